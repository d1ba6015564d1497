use serde::{Deserialize, Serialize};

/// Room lifecycle status. `1` and `2` both count as "live" for discovery
/// purposes; only `1` opens a recording Session.
pub const LIVE_STATUS_UNKNOWN: i32 = 0;
pub const LIVE_STATUS_LIVE: i32 = 1;
pub const LIVE_STATUS_GUEST: i32 = 2;
pub const LIVE_STATUS_ENDED: i32 = 4;

/// Top-level room document. `room_id` is the natural key; `created_at` and
/// `start_follower_count` are write-once fields enforced by the store
/// layer's upsert builder, not by this struct.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Room {
    pub room_id: String,
    pub web_rid: Option<String>,
    pub sec_uid: Option<String>,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub cover: Option<String>,
    pub live_status: i32,
    pub start_follower_count: i64,
    pub current_follower_count: Option<i64>,
    pub follower_diff: Option<i64>,
    pub total_diamond_count: i64,
    pub total_chat_count: i64,
    pub total_watch_time_sec: i64,
    pub real_time_entries: i64,
    pub real_time_exits: i64,
    pub fans_ticket_count: i64,
    pub max_viewers: i64,
    pub ranks: Option<serde_json::Value>,
    pub end_reason: Option<String>,
}

/// Broadcaster profile, keyed by `sec_uid`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Broadcaster {
    pub sec_uid: String,
    pub web_rid: Option<String>,
    pub self_web_rid: Option<String>,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub signature: Option<String>,
    pub live_status: i32,
    pub follower_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub room_id: String,
    pub web_rid: Option<String>,
    pub user_id: Option<String>,
    pub nickname: Option<String>,
    pub content: String,
    pub consumption_level: Option<i32>,
    pub fan_club_level: Option<i32>,
    /// Corrected event time (platform epoch + 8h, or now() if the platform
    /// sent 0).
    pub event_time: chrono::DateTime<chrono::Utc>,
    pub insert_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiftEvent {
    pub room_id: String,
    pub web_rid: Option<String>,
    pub sender_id: String,
    pub sender_nickname: Option<String>,
    pub gift_id: String,
    pub gift_name: String,
    pub diamond_count: i64,
    pub combo_count: i64,
    pub group_count: i64,
    pub group_id: String,
    pub repeat_end: bool,
    pub trace_id: Option<String>,
    pub total_diamond_count: Option<i64>,
    pub event_time: chrono::DateTime<chrono::Utc>,
}

impl GiftEvent {
    /// `diamond_count x combo_count x group_count`, treating a missing (zero)
    /// combo or group multiplier as 1 per the normative flush algorithm.
    pub fn compute_total(&self) -> i64 {
        let combo = if self.combo_count <= 0 {
            1
        } else {
            self.combo_count
        };
        let group = if self.group_count <= 0 {
            1
        } else {
            self.group_count
        };
        self.diamond_count * combo * group
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BattleMode {
    TeamBattle,
    FreeForAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleContributor {
    pub user_id: String,
    pub nickname: Option<String>,
    pub score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleTeam {
    pub anchor_id: String,
    pub anchor_nickname: Option<String>,
    pub score: i64,
    pub rank: Option<i32>,
    pub win_status: Option<i32>,
    pub top_contributors: Vec<BattleContributor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResult {
    pub battle_id: String,
    pub room_id: String,
    pub mode: BattleMode,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub teams: Vec<BattleTeam>,
}

/// A platform session cookie plus pool bookkeeping fields. `note` is an
/// operator annotation; its presence decides soft- vs. hard-delete on 401/403
/// (see CredentialPool::reject).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub cookie: String,
    pub note: Option<String>,
    pub status: Option<String>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomStatsUpdate {
    pub user_count: Option<i64>,
    pub total_user_count: Option<i64>,
    pub ranks: Option<serde_json::Value>,
    pub like_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_total_treats_missing_multipliers_as_one() {
        let gift = GiftEvent {
            room_id: "r1".into(),
            web_rid: None,
            sender_id: "s1".into(),
            sender_nickname: None,
            gift_id: "1".into(),
            gift_name: "rose".into(),
            diamond_count: 10,
            combo_count: 0,
            group_count: 0,
            group_id: "g1".into(),
            repeat_end: true,
            trace_id: None,
            total_diamond_count: None,
            event_time: chrono::Utc::now(),
        };
        assert_eq!(gift.compute_total(), 10);
    }

    #[test]
    fn compute_total_multiplies_combo_and_group() {
        let gift = GiftEvent {
            room_id: "r1".into(),
            web_rid: None,
            sender_id: "s1".into(),
            sender_nickname: None,
            gift_id: "1".into(),
            gift_name: "rose".into(),
            diamond_count: 100,
            combo_count: 3,
            group_count: 2,
            group_id: "g1".into(),
            repeat_end: true,
            trace_id: None,
            total_diamond_count: None,
            event_time: chrono::Utc::now(),
        };
        assert_eq!(gift.compute_total(), 600);
    }
}
