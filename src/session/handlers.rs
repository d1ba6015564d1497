//! Normalizing decoders: one method per wire message type, each tolerant of
//! missing fields (a missing field just means "skip that attribute", never
//! an error). Grounded line-for-line on `message_handler.py`'s `_parse_*`
//! methods, restructured as a `MessageHandler` owned by one `Session`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use prost::Message as _;
use tracing::{debug, warn};

use crate::aggregator::GiftAggregator;
use crate::core::{
    correct_event_time, correct_event_time_millis, BattleContributor, BattleMode, BattleResult,
    BattleTeam, ChatEvent, GiftEvent, Result, RoomStatsUpdate,
};
use crate::store::StoreWriter;

use super::protocol::{
    BattleAnchorGroup, BattleContributorGroup, BattleScore, ChatMessage, ControlMessage,
    GiftMessage, LikeMessage, LinkMicBattleFinishMethod, RoomUserSeqMessage, WireUser,
};

const THROTTLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
struct SeqState {
    online: i64,
    total: i64,
    at: Instant,
}

/// Outcome of dispatching one inner message. `Terminated` is the control
/// channel's `status == 3` ("broadcaster ended the session") signal; every
/// other handler returns `Continue` regardless of its own success.
pub enum DispatchOutcome {
    Continue,
    Terminated,
}

pub struct MessageHandler {
    web_rid: String,
    room_id: String,
    store: Arc<StoreWriter>,
    aggregator: Arc<GiftAggregator>,
    last_seq_state: Option<SeqState>,
    last_seq_time: Option<Instant>,
    last_like_time: Option<Instant>,
}

impl MessageHandler {
    pub fn new(web_rid: String, room_id: String, store: Arc<StoreWriter>, aggregator: Arc<GiftAggregator>) -> Self {
        Self {
            web_rid,
            room_id,
            store,
            aggregator,
            last_seq_state: None,
            last_seq_time: None,
            last_like_time: None,
        }
    }

    /// Dispatches one `(method, payload)` pair by method name. Decode
    /// failures on an individual message are swallowed here (logged at
    /// debug) so one malformed frame never ends the session.
    pub async fn handle(&mut self, method: &str, payload: &[u8]) -> DispatchOutcome {
        let result = match method {
            super::protocol::METHOD_CHAT => self.handle_chat(payload).await,
            super::protocol::METHOD_GIFT => self.handle_gift(payload).await,
            super::protocol::METHOD_ROOM_USER_SEQ => self.handle_room_user_seq(payload).await,
            super::protocol::METHOD_LIKE => self.handle_like(payload).await,
            super::protocol::METHOD_CONTROL => return self.handle_control(payload).await,
            super::protocol::METHOD_BATTLE_FINISH => self.handle_battle_finish(payload).await,
            other => {
                debug!(method = other, "unhandled wire method, ignoring");
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(method, error = %e, "message handler error, frame dropped");
        }
        DispatchOutcome::Continue
    }

    async fn handle_chat(&self, payload: &[u8]) -> Result<()> {
        let message = match ChatMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => return Err(crate::core::IngestError::Decode(e.to_string())),
        };
        let user = message.user.as_ref();
        let event_time = if message.event_time == 0 {
            Utc::now()
        } else {
            correct_event_time(message.event_time)
        };

        let event = ChatEvent {
            room_id: self.room_id.clone(),
            web_rid: Some(self.web_rid.clone()),
            user_id: user.map(|u| u.id.clone()).filter(|s| !s.is_empty()),
            nickname: user.map(|u| u.nick_name.clone()).filter(|s| !s.is_empty()),
            content: message.content,
            consumption_level: user.map(|u| u.pay_grade_level),
            fan_club_level: user.map(|u| u.fans_club_level),
            event_time,
            insert_time: Utc::now(),
        };
        self.store.buffer_chat(&event).await
    }

    async fn handle_gift(&self, payload: &[u8]) -> Result<()> {
        let message = match GiftMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => return Err(crate::core::IngestError::Decode(e.to_string())),
        };
        let user = message.user.unwrap_or_default();
        let gift = message.gift.unwrap_or_default();

        let event_time = if message.send_time == 0 {
            Utc::now()
        } else {
            correct_event_time_millis(message.send_time)
        };

        let event = GiftEvent {
            room_id: self.room_id.clone(),
            web_rid: Some(self.web_rid.clone()),
            sender_id: user.id,
            sender_nickname: Some(user.nick_name).filter(|s| !s.is_empty()),
            gift_id: gift.id,
            gift_name: gift.name,
            diamond_count: gift.diamond_count,
            combo_count: message.combo_count,
            group_count: message.group_count,
            group_id: message.group_id,
            repeat_end: message.repeat_end,
            trace_id: Some(message.trace_id).filter(|s| !s.is_empty()),
            total_diamond_count: None,
            event_time,
        };
        self.aggregator.handle_gift(event, &gift.icon_url).await
    }

    /// Throttled to one invocation per `THROTTLE_INTERVAL`. The first call
    /// only seeds `last_seq_state` — there is no valid previous state to
    /// diff against, so no `IncrementRoomStats` call is made for it.
    async fn handle_room_user_seq(&mut self, payload: &[u8]) -> Result<()> {
        let now = Instant::now();
        if let Some(last) = self.last_seq_time {
            if now.duration_since(last) < THROTTLE_INTERVAL {
                return Ok(());
            }
        }
        let time_diff = self
            .last_seq_time
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_seq_time = Some(now);

        let message = match RoomUserSeqMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => return Err(crate::core::IngestError::Decode(e.to_string())),
        };

        let current_online = message.total;
        let current_total = message.total_user;

        let ranks = if message.ranks_list.is_empty() {
            None
        } else {
            let items: Vec<serde_json::Value> = message
                .ranks_list
                .iter()
                .filter_map(|item| {
                    let user = item.user.as_ref()?;
                    Some(serde_json::json!({
                        "uid": user.id,
                        "nickname": user.nick_name,
                        "avatar": user.avatar_url,
                        "rank": item.rank,
                    }))
                })
                .collect();
            Some(serde_json::Value::Array(items))
        };

        let stats = RoomStatsUpdate {
            user_count: Some(current_online),
            total_user_count: Some(current_total),
            ranks,
            like_count: None,
        };
        self.store.update_room_stats(&self.room_id, &stats).await?;

        if let Some(prev) = self.last_seq_state {
            let new_entries = (current_total - prev.total).max(0);
            let net_growth = current_online - prev.online;
            let new_exits = (new_entries - net_growth).max(0);
            let duration_inc = (current_online as f64 * time_diff).round() as i64;

            let mut inc = std::collections::HashMap::new();
            inc.insert("real_time_entries", new_entries);
            inc.insert("real_time_exits", new_exits);
            inc.insert("total_watch_time_sec", duration_inc);
            self.store.increment_room_stats(&self.room_id, &inc).await?;
        }

        self.last_seq_state = Some(SeqState {
            online: current_online,
            total: current_total,
            at: now,
        });
        Ok(())
    }

    async fn handle_like(&mut self, payload: &[u8]) -> Result<()> {
        let now = Instant::now();
        if let Some(last) = self.last_like_time {
            if now.duration_since(last) < THROTTLE_INTERVAL {
                return Ok(());
            }
        }
        self.last_like_time = Some(now);

        let message = match LikeMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => return Err(crate::core::IngestError::Decode(e.to_string())),
        };
        let stats = RoomStatsUpdate {
            user_count: None,
            total_user_count: None,
            ranks: None,
            like_count: Some(message.total),
        };
        self.store.update_room_stats(&self.room_id, &stats).await
    }

    /// The one handler that can terminate the session: `status == 3` means
    /// the broadcaster ended the livestream.
    async fn handle_control(&self, payload: &[u8]) -> DispatchOutcome {
        let message = match ControlMessage::decode(payload) {
            Ok(m) => m,
            Err(_) => return DispatchOutcome::Continue,
        };
        if message.status == 3 {
            if let Err(e) = self.store.mark_room_ended(&self.room_id).await {
                warn!(room_id = %self.room_id, error = %e, "failed to mark room ended on control signal");
            }
            return DispatchOutcome::Terminated;
        }
        DispatchOutcome::Continue
    }

    async fn handle_battle_finish(&self, payload: &[u8]) -> Result<()> {
        let message = match LinkMicBattleFinishMethod::decode(payload) {
            Ok(m) => m,
            Err(e) => return Err(crate::core::IngestError::Decode(e.to_string())),
        };
        let Some(info) = message.info.as_ref() else {
            return Ok(());
        };
        if info.status != 2 {
            return Ok(());
        }

        let battle = build_battle_result(&self.room_id, info.battle_id.clone(), info.start_time_ms, &message.scores, &message.contributors, &message.anchors);
        self.store.save_battle_result(&battle).await
    }
}

/// Mode classification: `team_battle` if any score carries a defined
/// win/lose status or exactly two anchors are present, else
/// `free_for_all`. `free_for_all` teams sort by their first anchor's rank
/// ascending; `team_battle` teams keep encounter order.
fn build_battle_result(
    room_id: &str,
    battle_id: String,
    start_time_ms: i64,
    scores: &[BattleScore],
    contributors: &[BattleContributorGroup],
    anchors: &[BattleAnchorGroup],
) -> BattleResult {
    use std::collections::HashMap;

    let scores_map: HashMap<&str, &BattleScore> =
        scores.iter().map(|s| (s.user_id.as_str(), s)).collect();
    let has_valid_win_status = scores.iter().any(|s| s.win_status == 1 || s.win_status == 2);

    let contrib_map: HashMap<&str, Vec<BattleContributor>> = contributors
        .iter()
        .map(|group| {
            let top: Vec<BattleContributor> = group
                .list
                .iter()
                .take(3)
                .map(|item| BattleContributor {
                    user_id: item.id.clone(),
                    nickname: Some(item.nickname.clone()).filter(|s| !s.is_empty()),
                    score: item.score,
                })
                .collect();
            (group.anchor_id.as_str(), top)
        })
        .collect();

    let total_anchors: usize = anchors.iter().map(|a| a.list.len()).sum();
    let mode = if has_valid_win_status || total_anchors == 2 {
        BattleMode::TeamBattle
    } else {
        BattleMode::FreeForAll
    };

    let mut teams_by_key: Vec<(String, BattleTeam)> = Vec::new();
    for group in anchors {
        for anchor in &group.list {
            let Some(user) = anchor.user.as_ref() else {
                continue;
            };
            let score_info = scores_map.get(user.id.as_str());
            let contributors = contrib_map.get(user.id.as_str()).cloned().unwrap_or_default();

            let team = BattleTeam {
                anchor_id: user.id.clone(),
                anchor_nickname: Some(user.nick_name.clone()).filter(|s| !s.is_empty()),
                score: score_info.map(|s| s.score).unwrap_or(0),
                rank: score_info.map(|s| s.rank),
                win_status: score_info.map(|s| s.win_status),
                top_contributors: contributors,
            };

            let key = if has_valid_win_status {
                score_info.map(|s| s.win_status.to_string()).unwrap_or_default()
            } else {
                user.id.clone()
            };

            if let Some((_, existing)) = teams_by_key.iter_mut().find(|(k, _)| k == &key) {
                existing.top_contributors.extend(team.top_contributors);
            } else {
                teams_by_key.push((key, team));
            }
        }
    }

    let mut teams: Vec<BattleTeam> = teams_by_key.into_iter().map(|(_, t)| t).collect();
    if mode == BattleMode::FreeForAll {
        teams.sort_by_key(|t| t.rank.unwrap_or(999));
    }

    BattleResult {
        battle_id,
        room_id: room_id.to_string(),
        mode,
        start_time: if start_time_ms > 0 {
            chrono::DateTime::from_timestamp_millis(start_time_ms).unwrap_or_else(Utc::now)
        } else {
            Utc::now()
        },
        teams,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::protocol::BattleAnchor;

    fn anchor(id: &str, nickname: &str) -> BattleAnchor {
        BattleAnchor {
            user: Some(WireUser {
                id: id.to_string(),
                sec_uid: String::new(),
                nick_name: nickname.to_string(),
                avatar_url: String::new(),
                pay_grade_level: 0,
                fans_club_level: 0,
            }),
        }
    }

    #[test]
    fn two_anchors_with_no_win_status_classified_as_team_battle() {
        let anchors = vec![BattleAnchorGroup {
            list: vec![anchor("u1", "A"), anchor("u2", "B")],
        }];
        let result = build_battle_result("room1", "b1".into(), 0, &[], &[], &anchors);
        assert_eq!(result.mode, BattleMode::TeamBattle);
    }

    #[test]
    fn three_anchors_with_no_win_status_classified_as_free_for_all() {
        let anchors = vec![BattleAnchorGroup {
            list: vec![anchor("u1", "A"), anchor("u2", "B"), anchor("u3", "C")],
        }];
        let result = build_battle_result("room1", "b1".into(), 0, &[], &[], &anchors);
        assert_eq!(result.mode, BattleMode::FreeForAll);
    }

    #[test]
    fn free_for_all_teams_sort_by_first_anchor_rank() {
        let anchors = vec![BattleAnchorGroup {
            list: vec![anchor("u1", "A")],
        }];
        let anchors2 = vec![
            anchors[0].clone(),
            BattleAnchorGroup { list: vec![anchor("u2", "B")] },
            BattleAnchorGroup { list: vec![anchor("u3", "C")] },
        ];
        let scores = vec![
            BattleScore { user_id: "u1".into(), score: 10, win_status: 0, rank: 2 },
            BattleScore { user_id: "u2".into(), score: 20, win_status: 0, rank: 1 },
            BattleScore { user_id: "u3".into(), score: 5, win_status: 0, rank: 3 },
        ];
        let result = build_battle_result("room1", "b1".into(), 0, &scores, &[], &anchors2);
        assert_eq!(result.mode, BattleMode::FreeForAll);
        let ranks: Vec<_> = result.teams.iter().map(|t| t.rank.unwrap()).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }
}
