//! Wire types for the push channel. The real platform wire schema is a
//! fixed, externally-defined protobuf; per SPEC_FULL §1 it's treated as an
//! opaque decoder here, so these are plain structs carrying a
//! `prost::Message` derive rather than a faithful reproduction of the
//! platform's actual field numbers — only the shape the rest of the crate
//! depends on (frame envelope, method dispatch, per-event payloads) matters.

use prost::Message;

#[derive(Clone, PartialEq, Eq, Message)]
pub struct PushFrame {
    #[prost(string, tag = "1")]
    pub payload_type: String,
    #[prost(uint64, tag = "2")]
    pub log_id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl PushFrame {
    pub fn heartbeat() -> Self {
        Self {
            payload_type: "hb".to_string(),
            log_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn ack(log_id: u64, internal_ext: &str) -> Self {
        Self {
            payload_type: "ack".to_string(),
            log_id,
            payload: internal_ext.as_bytes().to_vec(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct WireMessage {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(bool, tag = "1")]
    pub need_ack: bool,
    #[prost(string, tag = "2")]
    pub internal_ext: String,
    #[prost(message, repeated, tag = "3")]
    pub messages_list: Vec<WireMessage>,
}

#[derive(Clone, PartialEq, Eq, Default, Message)]
pub struct WireUser {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub sec_uid: String,
    #[prost(string, tag = "3")]
    pub nick_name: String,
    #[prost(string, tag = "4")]
    pub avatar_url: String,
    #[prost(int32, tag = "5")]
    pub pay_grade_level: i32,
    #[prost(int32, tag = "6")]
    pub fans_club_level: i32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct ChatMessage {
    #[prost(message, optional, tag = "1")]
    pub user: Option<WireUser>,
    #[prost(string, tag = "2")]
    pub content: String,
    #[prost(int64, tag = "3")]
    pub event_time: i64,
}

#[derive(Clone, PartialEq, Eq, Default, Message)]
pub struct GiftStruct {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub diamond_count: i64,
    #[prost(string, tag = "4")]
    pub icon_url: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct GiftMessage {
    #[prost(message, optional, tag = "1")]
    pub user: Option<WireUser>,
    #[prost(message, optional, tag = "2")]
    pub gift: Option<GiftStruct>,
    #[prost(int64, tag = "3")]
    pub combo_count: i64,
    #[prost(int64, tag = "4")]
    pub group_count: i64,
    #[prost(string, tag = "5")]
    pub group_id: String,
    #[prost(bool, tag = "6")]
    pub repeat_end: bool,
    #[prost(string, tag = "7")]
    pub trace_id: String,
    #[prost(int64, tag = "8")]
    pub send_time: i64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct RankItem {
    #[prost(message, optional, tag = "1")]
    pub user: Option<WireUser>,
    #[prost(int32, tag = "2")]
    pub rank: i32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct RoomUserSeqMessage {
    #[prost(int64, tag = "1")]
    pub total: i64,
    #[prost(int64, tag = "2")]
    pub total_user: i64,
    #[prost(message, repeated, tag = "3")]
    pub ranks_list: Vec<RankItem>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct LikeMessage {
    #[prost(int64, tag = "1")]
    pub total: i64,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct ControlMessage {
    #[prost(int32, tag = "1")]
    pub status: i32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BattleScore {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(int64, tag = "2")]
    pub score: i64,
    #[prost(int32, tag = "3")]
    pub win_status: i32,
    #[prost(int32, tag = "4")]
    pub rank: i32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BattleContributorItem {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub nickname: String,
    #[prost(string, tag = "3")]
    pub avatar: String,
    #[prost(int64, tag = "4")]
    pub score: i64,
    #[prost(int32, tag = "5")]
    pub rank: i32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BattleContributorGroup {
    #[prost(string, tag = "1")]
    pub anchor_id: String,
    #[prost(message, repeated, tag = "2")]
    pub list: Vec<BattleContributorItem>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BattleAnchor {
    #[prost(message, optional, tag = "1")]
    pub user: Option<WireUser>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BattleAnchorGroup {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<BattleAnchor>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct BattleInfo {
    #[prost(string, tag = "1")]
    pub battle_id: String,
    #[prost(int64, tag = "2")]
    pub start_time_ms: i64,
    #[prost(int32, tag = "3")]
    pub status: i32,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct LinkMicBattleFinishMethod {
    #[prost(message, optional, tag = "1")]
    pub info: Option<BattleInfo>,
    #[prost(message, repeated, tag = "2")]
    pub scores: Vec<BattleScore>,
    #[prost(message, repeated, tag = "3")]
    pub contributors: Vec<BattleContributorGroup>,
    #[prost(message, repeated, tag = "4")]
    pub anchors: Vec<BattleAnchorGroup>,
}

pub const METHOD_CHAT: &str = "WebcastChatMessage";
pub const METHOD_GIFT: &str = "WebcastGiftMessage";
pub const METHOD_ROOM_USER_SEQ: &str = "WebcastRoomUserSeqMessage";
pub const METHOD_LIKE: &str = "WebcastLikeMessage";
pub const METHOD_CONTROL: &str = "WebcastControlMessage";
pub const METHOD_BATTLE_FINISH: &str = "WebcastLinkMicBattleFinishMethod";

/// Query parameters the push-channel signature is computed over, joined as
/// `k=v,k=v,...` in this fixed order and MD5-hashed before being handed to
/// the signature oracle.
const SIGNATURE_PARAM_ORDER: &[&str] = &[
    "live_id",
    "aid",
    "version_code",
    "webcast_sdk_version",
    "room_id",
    "sub_room_id",
    "sub_channel_id",
    "did_rule",
    "user_unique_id",
    "device_platform",
    "device_type",
    "ac",
    "identity",
];

/// Builds the MD5 digest the signature oracle expects, from a
/// `k=v&k=v&...` query string. Parameters absent from `query` contribute an
/// empty value, matching the original's `wss_maps.get(i, '')`.
pub fn canonical_signature_digest(query: &str) -> String {
    let params: std::collections::HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let joined = SIGNATURE_PARAM_ORDER
        .iter()
        .map(|key| format!("{key}={}", params.get(key).copied().unwrap_or("")))
        .collect::<Vec<_>>()
        .join(",");

    format!("{:x}", md5::compute(joined.as_bytes()))
}

/// A signature oracle is an opaque external dependency (the platform's
/// anti-bot JS VM in the original source); the ingestor only needs to call
/// it, never implement it. CPU-bound but treated as synchronous per the
/// concurrency model's "signature computation executes inline" note.
pub trait SignatureOracle: Send + Sync {
    /// Signs the MD5 digest of the canonical push-channel parameter string.
    fn sign_push_channel(&self, digest_hex: &str) -> crate::core::Result<String>;

    /// Computes `a_bogus` over a serialized query string and user agent,
    /// used by the discovery and room-detail HTTP requests.
    fn compute_a_bogus(&self, query_string: &str, user_agent: &str) -> crate::core::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_digest_only_uses_fixed_param_order() {
        let query = "room_id=42&aid=6383&live_id=1&extra=ignored";
        let digest = canonical_signature_digest(query);
        // Same inputs always produce the same digest (pure function, no time/random).
        assert_eq!(digest, canonical_signature_digest(query));
        assert_eq!(digest.len(), 32);
    }

    #[test]
    fn missing_params_contribute_empty_value() {
        let a = canonical_signature_digest("room_id=1");
        let b = canonical_signature_digest("room_id=1&sub_room_id=");
        assert_eq!(a, b);
    }

    #[test]
    fn heartbeat_frame_has_no_payload() {
        let frame = PushFrame::heartbeat();
        assert_eq!(frame.payload_type, "hb");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn ack_frame_carries_log_id_and_internal_ext() {
        let frame = PushFrame::ack(7, "ext-bytes");
        assert_eq!(frame.payload_type, "ack");
        assert_eq!(frame.log_id, 7);
        assert_eq!(frame.payload, b"ext-bytes");
    }
}
