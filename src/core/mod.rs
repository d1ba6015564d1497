pub mod error;
pub mod types;
pub mod util;

pub use error::{IngestError, Result};
pub use types::{
    BattleContributor, BattleMode, BattleResult, BattleTeam, Broadcaster, ChatEvent, Credential,
    GiftEvent, Room, RoomStatsUpdate, LIVE_STATUS_ENDED, LIVE_STATUS_GUEST, LIVE_STATUS_LIVE,
    LIVE_STATUS_UNKNOWN,
};
pub use util::{correct_event_time, correct_event_time_millis, generate_ms_token};
