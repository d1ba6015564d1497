//! Small helpers shared by the Session and Supervisor: the platform's epoch
//! timestamps need a fixed +8h correction, and both the discovery endpoint
//! and the room detail endpoint need a throwaway `msToken` query parameter.

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

/// Platform epoch timestamps are naive UTC; the operator account is in
/// UTC+8, so every event time gets the offset added. `0` means "the
/// platform didn't send a timestamp", which callers map to `Utc::now()`
/// themselves rather than calling this function.
pub fn correct_event_time(epoch_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch_secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
        + chrono::Duration::hours(8)
}

pub fn correct_event_time_millis(epoch_millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(epoch_millis)
        .single()
        .unwrap_or_else(Utc::now)
        + chrono::Duration::hours(8)
}

/// A random alphanumeric+`-_` token of the given length, used as the
/// `msToken` query parameter on discovery and room-detail requests.
pub fn generate_ms_token(length: usize) -> String {
    const CHARSET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timestamp_correction_is_deterministic_relative_to_epoch() {
        let t = correct_event_time(0);
        assert_eq!(t.timestamp(), 8 * 3600);
    }

    #[test]
    fn ms_token_has_requested_length() {
        let token = generate_ms_token(182);
        assert_eq!(token.chars().count(), 182);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
