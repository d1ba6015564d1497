use thiserror::Error;

/// Crate-wide error taxonomy. Variants map to the error classes in the
/// design's error-handling section: transient I/O, parse, credential, and
/// business-logic failures each get their own shape so callers can match on
/// them instead of string-sniffing.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("durable buffer error: {0}")]
    Buffer(#[from] redis::RedisError),

    #[error("store error: {0}")]
    Store(#[from] mongodb::error::Error),

    #[error("bson serialization error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("record serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("malformed wire message: {0}")]
    Decode(String),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("credential rejected (status {0})")]
    CredentialInvalid(u16),

    #[error("credential pool exhausted")]
    PoolExhausted,

    #[error("platform business error: {0}")]
    BusinessError(String),

    #[error("signature oracle failed")]
    SignatureOracle,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_carries_message() {
        let err = IngestError::Decode("bad frame".into());
        assert_eq!(err.to_string(), "malformed wire message: bad frame");
    }

    #[test]
    fn credential_invalid_carries_status() {
        let err = IngestError::CredentialInvalid(401);
        assert_eq!(err.to_string(), "credential rejected (status 401)");
    }

    #[test]
    fn business_error_carries_message() {
        let err = IngestError::BusinessError("risk control".into());
        assert_eq!(err.to_string(), "platform business error: risk control");
    }

    #[test]
    fn pool_exhausted_has_fixed_message() {
        assert_eq!(
            IngestError::PoolExhausted.to_string(),
            "credential pool exhausted"
        );
    }
}
