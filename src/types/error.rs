//! Error types for listing-sync
//!
//! Stale events and deletes for unknown ids are not errors; they are
//! reported as [`crate::cache::ApplyOutcome`] variants and resolved locally.

/// Main error type for synchronization operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Subscription to '{topic}' exhausted after {attempts} reconnection attempts")]
    SubscriptionExhausted { topic: String, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedEvent(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type alias for listing-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message() {
        let err = SyncError::SubscriptionExhausted {
            topic: "properties".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Subscription to 'properties' exhausted after 3 reconnection attempts"
        );
    }

    #[test]
    fn test_json_error_is_malformed() {
        let err: SyncError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, SyncError::MalformedEvent(_)));
    }
}
