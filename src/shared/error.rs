//! Backbone Error Types
//!
//! Centralized error handling for the event backbone.

/// Event backbone error type
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event failed structural validation and was never published.
    /// Fatal to the calling operation, never retried.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// No upgrade/downgrade handler exists for a required version hop.
    /// Surfaced to operators rather than silently coerced.
    #[error("No version path for {event_type}: {from} -> {to}")]
    VersionGap {
        event_type: String,
        from: u32,
        to: u32,
    },

    /// A listener-specific failure. Isolated per listener; the idempotency
    /// key stays unset so the event remains eligible for redelivery.
    #[error("Handler '{consumer}' failed: {message}")]
    Handler { consumer: String, message: String },

    /// A wrapped handler exceeded its bounded execution timeout.
    #[error("Handler '{consumer}' timed out after {timeout_secs}s")]
    HandlerTimeout { consumer: String, timeout_secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventError {
    /// Wrap an arbitrary listener failure, tagging the consumer it came from.
    pub fn handler(consumer: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Handler {
            consumer: consumer.into(),
            message: message.to_string(),
        }
    }

    /// True when the failure leaves the event eligible for redelivery.
    ///
    /// Validation and version-gap failures are terminal: redelivering the
    /// same bytes cannot succeed, so retrying them only burns redeliveries.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::InvalidEvent(_) | Self::VersionGap { .. })
    }
}
