//! Event Envelope
//!
//! The immutable value type every domain event crosses module and process
//! boundaries in. Identity, causality and versioning metadata are stamped at
//! construction; the `event_id` doubles as the idempotency key downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::EventError;

use super::payloads::{DomainEvent, EventSource};

/// Immutable envelope around a [`DomainEvent`].
///
/// Two envelopes with the same `event_id` are the same logical occurrence:
/// consumers must produce the side effects of at most one delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique identity; the dedup key for idempotent consumption
    pub event_id: Uuid,

    /// UTC creation time, stamped by the publisher
    pub occurred_at: DateTime<Utc>,

    /// Schema version of the payload as constructed
    pub version: u32,

    /// Bounded context that owns the event
    pub source: EventSource,

    /// Entity the event is about; the per-consumer FIFO ordering unit
    pub aggregate_id: String,

    /// Propagated across a causal chain for tracing; never used for dedup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(flatten)]
    pub event: DomainEvent,
}

impl EventEnvelope {
    /// Wrap a domain event, stamping identity, timestamp, version, source
    /// and aggregate id from the payload.
    pub fn new(event: DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            version: event.schema_version(),
            source: event.source(),
            aggregate_id: event.aggregate_id(),
            correlation_id: None,
            event,
        }
    }

    /// Attach a correlation id propagated from the originating request.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Event type name of the wrapped payload.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Structural validation: identity fields plus the payload's required
    /// fields must be non-empty. Producers call this before an event leaves
    /// process memory; a failing envelope must not be published.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_id.is_nil() {
            return Err(EventError::InvalidEvent("event_id is nil".into()));
        }
        if self.version == 0 {
            return Err(EventError::InvalidEvent("version must be positive".into()));
        }
        if self.aggregate_id.is_empty() {
            return Err(EventError::InvalidEvent("aggregate_id is empty".into()));
        }
        for (field, value) in self.event.required_fields() {
            if value.is_empty() {
                return Err(EventError::InvalidEvent(format!(
                    "{}: required field '{}' is empty",
                    self.event_type(),
                    field
                )));
            }
        }
        Ok(())
    }

    /// Convenience wrapper over [`validate`](Self::validate).
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}
