//! Durable Event Log
//!
//! Append-only storage for published events, owned exclusively by the
//! publisher. The durable append is the commit point of a publish: an event
//! that was never appended here was never published, whatever happened to
//! its dispatch. Sequence numbers are assigned per aggregate at append time
//! and are the basis of the FIFO-per-aggregate ordering guarantee.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::DatabaseSettings;
use crate::domain::events::EventEnvelope;
use crate::shared::error::EventError;

/// An event together with its durable per-aggregate sequence number.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub sequence: i64,
    pub envelope: EventEnvelope,
}

/// Append-only event log interface.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append an event, assigning the next sequence number for its
    /// aggregate. Fails the whole publish on error; never partially writes.
    async fn append(&self, envelope: &EventEnvelope) -> Result<i64, EventError>;

    /// Load events for one aggregate with sequence greater than
    /// `after_sequence`, in sequence order. This is the reconciliation path
    /// for subscribers that missed broadcasts while offline.
    async fn load_after(
        &self,
        aggregate_id: &str,
        after_sequence: i64,
    ) -> Result<Vec<StoredEvent>, EventError>;
}

/// Create a PostgreSQL connection pool
pub async fn create_pool(settings: &DatabaseSettings) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout))
        .connect(&settings.url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// PostgreSQL event log implementation.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Internal row type for event log queries.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    envelope: serde_json::Value,
}

impl EventRow {
    fn into_stored(self) -> Result<StoredEvent, EventError> {
        Ok(StoredEvent {
            sequence: self.sequence,
            envelope: serde_json::from_value(self.envelope)?,
        })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, envelope), fields(event_id = %envelope.event_id, aggregate_id = %envelope.aggregate_id))]
    async fn append(&self, envelope: &EventEnvelope) -> Result<i64, EventError> {
        let wire = serde_json::to_value(envelope)?;
        let mut tx = self.pool.begin().await?;

        // Sequence row is upserted under row-level lock, so two concurrent
        // appends for one aggregate serialize here.
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO aggregate_sequences (aggregate_id, last_sequence)
            VALUES ($1, 1)
            ON CONFLICT (aggregate_id)
            DO UPDATE SET last_sequence = aggregate_sequences.last_sequence + 1
            RETURNING last_sequence
            "#,
        )
        .bind(&envelope.aggregate_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO event_log
                (event_id, aggregate_id, sequence, event_type, source, version, correlation_id, envelope, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(envelope.event_id)
        .bind(&envelope.aggregate_id)
        .bind(sequence)
        .bind(envelope.event_type())
        .bind(envelope.source.as_str())
        .bind(envelope.version as i32)
        .bind(&envelope.correlation_id)
        .bind(&wire)
        .bind(envelope.occurred_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(sequence, "Event appended");
        Ok(sequence)
    }

    #[instrument(skip(self))]
    async fn load_after(
        &self,
        aggregate_id: &str,
        after_sequence: i64,
    ) -> Result<Vec<StoredEvent>, EventError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT sequence, envelope
            FROM event_log
            WHERE aggregate_id = $1 AND sequence > $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(aggregate_id)
        .bind(after_sequence)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_stored).collect()
    }
}

/// In-memory event log for tests and single-node development.
///
/// Keeps the same append/replay semantics as [`PgEventStore`], including
/// event-id uniqueness and per-aggregate sequencing, without a database.
#[derive(Default)]
pub struct InMemoryEventStore {
    aggregates: DashMap<String, Vec<StoredEvent>>,
    seen_ids: Mutex<HashSet<uuid::Uuid>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all aggregates.
    pub fn len(&self) -> usize {
        self.aggregates.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, envelope: &EventEnvelope) -> Result<i64, EventError> {
        {
            let mut seen = self
                .seen_ids
                .lock()
                .map_err(|_| EventError::Internal("event store lock poisoned".into()))?;
            if !seen.insert(envelope.event_id) {
                return Err(EventError::Internal(format!(
                    "duplicate event_id {}",
                    envelope.event_id
                )));
            }
        }

        let mut events = self
            .aggregates
            .entry(envelope.aggregate_id.clone())
            .or_default();
        let sequence = events.len() as i64 + 1;
        events.push(StoredEvent {
            sequence,
            envelope: envelope.clone(),
        });
        Ok(sequence)
    }

    async fn load_after(
        &self,
        aggregate_id: &str,
        after_sequence: i64,
    ) -> Result<Vec<StoredEvent>, EventError> {
        Ok(self
            .aggregates
            .get(aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::payloads::{DomainEvent, MessageDeletedPayload};
    use pretty_assertions::assert_eq;

    fn deleted_in(conversation: &str) -> EventEnvelope {
        EventEnvelope::new(DomainEvent::MessageDeleted(MessageDeletedPayload {
            message_id: "m-1".into(),
            conversation_id: conversation.into(),
            deleted_by: "u-1".into(),
        }))
    }

    #[tokio::test]
    async fn sequences_are_per_aggregate() {
        let store = InMemoryEventStore::new();

        assert_eq!(store.append(&deleted_in("conv-1")).await.unwrap(), 1);
        assert_eq!(store.append(&deleted_in("conv-1")).await.unwrap(), 2);
        assert_eq!(store.append(&deleted_in("conv-2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let store = InMemoryEventStore::new();
        let envelope = deleted_in("conv-1");

        store.append(&envelope).await.unwrap();
        assert!(store.append(&envelope).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn load_after_replays_in_sequence_order() {
        let store = InMemoryEventStore::new();
        let first = deleted_in("conv-1");
        let second = deleted_in("conv-1");
        store.append(&first).await.unwrap();
        store.append(&second).await.unwrap();

        let replayed = store.load_after("conv-1", 1).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sequence, 2);
        assert_eq!(replayed[0].envelope.event_id, second.event_id);
    }
}
