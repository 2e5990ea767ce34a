//! Idempotency Store
//!
//! Shared dedup state for idempotent consumption, reachable from every
//! process running consumers. The store must support atomic conditional
//! writes: two redelivered copies of one event racing from different
//! processes must not both pass the claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::events::EventEnvelope;
use crate::shared::error::EventError;

/// Composite dedup key: one consumer processing one event type occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub event_id: Uuid,
    pub consumer_name: String,
    pub event_type: String,
}

impl DedupKey {
    pub fn for_consumer(envelope: &EventEnvelope, consumer_name: &str) -> Self {
        Self {
            event_id: envelope.event_id,
            consumer_name: consumer_name.to_owned(),
            event_type: envelope.event_type().to_owned(),
        }
    }

    fn processed_key(&self) -> String {
        format!(
            "processed:{}:{}:{}",
            self.consumer_name, self.event_type, self.event_id
        )
    }

    fn claim_key(&self) -> String {
        format!(
            "inflight:{}:{}:{}",
            self.consumer_name, self.event_type, self.event_id
        )
    }
}

/// What gets persisted once a consumer finishes an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub consumer_name: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub version: u32,
    pub processed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn from_envelope(envelope: &EventEnvelope, consumer_name: &str) -> Self {
        Self {
            consumer_name: consumer_name.to_owned(),
            event_type: envelope.event_type().to_owned(),
            correlation_id: envelope.correlation_id.clone(),
            version: envelope.version,
            processed_at: Utc::now(),
        }
    }
}

/// Dedup store interface for idempotent consumption.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Has this key already been successfully processed?
    async fn is_processed(&self, key: &DedupKey) -> Result<bool, EventError>;

    /// Atomically claim the key for in-flight processing. Returns `false`
    /// when another delivery already holds the claim. The claim expires
    /// after `ttl_secs` so a crashed handler never wedges the event.
    async fn try_claim(&self, key: &DedupKey, ttl_secs: u64) -> Result<bool, EventError>;

    /// Drop an in-flight claim (after success or failure).
    async fn release_claim(&self, key: &DedupKey) -> Result<(), EventError>;

    /// Mark the key processed. Retention must outlive the broker's widest
    /// redelivery window; it is configuration, not a constant.
    async fn record_processed(
        &self,
        key: &DedupKey,
        record: IdempotencyRecord,
        retention_secs: u64,
    ) -> Result<(), EventError>;
}

/// Redis-backed idempotency store.
///
/// Claims use `SET NX EX`, the same conditional-write primitive as a
/// distributed lock, which gives the required atomicity across processes.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
}

impl RedisIdempotencyStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    #[instrument(skip(self), level = "debug", fields(key = %key.processed_key()))]
    async fn is_processed(&self, key: &DedupKey) -> Result<bool, EventError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key.processed_key()).await?;
        Ok(exists)
    }

    #[instrument(skip(self), level = "debug", fields(key = %key.claim_key()))]
    async fn try_claim(&self, key: &DedupKey, ttl_secs: u64) -> Result<bool, EventError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key.claim_key())
            .arg(Utc::now().timestamp())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;

        let claimed = result.is_some();
        debug!(claimed, "Idempotency claim attempt");
        Ok(claimed)
    }

    #[instrument(skip(self), level = "debug", fields(key = %key.claim_key()))]
    async fn release_claim(&self, key: &DedupKey) -> Result<(), EventError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(key.claim_key()).await?;
        Ok(())
    }

    #[instrument(skip(self, record), level = "debug", fields(key = %key.processed_key()))]
    async fn record_processed(
        &self,
        key: &DedupKey,
        record: IdempotencyRecord,
        retention_secs: u64,
    ) -> Result<(), EventError> {
        let data = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key.processed_key(), data, retention_secs).await?;
        debug!(retention_secs, "Processed record written");
        Ok(())
    }
}

/// In-memory idempotency store for tests.
///
/// Atomicity comes from the map's entry API; TTLs are not enforced, which
/// is acceptable for test lifetimes.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    processed: DashMap<String, IdempotencyRecord>,
    claims: DashMap<String, i64>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, key: &DedupKey) -> Result<bool, EventError> {
        Ok(self.processed.contains_key(&key.processed_key()))
    }

    async fn try_claim(&self, key: &DedupKey, _ttl_secs: u64) -> Result<bool, EventError> {
        match self.claims.entry(key.claim_key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Utc::now().timestamp());
                Ok(true)
            }
        }
    }

    async fn release_claim(&self, key: &DedupKey) -> Result<(), EventError> {
        self.claims.remove(&key.claim_key());
        Ok(())
    }

    async fn record_processed(
        &self,
        key: &DedupKey,
        record: IdempotencyRecord,
        _retention_secs: u64,
    ) -> Result<(), EventError> {
        self.processed.insert(key.processed_key(), record);
        Ok(())
    }
}
