//! Idempotent Consumer
//!
//! Wraps a side-effecting handler with the dedup protocol that turns
//! at-least-once delivery into at-most-once processing:
//!
//! 1. already processed -> silent no-op,
//! 2. atomically claim the key so racing redeliveries cannot both run,
//! 3. run the handler under a bounded timeout,
//! 4. record the key only after success.
//!
//! A failure or timeout leaves the key unrecorded and the claim released,
//! so the event stays eligible for redelivery. The only window where a
//! crash can duplicate a side effect is between "handler finished" and
//! "key recorded"; handlers must therefore be safe to re-run in that
//! narrow window (upserts, not blind inserts). That is part of the handler
//! contract, not something this wrapper can solve alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::application::dispatch::EventConsumer;
use crate::domain::events::EventEnvelope;
use crate::infrastructure::idempotency::{DedupKey, IdempotencyRecord, IdempotencyStore};
use crate::infrastructure::metrics;
use crate::shared::error::EventError;

/// The side-effecting logic being wrapped.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable consumer name; part of the dedup key.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), EventError>;
}

/// Dedup wrapper around an [`EventHandler`].
pub struct IdempotentConsumer<H, S> {
    handler: H,
    store: Arc<S>,
    handler_timeout: Duration,
    retention_secs: u64,
}

impl<H, S> IdempotentConsumer<H, S>
where
    H: EventHandler,
    S: IdempotencyStore,
{
    pub fn new(handler: H, store: Arc<S>, handler_timeout: Duration, retention_secs: u64) -> Self {
        Self {
            handler,
            store,
            handler_timeout,
            retention_secs,
        }
    }

    async fn run_once(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        let key = DedupKey::for_consumer(envelope, self.handler.name());

        if self.store.is_processed(&key).await? {
            metrics::record_duplicate_skip(self.handler.name(), envelope.event_type());
            debug!(
                event_id = %envelope.event_id,
                consumer = self.handler.name(),
                "Duplicate delivery skipped"
            );
            return Ok(());
        }

        // Claim TTL matches the handler timeout: a crashed handler's claim
        // expires on its own, so the event is redeliverable, never wedged.
        let ttl_secs = self.handler_timeout.as_secs().max(1);
        if !self.store.try_claim(&key, ttl_secs).await? {
            debug!(
                event_id = %envelope.event_id,
                consumer = self.handler.name(),
                "Concurrent delivery already in flight; yielding"
            );
            return Ok(());
        }

        let outcome = tokio::time::timeout(self.handler_timeout, self.handler.handle(envelope)).await;

        match outcome {
            Ok(Ok(())) => {
                self.store
                    .record_processed(
                        &key,
                        IdempotencyRecord::from_envelope(envelope, self.handler.name()),
                        self.retention_secs,
                    )
                    .await?;
                self.store.release_claim(&key).await?;
                Ok(())
            }
            Ok(Err(error)) => {
                self.store.release_claim(&key).await?;
                metrics::record_handler_failure(self.handler.name(), envelope.event_type());
                warn!(
                    event_id = %envelope.event_id,
                    consumer = self.handler.name(),
                    %error,
                    "Handler failed; key left unset for redelivery"
                );
                Err(EventError::handler(self.handler.name(), error))
            }
            Err(_elapsed) => {
                self.store.release_claim(&key).await?;
                metrics::record_handler_failure(self.handler.name(), envelope.event_type());
                Err(EventError::HandlerTimeout {
                    consumer: self.handler.name().to_owned(),
                    timeout_secs: self.handler_timeout.as_secs(),
                })
            }
        }
    }
}

#[async_trait]
impl<H, S> EventConsumer for IdempotentConsumer<H, S>
where
    H: EventHandler,
    S: IdempotencyStore,
{
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn consume(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        self.run_once(envelope).await
    }
}
