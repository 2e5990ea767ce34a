//! Listener Dispatch Table
//!
//! Explicit registration of in-process event consumers: the table is built
//! once at startup by the builder and frozen behind an `Arc`. There is no
//! ambient global registry and no runtime mutation; what listens to what is
//! visible in one place in the wiring code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::events::EventEnvelope;
use crate::shared::error::EventError;

/// An in-process consumer of published events.
///
/// Implementations are expected to already be idempotent, usually by being
/// wrapped in [`IdempotentConsumer`](crate::application::consumer::IdempotentConsumer).
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Stable name, part of the dedup key; renaming it reprocesses history.
    fn name(&self) -> &str;

    async fn consume(&self, envelope: &EventEnvelope) -> Result<(), EventError>;
}

/// Immutable event type -> ordered consumers mapping.
pub struct DispatchTable {
    consumers: HashMap<String, Vec<Arc<dyn EventConsumer>>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Consumers registered for an event type, in registration order.
    pub fn consumers_for(&self, event_type: &str) -> &[Arc<dyn EventConsumer>] {
        self.consumers
            .get(event_type)
            .map_or(&[], Vec::as_slice)
    }

    /// Number of event types with at least one consumer.
    pub fn event_type_count(&self) -> usize {
        self.consumers.len()
    }
}

/// Builder for [`DispatchTable`], consumed by `build`.
#[derive(Default)]
pub struct DispatchTableBuilder {
    consumers: HashMap<String, Vec<Arc<dyn EventConsumer>>>,
}

impl DispatchTableBuilder {
    /// Register a consumer for an event type. Order of registration is the
    /// order of synchronous dispatch.
    pub fn on(mut self, event_type: impl Into<String>, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumers.entry(event_type.into()).or_default().push(consumer);
        self
    }

    /// Register one consumer for several event types at once.
    pub fn on_each<I>(mut self, event_types: I, consumer: Arc<dyn EventConsumer>) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for event_type in event_types {
            self = self.on(event_type, consumer.clone());
        }
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            consumers: self.consumers,
        }
    }
}
