//! Event Publisher
//!
//! The single boundary a state-mutating operation emits events through.
//! Outbox-style ordering: the durable append is the commit point, and only
//! then does dispatch happen: first synchronously to in-process listeners,
//! then asynchronously to the cross-process broadcaster. The publisher never
//! mutates domain state itself.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::application::dispatch::DispatchTable;
use crate::domain::events::EventEnvelope;
use crate::infrastructure::broadcast::{channels, Broadcast};
use crate::infrastructure::event_store::EventStore;
use crate::infrastructure::metrics;
use crate::shared::error::EventError;

/// Which listeners failed during the synchronous dispatch of one publish.
/// Failures are isolated; they never abort siblings or the mutation.
#[derive(Debug, Default)]
pub struct ListenerOutcome {
    pub dispatched: usize,
    pub failed: Vec<String>,
}

/// Result of a successful publish.
#[derive(Debug)]
pub struct PublishReceipt {
    /// Durable per-aggregate sequence number assigned at the commit point
    pub sequence: i64,
    pub listeners: ListenerOutcome,
}

pub struct EventPublisher<S> {
    store: Arc<S>,
    dispatch: Arc<DispatchTable>,
    broadcaster: Arc<dyn Broadcast>,
}

impl<S: EventStore + 'static> EventPublisher<S> {
    pub fn new(store: Arc<S>, dispatch: Arc<DispatchTable>, broadcaster: Arc<dyn Broadcast>) -> Self {
        Self {
            store,
            dispatch,
            broadcaster,
        }
    }

    /// Publish one event: validate, durably append, dispatch, fan out.
    ///
    /// An append failure propagates to the caller as the mutation's own
    /// failure; a published-looking event that was never durably recorded
    /// must never exist. Listener and broadcast failures do not fail the
    /// publish: the durable record already exists and redelivery or
    /// reconciliation covers them.
    #[instrument(skip(self, envelope), fields(event_type = envelope.event_type(), aggregate_id = %envelope.aggregate_id))]
    pub async fn publish(&self, envelope: EventEnvelope) -> Result<PublishReceipt, EventError> {
        envelope.validate()?;

        // Commit point.
        let started = Instant::now();
        let sequence = self.store.append(&envelope).await?;
        metrics::record_publish(
            envelope.event_type(),
            envelope.source.as_str(),
            started.elapsed().as_secs_f64(),
        );
        debug!(sequence, event_id = %envelope.event_id, "Event committed");

        // Synchronous in-process dispatch, registration order, isolated
        // failures.
        let mut listeners = ListenerOutcome::default();
        for consumer in self.dispatch.consumers_for(envelope.event_type()) {
            listeners.dispatched += 1;
            if let Err(error) = consumer.consume(&envelope).await {
                warn!(
                    consumer = consumer.name(),
                    event_id = %envelope.event_id,
                    %error,
                    "Listener failed; left for redelivery"
                );
                listeners.failed.push(consumer.name().to_owned());
            }
        }

        // Cross-process fan-out off the caller's path. A slow or failing
        // broadcast never delays the durable commit the caller observed.
        let broadcaster = self.broadcaster.clone();
        let channel = channels::for_envelope(&envelope);
        let event_id = envelope.event_id;
        let wire = serde_json::to_value(&envelope)?;
        tokio::spawn(async move {
            if let Err(error) = broadcaster.publish_json(&channel, wire).await {
                // Accepted cost of fire-and-forget delivery; durable log is
                // the recovery path.
                warn!(%channel, %event_id, %error, "Broadcast dropped");
            }
        });

        Ok(PublishReceipt {
            sequence,
            listeners,
        })
    }

    /// Replay access to the durable log, for reconciliation after a
    /// subscriber's downtime.
    pub async fn replay_after(
        &self,
        aggregate_id: &str,
        after_sequence: i64,
    ) -> Result<Vec<crate::infrastructure::event_store::StoredEvent>, EventError> {
        self.store.load_after(aggregate_id, after_sequence).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::dispatch::{DispatchTable, EventConsumer};
    use crate::domain::events::payloads::{DomainEvent, MessageSentPayload};
    use crate::infrastructure::event_store::InMemoryEventStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::sync::Mutex;

    fn sent_in(conversation: &str, message: &str) -> EventEnvelope {
        EventEnvelope::new(DomainEvent::MessageSent(MessageSentPayload {
            message_id: message.into(),
            conversation_id: conversation.into(),
            sender_id: "u-1".into(),
            content: "hi".into(),
            reply_to_id: None,
        }))
    }

    /// Broadcast sink that records what would have gone to the broker.
    #[derive(Default)]
    struct RecordingBroadcast {
        sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Broadcast for RecordingBroadcast {
        async fn publish_json(&self, channel: &str, payload: Value) -> Result<(), EventError> {
            self.sent.lock().unwrap().push((channel.to_owned(), payload));
            Ok(())
        }
    }

    /// Consumer that records message ids, optionally failing every call.
    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventConsumer for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn consume(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
            if self.fail {
                return Err(EventError::handler(self.name, "boom"));
            }
            self.seen
                .lock()
                .unwrap()
                .push(envelope.event_id.to_string());
            Ok(())
        }
    }

    fn publisher_with(
        dispatch: DispatchTable,
    ) -> (
        EventPublisher<InMemoryEventStore>,
        Arc<InMemoryEventStore>,
        Arc<RecordingBroadcast>,
    ) {
        let store = Arc::new(InMemoryEventStore::new());
        let broadcast = Arc::new(RecordingBroadcast::default());
        let publisher = EventPublisher::new(store.clone(), Arc::new(dispatch), broadcast.clone());
        (publisher, store, broadcast)
    }

    #[tokio::test]
    async fn invalid_event_is_rejected_before_the_commit_point() {
        let (publisher, store, _) = publisher_with(DispatchTable::builder().build());
        let envelope = sent_in("", "m-1"); // empty conversation id

        let outcome = publisher.publish(envelope).await;
        assert!(matches!(outcome, Err(EventError::InvalidEvent(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn publish_assigns_per_aggregate_sequence() {
        let (publisher, _, _) = publisher_with(DispatchTable::builder().build());

        let first = publisher.publish(sent_in("conv-1", "m-1")).await.unwrap();
        let second = publisher.publish(sent_in("conv-1", "m-2")).await.unwrap();
        let other = publisher.publish(sent_in("conv-2", "m-3")).await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(other.sequence, 1);
    }

    #[tokio::test]
    async fn listeners_see_same_aggregate_events_in_publish_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatch = DispatchTable::builder()
            .on(
                "MESSAGE_SENT",
                Arc::new(Recorder {
                    name: "recorder",
                    seen: seen.clone(),
                    fail: false,
                }),
            )
            .build();
        let (publisher, _, _) = publisher_with(dispatch);

        let e1 = sent_in("conv-1", "m-1");
        let e2 = sent_in("conv-1", "m-2");
        let (id1, id2) = (e1.event_id.to_string(), e2.event_id.to_string());

        publisher.publish(e1).await.unwrap();
        publisher.publish(e2).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![id1, id2]);
    }

    #[tokio::test]
    async fn a_failing_listener_does_not_block_its_siblings() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatch = DispatchTable::builder()
            .on(
                "MESSAGE_SENT",
                Arc::new(Recorder {
                    name: "broken",
                    seen: Arc::new(Mutex::new(Vec::new())),
                    fail: true,
                }),
            )
            .on(
                "MESSAGE_SENT",
                Arc::new(Recorder {
                    name: "healthy",
                    seen: seen.clone(),
                    fail: false,
                }),
            )
            .build();
        let (publisher, _, _) = publisher_with(dispatch);

        let receipt = publisher.publish(sent_in("conv-1", "m-1")).await.unwrap();

        assert_eq!(receipt.listeners.dispatched, 2);
        assert_eq!(receipt.listeners.failed, vec!["broken".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn committed_events_reach_the_broadcaster_on_their_channel() {
        let (publisher, _, broadcast) = publisher_with(DispatchTable::builder().build());

        publisher.publish(sent_in("conv-7", "m-1")).await.unwrap();

        // fan-out runs on a spawned task
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let sent = broadcast.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "conversation:conv-7");
        assert_eq!(sent[0].1["t"], "MESSAGE_SENT");
    }

    #[tokio::test]
    async fn replay_after_returns_missed_events_in_order() {
        let (publisher, _, _) = publisher_with(DispatchTable::builder().build());

        publisher.publish(sent_in("conv-1", "m-1")).await.unwrap();
        let second = publisher.publish(sent_in("conv-1", "m-2")).await.unwrap();

        let missed = publisher.replay_after("conv-1", 1).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].sequence, second.sequence);
    }
}
