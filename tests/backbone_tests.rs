//! End-to-end backbone tests
//!
//! Exercises the full publish path against in-memory infrastructure: a
//! mutation publishes, the durable log commits, in-process listeners run
//! behind the idempotency guard, the broadcaster fans out, and a second
//! gateway process decodes the wire payload and consumes it, including
//! redelivery and version bridging along the way.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::Value;

use chat_backbone::application::{
    DispatchTable, EventConsumer, EventHandler, EventPublisher, IdempotentConsumer,
};
use chat_backbone::domain::events::payloads::{DomainEvent, MessageSentPayload};
use chat_backbone::domain::events::{default_registry, EventEnvelope, VersionRegistry};
use chat_backbone::infrastructure::broadcast::Broadcast;
use chat_backbone::infrastructure::event_store::InMemoryEventStore;
use chat_backbone::infrastructure::idempotency::{
    DedupKey, IdempotencyStore, InMemoryIdempotencyStore,
};
use chat_backbone::shared::error::EventError;

fn message_sent(conversation: &str, message: &str) -> EventEnvelope {
    EventEnvelope::new(DomainEvent::MessageSent(MessageSentPayload {
        message_id: message.into(),
        conversation_id: conversation.into(),
        sender_id: "u-1".into(),
        content: "hello".into(),
        reply_to_id: None,
    }))
    .with_correlation("req-1")
}

/// Captures broadcast traffic the way another gateway would receive it.
#[derive(Default)]
struct CapturingBroker {
    messages: Mutex<Vec<(String, Value)>>,
}

impl CapturingBroker {
    fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }
}

#[async_trait]
impl Broadcast for CapturingBroker {
    async fn publish_json(&self, channel: &str, payload: Value) -> Result<(), EventError> {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_owned(), payload));
        Ok(())
    }
}

/// Cache-style handler whose writes are observable and upsert-safe.
struct ConversationCache {
    writes: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for ConversationCache {
    fn name(&self) -> &str {
        "conversation-cache"
    }

    async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), EventError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Backbone {
    publisher: EventPublisher<InMemoryEventStore>,
    broker: Arc<CapturingBroker>,
    dedup: Arc<InMemoryIdempotencyStore>,
    consumer: Arc<dyn EventConsumer>,
    writes: Arc<AtomicUsize>,
}

fn build_backbone() -> Backbone {
    let writes = Arc::new(AtomicUsize::new(0));
    let dedup = Arc::new(InMemoryIdempotencyStore::new());
    let consumer: Arc<dyn EventConsumer> = Arc::new(IdempotentConsumer::new(
        ConversationCache {
            writes: writes.clone(),
        },
        dedup.clone(),
        Duration::from_secs(5),
        3600,
    ));

    let dispatch = DispatchTable::builder()
        .on("MESSAGE_SENT", consumer.clone())
        .build();

    let broker = Arc::new(CapturingBroker::default());
    let publisher = EventPublisher::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(dispatch),
        broker.clone(),
    );

    Backbone {
        publisher,
        broker,
        dedup,
        consumer,
        writes,
    }
}

async fn settle_broadcasts() {
    // fan-out runs on spawned tasks
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn publish_commits_dispatches_and_fans_out() {
    let backbone = build_backbone();
    let envelope = message_sent("conv-1", "m-1");
    let event_id = envelope.event_id;

    let receipt = backbone.publisher.publish(envelope).await.unwrap();
    settle_broadcasts().await;

    assert_eq!(receipt.sequence, 1);
    assert!(receipt.listeners.failed.is_empty());
    assert_eq!(backbone.writes.load(Ordering::SeqCst), 1);

    let broadcasts = backbone.broker.take();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].0, "conversation:conv-1");
    assert_eq!(broadcasts[0].1["event_id"], event_id.to_string());
    assert_eq!(broadcasts[0].1["correlation_id"], "req-1");
}

#[tokio::test]
async fn redelivered_event_produces_side_effects_once() {
    let backbone = build_backbone();
    let envelope = message_sent("conv-1", "m-1");

    backbone.publisher.publish(envelope.clone()).await.unwrap();
    // broker redelivers the same occurrence twice
    backbone.consumer.consume(&envelope).await.unwrap();
    backbone.consumer.consume(&envelope).await.unwrap();

    assert_eq!(backbone.writes.load(Ordering::SeqCst), 1);
    let key = DedupKey::for_consumer(&envelope, "conversation-cache");
    assert!(backbone.dedup.is_processed(&key).await.unwrap());
}

#[tokio::test]
async fn another_gateway_decodes_the_wire_payload_and_dedups_it() {
    let backbone = build_backbone();
    let envelope = message_sent("conv-1", "m-1");

    backbone.publisher.publish(envelope).await.unwrap();
    settle_broadcasts().await;

    // a second gateway process receives the broadcast and decodes it with
    // its own compiled version registry
    let (_, wire) = backbone.broker.take().pop().unwrap();
    let registry = default_registry();
    let received = registry.decode(wire).unwrap();

    // it was already processed in this process: the shared dedup store
    // keeps the handler from running again
    backbone.consumer.consume(&received).await.unwrap();
    assert_eq!(backbone.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn same_aggregate_events_reach_consumers_in_publish_order() {
    let order = Arc::new(Mutex::new(Vec::new()));

    struct OrderRecorder {
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventConsumer for OrderRecorder {
        fn name(&self) -> &str {
            "order-recorder"
        }

        async fn consume(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
            if let DomainEvent::MessageSent(p) = &envelope.event {
                self.order.lock().unwrap().push(p.message_id.clone());
            }
            Ok(())
        }
    }

    let dispatch = DispatchTable::builder()
        .on(
            "MESSAGE_SENT",
            Arc::new(OrderRecorder {
                order: order.clone(),
            }),
        )
        .build();
    let publisher = EventPublisher::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(dispatch),
        Arc::new(CapturingBroker::default()),
    );

    for message in ["m-1", "m-2", "m-3"] {
        publisher
            .publish(message_sent("conv-1", message))
            .await
            .unwrap();
    }

    assert_eq!(
        *order.lock().unwrap(),
        vec!["m-1".to_string(), "m-2".into(), "m-3".into()]
    );
}

#[tokio::test]
async fn unbridgeable_version_is_rejected_before_any_consumption() {
    let backbone = build_backbone();
    let envelope = message_sent("conv-1", "m-1");
    backbone.publisher.publish(envelope).await.unwrap();
    settle_broadcasts().await;

    let (_, mut wire) = backbone.broker.take().pop().unwrap();
    // a newer producer stamped a version this process has no hop for
    wire["version"] = 5.into();

    // registry without any hops cannot bridge 5 -> 1
    let bare_registry = VersionRegistry::builder().build();
    let outcome = bare_registry.decode(wire);

    assert!(matches!(outcome, Err(EventError::VersionGap { .. })));
    // the event never reached the handler, and nothing was marked processed
    assert_eq!(backbone.writes.load(Ordering::SeqCst), 1);
    assert_eq!(backbone.dedup.processed_count(), 1);
}

#[tokio::test]
async fn old_wire_version_is_upgraded_before_the_consumer_sees_it() {
    let registry = default_registry();
    let wire = serde_json::json!({
        "event_id": "0b9bd3a2-9a49-41a4-9f0d-3f831ad34b1f",
        "occurred_at": "2026-02-01T09:30:00Z",
        "version": 1,
        "source": "messages",
        "aggregate_id": "conv-1",
        "t": "MESSAGE_SENT",
        "d": {
            "message_id": "m-1",
            "conversation_id": "conv-1",
            "sender_id": "u-1",
            "body": "hello from an old producer"
        }
    });

    let envelope = registry.decode(wire).unwrap();
    assert_eq!(envelope.version, 2);
    match &envelope.event {
        DomainEvent::MessageSent(p) => {
            assert_eq!(p.content, "hello from an old producer");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn replay_covers_broadcasts_missed_while_offline() {
    let backbone = build_backbone();

    backbone
        .publisher
        .publish(message_sent("conv-1", "m-1"))
        .await
        .unwrap();
    backbone
        .publisher
        .publish(message_sent("conv-1", "m-2"))
        .await
        .unwrap();

    // a gateway that saw sequence 1 and then went down reconciles by pull
    let missed = backbone.publisher.replay_after("conv-1", 1).await.unwrap();
    assert_eq!(missed.len(), 1);
    assert_eq!(missed[0].sequence, 2);
}
