//! Pub/Sub Broadcaster
//!
//! Fire-and-forget fan-out of real-time payloads across gateway processes
//! over Redis pub/sub. No acknowledgement, no backpressure, no replay: a
//! subscriber that was not listening at publish time misses the message, and
//! callers needing durability go to the event log instead.
//!
//! Channel names are pure functions of a routing key, so any process can
//! compute the channel for an entity without a directory lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::RedisSettings;
use crate::domain::events::EventEnvelope;
use crate::infrastructure::metrics;
use crate::shared::error::EventError;

/// Channel naming: `<domain>:<routing key>`.
pub mod channels {
    use crate::domain::events::{DomainEvent, EventEnvelope};

    /// All events scoped to one conversation
    pub fn conversation(conversation_id: impl std::fmt::Display) -> String {
        format!("conversation:{}", conversation_id)
    }

    /// Per-user channel (blocks, privacy, receipts)
    pub fn user(user_id: impl std::fmt::Display) -> String {
        format!("user:{}", user_id)
    }

    /// Per-conversation typing indicator channel
    pub fn typing(conversation_id: impl std::fmt::Display) -> String {
        format!("typing:{}", conversation_id)
    }

    /// Channel an envelope fans out on.
    ///
    /// Typing traffic gets its own channel so gateways can opt out of the
    /// chatter; conversation-scoped events share the conversation channel;
    /// everything else is per-user.
    pub fn for_envelope(envelope: &EventEnvelope) -> String {
        match &envelope.event {
            DomainEvent::TypingStarted(p) => typing(&p.conversation_id),
            event => match event.conversation_id() {
                Some(conversation_id) => conversation(conversation_id),
                None => user(&envelope.aggregate_id),
            },
        }
    }
}

type HandlerFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Process-local registry of channel subscriptions.
///
/// Cardinality is per-process: the broker only knows whether this process
/// listens on a channel at all, the table knows which local handlers do.
#[derive(Default)]
pub struct SubscriptionTable {
    next_id: AtomicU64,
    handlers: DashMap<String, Vec<(u64, HandlerFn)>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns its registration id and whether it is the
    /// first handler for the channel in this process.
    fn insert(&self, channel: &str, handler: HandlerFn) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.handlers.entry(channel.to_owned()).or_default();
        entry.push((id, handler));
        (id, entry.len() == 1)
    }

    /// Remove one registration; returns true when the channel has no local
    /// handlers left.
    fn remove(&self, channel: &str, id: u64) -> bool {
        if let Some(mut entry) = self.handlers.get_mut(channel) {
            entry.retain(|(handler_id, _)| *handler_id != id);
            if entry.is_empty() {
                drop(entry);
                self.handlers.remove_if(channel, |_, handlers| handlers.is_empty());
                return true;
            }
            return false;
        }
        true
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.handlers.get(channel).map_or(0, |entry| entry.len())
    }

    /// Deliver a raw payload to every handler registered for the channel.
    ///
    /// A malformed payload is logged and dropped; it must not take down the
    /// receive loop or starve later messages. Returns the number of handlers
    /// invoked.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(error) => {
                warn!(channel, %error, "Dropping malformed broadcast payload");
                metrics::record_broadcast_dropped();
                return 0;
            }
        };

        // Snapshot the handlers so callbacks run without holding the map lock.
        let handlers: Vec<HandlerFn> = self
            .handlers
            .get(channel)
            .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(value.clone());
        }
        handlers.len()
    }
}

/// Wrap a typed callback into the raw-JSON handler the table stores.
/// Deserialization failures are logged and dropped per channel contract.
fn typed_handler<T, F>(channel: &str, callback: F) -> HandlerFn
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    let channel = channel.to_owned();
    Arc::new(move |value: Value| match serde_json::from_value::<T>(value) {
        Ok(payload) => callback(payload),
        Err(error) => {
            warn!(channel = %channel, %error, "Dropping broadcast payload of unexpected shape");
            metrics::record_broadcast_dropped();
        }
    })
}

/// Publisher-side half of the broadcaster, object-safe so the event
/// publisher can fan out without caring about the transport.
#[async_trait]
pub trait Broadcast: Send + Sync {
    async fn publish_json(&self, channel: &str, payload: Value) -> Result<(), EventError>;
}

enum ControlMsg {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis pub/sub broadcaster.
///
/// Publishing goes through a cloned [`ConnectionManager`]; receiving runs on
/// a dedicated task owning the pub/sub connection, feeding the process-local
/// [`SubscriptionTable`]. Broker SUBSCRIBE/UNSUBSCRIBE commands are issued
/// only on the first/last local handler for a channel.
pub struct RedisBroadcaster {
    publish_conn: ConnectionManager,
    table: Arc<SubscriptionTable>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
}

impl RedisBroadcaster {
    /// Connect to Redis and spawn the receive loop.
    #[instrument(skip(settings), fields(url = %settings.url))]
    pub async fn connect(settings: &RedisSettings) -> Result<Self, EventError> {
        let client = redis::Client::open(settings.url.as_str())?;
        let publish_conn = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;
        info!("Broadcast connection established");

        let table = Arc::new(SubscriptionTable::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (sink, stream) = pubsub.split();
        tokio::spawn(receive_loop(sink, stream, control_rx, table.clone()));

        Ok(Self {
            publish_conn,
            table,
            control_tx,
        })
    }

    /// Publish a payload to a channel. Fire-and-forget: the subscriber count
    /// at the broker is ignored, and zero subscribers is not an error.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<(), EventError> {
        let data = serde_json::to_string(payload)?;
        let mut conn = self.publish_conn.clone();
        let _receivers: u64 = conn.publish(channel, data).await?;
        metrics::record_broadcast_published(channel);
        debug!(channel, "Broadcast published");
        Ok(())
    }

    /// Register a typed handler for a channel in this process. Every
    /// registration is independent; all handlers on a channel fire for each
    /// incoming message. The returned guard removes exactly this
    /// registration when dropped or explicitly unsubscribed.
    pub fn subscribe<T, F>(&self, channel: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let (id, first) = self.table.insert(channel, typed_handler(channel, handler));
        if first {
            // Receive loop owns the broker-side subscription state.
            let _ = self.control_tx.send(ControlMsg::Subscribe(channel.to_owned()));
        }
        Subscription {
            channel: channel.to_owned(),
            id,
            table: self.table.clone(),
            control_tx: self.control_tx.clone(),
            active: true,
        }
    }

    /// Convenience wrapper: subscribe to envelopes on a channel.
    pub fn subscribe_envelopes<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        self.subscribe::<EventEnvelope, F>(channel, handler)
    }
}

#[async_trait]
impl Broadcast for RedisBroadcaster {
    async fn publish_json(&self, channel: &str, payload: Value) -> Result<(), EventError> {
        self.publish(channel, &payload).await
    }
}

/// Capability to remove one channel registration.
pub struct Subscription {
    channel: String,
    id: u64,
    table: Arc<SubscriptionTable>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    active: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove this registration; the last one off a channel unsubscribes the
    /// process at the broker.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if self.table.remove(&self.channel, self.id) {
            let _ = self
                .control_tx
                .send(ControlMsg::Unsubscribe(self.channel.clone()));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Broker-side subscription commands, as the receive loop issues them.
#[async_trait]
trait BrokerSink: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), redis::RedisError>;
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), redis::RedisError>;
}

#[async_trait]
impl BrokerSink for redis::aio::PubSubSink {
    async fn subscribe(&mut self, channel: &str) -> Result<(), redis::RedisError> {
        redis::aio::PubSubSink::subscribe(self, channel).await
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), redis::RedisError> {
        redis::aio::PubSubSink::unsubscribe(self, channel).await
    }
}

async fn receive_loop<K, S>(
    mut sink: K,
    mut stream: S,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    table: Arc<SubscriptionTable>,
) where
    K: BrokerSink,
    S: futures::Stream<Item = redis::Msg> + Unpin + Send,
{
    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(ControlMsg::Subscribe(channel)) => {
                    if let Err(error) = sink.subscribe(&channel).await {
                        warn!(channel, %error, "Broker subscribe failed");
                    }
                }
                Some(ControlMsg::Unsubscribe(channel)) => {
                    if let Err(error) = sink.unsubscribe(&channel).await {
                        warn!(channel, %error, "Broker unsubscribe failed");
                    }
                }
                // Broadcaster and every subscription guard are gone, so
                // nothing can observe further messages.
                None => {
                    info!("Broadcast control channel closed; receive loop exiting");
                    break;
                }
            },
            message = stream.next() => match message {
                Some(message) => {
                    let channel = message.get_channel_name().to_owned();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(error) => {
                            warn!(channel, %error, "Dropping undecodable broadcast frame");
                            metrics::record_broadcast_dropped();
                            continue;
                        }
                    };
                    let delivered = table.dispatch(&channel, &payload);
                    metrics::record_broadcast_received(&channel);
                    debug!(channel, delivered, "Broadcast received");
                }
                None => {
                    info!("Broadcast stream closed; receive loop exiting");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::payloads::{DomainEvent, MessageSentPayload, TypingStartedPayload};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> HandlerFn {
        Arc::new(move |_value| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn channel_names_are_pure_functions_of_routing_keys() {
        assert_eq!(channels::conversation("conv-1"), "conversation:conv-1");
        assert_eq!(channels::user("u-1"), "user:u-1");
        assert_eq!(channels::typing("conv-1"), "typing:conv-1");
    }

    #[test]
    fn typing_events_route_to_the_typing_channel() {
        let envelope = EventEnvelope::new(DomainEvent::TypingStarted(TypingStartedPayload {
            conversation_id: "conv-4".into(),
            user_id: "u-1".into(),
            started_at_ms: 0,
        }));
        assert_eq!(channels::for_envelope(&envelope), "typing:conv-4");

        let envelope = EventEnvelope::new(DomainEvent::MessageSent(MessageSentPayload {
            message_id: "m-1".into(),
            conversation_id: "conv-4".into(),
            sender_id: "u-1".into(),
            content: "hi".into(),
            reply_to_id: None,
        }));
        assert_eq!(channels::for_envelope(&envelope), "conversation:conv-4");
    }

    #[test]
    fn every_local_handler_fires_per_message() {
        let table = SubscriptionTable::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        table.insert("conversation:conv-1", counting_handler(first.clone()));
        table.insert("conversation:conv-1", counting_handler(second.clone()));

        let delivered = table.dispatch("conversation:conv-1", r#"{"k":1}"#);

        assert_eq!(delivered, 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let table = SubscriptionTable::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // published before any subscriber existed
        table.dispatch("conversation:conv-1", r#"{"k":1}"#);

        table.insert("conversation:conv-1", counting_handler(counter.clone()));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_payload_is_dropped_not_fatal() {
        let table = SubscriptionTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table.insert("conversation:conv-1", counting_handler(counter.clone()));

        assert_eq!(table.dispatch("conversation:conv-1", "{not json"), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // the channel still works for subsequent messages
        assert_eq!(table.dispatch("conversation:conv-1", r#"{"ok":true}"#), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_deletes_exactly_one_registration() {
        let table = SubscriptionTable::new();
        let keep = Arc::new(AtomicUsize::new(0));
        let gone = Arc::new(AtomicUsize::new(0));

        let (keep_id, _) = table.insert("user:u-1", counting_handler(keep.clone()));
        let (gone_id, _) = table.insert("user:u-1", counting_handler(gone.clone()));
        let _ = keep_id;

        assert!(!table.remove("user:u-1", gone_id));
        table.dispatch("user:u-1", "{}");

        assert_eq!(keep.load(Ordering::SeqCst), 1);
        assert_eq!(gone.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn last_removal_empties_the_channel() {
        let table = SubscriptionTable::new();
        let (id, first) = table.insert("typing:conv-1", counting_handler(Arc::new(AtomicUsize::new(0))));

        assert!(first);
        assert!(table.remove("typing:conv-1", id));
        assert_eq!(table.handler_count("typing:conv-1"), 0);
    }

    struct NoopSink;

    #[async_trait]
    impl BrokerSink for NoopSink {
        async fn subscribe(&mut self, _channel: &str) -> Result<(), redis::RedisError> {
            Ok(())
        }

        async fn unsubscribe(&mut self, _channel: &str) -> Result<(), redis::RedisError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn receive_loop_exits_when_the_last_control_sender_drops() {
        let table = Arc::new(SubscriptionTable::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlMsg>();

        // An idle broker connection may never close its message stream, so
        // loop termination must not depend on it.
        let task = tokio::spawn(receive_loop(
            NoopSink,
            futures::stream::pending::<redis::Msg>(),
            control_rx,
            table,
        ));
        drop(control_tx);

        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("receive loop must exit once no sender remains")
            .unwrap();
    }

    #[test]
    fn typed_handler_drops_unexpected_shapes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let handler = typed_handler::<TypingStartedPayload, _>("typing:conv-1", move |_payload| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        handler(json!({"unexpected": "shape"}));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        handler(json!({
            "conversation_id": "conv-1",
            "user_id": "u-1",
            "started_at_ms": 123
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
