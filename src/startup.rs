//! Application Startup
//!
//! Wires the event backbone together: connection pools, the version
//! registry, the dispatch table, the publisher and the broadcaster. The
//! dispatch table is supplied by the embedding service at build time and
//! frozen before the first publish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::application::{DispatchTable, EventHandler, EventPublisher, IdempotentConsumer};
use crate::config::{EventSettings, Settings};
use crate::domain::events::{default_registry, VersionRegistry};
use crate::infrastructure::broadcast::RedisBroadcaster;
use crate::infrastructure::event_store::{self, PgEventStore};
use crate::infrastructure::idempotency::{IdempotencyStore, RedisIdempotencyStore};
use crate::presentation::http;

/// Wiring context handed to the embedding service when it registers its
/// consumers. Carries the shared dedup store and the configured event
/// settings so handler timeout, retention and the instance id all come
/// from one place.
pub struct EventContext<S> {
    store: Arc<S>,
    /// This process's instance id, for gateway fan-in construction
    pub instance_id: String,
    handler_timeout: Duration,
    retention_secs: u64,
}

impl<S: IdempotencyStore> EventContext<S> {
    pub fn new(events: &EventSettings, store: Arc<S>) -> Self {
        Self {
            store,
            instance_id: events.instance_id.clone(),
            handler_timeout: Duration::from_secs(events.handler_timeout_secs),
            retention_secs: events.idempotency_retention_secs,
        }
    }

    /// Wrap a handler with the configured idempotency guard.
    pub fn idempotent<H: EventHandler>(&self, handler: H) -> Arc<IdempotentConsumer<H, S>> {
        Arc::new(IdempotentConsumer::new(
            handler,
            self.store.clone(),
            self.handler_timeout,
            self.retention_secs,
        ))
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub publisher: Arc<EventPublisher<PgEventStore>>,
    pub broadcaster: Arc<RedisBroadcaster>,
    pub idempotency: Arc<RedisIdempotencyStore>,
    pub versions: Arc<VersionRegistry>,
    pub settings: Arc<Settings>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application from settings and the consumer wiring. The
    /// closure receives the [`EventContext`] so consumers are constructed
    /// with the configured timeout, retention and shared dedup store.
    pub async fn build<F>(settings: Settings, wire: F) -> Result<Self>
    where
        F: FnOnce(&EventContext<RedisIdempotencyStore>) -> DispatchTable,
    {
        // Event log pool
        let db = event_store::create_pool(&settings.database).await?;
        event_store::run_migrations(&db).await?;
        tracing::info!("Event log pool created and migrated");

        // Broadcast broker + idempotency store share the Redis instance
        let broadcaster = Arc::new(RedisBroadcaster::connect(&settings.redis).await?);
        let redis_client = redis::Client::open(settings.redis.url.as_str())?;
        let idempotency = Arc::new(RedisIdempotencyStore::new(
            redis::aio::ConnectionManager::new(redis_client).await?,
        ));
        tracing::info!("Redis connections established");

        let context = EventContext::new(&settings.events, idempotency.clone());
        let dispatch = wire(&context);
        tracing::info!(
            instance_id = %context.instance_id,
            event_types = dispatch.event_type_count(),
            "Consumers registered"
        );

        // Version hops compiled into this binary
        let versions = Arc::new(default_registry());

        let publisher = Arc::new(EventPublisher::new(
            Arc::new(PgEventStore::new(db.clone())),
            Arc::new(dispatch),
            broadcaster.clone(),
        ));

        let state = AppState {
            db,
            publisher,
            broadcaster,
            idempotency,
            versions,
            settings: Arc::new(settings.clone()),
        };

        let router = http::create_router(state);

        let addr = settings.server.socket_addr();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening on {}", addr);

        Ok(Self { listener, router })
    }

    /// Run the server until stopped
    pub async fn run_until_stopped(self) -> Result<()> {
        axum::serve(self.listener, self.router).await?;
        Ok(())
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::EventConsumer;
    use crate::domain::events::payloads::{DomainEvent, MessageSentPayload};
    use crate::domain::events::EventEnvelope;
    use crate::infrastructure::idempotency::{DedupKey, InMemoryIdempotencyStore};
    use crate::shared::error::EventError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            "message-cache"
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), EventError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn context_builds_consumers_from_event_settings() {
        let events = EventSettings {
            instance_id: "gw-test".into(),
            idempotency_retention_secs: 3600,
            handler_timeout_secs: 5,
        };
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let context = EventContext::new(&events, store.clone());
        assert_eq!(context.instance_id, "gw-test");

        let calls = Arc::new(AtomicUsize::new(0));
        let consumer = context.idempotent(CountingHandler {
            calls: calls.clone(),
        });
        let dispatch = DispatchTable::builder().on("MESSAGE_SENT", consumer).build();

        let envelope = EventEnvelope::new(DomainEvent::MessageSent(MessageSentPayload {
            message_id: "m-1".into(),
            conversation_id: "conv-1".into(),
            sender_id: "u-1".into(),
            content: "hi".into(),
            reply_to_id: None,
        }));

        // the wrapped consumer runs against the shared dedup store
        for consumer in dispatch.consumers_for("MESSAGE_SENT") {
            consumer.consume(&envelope).await.unwrap();
            consumer.consume(&envelope).await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let key = DedupKey::for_consumer(&envelope, "message-cache");
        assert!(store.is_processed(&key).await.unwrap());
    }
}
