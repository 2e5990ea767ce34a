//! Infrastructure Layer
//!
//! Durable event log (PostgreSQL), idempotency store (Redis), pub/sub
//! broadcaster (Redis), and metrics.

pub mod broadcast;
pub mod event_store;
pub mod idempotency;
pub mod metrics;

pub use broadcast::{channels, Broadcast, RedisBroadcaster, Subscription, SubscriptionTable};
pub use event_store::{
    create_pool, run_migrations, EventStore, InMemoryEventStore, PgEventStore, StoredEvent,
};
pub use idempotency::{
    DedupKey, IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore,
};
