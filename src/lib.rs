//! # Chat Backbone Library
//!
//! This crate provides the event backbone for a chat backend whose modules
//! (conversations, messages, blocks, calls, privacy, media) communicate
//! through domain events rather than direct calls:
//!
//! - A durable, versioned, replayable envelope for every state change
//! - At-most-once side effects per listener despite at-least-once delivery
//! - Cross-instance real-time fan-out over Redis pub/sub, so delivery
//!   survives horizontal scaling of gateway processes
//!
//! ## Architecture
//!
//! The crate follows Clean Architecture principles:
//!
//! - **Domain Layer**: Event envelope, payload union, schema versioning
//! - **Application Layer**: Publisher boundary, dispatch table, idempotent
//!   consumption
//! - **Infrastructure Layer**: Event log (PostgreSQL), idempotency store
//!   and pub/sub broker (Redis), metrics
//! - **Presentation Layer**: Gateway fan-in and ops HTTP endpoints
//!
//! ## Module Structure
//!
//! ```text
//! chat_backbone/
//! +-- config/         Configuration management
//! +-- domain/         Event envelope, payloads, versioning
//! +-- application/    Publisher, dispatch table, idempotent consumer
//! +-- infrastructure/ Event log, idempotency store, broadcaster, metrics
//! +-- presentation/   Gateway fan-in, health and metrics endpoints
//! +-- shared/         Common utilities (errors)
//! ```

// Configuration module
pub mod config;

// Domain layer - events and their contracts
pub mod domain;

// Application layer - publish and consume protocols
pub mod application;

// Infrastructure layer - durable log, dedup store, broker
pub mod infrastructure;

// Presentation layer - gateway fan-in and ops endpoints
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
