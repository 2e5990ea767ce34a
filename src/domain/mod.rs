//! Domain layer: events and the contracts built around them.

pub mod events;

pub use events::{DomainEvent, EventEnvelope, EventSource, VersionRegistry};
