//! Domain Events
//!
//! The envelope, the payload union, and the schema-version bridging that let
//! chat modules communicate through events instead of direct calls.

pub mod envelope;
pub mod payloads;
pub mod versioning;

pub use envelope::EventEnvelope;
pub use payloads::{DomainEvent, EventSource};
pub use versioning::{default_registry, VersionFn, VersionRegistry, VersionRegistryBuilder};
