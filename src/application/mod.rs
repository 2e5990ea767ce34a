//! Application Layer
//!
//! The event-publication boundary and the consumption protocol around it.

pub mod consumer;
pub mod dispatch;
pub mod publisher;

pub use consumer::{EventHandler, IdempotentConsumer};
pub use dispatch::{DispatchTable, DispatchTableBuilder, EventConsumer};
pub use publisher::{EventPublisher, ListenerOutcome, PublishReceipt};
