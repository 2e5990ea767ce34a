//! Presentation Layer
//!
//! Gateway-side broadcast fan-in and the ops HTTP endpoints.

pub mod gateway;
pub mod http;

pub use gateway::{GatewayFanout, InMemoryPresenceRegistry, PresenceRegistry, SocketRef};
