//! Shared utilities used across layers.

pub mod error;

pub use error::EventError;
