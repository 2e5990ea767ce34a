//! Configuration management.

mod settings;

pub use settings::{DatabaseSettings, EventSettings, RedisSettings, ServerSettings, Settings};
