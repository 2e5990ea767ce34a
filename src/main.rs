//! # Chat Backbone
//!
//! Event backbone service for a horizontally scaled chat backend.
//!
//! This is the application entry point that initializes:
//! - Tracing/logging subsystem
//! - Configuration loading
//! - Event log connection pool
//! - Redis broker connections
//! - Ops HTTP server

use anyhow::Result;
use tracing::info;

use chat_backbone::application::DispatchTable;
use chat_backbone::config::Settings;
use chat_backbone::startup::Application;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    chat_backbone::telemetry::init_tracing();

    info!("Starting Chat Backbone...");

    // Load configuration from environment and config files
    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        environment = %settings.environment,
        "Configuration loaded"
    );

    // Consumers are registered by the embedding service; the standalone
    // binary runs the backbone with an empty table.
    let application =
        Application::build(settings, |_context| DispatchTable::builder().build()).await?;

    info!("Backbone ready");
    application.run_until_stopped().await?;

    Ok(())
}
