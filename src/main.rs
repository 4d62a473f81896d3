//! Foreman - MCP server for Buildbot
//!
//! This binary runs as an MCP server using stdio transport.
//!
//! # Configuration
//!
//! Set the following environment variables (or use a `.env` file):
//!
//! - `BUILDBOT_URL`: Base URL of the Buildbot master
//! - `BUILDBOT_USER`, `BUILDBOT_PASSWORD`: Credentials, if the master requires them
//!
//! # Usage
//!
//! ```bash
//! BUILDBOT_URL=https://ci.example.com BUILDBOT_USER=alice BUILDBOT_PASSWORD=xxx ./foreman
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::{fmt, EnvFilter};

use foreman::{
    client::ApiClient,
    config::Config,
    server::ForemanServer,
    session::{AccountKey, MemorySecretStore, NonInteractivePrompt},
};

fn secret_store(config: &Config) -> MemorySecretStore {
    match (&config.user, &config.password) {
        (Some(user), Some(password)) => {
            MemorySecretStore::with_secret(AccountKey::new(config.host(), user), password.as_str())
        }
        (None, Some(_)) => {
            tracing::warn!("BUILDBOT_PASSWORD is set without BUILDBOT_USER and will be ignored");
            MemorySecretStore::new()
        }
        _ => MemorySecretStore::new(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // stdout is reserved for MCP JSON-RPC messages
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foreman=info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting Foreman MCP server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::debug!(url = %config.url, user = ?config.user, "Configuration loaded");

    // no terminal to ask on: the server runs over stdio
    let client = ApiClient::new(
        &config,
        Arc::new(secret_store(&config)),
        Arc::new(NonInteractivePrompt),
    )
    .context("Failed to create Buildbot client")?;

    tracing::info!("Testing connection to Buildbot...");
    if let Err(e) = client.test_connection().await {
        tracing::error!(error = %e, "Connection test failed");
        tracing::warn!(
            "Server will start but may not be able to reach Buildbot. \
             Check configuration and network connectivity."
        );
    }

    let server = ForemanServer::new(client);

    tracing::info!("Server initialized, starting stdio transport");

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("serving error: {:?}", e);
        })
        .context("Failed to start server")?;

    service
        .waiting()
        .await
        .context("Server error during operation")?;

    tracing::info!("Server shutting down");

    Ok(())
}
