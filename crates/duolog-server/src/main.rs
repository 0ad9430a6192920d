//! # duolog-server
//!
//! HTTP front end for the anonymous chat pairing service.
//!
//! This binary provides:
//! - **REST API** (axum) for onboarding, searching, relaying messages and
//!   ending chats, plus a long-poll `updates` endpoint per user
//! - **Background matcher** pairing waiting users as soon as the queue changes
//! - **Sweeper** closing idle chats and expiring gate tokens
//! - **Admin API** (bearer token) for bans, warnings, reports and the
//!   monetization gate settings
//! - **Per-user rate limiting** on message relay
//! - **Gateway secret** (`x-gateway-token`) guarding every `/users` route

mod api;
mod config;
mod error;
mod mailbox;
mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duolog_core::{ChannelTransport, ChatService, SystemClock};
use duolog_shared::Repository;
use duolog_store::{Database, SqliteRepository};

use crate::api::AppState;
use crate::config::ServerConfig;

fn open_repository(config: &ServerConfig) -> anyhow::Result<SqliteRepository> {
    let path = match &config.database_path {
        Some(path) => path.clone(),
        None => Database::default_path()?,
    };
    Ok(SqliteRepository::open_at(&path)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,duolog_server=debug,duolog_core=debug")
        }))
        .init();

    info!("Starting duolog server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.gateway_token.is_none() {
        warn!("GATEWAY_TOKEN is not set; every /users request will be refused");
    }

    // -----------------------------------------------------------------------
    // 3. Restore state
    // -----------------------------------------------------------------------
    let repo: Arc<dyn Repository> = Arc::new(open_repository(&config)?);
    let transport = Arc::new(ChannelTransport::new());
    let service = Arc::new(ChatService::restore(
        repo,
        transport.clone(),
        Arc::new(SystemClock),
        config.core.clone(),
    )?);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let matcher = service.spawn_matcher(config.match_interval());
    let sweeper = service.spawn_sweeper(config.sweep_interval(), config.idle_timeout());

    let http_addr = config.http_addr;
    let app_state = AppState::new(service, transport, config);

    // Evict relay buckets idle for more than 10 minutes, every 5 minutes.
    let limiter = app_state.relay_limiter.clone();
    let purger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    matcher.abort();
    sweeper.abort();
    purger.abort();

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
