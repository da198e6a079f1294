//! WA Session Hub - Main Entry Point
//!
//! Serves dashboard observers over WebSocket and drives the single protocol
//! session through the sidecar bridge.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wa_session_hub::config::HubConfig;
use wa_session_hub::hub::Hub;
use wa_session_hub::server;
use wa_session_hub::session::bridge::BridgeConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wa_session_hub=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 WA Session Hub starting...");

    // Load configuration
    let config = HubConfig::from_env()?;
    info!("📋 Configuration loaded");

    let connector = Arc::new(BridgeConnector::new(
        config.bridge_url.clone(),
        config.request_timeout(),
        config.debug_mode,
    ));
    let hub = Hub::start(&config, connector);

    if config.auto_start && hub.session.credentials().exists().await {
        info!("🔐 Stored credentials found, resuming session");
        hub.manager.start(None);
    }

    // Spawn observer server
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let state = hub.server_state(&config);
    let observer_server = tokio::spawn(async move {
        if let Err(e) = server::run_server(addr, state).await {
            tracing::error!("Observer server error: {}", e);
        }
    });

    info!("🌐 Dashboard endpoint ws://{}/ws", config.listen_addr);
    info!("🔌 Protocol sidecar at {}", config.bridge_url);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("📢 Shutdown signal received"),
        Err(err) => tracing::error!("Unable to listen for shutdown signal: {}", err),
    }

    // Graceful shutdown
    info!("🛑 Shutting down...");
    if let Some(client) = hub.session.live() {
        client.close().await;
    }
    observer_server.abort();
    hub.shutdown();

    info!("✅ WA Session Hub stopped");
    Ok(())
}
