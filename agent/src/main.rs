//! # Arcane Edge Tunnel — Agent
//!
//! Dials out to a manager, registers with a bearer token, and forwards
//! tunneled HTTP/WebSocket traffic to a local service. Runs as a
//! headless background process; reconnects with an exponential backoff
//! on any disconnect.
//!
//! ## Modules
//!
//! - [`config`]     — runtime configuration
//! - [`state`]       — the live tunnel connection and its bookkeeping
//! - [`client`]      — dial/register/reconnect loop
//! - [`dispatcher`]  — steady-state frame demultiplexing
//! - [`heartbeat`]   — periodic liveness signal
//! - [`handler`]     — forwards `request` frames to the local HTTP service
//! - [`local_ws`]    — local WebSocket URL construction and session pumping
//! - [`ws_conn`]     — `tokio-tungstenite` adapter for the shared `WsConn`

mod client;
mod config;
mod dispatcher;
mod handler;
mod heartbeat;
mod local_ws;
mod state;
mod ws_conn;

use std::sync::Arc;
use std::time::Duration;

use config::Config;

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls CryptoProvider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arcane_tunnel_agent=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env());
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout.as_secs().max(1)))
        .build()
        .expect("failed to build local http client");

    tracing::info!(
        manager_quic_url = %config.manager_quic_url,
        manager_ws_url = %config.manager_ws_url,
        local_base_url = %config.local_base_url,
        listen = %config.listen,
        port = %config.port,
        "starting agent"
    );

    client::run_forever(config, http_client).await;
}
