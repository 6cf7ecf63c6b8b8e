//! Agent runtime configuration. Replaces the teacher's `AgentState`
//! fields that existed purely to let the Tauri UI edit them at runtime
//! (`server_url` behind a `RwLock`) with environment-sourced, load-once
//! settings appropriate for a headless background process.

use std::time::Duration;

/// Which tunnel transport to use. `Auto` tries the framed QUIC transport
/// first and falls back to WebSocket if it cannot be established —
/// agents behind restrictive egress (UDP blocked) still connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTransport {
    Auto,
    Quic,
    WebSocket,
}

impl EdgeTransport {
    fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "quic" | "grpc" => EdgeTransport::Quic,
            "websocket" | "ws" => EdgeTransport::WebSocket,
            _ => EdgeTransport::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the manager's QUIC tunnel listener, e.g. `quic://manager:7443`.
    pub manager_quic_url: String,
    /// Base URL of the manager's WebSocket tunnel listener, e.g.
    /// `wss://manager:7070/api/tunnel/connect`.
    pub manager_ws_url: String,
    pub agent_token: String,
    pub transport: EdgeTransport,
    /// Base URL of the local service this agent exposes, e.g.
    /// `http://127.0.0.1:2375` for a local Docker API.
    pub local_base_url: String,
    /// Host/IP the local service listens on, used only to build the
    /// local WebSocket URL for `websocket_start` sessions (§4.6). May be
    /// empty or a wildcard (`0.0.0.0`, `::`), in which case `localhost`
    /// is used instead.
    pub listen: String,
    /// Port the local service listens on, used the same way as `listen`.
    pub port: String,
    pub reconnect_interval: Duration,
    /// Upper bound on the reconnect backoff (§4.6: "bounded backoff, cap
    /// default 60s").
    pub max_reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive un-acked heartbeats before the connection is considered
    /// dead and torn down for a fresh reconnect.
    pub max_unacked_heartbeats: u32,
    pub request_timeout: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            manager_quic_url: env_or("ARCANE_MANAGER_QUIC_URL", "quic://127.0.0.1:7443"),
            manager_ws_url: env_or(
                "ARCANE_MANAGER_WS_URL",
                "ws://127.0.0.1:7070/api/tunnel/connect",
            ),
            agent_token: env_or("ARCANE_AGENT_TOKEN", ""),
            transport: EdgeTransport::from_str(&env_or("ARCANE_EDGE_TRANSPORT", "auto")),
            local_base_url: env_or("ARCANE_LOCAL_BASE_URL", "http://127.0.0.1:2375"),
            listen: env_or("ARCANE_LISTEN", ""),
            port: env_or("ARCANE_PORT", "2375"),
            reconnect_interval: env_secs("ARCANE_RECONNECT_INTERVAL_SECS", 3),
            max_reconnect_interval: env_secs("ARCANE_MAX_RECONNECT_INTERVAL_SECS", 60),
            heartbeat_interval: env_secs("ARCANE_HEARTBEAT_INTERVAL_SECS", 20),
            max_unacked_heartbeats: std::env::var("ARCANE_MAX_UNACKED_HEARTBEATS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            request_timeout: env_secs("ARCANE_REQUEST_TIMEOUT_SECS", 30),
        }
    }
}
