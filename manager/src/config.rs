//! Runtime configuration, sourced from the environment with the same
//! "sane default, override with an env var" approach the teacher's
//! `main.rs` used for its fixed port — just with more knobs, since a
//! manager now has heartbeat/timeout/cleanup tunables the single-port
//! relay server didn't need.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP + WebSocket listener, serving both the request adapter and
    /// the WebSocket-fallback tunnel endpoint.
    pub http_bind: String,
    /// QUIC listener for the framed-RPC tunnel transport.
    pub quic_bind: String,
    /// How often an agent is expected to send a heartbeat.
    pub heartbeat_interval: Duration,
    /// How long without a heartbeat before a tunnel is considered dead.
    pub heartbeat_timeout: Duration,
    /// How often the cleanup loop sweeps the registry for dead tunnels.
    pub cleanup_interval: Duration,
    /// How long the request adapter waits for a response before failing
    /// a proxied HTTP request with `Timeout`.
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            http_bind: std::env::var("ARCANE_HTTP_BIND")
                .unwrap_or_else(|_| "0.0.0.0:7070".to_string()),
            quic_bind: std::env::var("ARCANE_QUIC_BIND")
                .unwrap_or_else(|_| "0.0.0.0:7443".to_string()),
            heartbeat_interval: Duration::from_secs(env_or("ARCANE_HEARTBEAT_INTERVAL_SECS", 20)),
            heartbeat_timeout: Duration::from_secs(env_or("ARCANE_HEARTBEAT_TIMEOUT_SECS", 90)),
            cleanup_interval: Duration::from_secs(env_or("ARCANE_CLEANUP_INTERVAL_SECS", 30)),
            request_timeout: Duration::from_secs(env_or("ARCANE_REQUEST_TIMEOUT_SECS", 30)),
        }
    }
}
