//! Shared application state, cloned into every `axum` handler and QUIC
//! accept task — the same role the teacher's `AppState` played, now
//! holding a [`TunnelRegistry`] instead of three parallel `DashMap`s plus
//! a token resolver and event sink.

use std::sync::Arc;

use async_trait::async_trait;
use tunnel_protocol::{TunnelError, TunnelEvent};

use crate::config::Config;
use crate::registry::TunnelRegistry;

/// Maps an agent's bearer token to the environment id it authenticates,
/// run during the register handshake. The pairing/provisioning database
/// that issues these tokens is out of scope for this crate (see
/// `DESIGN.md`); the default resolver treats the trimmed token itself as
/// the environment id, which is sufficient for a single manager talking
/// to agents it provisioned directly.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, agent_token: &str) -> Result<String, TunnelError>;
}

pub struct StaticTokenResolver;

#[async_trait]
impl TokenResolver for StaticTokenResolver {
    async fn resolve(&self, agent_token: &str) -> Result<String, TunnelError> {
        let trimmed = agent_token.trim();
        if trimmed.is_empty() {
            return Err(TunnelError::Unauthenticated);
        }
        Ok(trimmed.to_string())
    }
}

/// Receives every `event` frame an agent forwards. The default sink just
/// logs; a real deployment wires this to whatever ingests domain events
/// (audit log, notification fan-out, ...).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, environment_id: &str, event: TunnelEvent);
}

pub struct LoggingEventSink;

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn handle(&self, environment_id: &str, event: TunnelEvent) {
        tracing::info!(
            environment_id,
            event_type = %event.event_type,
            severity = %event.severity,
            title = %event.title,
            "agent event"
        );
    }
}

/// Notified exactly once when a tunnel registers and exactly once when it
/// deregisters (§4.4 step 5/7: "optional `StatusCallback(ctx, envId,
/// connected bool)`"). The default implementation just logs; a real
/// deployment wires this to whatever tracks environment availability
/// (dashboard, provisioning database, alerting).
#[async_trait]
pub trait StatusCallback: Send + Sync {
    async fn on_status_change(&self, environment_id: &str, connected: bool);
}

pub struct LoggingStatusCallback;

#[async_trait]
impl StatusCallback for LoggingStatusCallback {
    async fn on_status_change(&self, environment_id: &str, connected: bool) {
        tracing::info!(environment_id, connected, "tunnel status changed");
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub config: Arc<Config>,
    pub token_resolver: Arc<dyn TokenResolver>,
    pub event_sink: Arc<dyn EventSink>,
    pub status_callback: Arc<dyn StatusCallback>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            config: Arc::new(config),
            token_resolver: Arc::new(StaticTokenResolver),
            event_sink: Arc::new(LoggingEventSink),
            status_callback: Arc::new(LoggingStatusCallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_is_trimmed_before_use_as_environment_id() {
        let resolver = StaticTokenResolver;
        let id = resolver.resolve("  env-123  \n").await.unwrap();
        assert_eq!(id, "env-123");
    }

    #[tokio::test]
    async fn blank_token_is_unauthenticated() {
        let resolver = StaticTokenResolver;
        assert!(matches!(
            resolver.resolve("   ").await,
            Err(TunnelError::Unauthenticated)
        ));
    }
}
