//! Idle-tunnel sweep: agents that stop heartbeating (crashed, network
//! partition with no clean close) are evicted instead of lingering in
//! the registry forever.

use tokio::sync::Notify;
use std::sync::Arc;

use crate::state::AppState;

pub struct CleanupHandle {
    shutdown: Arc<Notify>,
    done: tokio::task::JoinHandle<()>,
}

impl CleanupHandle {
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Blocks until the cleanup loop has observed the shutdown signal and
    /// exited, so callers can be sure no further registry eviction races
    /// with the rest of the shutdown sequence.
    pub async fn wait_for_done(self) {
        let _ = self.done.await;
    }
}

pub fn spawn(state: AppState) -> CleanupHandle {
    let shutdown = Arc::new(Notify::new());
    let shutdown_rx = shutdown.clone();

    let done = tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => sweep(&state),
                _ = shutdown_rx.notified() => break,
            }
        }
    });

    CleanupHandle { shutdown, done }
}

fn sweep(state: &AppState) {
    let timeout = state.config.heartbeat_timeout;
    let mut stale = Vec::new();
    state.registry.for_each(|tunnel| {
        if tunnel.is_stale(timeout) || tunnel.conn().is_closed() {
            stale.push(tunnel.clone());
        }
    });
    for tunnel in stale {
        tracing::warn!(
            environment_id = %tunnel.environment_id,
            "evicting tunnel with no recent heartbeat"
        );
        let registry = state.registry.clone();
        tokio::spawn(async move {
            tunnel.close().await;
            registry.unregister(&tunnel.environment_id, tunnel.tunnel_id);
        });
    }
}
