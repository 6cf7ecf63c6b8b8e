//! The agent's live tunnel connection and the bookkeeping that rides on
//! top of it — the agent-side counterpart to the manager's `AgentTunnel`.
//! Replaces the teacher's `AgentState` (built for a Tauri UI to read and
//! mutate) with something sized for a headless background process.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tunnel_protocol::{Conn, TunnelError, TunnelMessage};

use crate::config::Config;

pub struct AgentClient {
    conn: Arc<dyn Conn>,
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    ws_sessions: DashMap<String, mpsc::UnboundedSender<TunnelMessage>>,
    unacked_heartbeats: AtomicU32,
    environment_id: Mutex<String>,
    started_at: Instant,
    closed: AtomicBool,
    /// Non-fatal errors (individual request failures, local handler
    /// errors — §4.6/§6) published here in addition to being logged, so
    /// an embedding application can observe them instead of relying
    /// solely on `tracing` output.
    errors_tx: mpsc::UnboundedSender<TunnelError>,
    errors_rx: SyncMutex<Option<mpsc::UnboundedReceiver<TunnelError>>>,
}

#[derive(Debug, Serialize)]
pub struct AgentSnapshot {
    pub connected: bool,
    pub environment_id: String,
    pub uptime_secs: u64,
    pub active_websocket_sessions: usize,
    pub unacked_heartbeats: u32,
}

impl AgentClient {
    pub fn new(conn: Arc<dyn Conn>, config: Arc<Config>, http_client: reqwest::Client) -> Arc<Self> {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            conn,
            config,
            http_client,
            ws_sessions: DashMap::new(),
            unacked_heartbeats: AtomicU32::new(0),
            environment_id: Mutex::new(String::new()),
            started_at: Instant::now(),
            closed: AtomicBool::new(false),
            errors_tx,
            errors_rx: SyncMutex::new(Some(errors_rx)),
        })
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        &self.conn
    }

    pub async fn send(&self, msg: TunnelMessage) -> Result<(), TunnelError> {
        self.conn.send(&msg).await
    }

    pub async fn set_environment_id(&self, id: String) {
        *self.environment_id.lock().await = id;
    }

    pub async fn environment_id(&self) -> String {
        self.environment_id.lock().await.clone()
    }

    pub fn register_websocket_session(&self, id: String, tx: mpsc::UnboundedSender<TunnelMessage>) {
        self.ws_sessions.insert(id, tx);
    }

    pub fn forward_to_session(&self, id: &str, msg: TunnelMessage) {
        if let Some(tx) = self.ws_sessions.get(id) {
            let _ = tx.send(msg);
        }
    }

    pub fn end_websocket_session(&self, id: &str) {
        self.ws_sessions.remove(id);
    }

    pub fn note_heartbeat_sent(&self) -> u32 {
        self.unacked_heartbeats.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn note_heartbeat_ack(&self) {
        self.unacked_heartbeats.store(0, Ordering::SeqCst);
    }

    pub fn is_unresponsive(&self) -> bool {
        self.unacked_heartbeats.load(Ordering::SeqCst) >= self.config.max_unacked_heartbeats
    }

    /// Publishes a non-fatal error for whoever is draining
    /// [`Self::take_error_receiver`]. Dropped silently if nobody is
    /// listening (the default, logging-only consumer wired in `main.rs`
    /// counts as a listener).
    pub fn report_error(&self, err: TunnelError) {
        let _ = self.errors_tx.send(err);
    }

    /// Takes the error receiver, once. Returns `None` on every call after
    /// the first for this client, since `mpsc::UnboundedReceiver` has a
    /// single owner.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TunnelError>> {
        self.errors_rx.lock().unwrap().take()
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.conn.close().await;
        let ids: Vec<String> = self.ws_sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.end_websocket_session(&id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.conn.is_closed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            connected: !self.is_closed(),
            environment_id: self.environment_id().await,
            uptime_secs: self.uptime().as_secs(),
            active_websocket_sessions: self.ws_sessions.len(),
            unacked_heartbeats: self.unacked_heartbeats.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as TestAtomicBool;

    use crate::config::Config;

    struct NullConn {
        closed: TestAtomicBool,
    }

    #[async_trait::async_trait]
    impl Conn for NullConn {
        async fn send(&self, _msg: &TunnelMessage) -> Result<(), TunnelError> {
            Ok(())
        }
        async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
            Err(TunnelError::TunnelClosed)
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn is_expected_receive_error(&self, _err: &TunnelError) -> bool {
            true
        }
    }

    fn client() -> Arc<AgentClient> {
        AgentClient::new(
            Arc::new(NullConn {
                closed: TestAtomicBool::new(false),
            }),
            Arc::new(Config::from_env()),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn reported_errors_are_observed_by_the_taken_receiver() {
        let client = client();
        let mut rx = client.take_error_receiver().expect("receiver not yet taken");

        client.report_error(TunnelError::Timeout);

        assert!(matches!(rx.recv().await, Some(TunnelError::Timeout)));
    }

    #[test]
    fn the_error_receiver_can_only_be_taken_once() {
        let client = client();
        assert!(client.take_error_receiver().is_some());
        assert!(client.take_error_receiver().is_none());
    }
}
