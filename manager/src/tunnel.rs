//! A single agent's live connection and the request bookkeeping that
//! rides on top of it. Replaces the teacher's `AgentInfo` (a bare
//! `ClientTx`) with something that also tracks liveness and correlates
//! in-flight requests, since a manager talks to the tunnel core instead
//! of relaying two peers' raw frames at each other.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tunnel_protocol::{Conn, TunnelError, TunnelMessage};
use uuid::Uuid;

use crate::pending::{PendingRequest, ResponseOutcome, StreamChunk};

/// A registered agent's connection, keyed in the [`crate::registry::TunnelRegistry`]
/// by environment id.
pub struct AgentTunnel {
    /// Identity distinct from the environment id, so a replaced tunnel
    /// (same environment, new connection) can be told apart from the one
    /// it superseded — see [`crate::registry::TunnelRegistry::unregister`].
    pub tunnel_id: Uuid,
    pub environment_id: String,
    conn: Arc<dyn Conn>,
    pending: DashMap<String, PendingRequest>,
    /// Seconds since `Instant`'s arbitrary epoch at the last frame
    /// received from the agent (`lastSeen`, §3). Stored as an atomic so
    /// the cleanup loop can read liveness without touching the tunnel's
    /// task.
    last_seen_secs: AtomicI64,
    closed: AtomicBool,
    started_at: Instant,
}

impl AgentTunnel {
    pub fn new(environment_id: String, conn: Arc<dyn Conn>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            tunnel_id: Uuid::new_v4(),
            environment_id,
            conn,
            pending: DashMap::new(),
            last_seen_secs: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            started_at: now,
        })
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        &self.conn
    }

    pub fn note_activity(&self) {
        let elapsed = self.started_at.elapsed().as_secs() as i64;
        self.last_seen_secs.store(elapsed, Ordering::SeqCst);
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        let elapsed = self.started_at.elapsed().as_secs() as i64;
        let last = self.last_seen_secs.load(Ordering::SeqCst);
        elapsed - last >= timeout.as_secs() as i64
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn register_pending(&self, id: String, pending: PendingRequest) {
        self.pending.insert(id, pending);
    }

    pub fn take_pending(&self, id: &str) -> Option<PendingRequest> {
        self.pending.remove(id).map(|(_, v)| v)
    }

    pub fn forward_websocket_frame(&self, id: &str, msg: TunnelMessage) {
        if let Some(entry) = self.pending.get(id) {
            if let PendingRequest::WebSocket(tx) = entry.value() {
                let _ = tx.send(msg);
            }
        }
    }

    /// Resolves a pending request with a single buffered `response` frame.
    /// No-op if the id has no pending entry (caller timed out or
    /// cancelled) or has already been converted to a stream.
    pub fn deliver_response(&self, id: &str, msg: TunnelMessage) {
        if let Some((_, PendingRequest::Http(tx))) = self.pending.remove(id) {
            let _ = tx.send(Ok(ResponseOutcome::Buffered(msg)));
        }
    }

    /// Delivers one `stream_data` chunk for `id`. The first chunk for a
    /// still-`Http` pending entry converts it in place to
    /// [`ResponseOutcome::Streamed`]; later chunks are forwarded to the
    /// channel the caller is already draining. A chunk on an unknown id
    /// (already timed out, cancelled, or ended) is dropped.
    pub fn deliver_stream_data(&self, id: &str, body: Vec<u8>) {
        let already_streaming = self
            .pending
            .get(id)
            .is_some_and(|entry| matches!(entry.value(), PendingRequest::Stream(_)));
        if already_streaming {
            if let Some(entry) = self.pending.get(id) {
                if let PendingRequest::Stream(tx) = entry.value() {
                    let _ = tx.send(StreamChunk::Data(body));
                }
            }
            return;
        }

        if let Some((_, PendingRequest::Http(tx))) = self.pending.remove(id) {
            let (stream_tx, stream_rx) = mpsc::unbounded_channel();
            let _ = stream_tx.send(StreamChunk::Data(body));
            let _ = tx.send(Ok(ResponseOutcome::Streamed(stream_rx)));
            self.pending.insert(id.to_string(), PendingRequest::Stream(stream_tx));
        }
    }

    /// Ends a streamed response. If `id` is still `Http` (a bare
    /// `stream_end` with no preceding chunk — an empty streamed body),
    /// it is resolved to an already-empty stream. Dropping the sender in
    /// either case, rather than forwarding an explicit terminator, is
    /// what the body stream observes as end-of-body.
    pub fn end_stream(&self, id: &str) {
        match self.pending.remove(id) {
            Some((_, PendingRequest::Http(tx))) => {
                let (_stream_tx, stream_rx) = mpsc::unbounded_channel();
                let _ = tx.send(Ok(ResponseOutcome::Streamed(stream_rx)));
            }
            Some((_, PendingRequest::Stream(_))) => {}
            _ => {}
        }
    }

    pub fn cancel_pending(&self, id: &str, err: TunnelError) {
        if let Some((_, pending)) = self.pending.remove(id) {
            match pending {
                PendingRequest::Http(tx) => {
                    let _ = tx.send(Err(err));
                }
                PendingRequest::Stream(tx) => {
                    let _ = tx.send(StreamChunk::Error(err));
                }
                PendingRequest::WebSocket(_) => {}
            }
        }
    }

    /// Sends `msg` after stamping its message type, so callers building a
    /// frame don't each have to remember `msg.message_type = Some(..)`.
    pub async fn send(&self, msg: TunnelMessage) -> Result<(), TunnelError> {
        self.conn.send(&msg).await
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.conn.close().await;
        // Every in-flight request on this tunnel fails rather than hangs.
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_pending(&id, TunnelError::TunnelClosed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.conn.is_closed()
    }
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct NullConn {
        closed: AtomicBool,
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

    fn tunnel() -> Arc<AgentTunnel> {
        AgentTunnel::new(
            "env-a".to_string(),
            Arc::new(NullConn {
                closed: AtomicBool::new(false),
            }),
        )
    }

    #[test]
    fn fresh_tunnel_is_not_stale() {
        let t = tunnel();
        t.note_activity();
        assert!(!t.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn tunnel_with_old_heartbeat_is_stale() {
        let t = tunnel();
        // Never heartbeated: `last_seen_secs` stays at 0, so it reads
        // as stale as soon as the timeout is shorter than the tunnel's
        // own age — here, timeout 0 makes that immediate.
        assert!(t.is_stale(Duration::from_secs(0)));
    }

    #[tokio::test]
    async fn closing_cancels_pending_http_requests() {
        let t = tunnel();
        let (tx, rx) = tokio::sync::oneshot::channel();
        t.register_pending("req-1".to_string(), PendingRequest::Http(tx));
        t.close().await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(TunnelError::TunnelClosed)));
    }

    #[tokio::test]
    async fn a_single_response_frame_resolves_as_buffered() {
        let t = tunnel();
        let (tx, rx) = tokio::sync::oneshot::channel();
        t.register_pending("req-1".to_string(), PendingRequest::Http(tx));

        t.deliver_response(
            "req-1",
            TunnelMessage {
                id: "req-1".into(),
                status: 200,
                body: b"hello".to_vec(),
                ..Default::default()
            },
        );

        match rx.await.unwrap().unwrap() {
            ResponseOutcome::Buffered(msg) => assert_eq!(msg.body, b"hello"),
            ResponseOutcome::Streamed(_) => panic!("expected a buffered response"),
        }
    }

    #[tokio::test]
    async fn a_leading_stream_data_frame_resolves_as_streamed() {
        let t = tunnel();
        let (tx, rx) = tokio::sync::oneshot::channel();
        t.register_pending("req-1".to_string(), PendingRequest::Http(tx));

        t.deliver_stream_data("req-1", b"chunk-1".to_vec());
        t.deliver_stream_data("req-1", b"chunk-2".to_vec());
        t.end_stream("req-1");

        let mut rx = match rx.await.unwrap().unwrap() {
            ResponseOutcome::Streamed(rx) => rx,
            ResponseOutcome::Buffered(_) => panic!("expected a streamed response"),
        };
        assert!(matches!(rx.recv().await, Some(StreamChunk::Data(b)) if b == b"chunk-1"));
        assert!(matches!(rx.recv().await, Some(StreamChunk::Data(b)) if b == b"chunk-2"));
        assert!(rx.recv().await.is_none(), "sender dropped by end_stream should close the channel");
    }

    #[tokio::test]
    async fn a_bare_stream_end_resolves_as_an_empty_stream() {
        let t = tunnel();
        let (tx, rx) = tokio::sync::oneshot::channel();
        t.register_pending("req-1".to_string(), PendingRequest::Http(tx));

        t.end_stream("req-1");

        let mut rx = match rx.await.unwrap().unwrap() {
            ResponseOutcome::Streamed(rx) => rx,
            ResponseOutcome::Buffered(_) => panic!("expected a streamed response"),
        };
        assert!(rx.recv().await.is_none());
    }
}
