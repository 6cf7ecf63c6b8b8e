//! Uniform connection abstraction both transports implement, so the
//! manager's receive loop and the agent's dispatcher never need to know
//! whether they're talking QUIC or WebSocket (§4.2, §4.5).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use tokio::sync::Mutex;

use crate::direction::Direction;
use crate::error::TunnelError;
use crate::framed::{AgentFrame, ManagerFrame};
use crate::message::TunnelMessage;
use crate::quic;

/// A bidirectional, full-duplex tunnel connection carrying
/// [`TunnelMessage`] envelopes. `send` and `receive` may be called
/// concurrently from different tasks (one writer, one reader), but each
/// must be serialized against itself by the implementation.
#[async_trait]
pub trait Conn: Send + Sync {
    async fn send(&self, msg: &TunnelMessage) -> Result<(), TunnelError>;
    async fn receive(&self) -> Result<TunnelMessage, TunnelError>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
    fn is_expected_receive_error(&self, err: &TunnelError) -> bool;
}

/// `Conn` over a QUIC bidirectional stream, used by both the manager
/// (`accept_bi`) and the agent (`open_bi`) — `quinn` hands back the same
/// `(SendStream, RecvStream)` pair on either side.
pub struct QuicConn {
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    /// Which side of the pair this conn encodes outgoing frames as.
    local_origin: Direction,
    closed: AtomicBool,
}

impl QuicConn {
    pub fn new(send: SendStream, recv: RecvStream, local_origin: Direction) -> Self {
        Self {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            local_origin,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Conn for QuicConn {
    async fn send(&self, msg: &TunnelMessage) -> Result<(), TunnelError> {
        let bytes = match self.local_origin {
            Direction::ManagerOrigin => ManagerFrame::from_message(msg)?.encode()?,
            Direction::AgentOrigin => AgentFrame::from_message(msg)?.encode()?,
        };
        let mut send = self.send.lock().await;
        quic::write_frame(&mut send, &bytes).await
    }

    async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
        let bytes = {
            let mut recv = self.recv.lock().await;
            quic::read_frame(&mut recv).await?
        };
        Ok(match self.local_origin {
            // We send as manager, so we receive agent-origin frames, and vice versa.
            Direction::ManagerOrigin => AgentFrame::decode(&bytes)?.into_message(),
            Direction::AgentOrigin => ManagerFrame::decode(&bytes)?.into_message(),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut send = self.send.lock().await;
        let _ = send.finish();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_expected_receive_error(&self, err: &TunnelError) -> bool {
        quic::is_expected_receive_error(err)
    }
}

/// Minimal text-frame transport a WebSocket implementation must provide
/// so [`WsConn`] can sit on top of either `axum`'s server-side socket or
/// `tokio-tungstenite`'s client socket without this crate depending on
/// either. The concrete impls live in the `manager` and `agent` crates
/// respectively.
#[async_trait]
pub trait WsSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TunnelError>;
    async fn close(&mut self) -> Result<(), TunnelError>;
}

#[async_trait]
pub trait WsSource: Send {
    /// `Ok(None)` signals a clean stream end.
    async fn recv_text(&mut self) -> Result<Option<String>, TunnelError>;
}

/// `Conn` over the JSON WebSocket fallback, generic over whichever
/// concrete sink/source a crate's WebSocket library hands back.
pub struct WsConn<Tx: WsSink, Rx: WsSource> {
    tx: Mutex<Tx>,
    rx: Mutex<Rx>,
    local_origin: Direction,
    closed: AtomicBool,
}

impl<Tx: WsSink, Rx: WsSource> WsConn<Tx, Rx> {
    pub fn new(tx: Tx, rx: Rx, local_origin: Direction) -> Self {
        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            local_origin,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<Tx: WsSink, Rx: WsSource> Conn for WsConn<Tx, Rx> {
    async fn send(&self, msg: &TunnelMessage) -> Result<(), TunnelError> {
        let text = crate::ws::encode(self.local_origin, msg)?;
        let mut tx = self.tx.lock().await;
        tx.send_text(text).await
    }

    async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
        let peer_origin = match self.local_origin {
            Direction::ManagerOrigin => Direction::AgentOrigin,
            Direction::AgentOrigin => Direction::ManagerOrigin,
        };
        let text = {
            let mut rx = self.rx.lock().await;
            rx.recv_text().await?.ok_or(TunnelError::TunnelClosed)?
        };
        crate::ws::decode(peer_origin, &text)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut tx = self.tx.lock().await;
        let _ = tx.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_expected_receive_error(&self, err: &TunnelError) -> bool {
        matches!(err, TunnelError::TunnelClosed)
            || matches!(err, TunnelError::TransportError(m) if m.to_lowercase().contains("closed"))
    }
}
