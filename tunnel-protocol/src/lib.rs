//! Wire protocol, transport codecs, and connection abstraction shared by
//! the Arcane edge tunnel manager and agent.
//!
//! - [`message`] — the transport-neutral [`message::TunnelMessage`] envelope.
//! - [`direction`] — direction legality, canonical path normalization,
//!   tunnel-traffic detection.
//! - [`framed`] — the `bincode` one-of-per-direction codec used over QUIC.
//! - [`ws`] — the JSON codec used over the WebSocket fallback.
//! - [`quic`] — QUIC stream framing and TLS config builders.
//! - [`conn`] — the [`conn::Conn`] trait unifying both transports.
//! - [`error`] — the closed [`error::TunnelError`] taxonomy.

pub mod conn;
pub mod direction;
pub mod error;
pub mod framed;
pub mod message;
pub mod quic;
pub mod ws;

pub use conn::{Conn, WsConn, WsSink, WsSource};
pub use direction::{
    is_tunnel_request, normalize_tunnel_path, Direction, RequestClassifyInput,
    CANONICAL_TUNNEL_PATH, LEGACY_TUNNEL_PATH,
};
pub use error::TunnelError;
pub use framed::{checked_i32, AgentFrame, ManagerFrame};
pub use message::{MessageType, TunnelEvent, TunnelMessage};
