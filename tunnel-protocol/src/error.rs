//! The closed error taxonomy from §7. Both `manager` and `agent` match on
//! this single enum rather than inventing their own per-crate error types
//! for tunnel-core failures.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("agent token required or invalid")]
    Unauthenticated,

    #[error("environment {0} is not connected")]
    NotConnected(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("local handler error: {0}")]
    LocalHandlerError(String),

    #[error("encode error: {0}")]
    EncodeError(String),

    #[error("decode error: {0}")]
    DecodeError(String),
}

impl TunnelError {
    /// Maps a caller-visible error to the HTTP status the manager's
    /// request-adapter surface should return to business code (§7
    /// "User-visible behavior").
    pub fn http_status(&self) -> u16 {
        match self {
            TunnelError::Unauthenticated => 401,
            TunnelError::NotConnected(_) => 502,
            TunnelError::Timeout | TunnelError::Cancelled => 504,
            TunnelError::TunnelClosed => 502,
            TunnelError::ProtocolError(_) | TunnelError::TransportError(_) => 500,
            TunnelError::LocalHandlerError(_) => 500,
            TunnelError::EncodeError(_) | TunnelError::DecodeError(_) => 500,
        }
    }
}
