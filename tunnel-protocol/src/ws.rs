//! # WebSocket fallback codec
//!
//! The same [`TunnelMessage`] envelope, serialized as JSON text frames
//! instead of `bincode`. Used when an agent cannot establish the framed
//! QUIC transport (restrictive egress, no UDP) and falls back to plain
//! WebSocket, per §4.2/§9.

use crate::direction::{is_legal, Direction};
use crate::error::TunnelError;
use crate::message::TunnelMessage;

/// Serialize a message to its WebSocket JSON text-frame payload, rejecting
/// a tag illegal for `dir`.
pub fn encode(dir: Direction, msg: &TunnelMessage) -> Result<String, TunnelError> {
    let tag = msg
        .message_type
        .ok_or_else(|| TunnelError::EncodeError("missing message type".into()))?;
    if !is_legal(dir, tag) {
        return Err(TunnelError::ProtocolError(format!(
            "{:?} is not legal for this direction",
            tag
        )));
    }
    serde_json::to_string(msg).map_err(|e| TunnelError::EncodeError(e.to_string()))
}

/// Parse a WebSocket JSON text frame, rejecting a tag illegal for the
/// direction it was received from.
pub fn decode(dir: Direction, text: &str) -> Result<TunnelMessage, TunnelError> {
    let msg: TunnelMessage =
        serde_json::from_str(text).map_err(|e| TunnelError::DecodeError(e.to_string()))?;
    let tag = msg
        .message_type
        .ok_or_else(|| TunnelError::DecodeError("missing message type".into()))?;
    if !is_legal(dir, tag) {
        return Err(TunnelError::ProtocolError(format!(
            "{:?} is not legal for this direction",
            tag
        )));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn round_trip() {
        let mut msg = TunnelMessage::new(MessageType::Request).with_id("corr-1");
        msg.method = "GET".into();
        msg.path = "/local".into();
        msg.body = b"payload".to_vec();

        let text = encode(Direction::ManagerOrigin, &msg).unwrap();
        assert!(text.contains("\"type\":\"request\""));
        let decoded = decode(Direction::ManagerOrigin, &text).unwrap();
        assert_eq!(decoded.id, "corr-1");
        assert_eq!(decoded.body, b"payload");
    }

    #[test]
    fn direction_enforcement_on_encode_and_decode() {
        let msg = TunnelMessage::new(MessageType::Response).with_id("x");
        assert!(encode(Direction::ManagerOrigin, &msg).is_err());

        let msg = TunnelMessage::new(MessageType::Request).with_id("x");
        let text = encode(Direction::ManagerOrigin, &msg).unwrap();
        assert!(decode(Direction::AgentOrigin, &text).is_err());
    }
}
