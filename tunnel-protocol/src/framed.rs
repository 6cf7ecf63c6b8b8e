//! # Framed RPC transport codec
//!
//! A schema-typed one-of per direction (`ManagerFrame`, `AgentFrame`),
//! `bincode`-encoded and carried over a QUIC bidirectional stream
//! (see [`crate::quic`]). This is the preferred transport; [`crate::ws`]
//! is the fallback.
//!
//! Integer fields that cross the wire (`status`, `ws_message_type`) are
//! `i32`. [`TunnelMessage`] already stores them as `i32`, but callers
//! building a message from a wider source type (an HTTP status code
//! library, a platform `int`) should go through [`checked_i32`] so the
//! "value out of 32-bit range" failure happens at the boundary rather
//! than silently truncating.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::direction::{is_legal, Direction};
use crate::error::TunnelError;
use crate::message::{MessageType, TunnelEvent, TunnelMessage};

/// Convert a wider integer to `i32`, failing instead of truncating.
pub fn checked_i32(v: i64) -> Result<i32, TunnelError> {
    i32::try_from(v).map_err(|_| TunnelError::EncodeError("value out of 32-bit range".into()))
}

/// Frames a manager may send to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManagerFrame {
    Request {
        id: String,
        method: String,
        path: String,
        query: String,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    WebsocketStart {
        id: String,
        path: String,
        query: String,
        headers: HashMap<String, String>,
    },
    WebsocketData {
        id: String,
        ws_message_type: i32,
        body: Vec<u8>,
    },
    WebsocketClose {
        id: String,
    },
    HeartbeatAck {
        id: String,
    },
    RegisterResponse {
        accepted: bool,
        environment_id: String,
        error: String,
    },
}

/// Frames an agent may send to a manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentFrame {
    Response {
        id: String,
        status: i32,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    },
    WebsocketData {
        id: String,
        ws_message_type: i32,
        body: Vec<u8>,
    },
    WebsocketClose {
        id: String,
    },
    StreamData {
        id: String,
        body: Vec<u8>,
    },
    StreamEnd {
        id: String,
    },
    Heartbeat {
        id: String,
    },
    Register {
        agent_token: String,
    },
    Event {
        event: TunnelEvent,
    },
}

impl ManagerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TunnelError> {
        bincode::serialize(self).map_err(|e| TunnelError::EncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TunnelError> {
        bincode::deserialize(bytes).map_err(|e| TunnelError::DecodeError(e.to_string()))
    }

    /// Build a frame from a [`TunnelMessage`], rejecting tags illegal for
    /// manager-origin traffic.
    pub fn from_message(msg: &TunnelMessage) -> Result<Self, TunnelError> {
        let tag = msg
            .message_type
            .ok_or_else(|| TunnelError::EncodeError("missing message type".into()))?;
        if !is_legal(Direction::ManagerOrigin, tag) {
            return Err(TunnelError::ProtocolError(format!(
                "{:?} is not a legal manager-origin message",
                tag
            )));
        }
        Ok(match tag {
            MessageType::Request => ManagerFrame::Request {
                id: msg.id.clone(),
                method: msg.method.clone(),
                path: msg.path.clone(),
                query: msg.query.clone(),
                headers: msg.clone_headers(),
                body: msg.body.clone(),
            },
            MessageType::WebsocketStart => ManagerFrame::WebsocketStart {
                id: msg.id.clone(),
                path: msg.path.clone(),
                query: msg.query.clone(),
                headers: msg.clone_headers(),
            },
            MessageType::WebsocketData => ManagerFrame::WebsocketData {
                id: msg.id.clone(),
                ws_message_type: checked_i32(msg.ws_message_type as i64)?,
                body: msg.body.clone(),
            },
            MessageType::WebsocketClose => ManagerFrame::WebsocketClose { id: msg.id.clone() },
            MessageType::HeartbeatAck => ManagerFrame::HeartbeatAck { id: msg.id.clone() },
            MessageType::RegisterResponse => ManagerFrame::RegisterResponse {
                accepted: msg.accepted,
                environment_id: msg.environment_id.clone(),
                error: msg.error.clone(),
            },
            other => {
                return Err(TunnelError::ProtocolError(format!(
                    "unhandled manager-origin tag {:?}",
                    other
                )))
            }
        })
    }

    pub fn into_message(self) -> TunnelMessage {
        match self {
            ManagerFrame::Request {
                id,
                method,
                path,
                query,
                headers,
                body,
            } => TunnelMessage {
                id,
                message_type: Some(MessageType::Request),
                method,
                path,
                query,
                headers,
                body,
                ..Default::default()
            },
            ManagerFrame::WebsocketStart {
                id,
                path,
                query,
                headers,
            } => TunnelMessage {
                id,
                message_type: Some(MessageType::WebsocketStart),
                path,
                query,
                headers,
                ..Default::default()
            },
            ManagerFrame::WebsocketData {
                id,
                ws_message_type,
                body,
            } => TunnelMessage {
                id,
                message_type: Some(MessageType::WebsocketData),
                ws_message_type,
                body,
                ..Default::default()
            },
            ManagerFrame::WebsocketClose { id } => TunnelMessage {
                id,
                message_type: Some(MessageType::WebsocketClose),
                ..Default::default()
            },
            ManagerFrame::HeartbeatAck { id } => TunnelMessage {
                id,
                message_type: Some(MessageType::HeartbeatAck),
                ..Default::default()
            },
            ManagerFrame::RegisterResponse {
                accepted,
                environment_id,
                error,
            } => TunnelMessage {
                message_type: Some(MessageType::RegisterResponse),
                accepted,
                environment_id,
                error,
                ..Default::default()
            },
        }
    }
}

impl AgentFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TunnelError> {
        bincode::serialize(self).map_err(|e| TunnelError::EncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TunnelError> {
        bincode::deserialize(bytes).map_err(|e| TunnelError::DecodeError(e.to_string()))
    }

    pub fn from_message(msg: &TunnelMessage) -> Result<Self, TunnelError> {
        let tag = msg
            .message_type
            .ok_or_else(|| TunnelError::EncodeError("missing message type".into()))?;
        if !is_legal(Direction::AgentOrigin, tag) {
            return Err(TunnelError::ProtocolError(format!(
                "{:?} is not a legal agent-origin message",
                tag
            )));
        }
        Ok(match tag {
            MessageType::Response => AgentFrame::Response {
                id: msg.id.clone(),
                status: checked_i32(msg.status as i64)?,
                headers: msg.clone_headers(),
                body: msg.body.clone(),
            },
            MessageType::WebsocketData => AgentFrame::WebsocketData {
                id: msg.id.clone(),
                ws_message_type: checked_i32(msg.ws_message_type as i64)?,
                body: msg.body.clone(),
            },
            MessageType::WebsocketClose => AgentFrame::WebsocketClose { id: msg.id.clone() },
            MessageType::StreamData => AgentFrame::StreamData {
                id: msg.id.clone(),
                body: msg.body.clone(),
            },
            MessageType::StreamEnd => AgentFrame::StreamEnd { id: msg.id.clone() },
            MessageType::Heartbeat => AgentFrame::Heartbeat { id: msg.id.clone() },
            MessageType::Register => AgentFrame::Register {
                agent_token: msg.agent_token.clone(),
            },
            MessageType::Event => AgentFrame::Event {
                event: msg.event.clone().unwrap_or_default(),
            },
            other => {
                return Err(TunnelError::ProtocolError(format!(
                    "unhandled agent-origin tag {:?}",
                    other
                )))
            }
        })
    }

    pub fn into_message(self) -> TunnelMessage {
        match self {
            AgentFrame::Response {
                id,
                status,
                headers,
                body,
            } => TunnelMessage {
                id,
                message_type: Some(MessageType::Response),
                status,
                headers,
                body,
                ..Default::default()
            },
            AgentFrame::WebsocketData {
                id,
                ws_message_type,
                body,
            } => TunnelMessage {
                id,
                message_type: Some(MessageType::WebsocketData),
                ws_message_type,
                body,
                ..Default::default()
            },
            AgentFrame::WebsocketClose { id } => TunnelMessage {
                id,
                message_type: Some(MessageType::WebsocketClose),
                ..Default::default()
            },
            AgentFrame::StreamData { id, body } => TunnelMessage {
                id,
                message_type: Some(MessageType::StreamData),
                body,
                ..Default::default()
            },
            AgentFrame::StreamEnd { id } => TunnelMessage {
                id,
                message_type: Some(MessageType::StreamEnd),
                ..Default::default()
            },
            AgentFrame::Heartbeat { id } => TunnelMessage {
                id,
                message_type: Some(MessageType::Heartbeat),
                ..Default::default()
            },
            AgentFrame::Register { agent_token } => TunnelMessage {
                message_type: Some(MessageType::Register),
                agent_token,
                ..Default::default()
            },
            AgentFrame::Event { event } => TunnelMessage {
                message_type: Some(MessageType::Event),
                event: Some(event),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("X-Local".into(), "true".into());
        h
    }

    #[test]
    fn request_round_trip() {
        let mut msg = TunnelMessage::new(MessageType::Request).with_id("corr-1");
        msg.method = "GET".into();
        msg.path = "/local/api".into();
        msg.query = "a=1".into();
        msg.headers = sample_headers();
        msg.body = b"hello".to_vec();

        let frame = ManagerFrame::from_message(&msg).unwrap();
        let bytes = frame.encode().unwrap();
        let decoded = ManagerFrame::decode(&bytes).unwrap().into_message();

        assert_eq!(decoded.id, "corr-1");
        assert_eq!(decoded.method, "GET");
        assert_eq!(decoded.path, "/local/api");
        assert_eq!(decoded.query, "a=1");
        assert_eq!(decoded.headers, sample_headers());
        assert_eq!(decoded.body, b"hello");
    }

    #[test]
    fn response_round_trip_with_event() {
        let mut msg = TunnelMessage::new(MessageType::Response).with_id("corr-2");
        msg.status = 200;
        msg.headers = sample_headers();
        msg.body = b"local response".to_vec();

        let frame = AgentFrame::from_message(&msg).unwrap();
        let bytes = frame.encode().unwrap();
        let decoded = AgentFrame::decode(&bytes).unwrap().into_message();
        assert_eq!(decoded.status, 200);
        assert_eq!(decoded.body, b"local response");

        let mut ev_msg = TunnelMessage::new(MessageType::Event);
        ev_msg.event = Some(TunnelEvent {
            event_type: "container.start".into(),
            severity: "info".into(),
            title: "Container started".into(),
            description: "nginx started".into(),
            metadata_json: b"{}".to_vec(),
            ..Default::default()
        });
        let frame = AgentFrame::from_message(&ev_msg).unwrap();
        let bytes = frame.encode().unwrap();
        let decoded = AgentFrame::decode(&bytes).unwrap().into_message();
        assert_eq!(decoded.event.unwrap().title, "Container started");
    }

    #[test]
    fn direction_enforcement_rejects_wrong_origin() {
        let msg = TunnelMessage::new(MessageType::Response).with_id("x");
        assert!(ManagerFrame::from_message(&msg).is_err());

        let msg = TunnelMessage::new(MessageType::Request).with_id("x");
        assert!(AgentFrame::from_message(&msg).is_err());
    }

    #[test]
    fn integer_range_boundaries() {
        assert!(checked_i32(i32::MIN as i64).is_ok());
        assert!(checked_i32(i32::MAX as i64).is_ok());
        assert!(checked_i32(i32::MAX as i64 + 1).is_err());
        assert!(checked_i32(i32::MIN as i64 - 1).is_err());
    }
}
