//! # Message Model
//!
//! The wire-neutral envelope carried over both tunnel transports. Nothing
//! in this module knows about QUIC, WebSocket, or JSON — the transport
//! codecs in [`crate::framed`] and [`crate::ws`] translate `TunnelMessage`
//! to and from their respective wire shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The closed set of message tags. Direction legality for each tag is
/// enforced by the codecs, not by this type — see [`crate::direction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Heartbeat,
    HeartbeatAck,
    WebsocketStart,
    WebsocketData,
    WebsocketClose,
    StreamData,
    StreamEnd,
    Register,
    RegisterResponse,
    Event,
}

/// Domain event emitted by an agent, forwarded to the manager's
/// `EventCallback` and otherwise opaque to the tunnel core.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    /// Opaque bytes. The tunnel core only ever copies this, never parses it.
    #[serde(default, with = "base64_bytes")]
    pub metadata_json: Vec<u8>,
}

/// The universal envelope. Most fields are only meaningful for a subset of
/// [`MessageType`] tags; unused fields are left at their default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelMessage {
    /// Correlation id for request/stream/websocket traffic. Unused for
    /// heartbeats and register.
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: Option<MessageType>,

    // HTTP request/response fields.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub status: i32,

    // WebSocket fields.
    #[serde(default)]
    pub ws_message_type: i32,

    // Register fields.
    #[serde(default)]
    pub agent_token: String,

    // Register response fields.
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub environment_id: String,
    #[serde(default)]
    pub error: String,

    // Event field.
    #[serde(default)]
    pub event: Option<TunnelEvent>,
}

impl TunnelMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type: Some(message_type),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Headers are cloned here rather than moved so callers can keep using
    /// their own map after building the message — every codec must clone
    /// header maps on encode, this just does it once up front.
    pub fn clone_headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
