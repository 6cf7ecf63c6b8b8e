//! Builds the local WebSocket URL a `websocket_start` frame should be
//! proxied to, and pumps frames between that local socket and the
//! tunnel once connected.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tunnel_protocol::{MessageType, TunnelMessage};

use crate::state::AgentClient;

const WS_TEXT: i32 = 1;
const WS_BINARY: i32 = 2;

/// Builds the local WebSocket URL a `websocket_start` frame should be
/// proxied to, from the agent's `Listen`/`Port` config (§4.6
/// `buildLocalWebSocketURL`, tested exactly by §8.12):
///
/// - an empty or wildcard `listen` (`0.0.0.0`, `::`) maps to `localhost`;
/// - a literal IPv6 address is bracketed;
/// - anything else is used verbatim.
///
/// The scheme is always `ws` — the agent's local service is assumed to be
/// plain HTTP, reached over loopback or a private network.
pub fn build_local_websocket_url(listen: &str, port: &str, path: &str, query: &str) -> String {
    let listen = listen.trim();
    let host = if listen.is_empty() || listen == "0.0.0.0" || listen == "::" {
        "localhost".to_string()
    } else if listen.contains(':') && !listen.starts_with('[') {
        format!("[{listen}]")
    } else {
        listen.to_string()
    };

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let mut url = format!("ws://{host}:{port}{path}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Turns `url` into an upgrade request carrying the manager-forwarded
/// headers from the originating `websocket_start` frame (§4.6: "Propagate
/// the upgrade headers from msg.headers"), so auth cookies and the like
/// that the local service expects on the handshake still arrive.
fn build_request(
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    let req_headers = request.headers_mut();
    for (k, v) in headers {
        // Don't let a forwarded header clobber the handshake fields
        // tungstenite already set from the URL (Host, Connection,
        // Upgrade, Sec-WebSocket-*).
        if k.to_ascii_lowercase().starts_with("sec-websocket")
            || matches!(
                k.to_ascii_lowercase().as_str(),
                "host" | "connection" | "upgrade"
            )
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            tokio_tungstenite::tungstenite::http::HeaderName::try_from(k.as_str()),
            HeaderValue::from_str(v),
        ) {
            req_headers.insert(name, value);
        }
    }
    Ok(request)
}

/// Connects to the local service's WebSocket endpoint and pumps frames
/// both ways until either side closes, forwarding manager frames that
/// arrive on `inbound` and sending what the local socket produces back
/// as `websocket_data`/`websocket_close` frames tagged with `id`.
pub async fn run_session(
    client: Arc<AgentClient>,
    id: String,
    url: String,
    headers: HashMap<String, String>,
    mut inbound: mpsc::UnboundedReceiver<TunnelMessage>,
) {
    let request = match build_request(&url, &headers) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(id, url, error = %e, "invalid local websocket request");
            let _ = client
                .send(TunnelMessage {
                    id: id.clone(),
                    message_type: Some(MessageType::WebsocketClose),
                    ..Default::default()
                })
                .await;
            client.end_websocket_session(&id);
            return;
        }
    };

    let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(id, url, error = %e, "failed to connect to local websocket endpoint");
            let _ = client
                .send(TunnelMessage {
                    id: id.clone(),
                    message_type: Some(MessageType::WebsocketClose),
                    ..Default::default()
                })
                .await;
            client.end_websocket_session(&id);
            return;
        }
    };

    let (mut local_tx, mut local_rx) = ws_stream.split();

    loop {
        tokio::select! {
            manager_msg = inbound.recv() => {
                match manager_msg {
                    Some(msg) if msg.message_type == Some(MessageType::WebsocketClose) => break,
                    Some(msg) => {
                        let out = if msg.ws_message_type == WS_BINARY {
                            Message::Binary(msg.body.into())
                        } else {
                            Message::Text(String::from_utf8_lossy(&msg.body).into_owned().into())
                        };
                        if local_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            local_msg = local_rx.next() => {
                match local_msg {
                    Some(Ok(Message::Text(t))) => {
                        let frame = TunnelMessage {
                            id: id.clone(),
                            message_type: Some(MessageType::WebsocketData),
                            ws_message_type: WS_TEXT,
                            body: t.as_bytes().to_vec(),
                            ..Default::default()
                        };
                        if client.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(b))) => {
                        let frame = TunnelMessage {
                            id: id.clone(),
                            message_type: Some(MessageType::WebsocketData),
                            ws_message_type: WS_BINARY,
                            body: b.to_vec(),
                            ..Default::default()
                        };
                        if client.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(id, error = %e, "local websocket read error");
                        break;
                    }
                }
            }
        }
    }

    let _ = client
        .send(TunnelMessage {
            id: id.clone(),
            message_type: Some(MessageType::WebsocketClose),
            ..Default::default()
        })
        .await;
    client.end_websocket_session(&id);
}
