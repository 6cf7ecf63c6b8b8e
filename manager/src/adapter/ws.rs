//! Request Adapter, WebSocket half: proxies an inbound client WebSocket
//! session onto the tunnel as a `websocket_start` followed by a stream of
//! `websocket_data`/`websocket_close` frames, pumping in both directions
//! until either side closes.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tunnel_protocol::{MessageType, TunnelError, TunnelMessage};

use crate::pending::PendingRequest;
use crate::state::AppState;
use crate::tunnel::new_correlation_id;

/// `ws_message_type` values mirrored from the common WebSocket wire
/// opcodes so a text/binary distinction survives the tunnel.
const WS_TEXT: i32 = 1;
const WS_BINARY: i32 = 2;

pub async fn proxy_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((environment_id, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) =
            run_proxy_session(state, environment_id, rest, query, headers, socket).await
        {
            tracing::warn!(error = %e, "websocket proxy session ended with an error");
        }
    })
}

async fn run_proxy_session(
    state: AppState,
    environment_id: String,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    socket: WebSocket,
) -> Result<(), TunnelError> {
    let tunnel = state
        .registry
        .get(&environment_id)
        .ok_or_else(|| TunnelError::NotConnected(environment_id.clone()))?;

    let mut header_map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            header_map.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let id = new_correlation_id();
    let (agent_tx, mut agent_rx) = mpsc::unbounded_channel::<TunnelMessage>();
    tunnel.register_pending(id.clone(), PendingRequest::WebSocket(agent_tx));

    tunnel
        .send(TunnelMessage {
            id: id.clone(),
            message_type: Some(MessageType::WebsocketStart),
            path: format!("/{}", path.trim_start_matches('/')),
            query: query.unwrap_or_default(),
            headers: header_map,
            ..Default::default()
        })
        .await?;

    let (mut client_tx, mut client_rx) = socket.split();

    loop {
        tokio::select! {
            client_msg = client_rx.next() => {
                match client_msg {
                    Some(Ok(Message::Text(t))) => {
                        let frame = TunnelMessage {
                            id: id.clone(),
                            message_type: Some(MessageType::WebsocketData),
                            ws_message_type: WS_TEXT,
                            body: t.as_bytes().to_vec(),
                            ..Default::default()
                        };
                        tunnel.send(frame).await?;
                    }
                    Some(Ok(Message::Binary(b))) => {
                        let frame = TunnelMessage {
                            id: id.clone(),
                            message_type: Some(MessageType::WebsocketData),
                            ws_message_type: WS_BINARY,
                            body: b.to_vec(),
                            ..Default::default()
                        };
                        tunnel.send(frame).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(TunnelError::TransportError(e.to_string())),
                }
            }
            agent_msg = agent_rx.recv() => {
                match agent_msg {
                    Some(msg) if msg.message_type == Some(MessageType::WebsocketClose) => break,
                    Some(msg) => {
                        let out = if msg.ws_message_type == WS_BINARY {
                            Message::Binary(msg.body.into())
                        } else {
                            Message::Text(String::from_utf8_lossy(&msg.body).into_owned().into())
                        };
                        if client_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = tunnel
        .send(TunnelMessage {
            id: id.clone(),
            message_type: Some(MessageType::WebsocketClose),
            ..Default::default()
        })
        .await;
    tunnel.take_pending(&id);
    let _ = client_tx.send(Message::Close(None)).await;
    Ok(())
}
