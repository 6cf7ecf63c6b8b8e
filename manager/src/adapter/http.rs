//! Request Adapter: turns an inbound HTTP request destined for a
//! tunneled environment into a `request` frame, waits for the matching
//! `response` frame, and turns that back into an HTTP response.

use std::collections::HashMap;
use std::io;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tunnel_protocol::{MessageType, TunnelError, TunnelMessage};

use crate::pending::{PendingRequest, ResponseOutcome, StreamChunk};
use crate::state::AppState;
use crate::tunnel::new_correlation_id;

pub async fn proxy_request(
    State(state): State<AppState>,
    Path((environment_id, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch(&state, &environment_id, &rest, query, method, headers, body).await {
        Ok(resp) => resp,
        Err(e) => tunnel_error_response(e),
    }
}

async fn dispatch(
    state: &AppState,
    environment_id: &str,
    path: &str,
    query: Option<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TunnelError> {
    let tunnel = state
        .registry
        .get(environment_id)
        .ok_or_else(|| TunnelError::NotConnected(environment_id.to_string()))?;

    let mut header_map = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            header_map.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let id = new_correlation_id();
    let (tx, rx) = oneshot::channel();
    tunnel.register_pending(id.clone(), PendingRequest::Http(tx));

    let request_msg = TunnelMessage {
        id: id.clone(),
        message_type: Some(MessageType::Request),
        method: method.to_string(),
        path: format!("/{}", path.trim_start_matches('/')),
        query: query.unwrap_or_default(),
        headers: header_map,
        body: body.to_vec(),
        ..Default::default()
    };

    if let Err(e) = tunnel.send(request_msg).await {
        tunnel.cancel_pending(&id, TunnelError::TransportError(e.to_string()));
        return Err(e);
    }

    // Only the decision of *which shape* the response takes is bound by
    // the caller's deadline — once it resolves to a stream, the body may
    // keep flowing for as long as the agent keeps sending chunks (§4.5:
    // "a lazy, finite, non-restartable sequence of byte chunks").
    let result = tokio::time::timeout(state.config.request_timeout, rx).await;
    let outcome = match result {
        Ok(Ok(inner)) => inner?,
        Ok(Err(_)) => return Err(TunnelError::TunnelClosed),
        Err(_) => {
            tunnel.cancel_pending(&id, TunnelError::Timeout);
            return Err(TunnelError::Timeout);
        }
    };

    Ok(match outcome {
        ResponseOutcome::Buffered(msg) => response_to_axum(msg),
        ResponseOutcome::Streamed(rx) => streamed_response_to_axum(rx),
    })
}

fn response_to_axum(msg: TunnelMessage) -> Response {
    let status = StatusCode::from_u16(msg.status as u16).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in msg.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(msg.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Builds a chunked response from a live [`ResponseOutcome::Streamed`]
/// channel. There is no leading `response` frame in the pure-streaming
/// case (§4.5's "if instead `stream_data` arrives" branch), so status and
/// headers default to a plain `200 OK` — an agent that needs custom
/// headers on a streamed reply should send them via the usual `response`
/// frame before its first `stream_data` chunk instead.
fn streamed_response_to_axum(rx: tokio::sync::mpsc::UnboundedReceiver<StreamChunk>) -> Response {
    let stream = UnboundedReceiverStream::new(rx).map(|chunk| match chunk {
        StreamChunk::Data(bytes) => Ok::<Bytes, io::Error>(Bytes::from(bytes)),
        StreamChunk::Error(e) => Err(io::Error::other(e.to_string())),
    });
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn tunnel_error_response(err: TunnelError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    use crate::config::Config;
    use crate::server::receive_loop;
    use crate::state::AppState;
    use crate::tunnel::AgentTunnel;

    /// An in-memory loopback `Conn`, standing in for a QUIC/WebSocket pair
    /// so the adapter and receive loop can be exercised end to end
    /// without a real network connection.
    struct ChannelConn {
        tx: mpsc::UnboundedSender<TunnelMessage>,
        rx: Mutex<mpsc::UnboundedReceiver<TunnelMessage>>,
        closed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl tunnel_protocol::Conn for ChannelConn {
        async fn send(&self, msg: &TunnelMessage) -> Result<(), TunnelError> {
            self.tx
                .send(msg.clone())
                .map_err(|_| TunnelError::TunnelClosed)
        }
        async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(TunnelError::TunnelClosed)
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

    fn channel_pair() -> (ChannelConn, ChannelConn) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            ChannelConn {
                tx: tx_a,
                rx: Mutex::new(rx_b),
                closed: AtomicBool::new(false),
            },
            ChannelConn {
                tx: tx_b,
                rx: Mutex::new(rx_a),
                closed: AtomicBool::new(false),
            },
        )
    }

    #[tokio::test]
    async fn request_round_trips_through_a_fake_agent() {
        let state = AppState::new(Config::from_env());
        let (manager_side, agent_side) = channel_pair();

        let tunnel = AgentTunnel::new("env-a".to_string(), Arc::new(manager_side));
        tunnel.note_activity();
        state.registry.register(tunnel.clone()).await;
        tokio::spawn(receive_loop::run(state.clone(), tunnel.clone()));

        // Fake agent: echoes every request back as a 200 with an
        // uppercased body, the way a real local handler would respond.
        tokio::spawn(async move {
            use tunnel_protocol::Conn;
            let req = agent_side.receive().await.unwrap();
            assert_eq!(req.method, "GET");
            let response = TunnelMessage {
                id: req.id,
                message_type: Some(MessageType::Response),
                status: 200,
                body: req.body.to_ascii_uppercase(),
                ..Default::default()
            };
            agent_side.send(&response).await.unwrap();
        });

        let response = dispatch(
            &state,
            "env-a",
            "local/api",
            Some("x=1".to_string()),
            Method::GET,
            HeaderMap::new(),
            Bytes::from_static(b"hello"),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"HELLO");
    }

    #[tokio::test]
    async fn a_streamed_response_arrives_as_a_chunked_body() {
        let state = AppState::new(Config::from_env());
        let (manager_side, agent_side) = channel_pair();

        let tunnel = AgentTunnel::new("env-a".to_string(), Arc::new(manager_side));
        tunnel.note_activity();
        state.registry.register(tunnel.clone()).await;
        tokio::spawn(receive_loop::run(state.clone(), tunnel.clone()));

        // Fake agent: skips the buffered `response` frame entirely and
        // answers with a `stream_data`/`stream_data`/`stream_end` sequence,
        // the way a handler streaming a large local response would.
        tokio::spawn(async move {
            use tunnel_protocol::Conn;
            let req = agent_side.receive().await.unwrap();
            let id = req.id;
            for chunk in [b"chunk-one-".to_vec(), b"chunk-two".to_vec()] {
                let frame = TunnelMessage {
                    id: id.clone(),
                    message_type: Some(MessageType::StreamData),
                    body: chunk,
                    ..Default::default()
                };
                agent_side.send(&frame).await.unwrap();
            }
            let end = TunnelMessage {
                id,
                message_type: Some(MessageType::StreamEnd),
                ..Default::default()
            };
            agent_side.send(&end).await.unwrap();
        });

        let response = dispatch(
            &state,
            "env-a",
            "local/api",
            None,
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"chunk-one-chunk-two");
    }

    #[tokio::test]
    async fn missing_tunnel_is_not_connected() {
        let state = AppState::new(Config::from_env());
        let err = dispatch(
            &state,
            "unknown-env",
            "local/api",
            None,
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::NotConnected(_)));
    }
}
