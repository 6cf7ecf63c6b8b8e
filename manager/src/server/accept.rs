//! Agent registration handshake, shared by both transports: the first
//! message on a new connection must be `register`, validated against the
//! configured [`crate::state::TokenResolver`] before the tunnel is
//! admitted to the registry.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::StreamExt;
use tunnel_protocol::conn::WsConn;
use tunnel_protocol::{Conn, Direction, MessageType, TunnelError, TunnelMessage};

use super::receive_loop;
use super::ws_conn::{AxumWsSink, AxumWsSource};
use crate::state::AppState;
use crate::tunnel::AgentTunnel;

/// `GET /edge/tunnel.Tunnel/Connect` (or the legacy `/api/tunnel/connect`
/// alias) — the WebSocket-fallback tunnel endpoint. Unlike the QUIC
/// transport, this one rides on a real HTTP upgrade, so §4.4's
/// `X-Agent-Token`/`X-Api-Key` header auth is honored here; the in-band
/// `register` frame is still required of every transport and is the
/// fallback when neither header is present.
pub async fn ws_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let header_token = token_from_headers(&headers);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let conn: Arc<dyn Conn> = Arc::new(WsConn::new(
            AxumWsSink(sink),
            AxumWsSource(stream),
            Direction::ManagerOrigin,
        ));
        accept_and_serve(state, conn, header_token).await;
    })
}

/// `X-Agent-Token` takes precedence over `X-Api-Key` (§6), mirroring the
/// order the spec lists them in.
fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Agent-Token")
        .or_else(|| headers.get("X-Api-Key"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Runs the registration handshake on a freshly accepted connection and,
/// if it succeeds, drives that tunnel's receive loop until it disconnects.
/// `header_token` is the pre-upgrade auth header on transports that have
/// one (WebSocket); QUIC has no such mechanism and always passes `None`,
/// relying on the in-band `register` frame's `agent_token`.
pub async fn accept_and_serve(state: AppState, conn: Arc<dyn Conn>, header_token: Option<String>) {
    match accept_and_register(&state, conn, header_token).await {
        Ok(tunnel) => receive_loop::run(state, tunnel).await,
        Err(e) => tracing::warn!(error = %e, "agent registration failed"),
    }
}

async fn accept_and_register(
    state: &AppState,
    conn: Arc<dyn Conn>,
    header_token: Option<String>,
) -> Result<Arc<AgentTunnel>, TunnelError> {
    let first = conn.receive().await?;
    if first.message_type != Some(MessageType::Register) {
        return Err(TunnelError::ProtocolError(
            "expected register as the first message".into(),
        ));
    }

    let token = header_token.as_deref().unwrap_or(&first.agent_token).trim();
    if token.is_empty() {
        let _ = conn
            .send(&TunnelMessage {
                message_type: Some(MessageType::RegisterResponse),
                accepted: false,
                error: TunnelError::Unauthenticated.to_string(),
                ..Default::default()
            })
            .await;
        conn.close().await;
        return Err(TunnelError::Unauthenticated);
    }

    let environment_id = match state.token_resolver.resolve(token).await {
        Ok(id) => id,
        Err(e) => {
            let _ = conn
                .send(&TunnelMessage {
                    message_type: Some(MessageType::RegisterResponse),
                    accepted: false,
                    error: e.to_string(),
                    ..Default::default()
                })
                .await;
            conn.close().await;
            return Err(e);
        }
    };

    let tunnel = AgentTunnel::new(environment_id.clone(), conn);
    tunnel.note_activity();
    state.registry.register(tunnel.clone()).await;

    tunnel
        .send(TunnelMessage {
            message_type: Some(MessageType::RegisterResponse),
            accepted: true,
            environment_id: environment_id.clone(),
            ..Default::default()
        })
        .await?;

    tracing::info!(
        environment_id = %environment_id,
        tunnel_id = %tunnel.tunnel_id,
        "agent registered"
    );
    state
        .status_callback
        .on_status_change(&environment_id, true)
        .await;
    Ok(tunnel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::Config;
    use crate::state::{LoggingEventSink, StaticTokenResolver, StatusCallback, TokenResolver};

    struct ScriptedConn {
        incoming: Mutex<Vec<TunnelMessage>>,
        sent: Mutex<Vec<TunnelMessage>>,
        closed: AtomicBool,
    }

    impl ScriptedConn {
        fn registering_with(token: &str) -> Arc<Self> {
            Arc::new(Self {
                incoming: Mutex::new(vec![TunnelMessage {
                    message_type: Some(MessageType::Register),
                    agent_token: token.to_string(),
                    ..Default::default()
                }]),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Conn for ScriptedConn {
        async fn send(&self, msg: &TunnelMessage) -> Result<(), TunnelError> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
        async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
            let next = self.incoming.lock().unwrap().pop();
            next.ok_or(TunnelError::TunnelClosed)
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

    struct RecordingResolver {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TokenResolver for RecordingResolver {
        async fn resolve(&self, agent_token: &str) -> Result<String, TunnelError> {
            self.calls.lock().unwrap().push(agent_token.to_string());
            Ok(agent_token.to_string())
        }
    }

    struct CountingStatusCallback {
        calls: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl StatusCallback for CountingStatusCallback {
        async fn on_status_change(&self, environment_id: &str, connected: bool) {
            self.calls
                .lock()
                .unwrap()
                .push((environment_id.to_string(), connected));
        }
    }

    fn state_with(
        resolver: Arc<dyn TokenResolver>,
        status_callback: Arc<dyn StatusCallback>,
    ) -> AppState {
        AppState {
            registry: crate::registry::TunnelRegistry::new(),
            config: Arc::new(Config::from_env()),
            token_resolver: resolver,
            event_sink: Arc::new(LoggingEventSink),
            status_callback,
        }
    }

    #[tokio::test]
    async fn a_blank_token_is_rejected_without_calling_the_resolver() {
        let resolver = Arc::new(RecordingResolver {
            calls: Mutex::new(Vec::new()),
        });
        let state = state_with(
            resolver.clone(),
            Arc::new(CountingStatusCallback {
                calls: Mutex::new(Vec::new()),
            }),
        );
        let conn: Arc<dyn Conn> = ScriptedConn::registering_with("   ");

        let result = accept_and_register(&state, conn, None).await;

        assert!(matches!(result, Err(TunnelError::Unauthenticated)));
        assert!(resolver.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn the_resolver_receives_the_trimmed_token() {
        let resolver = Arc::new(RecordingResolver {
            calls: Mutex::new(Vec::new()),
        });
        let state = state_with(
            resolver.clone(),
            Arc::new(CountingStatusCallback {
                calls: Mutex::new(Vec::new()),
            }),
        );
        let conn: Arc<dyn Conn> = ScriptedConn::registering_with("  env-123  ");

        accept_and_register(&state, conn, None).await.unwrap();

        assert_eq!(resolver.calls.lock().unwrap().as_slice(), &["env-123"]);
    }

    #[tokio::test]
    async fn a_successful_register_invokes_the_status_callback_exactly_once_with_connected_true() {
        let callback = Arc::new(CountingStatusCallback {
            calls: Mutex::new(Vec::new()),
        });
        let state = state_with(Arc::new(StaticTokenResolver), callback.clone());
        let conn: Arc<dyn Conn> = ScriptedConn::registering_with("env-a");

        accept_and_register(&state, conn, None).await.unwrap();

        assert_eq!(
            callback.calls.lock().unwrap().as_slice(),
            &[("env-a".to_string(), true)]
        );
    }
}
