//! Demultiplexes frames arriving from a registered agent onto the
//! correlation id they belong to, until the connection ends.

use std::sync::Arc;

use tunnel_protocol::{MessageType, TunnelError, TunnelMessage};

use crate::state::AppState;
use crate::tunnel::AgentTunnel;

pub async fn run(state: AppState, tunnel: Arc<AgentTunnel>) {
    loop {
        match tunnel.conn().receive().await {
            Ok(msg) => {
                if let Err(e) = dispatch(&state, &tunnel, msg).await {
                    tracing::warn!(
                        environment_id = %tunnel.environment_id,
                        error = %e,
                        "closing tunnel after protocol violation"
                    );
                    break;
                }
            }
            Err(e) => {
                if !tunnel.conn().is_expected_receive_error(&e) {
                    tracing::warn!(
                        environment_id = %tunnel.environment_id,
                        error = %e,
                        "tunnel receive error"
                    );
                }
                break;
            }
        }
    }

    tunnel.close().await;
    state.registry.unregister(&tunnel.environment_id, tunnel.tunnel_id);
    state
        .status_callback
        .on_status_change(&tunnel.environment_id, false)
        .await;
    tracing::info!(environment_id = %tunnel.environment_id, "tunnel closed");
}

async fn dispatch(
    state: &AppState,
    tunnel: &Arc<AgentTunnel>,
    msg: TunnelMessage,
) -> Result<(), TunnelError> {
    let tag = msg
        .message_type
        .ok_or_else(|| TunnelError::ProtocolError("missing message type".into()))?;

    // §4.4: "update lastSeen" happens for every inbound frame, not just
    // heartbeats — a busy agent streaming responses is just as alive as
    // one sending idle pings.
    tunnel.note_activity();

    match tag {
        MessageType::Response => {
            let id = msg.id.clone();
            tunnel.deliver_response(&id, msg);
        }
        MessageType::WebsocketData | MessageType::WebsocketClose => {
            tunnel.forward_websocket_frame(&msg.id, msg);
        }
        MessageType::StreamData => {
            tunnel.deliver_stream_data(&msg.id, msg.body);
        }
        MessageType::StreamEnd => {
            tunnel.end_stream(&msg.id);
        }
        MessageType::Heartbeat => {
            let ack = TunnelMessage {
                id: msg.id,
                message_type: Some(MessageType::HeartbeatAck),
                ..Default::default()
            };
            if let Err(e) = tunnel.send(ack).await {
                tracing::warn!(
                    environment_id = %tunnel.environment_id,
                    error = %e,
                    "failed to send heartbeat ack"
                );
            }
        }
        MessageType::Event => {
            if let Some(event) = msg.event {
                state.event_sink.handle(&tunnel.environment_id, event).await;
            }
        }
        // A second `register` on an already-admitted tunnel has no valid
        // meaning — treat it as a protocol violation and drop the
        // connection rather than silently re-registering.
        MessageType::Register => {
            return Err(TunnelError::ProtocolError(
                "unexpected register on an already-registered tunnel".into(),
            ))
        }
        // Any other unknown or direction-illegal tag: log and ignore
        // rather than tearing down the tunnel (§4.4) — only a mid-session
        // `register` above warrants closing the connection.
        MessageType::Request | MessageType::WebsocketStart | MessageType::HeartbeatAck
        | MessageType::RegisterResponse => {
            tracing::warn!(
                environment_id = %tunnel.environment_id,
                tag = ?tag,
                "received manager-origin tag from an agent, ignoring"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tunnel_protocol::{Conn, TunnelEvent};

    use crate::config::Config;
    use crate::state::{EventSink, LoggingStatusCallback, StaticTokenResolver, TokenResolver};
    use crate::tunnel::AgentTunnel;

    struct NullConn {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Conn for NullConn {
        async fn send(&self, _msg: &TunnelMessage) -> Result<(), TunnelError> {
            Ok(())
        }
        async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
            Err(TunnelError::TunnelClosed)
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

    struct CountingEventSink {
        calls: Mutex<Vec<(String, TunnelEvent)>>,
    }

    #[async_trait]
    impl EventSink for CountingEventSink {
        async fn handle(&self, environment_id: &str, event: TunnelEvent) {
            self.calls
                .lock()
                .unwrap()
                .push((environment_id.to_string(), event));
        }
    }

    fn state_with_sink(sink: Arc<dyn EventSink>) -> AppState {
        AppState {
            registry: crate::registry::TunnelRegistry::new(),
            config: Arc::new(Config::from_env()),
            token_resolver: Arc::new(StaticTokenResolver) as Arc<dyn TokenResolver>,
            event_sink: sink,
            status_callback: Arc::new(LoggingStatusCallback),
        }
    }

    #[tokio::test]
    async fn an_event_frame_invokes_the_sink_exactly_once_with_identical_fields() {
        let sink = Arc::new(CountingEventSink {
            calls: Mutex::new(Vec::new()),
        });
        let state = state_with_sink(sink.clone());
        let tunnel = AgentTunnel::new(
            "env-a".to_string(),
            Arc::new(NullConn {
                closed: AtomicBool::new(false),
            }),
        );

        let event = TunnelEvent {
            event_type: "container.start".to_string(),
            severity: "info".to_string(),
            title: "started".to_string(),
            ..Default::default()
        };
        let msg = TunnelMessage {
            id: "evt-1".into(),
            message_type: Some(MessageType::Event),
            event: Some(event.clone()),
            ..Default::default()
        };

        dispatch(&state, &tunnel, msg).await.unwrap();

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "env-a");
        assert_eq!(calls[0].1, event);
    }

    #[tokio::test]
    async fn heartbeat_yields_a_heartbeat_ack_with_the_same_id() {
        struct EchoConn {
            sent: Mutex<Vec<TunnelMessage>>,
        }

        #[async_trait]
        impl Conn for EchoConn {
            async fn send(&self, msg: &TunnelMessage) -> Result<(), TunnelError> {
                self.sent.lock().unwrap().push(msg.clone());
                Ok(())
            }
            async fn receive(&self) -> Result<TunnelMessage, TunnelError> {
                Err(TunnelError::TunnelClosed)
            }
            async fn close(&self) {}
            fn is_closed(&self) -> bool {
                false
            }
            fn is_expected_receive_error(&self, _err: &TunnelError) -> bool {
                true
            }
        }

        let conn = Arc::new(EchoConn {
            sent: Mutex::new(Vec::new()),
        });
        let tunnel = AgentTunnel::new("env-a".to_string(), conn.clone());
        let state = state_with_sink(Arc::new(CountingEventSink {
            calls: Mutex::new(Vec::new()),
        }));

        let msg = TunnelMessage {
            id: "hb-1".into(),
            message_type: Some(MessageType::Heartbeat),
            ..Default::default()
        };
        dispatch(&state, &tunnel, msg).await.unwrap();

        let sent = conn.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type, Some(MessageType::HeartbeatAck));
        assert_eq!(sent[0].id, "hb-1");
    }

    #[tokio::test]
    async fn disconnect_invokes_the_status_callback_exactly_once_with_connected_false() {
        use crate::state::StatusCallback;

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

        let callback = Arc::new(CountingStatusCallback {
            calls: Mutex::new(Vec::new()),
        });
        let mut state = state_with_sink(Arc::new(CountingEventSink {
            calls: Mutex::new(Vec::new()),
        }));
        state.status_callback = callback.clone();

        let tunnel = AgentTunnel::new(
            "env-a".to_string(),
            Arc::new(NullConn {
                closed: AtomicBool::new(false),
            }),
        );

        run(state, tunnel).await;

        let calls = callback.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("env-a".to_string(), false)]);
    }

    #[tokio::test]
    async fn a_direction_illegal_tag_is_logged_and_ignored() {
        let tunnel = AgentTunnel::new(
            "env-a".to_string(),
            Arc::new(NullConn {
                closed: AtomicBool::new(false),
            }),
        );
        let state = state_with_sink(Arc::new(CountingEventSink {
            calls: Mutex::new(Vec::new()),
        }));
        let msg = TunnelMessage {
            message_type: Some(MessageType::HeartbeatAck),
            ..Default::default()
        };
        assert!(dispatch(&state, &tunnel, msg).await.is_ok());
        assert!(!tunnel.conn().is_closed());
    }

    #[tokio::test]
    async fn a_mid_session_register_is_a_protocol_error() {
        let tunnel = AgentTunnel::new(
            "env-a".to_string(),
            Arc::new(NullConn {
                closed: AtomicBool::new(false),
            }),
        );
        let state = state_with_sink(Arc::new(CountingEventSink {
            calls: Mutex::new(Vec::new()),
        }));
        let msg = TunnelMessage {
            message_type: Some(MessageType::Register),
            ..Default::default()
        };
        assert!(matches!(
            dispatch(&state, &tunnel, msg).await,
            Err(TunnelError::ProtocolError(_))
        ));
    }
}
