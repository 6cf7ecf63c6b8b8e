//! Steady-state receive loop: demultiplexes frames from the manager onto
//! the local HTTP handler or an open local WebSocket proxy session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tunnel_protocol::{MessageType, TunnelMessage};

use crate::handler;
use crate::local_ws;
use crate::state::AgentClient;

pub async fn run(client: Arc<AgentClient>) {
    loop {
        match client.conn().receive().await {
            Ok(msg) => dispatch(&client, msg).await,
            Err(e) => {
                if !client.conn().is_expected_receive_error(&e) {
                    tracing::warn!(error = %e, "tunnel receive error");
                }
                break;
            }
        }
        if client.is_closed() {
            break;
        }
    }
    client.close().await;
}

async fn dispatch(client: &Arc<AgentClient>, msg: TunnelMessage) {
    let Some(tag) = msg.message_type else {
        return;
    };

    match tag {
        MessageType::Request => {
            let client = client.clone();
            tokio::spawn(async move {
                handler::handle_request(&client, msg).await;
            });
        }
        MessageType::WebsocketStart => start_local_websocket_session(client, msg).await,
        MessageType::WebsocketData | MessageType::WebsocketClose => {
            client.forward_to_session(&msg.id, msg);
        }
        MessageType::HeartbeatAck => client.note_heartbeat_ack(),
        // A mid-session register_response has no valid meaning once the
        // tunnel is already registered (§4.6: "treat as protocol error").
        // §5's ordering guarantees call for terminating the tunnel rather
        // than re-running the handshake in place; closing here makes
        // `run`'s `is_closed` check exit the loop so `client.rs`'s
        // reconnect-with-backoff loop picks it back up.
        MessageType::RegisterResponse => {
            tracing::warn!("unexpected register_response on an already-registered tunnel, closing tunnel");
            client.close().await;
        }
        MessageType::Response
        | MessageType::Heartbeat
        | MessageType::StreamData
        | MessageType::StreamEnd
        | MessageType::Register
        | MessageType::Event => {
            tracing::warn!(tag = ?tag, "received agent-origin-only tag from the manager");
        }
    }
}

async fn start_local_websocket_session(client: &Arc<AgentClient>, msg: TunnelMessage) {
    let id = msg.id.clone();
    let url = local_ws::build_local_websocket_url(
        &client.config.listen,
        &client.config.port,
        &msg.path,
        &msg.query,
    );
    let headers = msg.clone_headers();
    let (tx, rx) = mpsc::unbounded_channel();
    client.register_websocket_session(id.clone(), tx);
    let client = client.clone();
    tokio::spawn(local_ws::run_session(client, id, url, headers, rx));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tunnel_protocol::{Conn, TunnelError};

    use crate::config::Config;

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

    fn client() -> Arc<AgentClient> {
        AgentClient::new(
            Arc::new(NullConn {
                closed: AtomicBool::new(false),
            }),
            Arc::new(Config::from_env()),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn a_post_handshake_register_response_closes_the_tunnel() {
        let client = client();
        let msg = TunnelMessage {
            message_type: Some(MessageType::RegisterResponse),
            accepted: true,
            ..Default::default()
        };
        dispatch(&client, msg).await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn an_unknown_agent_origin_tag_is_logged_and_ignored() {
        let client = client();
        let msg = TunnelMessage {
            message_type: Some(MessageType::Heartbeat),
            ..Default::default()
        };
        dispatch(&client, msg).await;
        assert!(!client.is_closed());
    }
}
