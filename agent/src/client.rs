//! Dial, register, and run loop — the agent-side counterpart to the
//! teacher's `run_agent_loop`, generalized to try the framed QUIC
//! transport before falling back to WebSocket and to report accept/
//! reject instead of trusting every connect to succeed.

use std::sync::Arc;

use futures_util::StreamExt;
use tunnel_protocol::conn::WsConn;
use tunnel_protocol::quic as tquic;
use tunnel_protocol::{Conn, Direction, MessageType, TunnelError, TunnelMessage};

use crate::config::{Config, EdgeTransport};
use crate::state::AgentClient;
use crate::ws_conn::{TungsteniteWsSink, TungsteniteWsSource};
use crate::{dispatcher, heartbeat};

/// Connects, registers, and serves one tunnel session to completion.
/// Returns once the connection ends, whatever the reason — the caller
/// is responsible for the reconnect/backoff loop.
///
/// Backoff doubles on every failed attempt, starting at
/// `config.reconnect_interval` and capped at
/// `config.max_reconnect_interval`, and resets as soon as a session is
/// established (§4.6: "reconnect with bounded backoff").
pub async fn run_forever(config: Arc<Config>, http_client: reqwest::Client) {
    let mut backoff = config.reconnect_interval;
    loop {
        match connect_and_register(&config, http_client.clone()).await {
            Ok(client) => {
                tracing::info!(
                    environment_id = %client.environment_id().await,
                    "tunnel established"
                );
                backoff = config.reconnect_interval;
                let hb = heartbeat::spawn(client.clone());
                let error_drain = spawn_error_logger(client.clone());
                dispatcher::run(client.clone()).await;
                hb.abort();
                error_drain.abort();
                tracing::warn!("tunnel session ended, will reconnect");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to establish tunnel");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_reconnect_interval);
    }
}

/// Drains the client's non-fatal-error channel and logs each one. A
/// parent application that embeds this crate instead of running it as
/// the `agent` binary would call `client.take_error_receiver()` itself
/// and skip this task entirely.
fn spawn_error_logger(client: Arc<AgentClient>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(mut rx) = client.take_error_receiver() {
            while let Some(err) = rx.recv().await {
                tracing::warn!(error = %err, "non-fatal tunnel error");
            }
        }
    })
}

async fn connect_and_register(
    config: &Arc<Config>,
    http_client: reqwest::Client,
) -> Result<Arc<AgentClient>, TunnelError> {
    let conn = dial(config).await?;

    conn.send(&TunnelMessage {
        message_type: Some(MessageType::Register),
        agent_token: config.agent_token.clone(),
        ..Default::default()
    })
    .await?;

    let response = conn.receive().await?;
    if response.message_type != Some(MessageType::RegisterResponse) {
        return Err(TunnelError::ProtocolError(
            "expected register_response as the first reply".into(),
        ));
    }
    if !response.accepted {
        return Err(TunnelError::ProtocolError(format!(
            "manager rejected registration: {}",
            response.error
        )));
    }

    let client = AgentClient::new(conn, config.clone(), http_client);
    client.set_environment_id(response.environment_id).await;
    Ok(client)
}

async fn dial(config: &Config) -> Result<Arc<dyn Conn>, TunnelError> {
    match config.transport {
        EdgeTransport::Quic => dial_quic(config).await,
        EdgeTransport::WebSocket => dial_ws(config).await,
        EdgeTransport::Auto => match dial_quic(config).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                tracing::info!(error = %e, "QUIC transport unavailable, falling back to websocket");
                dial_ws(config).await
            }
        },
    }
}

async fn dial_quic(config: &Config) -> Result<Arc<dyn Conn>, TunnelError> {
    let url = url::Url::parse(&config.manager_quic_url)
        .map_err(|e| TunnelError::TransportError(format!("invalid manager quic url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::TransportError("manager quic url has no host".into()))?
        .to_string();
    let port = url.port().unwrap_or(7443);

    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?
        .next()
        .ok_or_else(|| TunnelError::TransportError("could not resolve manager address".into()))?;

    let client_config = tquic::insecure_client_config()?;
    let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    endpoint.set_default_client_config(client_config);

    let connection = endpoint
        .connect(addr, &host)
        .map_err(|e| TunnelError::TransportError(e.to_string()))?
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;

    Ok(Arc::new(tunnel_protocol::conn::QuicConn::new(
        send,
        recv,
        Direction::AgentOrigin,
    )))
}

async fn dial_ws(config: &Config) -> Result<Arc<dyn Conn>, TunnelError> {
    let (stream, _) = tokio_tungstenite::connect_async(&config.manager_ws_url)
        .await
        .map_err(|e| TunnelError::TransportError(e.to_string()))?;
    let (tx, rx) = stream.split();
    Ok(Arc::new(WsConn::new(
        TungsteniteWsSink(tx),
        TungsteniteWsSource(rx),
        Direction::AgentOrigin,
    )))
}
