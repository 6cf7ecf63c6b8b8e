//! Connection acceptance, the per-tunnel receive loop, and the
//! idle-tunnel cleanup sweep — the manager-side half of §4.3/§4.5.

mod accept;
mod cleanup;
pub(crate) mod receive_loop;
mod ws_conn;

use std::net::SocketAddr;
use std::sync::Arc;

use tunnel_protocol::{quic, Direction};

use crate::state::AppState;

pub use accept::ws_handler;

/// Runs the QUIC listener until the process is torn down. Each accepted
/// connection's first bidirectional stream is treated as that agent's
/// tunnel; additional streams on the same QUIC connection are rejected
/// (the framed transport is one tunnel per connection, matching the
/// WebSocket side being one tunnel per socket).
pub async fn run_quic_listener(state: AppState, bind: SocketAddr) -> anyhow::Result<()> {
    let server_config = quic::self_signed_server_config()?;
    let endpoint = quinn::Endpoint::server(server_config, bind)?;
    tracing::info!(%bind, "QUIC tunnel listener started");

    while let Some(incoming) = endpoint.accept().await {
        let state = state.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(connection) => {
                    if let Err(e) = handle_quic_connection(state, connection).await {
                        tracing::warn!(error = %e, "QUIC tunnel connection ended with an error");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "QUIC handshake failed"),
            }
        });
    }
    Ok(())
}

async fn handle_quic_connection(state: AppState, connection: quinn::Connection) -> anyhow::Result<()> {
    let (send, recv) = connection.accept_bi().await?;
    let conn: Arc<dyn tunnel_protocol::Conn> =
        Arc::new(tunnel_protocol::conn::QuicConn::new(send, recv, Direction::ManagerOrigin));
    accept::accept_and_serve(state, conn, None).await;
    Ok(())
}

/// Starts the idle-tunnel cleanup loop. Returns a handle the caller can
/// use to wait for the loop to observe a shutdown signal and exit.
pub fn spawn_cleanup_loop(state: AppState) -> cleanup::CleanupHandle {
    cleanup::spawn(state)
}
