//! # Arcane Edge Tunnel — Manager
//!
//! Accepts agent connections over QUIC (preferred) or WebSocket
//! (fallback), and adapts ordinary inbound HTTP/WebSocket traffic onto
//! whichever tunnel serves the target environment.
//!
//! ## Modules
//!
//! - [`config`]   — runtime configuration
//! - [`state`]    — shared registries, token resolution, event sink
//! - [`tunnel`]   — a single agent's live connection and its in-flight requests
//! - [`registry`] — environment-id-keyed tunnel lookup
//! - [`pending`]  — in-flight request/session bookkeeping
//! - [`server`]   — connection acceptance, receive loop, idle cleanup
//! - [`adapter`]  — HTTP/WebSocket request adaptation onto a tunnel
//! - [`api`]      — status REST endpoints

mod adapter;
mod api;
mod config;
mod pending;
mod registry;
mod server;
mod state;
mod tunnel;

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::state::AppState;
use tunnel_protocol::direction::{
    is_tunnel_request, normalize_tunnel_path, RequestClassifyInput, CANONICAL_TUNNEL_PATH,
    LEGACY_TUNNEL_PATH,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arcane_tunnel_manager=info".into()),
        )
        .init();

    let config = Config::from_env();
    let state = AppState::new(config.clone());

    let quic_bind = config.quic_bind.parse()?;
    let quic_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_quic_listener(quic_state, quic_bind).await {
            tracing::error!(error = %e, "QUIC listener exited");
        }
    });

    let cleanup = server::spawn_cleanup_loop(state.clone());

    let app = Router::new()
        .route(CANONICAL_TUNNEL_PATH, get(server::ws_handler))
        .route(LEGACY_TUNNEL_PATH, get(server::ws_handler))
        .route("/api/tunnel/agents", get(api::list_agents))
        .route(
            "/edge/proxy/{environment_id}/http/{*rest}",
            any(adapter::proxy_request),
        )
        .route(
            "/edge/proxy/{environment_id}/ws/{*rest}",
            get(adapter::proxy_websocket),
        )
        .layer(middleware::from_fn(normalize_tunnel_path_mw))
        .layer(middleware::from_fn(reject_misdirected_framed_rpc))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    info!(http_bind = %config.http_bind, quic_bind = %config.quic_bind, "manager listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.shutdown();
    cleanup.wait_for_done().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Rewrites a reverse-proxy-prefixed tunnel-connect path to the canonical
/// one before routing, so `/edge/proxy/api/tunnel/connect` and similar
/// variants reach the same handler as the bare canonical/legacy paths
/// (§4.2, §8.6). An unprefixed canonical or legacy path is already an
/// exact route match and passes through unchanged.
async fn normalize_tunnel_path_mw(mut req: Request, next: Next) -> Response {
    if let Some(canonical) = normalize_tunnel_path(req.uri().path()) {
        if req.uri().path() != canonical {
            let mut parts = req.uri().clone().into_parts();
            let path_and_query = match req.uri().query() {
                Some(q) => format!("{canonical}?{q}"),
                None => canonical.to_string(),
            };
            parts.path_and_query = path_and_query.parse().ok();
            if let Ok(rewritten) = axum::http::Uri::from_parts(parts) {
                *req.uri_mut() = rewritten;
            }
        }
    }
    next.run(req).await
}

/// This deployment runs the framed-RPC transport on its own QUIC listener
/// rather than demultiplexing it off the HTTP listener via `isTunnelRequest`
/// (see SPEC_FULL.md §2/§6) — there is no framed-RPC server behind this
/// router to hand such a request to. A request `is_tunnel_request`
/// classifies as framed-RPC traffic arriving here is therefore always a
/// misdirected agent dial (wrong port, or a proxy that didn't route gRPC
/// traffic to the QUIC listener), not ordinary HTTP for the adapter routes
/// below — reject it with guidance instead of letting it fall through to a
/// confusing 404.
async fn reject_misdirected_framed_rpc(req: Request, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let te_header = req
        .headers()
        .get("te")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let http2 = req.version() == axum::http::Version::HTTP_2;

    let classify = RequestClassifyInput {
        method: &method,
        path: &path,
        content_type: content_type.as_deref(),
        http2,
        te_header: te_header.as_deref(),
    };

    if is_tunnel_request(&classify) {
        return (
            StatusCode::MISDIRECTED_REQUEST,
            "framed RPC tunnel traffic is served on the manager's QUIC listener (config.quic_bind), not this HTTP listener",
        )
            .into_response();
    }

    next.run(req).await
}
