//! REST API for inspecting manager state — generalizes the teacher's
//! `GET /api/agents` into a status endpoint covering every tunnel's
//! liveness, not just its identity.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct AgentStatus {
    pub environment_id: String,
    pub tunnel_id: String,
    pub uptime_secs: u64,
}

/// `GET /api/tunnel/agents` — lists every environment with a live tunnel
/// and how long its current connection has been up.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    let mut agents = Vec::new();
    state.registry.for_each(|tunnel| {
        agents.push(AgentStatus {
            environment_id: tunnel.environment_id.clone(),
            tunnel_id: tunnel.tunnel_id.to_string(),
            uptime_secs: tunnel.uptime().as_secs(),
        });
    });
    Json(agents)
}
