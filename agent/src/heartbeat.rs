//! Periodic liveness signal. Mirrors the teacher's 30-second ping task,
//! generalized with acked/unacked tracking so a silently stale tunnel
//! (manager unreachable but the socket hasn't errored yet) is torn down
//! after a bounded number of misses instead of being trusted forever.

use std::sync::Arc;

use tunnel_protocol::{MessageType, TunnelMessage};
use uuid::Uuid;

use crate::state::AgentClient;

pub fn spawn(client: Arc<AgentClient>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(client.config.heartbeat_interval);
        loop {
            interval.tick().await;
            if client.is_closed() {
                break;
            }

            let unacked = client.note_heartbeat_sent();
            let heartbeat = TunnelMessage {
                id: Uuid::new_v4().to_string(),
                message_type: Some(MessageType::Heartbeat),
                ..Default::default()
            };
            if let Err(e) = client.send(heartbeat).await {
                client.report_error(e.clone());
                tracing::warn!(error = %e, "failed to send heartbeat");
                break;
            }

            if unacked >= client.config.max_unacked_heartbeats {
                tracing::warn!(
                    unacked,
                    "manager has not acked {} consecutive heartbeats, closing tunnel",
                    unacked
                );
                client.close().await;
                break;
            }
        }
    })
}
