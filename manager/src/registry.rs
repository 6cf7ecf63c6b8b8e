//! Environment-id-keyed tunnel registry. Generalizes the teacher's
//! `agents: Arc<DashMap<String, AgentInfo>>` — same lock-free concurrent
//! map, but `register` now has replace semantics (a reconnecting agent
//! supersedes its previous tunnel instead of the new connection losing
//! a race with the old one) and `unregister` only removes an entry if
//! the caller's tunnel is still the one registered under that id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::tunnel::AgentTunnel;

#[derive(Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Arc<AgentTunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
        }
    }

    /// Registers `tunnel` under its environment id. If another tunnel is
    /// already registered for that environment, it is closed and
    /// replaced — an agent reconnecting supersedes its stale connection
    /// rather than being rejected.
    pub async fn register(&self, tunnel: Arc<AgentTunnel>) {
        let previous = self
            .tunnels
            .insert(tunnel.environment_id.clone(), tunnel.clone());
        if let Some(previous) = previous {
            if previous.tunnel_id != tunnel.tunnel_id {
                previous.close().await;
            }
        }
    }

    pub fn get(&self, environment_id: &str) -> Option<Arc<AgentTunnel>> {
        self.tunnels.get(environment_id).map(|e| e.value().clone())
    }

    /// Removes the entry for `environment_id` only if it is still
    /// `tunnel` by identity. A tunnel that was already superseded by a
    /// reconnect must not unregister the new one when its own receive
    /// loop unwinds.
    pub fn unregister(&self, environment_id: &str, tunnel_id: uuid::Uuid) {
        self.tunnels.remove_if(environment_id, |_, v| v.tunnel_id == tunnel_id);
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<AgentTunnel>)) {
        for entry in self.tunnels.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }
}
