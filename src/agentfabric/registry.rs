//! Cluster-wide directory of live agents and clients.
//!
//! Entities register on activation and mark themselves deactivated on the
//! way down; entries linger for diagnostics until purged. The registry is a
//! cluster singleton used by status surfaces, not by the routing plane.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Whether a directory entry is currently activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Active,
    Deactivated,
}

/// Directory entry for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredAgent {
    pub handle: String,
    pub agent_type: String,
    /// Owning client handle, when the agent handle is owner-qualified.
    pub client_handle: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: RegistrationStatus,
}

/// Directory entry for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredClient {
    pub handle: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: RegistrationStatus,
}

/// Aggregate counts for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    pub total_agents: usize,
    pub active_agents: usize,
    pub total_clients: usize,
    pub active_clients: usize,
    pub oldest_registration: Option<DateTime<Utc>>,
    pub newest_registration: Option<DateTime<Utc>>,
}

/// The cluster singleton directory.
#[derive(Default)]
pub struct ManagementRegistry {
    agents: RwLock<HashMap<String, RegisteredAgent>>,
    clients: RwLock<HashMap<String, RegisteredClient>>,
}

impl ManagementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an agent activation, refreshing an existing entry.
    pub async fn register_agent(
        &self,
        handle: &str,
        agent_type: &str,
        client_handle: Option<String>,
    ) {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        agents
            .entry(handle.to_string())
            .and_modify(|entry| {
                entry.agent_type = agent_type.to_string();
                entry.client_handle = client_handle.clone();
                entry.last_seen = now;
                entry.status = RegistrationStatus::Active;
            })
            .or_insert_with(|| RegisteredAgent {
                handle: handle.to_string(),
                agent_type: agent_type.to_string(),
                client_handle,
                registered_at: now,
                last_seen: now,
                status: RegistrationStatus::Active,
            });
    }

    /// Mark an agent deactivated. Unknown handles are a no-op.
    pub async fn deactivate_agent(&self, handle: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(handle) {
            entry.status = RegistrationStatus::Deactivated;
            entry.last_seen = Utc::now();
        }
    }

    pub async fn register_client(&self, handle: &str) {
        let now = Utc::now();
        let mut clients = self.clients.write().await;
        clients
            .entry(handle.to_string())
            .and_modify(|entry| {
                entry.last_seen = now;
                entry.status = RegistrationStatus::Active;
            })
            .or_insert_with(|| RegisteredClient {
                handle: handle.to_string(),
                registered_at: now,
                last_seen: now,
                status: RegistrationStatus::Active,
            });
    }

    pub async fn deactivate_client(&self, handle: &str) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(handle) {
            entry.status = RegistrationStatus::Deactivated;
            entry.last_seen = Utc::now();
        }
    }

    /// Agents, optionally filtered by status, sorted by handle.
    pub async fn list_agents(&self, status: Option<RegistrationStatus>) -> Vec<RegisteredAgent> {
        let agents = self.agents.read().await;
        let mut listed: Vec<RegisteredAgent> = agents
            .values()
            .filter(|entry| status.map(|s| entry.status == s).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.handle.cmp(&b.handle));
        listed
    }

    pub async fn list_clients(&self, status: Option<RegistrationStatus>) -> Vec<RegisteredClient> {
        let clients = self.clients.read().await;
        let mut listed: Vec<RegisteredClient> = clients
            .values()
            .filter(|entry| status.map(|s| entry.status == s).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.handle.cmp(&b.handle));
        listed
    }

    pub async fn get_agent(&self, handle: &str) -> Option<RegisteredAgent> {
        self.agents.read().await.get(handle).cloned()
    }

    pub async fn statistics(&self) -> RegistryStatistics {
        let agents = self.agents.read().await;
        let clients = self.clients.read().await;
        let registrations = agents
            .values()
            .map(|a| a.registered_at)
            .chain(clients.values().map(|c| c.registered_at));
        RegistryStatistics {
            total_agents: agents.len(),
            active_agents: agents
                .values()
                .filter(|a| a.status == RegistrationStatus::Active)
                .count(),
            total_clients: clients.len(),
            active_clients: clients
                .values()
                .filter(|c| c.status == RegistrationStatus::Active)
                .count(),
            oldest_registration: registrations.clone().min(),
            newest_registration: registrations.max(),
        }
    }

    /// Drop entries not seen within the last `hours`. Returns how many were
    /// removed.
    pub async fn purge_older_than(&self, hours: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let mut removed = 0;
        {
            let mut agents = self.agents.write().await;
            let before = agents.len();
            agents.retain(|_, entry| entry.last_seen >= cutoff);
            removed += before - agents.len();
        }
        {
            let mut clients = self.clients.write().await;
            let before = clients.len();
            clients.retain(|_, entry| entry.last_seen >= cutoff);
            removed += before - clients.len();
        }
        removed
    }
}
