//! Cluster and client configuration surfaces.

use std::time::Duration;

/// How entity state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusteringMode {
    /// In-memory storage; state dies with the process.
    Localhost,
    /// Durable storage via the relational connection string.
    Relational,
    /// Durable storage via the cloud-table connection string.
    CloudTable,
}

/// Options fixed at cluster startup.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub cluster_id: String,
    pub service_id: String,
    pub clustering_mode: ClusteringMode,
    /// Backing location for `Relational`/`CloudTable` modes.
    pub connection_string: Option<String>,
    /// Overrides `connection_string` for the state store when set.
    pub storage_connection_string: Option<String>,
    /// How long an activation may sit idle before it is collected.
    pub idle_deactivation: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            cluster_id: "dev".to_string(),
            service_id: "agentfabric".to_string(),
            clustering_mode: ClusteringMode::Localhost,
            connection_string: None,
            storage_connection_string: None,
            idle_deactivation: Duration::from_secs(600),
        }
    }
}

/// Options governing the external-client side of the runtime.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Connection attempts before startup fails terminally.
    pub connection_retry_count: u32,
    /// Delay between connection attempts.
    pub connection_retry_delay: Duration,
    pub gateway_list_refresh_period: Duration,
    /// Deadline applied to request-response RPC.
    pub response_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connection_retry_count: 5,
            connection_retry_delay: Duration::from_secs(3),
            gateway_list_refresh_period: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
        }
    }
}
