//! Agent health reporting.

use crate::agentfabric::message::AgentConfiguration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health states ordered from best to worst; combining takes the numeric
/// worst of the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthState {
    NotConfigured,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// The worse of `self` and `other`.
    pub fn worst(self, other: HealthState) -> HealthState {
        self.max(other)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::Healthy
    }
}

/// How much detail a health probe should gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthDetail {
    /// Agent-level state only.
    Basic,
    /// Agent-level state plus the hosted behavior's own report, combined
    /// worst-of.
    Full,
}

/// Health report of the hosted behavior (the proxy).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyHealth {
    pub state: HealthState,
    pub diagnostics: HashMap<String, String>,
}

/// Full health snapshot of one agent entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealthStatus {
    pub handle: String,
    pub state: HealthState,
    pub is_configured: bool,
    pub timestamp: DateTime<Utc>,
    pub agent_type: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub messages_processed: Option<u64>,
    pub active_timer_count: Option<usize>,
    pub active_reminder_count: Option<usize>,
    pub stream_count: Option<usize>,
    pub active_streams: Option<Vec<String>>,
    pub proxy_health: Option<ProxyHealth>,
    pub diagnostics: Option<HashMap<String, String>>,
    pub configuration: Option<AgentConfiguration>,
}

impl AgentHealthStatus {
    /// An unconfigured agent's report.
    pub fn not_configured(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            state: HealthState::NotConfigured,
            is_configured: false,
            timestamp: Utc::now(),
            agent_type: None,
            uptime_seconds: None,
            messages_processed: None,
            active_timer_count: None,
            active_reminder_count: None,
            stream_count: None,
            active_streams: None,
            proxy_health: None,
            diagnostics: None,
            configuration: None,
        }
    }

    /// Fold the proxy's report into this status, taking the worst state.
    pub fn with_proxy(mut self, proxy: ProxyHealth) -> Self {
        self.state = self.state.worst(proxy.state);
        self.proxy_health = Some(proxy);
        self
    }
}
