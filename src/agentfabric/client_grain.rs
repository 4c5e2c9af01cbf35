//! The client entity: one single-activation mailbox per external client.
//!
//! A client grain owns everything the cluster keeps on behalf of one
//! external client handle: the observer set, the pending-message buffer that
//! absorbs traffic while no observer is attached, and the tracked-agent
//! directory. It subscribes to its own chat stream on activation, so agents
//! reach the client by publishing on `(AgentChat, clientId)`.
//!
//! Pending messages are delivered FIFO to the next observer that subscribes.
//! At rehydration, a pending buffer whose persisted timestamp is older than
//! one hour is discarded.

use crate::agentfabric::cluster::ClusterCore;
use crate::agentfabric::error::RuntimeResult;
use crate::agentfabric::handle;
use crate::agentfabric::health::{AgentHealthStatus, HealthDetail, HealthState};
use crate::agentfabric::message::{AgentConfiguration, AgentMessage};
use crate::agentfabric::observer::{MessageObserver, ObserverManager};
use crate::agentfabric::state::{ClientGrainState, TrackedAgent};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fabric::{FabricError, Grain};
use std::sync::Arc;

/// Pending messages older than this at rehydration are discarded.
const PENDING_MAX_AGE_HOURS: i64 = 1;

/// Single-activation mailbox grain for one client handle.
pub struct ClientGrain {
    client_id: String,
    core: Arc<ClusterCore>,
    state: ClientGrainState,
    observers: ObserverManager,
}

impl ClientGrain {
    pub(crate) fn new(client_id: &str, core: Arc<ClusterCore>) -> Self {
        Self {
            client_id: client_id.to_string(),
            core,
            state: ClientGrainState::default(),
            observers: ObserverManager::default(),
        }
    }

    fn prefix(&self) -> String {
        handle::owner_prefix(&self.client_id)
    }

    /// Install `observer`. A non-empty pending queue is drained FIFO to all
    /// observers and cleared.
    pub async fn subscribe(&mut self, observer: Arc<dyn MessageObserver>) {
        self.observers.subscribe(observer);

        if self.state.pending_messages.is_empty() {
            return;
        }
        let drained = std::mem::take(&mut self.state.pending_messages);
        self.state.pending_messages_persisted = None;
        let mut delivered = 0;
        for message in &drained {
            delivered += self.observers.notify(message).await;
        }
        log::debug!(
            "client '{}' drained {} pending messages ({} deliveries)",
            self.client_id,
            drained.len(),
            delivered
        );
    }

    /// Remove `observer`. Unknown references are a no-op.
    pub fn unsubscribe(&mut self, observer: &Arc<dyn MessageObserver>) {
        self.observers.unsubscribe(observer);
    }

    /// Direct request-response RPC to an agent. The target handle is
    /// normalized with this client's prefix; errors surface to the caller.
    pub async fn send_and_receive(
        &mut self,
        message: AgentMessage,
    ) -> RuntimeResult<Option<AgentMessage>> {
        let message = self.normalize_outbound(message)?;
        let target = message.to_handle.clone();
        self.core.invoke_agent_message(&target, message).await
    }

    /// Fire-and-forget publish on the target agent's chat stream.
    pub async fn send_message(&mut self, message: AgentMessage) -> RuntimeResult<()> {
        let message = self.normalize_outbound(message)?;
        let target = message.to_handle.clone();
        self.core.publish_chat(&target, message).await
    }

    /// Publish an event: on `stream_name` verbatim when given, else on the
    /// normalized target's event stream.
    pub async fn send_event(
        &mut self,
        message: AgentMessage,
        stream_name: Option<&str>,
    ) -> RuntimeResult<()> {
        match stream_name {
            Some(stream) => {
                let mut message = message;
                if message.from_handle.is_empty() {
                    message.from_handle = self.client_id.clone();
                }
                self.core.publish_event(stream, message).await
            }
            None => {
                let message = self.normalize_outbound(message)?;
                let target = message.to_handle.clone();
                self.core.publish_event(&target, message).await
            }
        }
    }

    /// Create (or reuse) an agent owned by this client.
    ///
    /// The handle is normalized to `clientId:handle`. When the agent is
    /// already tracked and no reconfigure is forced, a basic health probe
    /// decides: a configured agent's cached health is returned as-is, while
    /// `NotConfigured` (or a probe failure) falls through to a full
    /// configure.
    pub async fn create_agent(
        &mut self,
        mut configuration: AgentConfiguration,
    ) -> RuntimeResult<AgentHealthStatus> {
        configuration.handle = handle::ensure_prefix(&configuration.handle, &self.prefix());
        handle::validate(&configuration.handle)?;
        let agent_handle = configuration.handle.clone();

        if self.state.tracked_agents.contains_key(&agent_handle) && !configuration.force_reconfigure
        {
            match self.core.agent_health(&agent_handle, HealthDetail::Basic).await {
                Ok(health) if health.state != HealthState::NotConfigured => return Ok(health),
                Ok(_) => {
                    log::debug!(
                        "tracked agent '{}' reports NotConfigured; reconfiguring",
                        agent_handle
                    );
                }
                Err(err) => {
                    log::warn!(
                        "health probe for tracked agent '{}' failed ({}); reconfiguring",
                        agent_handle,
                        err
                    );
                }
            }
        }

        let health = self.core.configure_agent(configuration.clone()).await?;
        self.state.tracked_agents.insert(
            agent_handle.clone(),
            TrackedAgent {
                handle: agent_handle,
                agent_type: configuration.agent_type,
            },
        );
        self.state.last_modified = Utc::now();
        if let Err(err) = self.state.persist(self.core.store().as_ref(), &self.client_id).await {
            log::error!(
                "tracked-agent persist for client '{}' failed: {}",
                self.client_id,
                err
            );
        }
        Ok(health)
    }

    /// Snapshot of the tracked-agent directory.
    pub fn tracked_agents(&self) -> Vec<TrackedAgent> {
        let mut tracked: Vec<TrackedAgent> = self.state.tracked_agents.values().cloned().collect();
        tracked.sort_by(|a, b| a.handle.cmp(&b.handle));
        tracked
    }

    /// O(1) directory lookup; the probe handle is normalized first.
    pub fn is_agent_tracked(&self, agent_handle: &str) -> bool {
        let qualified = handle::ensure_prefix(agent_handle, &self.prefix());
        self.state.tracked_agents.contains_key(&qualified)
    }

    /// Intake from this client's chat stream: notify observers when any are
    /// attached, otherwise buffer.
    pub async fn deliver(&mut self, message: AgentMessage) {
        if self.observers.count() > 0 {
            self.observers.notify(&message).await;
        } else {
            log::debug!(
                "client '{}' has no observers; buffering message from '{}'",
                self.client_id,
                message.from_handle
            );
            self.state.pending_messages.push(message);
        }
    }

    /// Live observer count (test and diagnostics surface).
    pub fn observer_count(&mut self) -> usize {
        self.observers.count()
    }

    fn normalize_outbound(&self, mut message: AgentMessage) -> RuntimeResult<AgentMessage> {
        if message.from_handle.is_empty() {
            message.from_handle = self.client_id.clone();
        }
        handle::validate(&message.to_handle)?;
        message.to_handle = handle::ensure_prefix(&message.to_handle, &self.prefix());
        Ok(message)
    }
}

#[async_trait]
impl Grain for ClientGrain {
    async fn on_activate(&mut self) -> Result<(), FabricError> {
        self.state = ClientGrainState::load(self.core.store().as_ref(), &self.client_id).await;

        // Stale purge: a pending buffer persisted more than an hour ago is
        // dropped wholesale.
        if let Some(persisted_at) = self.state.pending_messages_persisted {
            let age = Utc::now() - persisted_at;
            if age > ChronoDuration::hours(PENDING_MAX_AGE_HOURS)
                && !self.state.pending_messages.is_empty()
            {
                log::warn!(
                    "client '{}' discarding {} pending messages older than {}h",
                    self.client_id,
                    self.state.pending_messages.len(),
                    PENDING_MAX_AGE_HOURS
                );
                self.state.pending_messages.clear();
                self.state.pending_messages_persisted = None;
            }
        }

        self.core.ensure_client_intake(&self.client_id).await;
        self.core.registry().register_client(&self.client_id).await;
        Ok(())
    }

    async fn on_deactivate(&mut self) {
        self.state.pending_messages_persisted = if self.state.pending_messages.is_empty() {
            None
        } else {
            Some(Utc::now())
        };
        self.state.last_modified = Utc::now();
        if let Err(err) = self.state.persist(self.core.store().as_ref(), &self.client_id).await {
            log::error!(
                "client '{}' state persist on deactivation failed: {}",
                self.client_id,
                err
            );
        }
        self.core.registry().deactivate_client(&self.client_id).await;
    }
}
