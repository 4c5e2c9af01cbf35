//! Cluster assembly: substrate services, grain catalogs, and routing glue.
//!
//! [`AgentCluster`] is the embedding application's entry point. Starting one
//! builds the state store for the configured clustering mode, the stream
//! bus, the durable reminder service, the management registry, and the two
//! single-activation catalogs (agents and clients), then resumes persisted
//! reminders. Behaviors and chat models are registered afterwards, before
//! traffic arrives.
//!
//! [`ClusterCore`] is the internal routing surface shared by grains, hosts,
//! and client contexts: direct RPC with a response deadline, stream
//! publication, scheduled-callback dispatch, and client-grain forwarding.

use crate::agentfabric::agent_grain::AgentGrain;
use crate::agentfabric::behavior::BehaviorRegistry;
use crate::agentfabric::client_grain::ClientGrain;
use crate::agentfabric::completion::ModelRegistry;
use crate::agentfabric::config::{ClientOptions, ClusterOptions, ClusteringMode};
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::health::{AgentHealthStatus, HealthDetail};
use crate::agentfabric::message::{AgentConfiguration, AgentMessage};
use crate::agentfabric::observer::MessageObserver;
use crate::agentfabric::registry::ManagementRegistry;
use crate::agentfabric::state::TrackedAgent;
use async_trait::async_trait;
use fabric::{
    Catalog, FileStateStore, MemoryStateStore, ReminderHandler, ReminderService, StateStore,
    StreamBus, StreamEnvelope, StreamHandler, StreamId, StreamSubscription,
};
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use tokio::time::timeout;

/// Internal routing surface shared across the runtime.
pub struct ClusterCore {
    options: ClusterOptions,
    client_options: ClientOptions,
    store: Arc<dyn StateStore>,
    streams: Arc<StreamBus>,
    reminders: Arc<ReminderService>,
    registry: Arc<ManagementRegistry>,
    behaviors: Arc<BehaviorRegistry>,
    models: Arc<ModelRegistry>,
    agents: OnceLock<Catalog<AgentGrain>>,
    clients: OnceLock<Catalog<ClientGrain>>,
    /// Handles whose chat/event intakes are already installed. Intakes are
    /// installed once per handle and survive deactivation, so stream traffic
    /// reactivates the grain instead of vanishing.
    agent_intakes: tokio::sync::Mutex<std::collections::HashSet<String>>,
    client_intakes: tokio::sync::Mutex<std::collections::HashSet<String>>,
    /// Handed to stream intakes and the reminder handler so background tasks
    /// never keep the core alive.
    weak_self: Weak<ClusterCore>,
}

impl ClusterCore {
    pub(crate) fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub(crate) fn streams(&self) -> &Arc<StreamBus> {
        &self.streams
    }

    pub(crate) fn reminders(&self) -> &Arc<ReminderService> {
        &self.reminders
    }

    pub(crate) fn registry(&self) -> &Arc<ManagementRegistry> {
        &self.registry
    }

    pub(crate) fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        &self.behaviors
    }

    pub(crate) fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub(crate) fn client_options(&self) -> &ClientOptions {
        &self.client_options
    }

    fn agent_catalog(&self) -> RuntimeResult<&Catalog<AgentGrain>> {
        self.agents.get().ok_or_else(|| {
            AgentRuntimeError::SubstratePermanent("agent catalog not initialized".into())
        })
    }

    fn client_catalog(&self) -> RuntimeResult<&Catalog<ClientGrain>> {
        self.clients.get().ok_or_else(|| {
            AgentRuntimeError::SubstratePermanent("client catalog not initialized".into())
        })
    }

    // ── Agent routing ─────────────────────────────────────────────────────

    /// Direct RPC into an agent's `handle_message` under the response
    /// deadline.
    pub(crate) async fn invoke_agent_message(
        &self,
        to: &str,
        message: AgentMessage,
    ) -> RuntimeResult<Option<AgentMessage>> {
        let catalog = self.agent_catalog()?;
        let deadline = self.client_options.response_timeout;
        let invocation = catalog.invoke(to, move |grain| {
            Box::pin(async move { grain.handle_message(message).await })
        });
        match timeout(deadline, invocation).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(AgentRuntimeError::SubstrateTransient(format!(
                "response deadline of {:?} exceeded for '{}'",
                deadline, to
            ))),
        }
    }

    pub(crate) async fn configure_agent(
        &self,
        configuration: AgentConfiguration,
    ) -> RuntimeResult<AgentHealthStatus> {
        self.configure_agent_with_detail(configuration, HealthDetail::Basic)
            .await
    }

    pub(crate) async fn configure_agent_with_detail(
        &self,
        configuration: AgentConfiguration,
        detail: HealthDetail,
    ) -> RuntimeResult<AgentHealthStatus> {
        let catalog = self.agent_catalog()?;
        let target = configuration.handle.clone();
        catalog
            .invoke(&target, move |grain| {
                Box::pin(async move { grain.configure(configuration, detail).await })
            })
            .await
            .map_err(AgentRuntimeError::from)?
    }

    /// Probe an agent's health, activating it if needed.
    pub(crate) async fn agent_health(
        &self,
        handle: &str,
        detail: HealthDetail,
    ) -> RuntimeResult<AgentHealthStatus> {
        let catalog = self.agent_catalog()?;
        catalog
            .invoke(handle, move |grain| {
                Box::pin(async move { grain.health(detail).await })
            })
            .await
            .map_err(AgentRuntimeError::from)
    }

    pub(crate) async fn deactivate_agent(&self, handle: &str) -> RuntimeResult<bool> {
        Ok(self.agent_catalog()?.deactivate(handle).await)
    }

    /// Dispatch a timer/reminder tick into the agent, reactivating it when
    /// necessary. Failures are logged; scheduled callbacks have no caller to
    /// surface to.
    pub(crate) async fn dispatch_scheduled(
        &self,
        handle: &str,
        name: &str,
        message_type: &str,
        message: Option<String>,
    ) {
        let catalog = match self.agent_catalog() {
            Ok(catalog) => catalog,
            Err(err) => {
                log::error!("scheduled dispatch for '{}' failed: {}", handle, err);
                return;
            }
        };
        let name = name.to_string();
        let message_type = message_type.to_string();
        if let Err(err) = catalog
            .invoke(handle, move |grain| {
                Box::pin(async move {
                    grain.dispatch_scheduled(&name, &message_type, message).await
                })
            })
            .await
        {
            log::error!("scheduled dispatch for '{}' failed: {}", handle, err);
        }
    }

    /// Timer-tick variant of [`dispatch_scheduled`](Self::dispatch_scheduled):
    /// never reactivates. A tick racing the activation's collection is
    /// dropped, because timers die with the activation.
    pub(crate) async fn dispatch_timer(
        &self,
        handle: &str,
        name: &str,
        message_type: &str,
        message: Option<String>,
    ) {
        let Ok(catalog) = self.agent_catalog() else {
            return;
        };
        let name = name.to_string();
        let message_type = message_type.to_string();
        if catalog
            .invoke_if_active(handle, move |grain| {
                Box::pin(async move {
                    grain.dispatch_scheduled(&name, &message_type, message).await
                })
            })
            .await
            .is_none()
        {
            log::debug!("timer tick for inactive agent '{}' dropped", handle);
        }
    }

    // ── Stream plumbing ───────────────────────────────────────────────────

    pub(crate) async fn publish_chat(&self, key: &str, message: AgentMessage) -> RuntimeResult<()> {
        let payload = encode_message(&message)?;
        self.streams.publish(&StreamId::chat(key), payload).await;
        Ok(())
    }

    pub(crate) async fn publish_event(&self, key: &str, message: AgentMessage) -> RuntimeResult<()> {
        let payload = encode_message(&message)?;
        self.streams.publish(&StreamId::event(key), payload).await;
        Ok(())
    }

    /// Install an agent's chat and event intakes, once per handle. The
    /// intakes outlive any single activation: traffic on either stream
    /// reactivates the agent through the catalog.
    pub(crate) async fn ensure_agent_intakes(&self, handle: &str) {
        let mut installed = self.agent_intakes.lock().await;
        if !installed.insert(handle.to_string()) {
            return;
        }
        drop(installed);
        self.streams
            .subscribe(
                &StreamId::chat(handle),
                Arc::new(AgentChatIntake {
                    core: self.weak_self.clone(),
                    handle: handle.to_string(),
                }),
            )
            .await;
        self.streams
            .subscribe(
                &StreamId::event(handle),
                Arc::new(AgentEventIntake {
                    core: self.weak_self.clone(),
                    handle: handle.to_string(),
                }),
            )
            .await;
    }

    /// Subscribe an agent to the extra event streams named in its
    /// configuration. These are per-activation subscriptions; the grain owns
    /// the handles and drops them on deactivation.
    pub(crate) async fn subscribe_extra_streams(
        &self,
        handle: &str,
        extra_streams: &[String],
    ) -> Vec<StreamSubscription> {
        let mut subscriptions = Vec::with_capacity(extra_streams.len());
        for stream in extra_streams {
            subscriptions.push(
                self.streams
                    .subscribe(
                        &StreamId::event(stream),
                        Arc::new(AgentEventIntake {
                            core: self.weak_self.clone(),
                            handle: handle.to_string(),
                        }),
                    )
                    .await,
            );
        }
        subscriptions
    }

    /// Install a client's `(AgentChat, clientId)` intake, once per handle.
    /// Like agent intakes, it survives deactivation so buffered delivery
    /// reactivates the client grain.
    pub(crate) async fn ensure_client_intake(&self, client_id: &str) {
        let mut installed = self.client_intakes.lock().await;
        if !installed.insert(client_id.to_string()) {
            return;
        }
        drop(installed);
        self.streams
            .subscribe(
                &StreamId::chat(client_id),
                Arc::new(ClientChatIntake {
                    core: self.weak_self.clone(),
                    client_id: client_id.to_string(),
                }),
            )
            .await;
    }

    // ── Client-grain forwarding ───────────────────────────────────────────

    pub(crate) async fn subscribe_observer(
        &self,
        client_id: &str,
        observer: Arc<dyn MessageObserver>,
    ) -> RuntimeResult<()> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.subscribe(observer).await })
            })
            .await
            .map_err(AgentRuntimeError::from)
    }

    pub(crate) async fn unsubscribe_observer(
        &self,
        client_id: &str,
        observer: Arc<dyn MessageObserver>,
    ) -> RuntimeResult<()> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.unsubscribe(&observer) })
            })
            .await
            .map_err(AgentRuntimeError::from)
    }

    pub(crate) async fn client_send_and_receive(
        &self,
        client_id: &str,
        message: AgentMessage,
    ) -> RuntimeResult<Option<AgentMessage>> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.send_and_receive(message).await })
            })
            .await
            .map_err(AgentRuntimeError::from)?
    }

    pub(crate) async fn client_send_message(
        &self,
        client_id: &str,
        message: AgentMessage,
    ) -> RuntimeResult<()> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.send_message(message).await })
            })
            .await
            .map_err(AgentRuntimeError::from)?
    }

    pub(crate) async fn client_send_event(
        &self,
        client_id: &str,
        message: AgentMessage,
        stream_name: Option<String>,
    ) -> RuntimeResult<()> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.send_event(message, stream_name.as_deref()).await })
            })
            .await
            .map_err(AgentRuntimeError::from)?
    }

    pub(crate) async fn client_create_agent(
        &self,
        client_id: &str,
        configuration: AgentConfiguration,
    ) -> RuntimeResult<AgentHealthStatus> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.create_agent(configuration).await })
            })
            .await
            .map_err(AgentRuntimeError::from)?
    }

    pub(crate) async fn client_tracked_agents(
        &self,
        client_id: &str,
    ) -> RuntimeResult<Vec<TrackedAgent>> {
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.tracked_agents() })
            })
            .await
            .map_err(AgentRuntimeError::from)
    }

    pub(crate) async fn client_is_agent_tracked(
        &self,
        client_id: &str,
        agent_handle: &str,
    ) -> RuntimeResult<bool> {
        let agent_handle = agent_handle.to_string();
        self.client_catalog()?
            .invoke(client_id, move |grain| {
                Box::pin(async move { grain.is_agent_tracked(&agent_handle) })
            })
            .await
            .map_err(AgentRuntimeError::from)
    }
}

fn encode_message(message: &AgentMessage) -> RuntimeResult<Value> {
    serde_json::to_value(message)
        .map_err(|e| AgentRuntimeError::SubstratePermanent(format!("message encoding: {}", e)))
}

fn decode_message(payload: &Value) -> Result<AgentMessage, Box<dyn std::error::Error + Send + Sync>> {
    serde_json::from_value(payload.clone()).map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
        format!("message decoding: {}", e).into()
    })
}

struct AgentChatIntake {
    core: Weak<ClusterCore>,
    handle: String,
}

#[async_trait]
impl StreamHandler for AgentChatIntake {
    async fn on_stream_message(
        &self,
        envelope: StreamEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        let message = decode_message(&envelope.payload)?;
        core.agent_catalog()?
            .invoke(&self.handle, move |grain| {
                Box::pin(async move { grain.handle_chat_stream(message).await })
            })
            .await?;
        Ok(())
    }
}

struct AgentEventIntake {
    core: Weak<ClusterCore>,
    handle: String,
}

#[async_trait]
impl StreamHandler for AgentEventIntake {
    async fn on_stream_message(
        &self,
        envelope: StreamEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        let event = decode_message(&envelope.payload)?;
        core.agent_catalog()?
            .invoke(&self.handle, move |grain| {
                Box::pin(async move { grain.handle_event_stream(event).await })
            })
            .await?;
        Ok(())
    }
}

struct ClientChatIntake {
    core: Weak<ClusterCore>,
    client_id: String,
}

#[async_trait]
impl StreamHandler for ClientChatIntake {
    async fn on_stream_message(
        &self,
        envelope: StreamEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        let message = decode_message(&envelope.payload)?;
        core.client_catalog()?
            .invoke(&self.client_id, move |grain| {
                Box::pin(async move { grain.deliver(message).await })
            })
            .await?;
        Ok(())
    }
}

/// Routes reminder ticks back into agent activations.
struct ClusterReminderHandler {
    core: Weak<ClusterCore>,
}

#[async_trait]
impl ReminderHandler for ClusterReminderHandler {
    async fn on_reminder(&self, entity_key: &str, name: &str, payload: &Value) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let message_type = payload
            .get("messageType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        core.dispatch_scheduled(entity_key, name, &message_type, message)
            .await;
    }
}

/// A running cluster: the embedding application's entry point.
pub struct AgentCluster {
    core: Arc<ClusterCore>,
}

impl AgentCluster {
    /// Build the substrate per `options`, wire the catalogs, and resume
    /// persisted reminders. Must run inside a tokio runtime.
    pub async fn start(options: ClusterOptions) -> RuntimeResult<Self> {
        let store: Arc<dyn StateStore> = match options.clustering_mode {
            ClusteringMode::Localhost => Arc::new(MemoryStateStore::new()),
            ClusteringMode::Relational | ClusteringMode::CloudTable => {
                let location = options
                    .storage_connection_string
                    .as_ref()
                    .or(options.connection_string.as_ref())
                    .ok_or_else(|| {
                        AgentRuntimeError::InvalidConfiguration(
                            "durable clustering modes need a connection string".into(),
                        )
                    })?;
                Arc::new(FileStateStore::new(location.clone()))
            }
        };

        let reminders = ReminderService::new(Arc::clone(&store));
        let streams = Arc::new(StreamBus::new(options.service_id.clone()));
        let core = Arc::new_cyclic(|weak_self| ClusterCore {
            client_options: ClientOptions::default(),
            store,
            streams,
            reminders: Arc::clone(&reminders),
            registry: Arc::new(ManagementRegistry::new()),
            behaviors: Arc::new(BehaviorRegistry::new()),
            models: Arc::new(ModelRegistry::new()),
            agents: OnceLock::new(),
            clients: OnceLock::new(),
            agent_intakes: tokio::sync::Mutex::new(std::collections::HashSet::new()),
            client_intakes: tokio::sync::Mutex::new(std::collections::HashSet::new()),
            weak_self: weak_self.clone(),
            options,
        });

        let agent_core = Arc::clone(&core);
        let _ = core.agents.set(Catalog::new(
            "agent",
            core.options.idle_deactivation,
            move |key| AgentGrain::new(key, Arc::clone(&agent_core)),
        ));
        let client_core = Arc::clone(&core);
        let _ = core.clients.set(Catalog::new(
            "client",
            core.options.idle_deactivation,
            move |key| ClientGrain::new(key, Arc::clone(&client_core)),
        ));

        reminders
            .set_handler(Arc::new(ClusterReminderHandler {
                core: Arc::downgrade(&core),
            }))
            .await;
        let resumed = reminders.resume().await?;
        if resumed > 0 {
            log::info!("resumed {} persisted reminders", resumed);
        }

        log::info!(
            "cluster '{}' ({}) started",
            core.options.cluster_id,
            core.options.service_id
        );
        Ok(Self { core })
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.core.options
    }

    /// Behavior factory table; populate before traffic arrives.
    pub fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        &self.core.behaviors
    }

    /// Chat-model directory; populate before traffic arrives.
    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.core.models
    }

    pub fn management(&self) -> &Arc<ManagementRegistry> {
        &self.core.registry
    }

    pub fn streams(&self) -> &Arc<StreamBus> {
        &self.core.streams
    }

    /// A factory for client contexts against this cluster.
    pub fn context_factory(&self) -> crate::agentfabric::client_context::ClientContextFactory {
        crate::agentfabric::client_context::ClientContextFactory::new(Arc::clone(&self.core))
    }

    /// Configure an agent directly (without a client context).
    pub async fn configure_agent(
        &self,
        configuration: AgentConfiguration,
        detail: HealthDetail,
    ) -> RuntimeResult<AgentHealthStatus> {
        self.core
            .configure_agent_with_detail(configuration, detail)
            .await
    }

    /// Probe an agent's health.
    pub async fn agent_health(
        &self,
        handle: &str,
        detail: HealthDetail,
    ) -> RuntimeResult<AgentHealthStatus> {
        self.core.agent_health(handle, detail).await
    }

    /// Force-deactivate one agent (management purge path). Returns whether a
    /// live activation was collected.
    pub async fn deactivate_agent(&self, handle: &str) -> RuntimeResult<bool> {
        self.core.deactivate_agent(handle).await
    }

    /// Deactivate everything and stop reminder timers. Persisted reminders
    /// resume on the next start.
    pub async fn shutdown(&self) {
        if let Ok(catalog) = self.core.agent_catalog() {
            catalog.shutdown().await;
        }
        if let Ok(catalog) = self.core.client_catalog() {
            catalog.shutdown().await;
        }
        self.core.reminders.shutdown().await;
        log::info!("cluster '{}' stopped", self.core.options.cluster_id);
    }
}
