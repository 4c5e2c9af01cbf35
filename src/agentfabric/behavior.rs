//! User-code hosting: the behavior trait, its registry, and the host handle.
//!
//! Agent logic is supplied by the embedding application as [`AgentBehavior`]
//! implementations and registered under a type alias in the
//! [`BehaviorRegistry`]. When an agent entity activates with a configuration,
//! the registry's factory builds the behavior (the *proxy*) and hands it an
//! [`AgentHost`], its capability surface back into the runtime: messaging,
//! timers and reminders, custom state, chat-history providers, and chat
//! models.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentfabric::behavior::{AgentBehavior, AgentHost, BehaviorRegistry};
//! use agentfabric::message::AgentMessage;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct EchoBehavior;
//!
//! #[async_trait]
//! impl AgentBehavior for EchoBehavior {
//!     async fn on_message(
//!         &mut self,
//!         message: AgentMessage,
//!     ) -> Result<Option<AgentMessage>, Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(Some(message.respond(format!("echo:{}", message.message))))
//!     }
//! }
//!
//! # async fn example(registry: &BehaviorRegistry) {
//! registry
//!     .register("echo", Arc::new(|_cfg, _host: AgentHost| Box::new(EchoBehavior)))
//!     .await;
//! # }
//! ```

use crate::agentfabric::chat_history::ChatHistoryProvider;
use crate::agentfabric::cluster::ClusterCore;
use crate::agentfabric::completion::CompletionClient;
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::handle;
use crate::agentfabric::health::ProxyHealth;
use crate::agentfabric::message::{AgentConfiguration, AgentMessage};
use crate::agentfabric::state::AgentStateCell;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Result alias for user-supplied behavior code.
pub type BehaviorResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// User-supplied agent logic hosted behind a handle.
///
/// Every hook runs under the agent's per-activation serializer: at most one
/// of `on_initialize`/`on_message`/`on_event` executes at a time for one
/// handle.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Called once after construction, before the first dispatch.
    async fn on_initialize(&mut self) -> BehaviorResult<()> {
        Ok(())
    }

    /// Handle a message. Returning `Some(response)` answers request-response
    /// callers; for stream-delivered requests the host routes the response
    /// back over the sender's chat stream.
    async fn on_message(&mut self, message: AgentMessage) -> BehaviorResult<Option<AgentMessage>>;

    /// Handle a fire-and-forget event.
    async fn on_event(&mut self, _event: AgentMessage) -> BehaviorResult<()> {
        Ok(())
    }

    /// Called on deactivation, after state flushes.
    async fn dispose(&mut self) {}

    /// The behavior's own health report, embedded at `Full` detail.
    fn health(&self) -> ProxyHealth {
        ProxyHealth::default()
    }
}

/// Factory building a behavior from its configuration and host surface.
pub type BehaviorFactory =
    Arc<dyn Fn(AgentConfiguration, AgentHost) -> Box<dyn AgentBehavior> + Send + Sync>;

/// Alias-keyed behavior factory table, populated at startup by the embedding
/// application.
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: RwLock<HashMap<String, BehaviorFactory>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, alias: impl Into<String>, factory: BehaviorFactory) {
        self.factories.write().await.insert(alias.into(), factory);
    }

    pub async fn contains(&self, alias: &str) -> bool {
        self.factories.read().await.contains_key(alias)
    }

    /// Instantiate the behavior for `configuration.agent_type`.
    pub async fn create(
        &self,
        configuration: &AgentConfiguration,
        host: AgentHost,
    ) -> RuntimeResult<Box<dyn AgentBehavior>> {
        if configuration.agent_type.is_empty() {
            return Err(AgentRuntimeError::InvalidConfiguration(
                "configuration has no agent type".into(),
            ));
        }
        let factories = self.factories.read().await;
        let factory = factories.get(&configuration.agent_type).ok_or_else(|| {
            AgentRuntimeError::InvalidConfiguration(format!(
                "no behavior registered for agent type '{}'",
                configuration.agent_type
            ))
        })?;
        Ok(factory(configuration.clone(), host))
    }
}

struct HostInner {
    handle: String,
    core: Arc<ClusterCore>,
    state: Arc<AgentStateCell>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    histories: Mutex<HashMap<String, Arc<ChatHistoryProvider>>>,
}

/// An agent's capability surface back into the runtime. Cheap to clone;
/// behaviors keep a clone and use it from their hooks.
#[derive(Clone)]
pub struct AgentHost {
    inner: Arc<HostInner>,
}

impl AgentHost {
    pub(crate) fn new(
        handle: impl Into<String>,
        core: Arc<ClusterCore>,
        state: Arc<AgentStateCell>,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                handle: handle.into(),
                core,
                state,
                timers: Mutex::new(HashMap::new()),
                histories: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// This agent's qualified handle.
    pub fn handle(&self) -> &str {
        &self.inner.handle
    }

    /// This agent's persistent document.
    pub fn state(&self) -> &Arc<AgentStateCell> {
        &self.inner.state
    }

    pub async fn configuration(&self) -> Option<AgentConfiguration> {
        self.inner.state.configuration().await
    }

    // ── Messaging ─────────────────────────────────────────────────────────

    /// Direct request-response RPC to another agent. `from_handle` defaults
    /// to this agent; `to_handle` is normalized with this agent's owner
    /// prefix.
    pub async fn send_and_receive(&self, message: AgentMessage) -> RuntimeResult<Option<AgentMessage>> {
        let message = self.normalize_outbound(message)?;
        let target = message.to_handle.clone();
        self.inner.core.invoke_agent_message(&target, message).await
    }

    /// Fire-and-forget publish on the target's chat stream.
    pub async fn send_message(&self, message: AgentMessage) -> RuntimeResult<()> {
        let message = self.normalize_outbound(message)?;
        let target = message.to_handle.clone();
        self.inner.core.publish_chat(&target, message).await
    }

    /// Publish on an event stream: the explicit `stream_name` when given
    /// (no handle normalization), else the target's own event stream.
    pub async fn send_event(
        &self,
        message: AgentMessage,
        stream_name: Option<&str>,
    ) -> RuntimeResult<()> {
        match stream_name {
            Some(stream) => {
                let mut message = message;
                if message.from_handle.is_empty() {
                    message.from_handle = self.inner.handle.clone();
                }
                self.inner.core.publish_event(stream, message).await
            }
            None => {
                let message = self.normalize_outbound(message)?;
                let target = message.to_handle.clone();
                self.inner.core.publish_event(&target, message).await
            }
        }
    }

    // ── Scheduler ─────────────────────────────────────────────────────────

    /// Install a per-activation timer. An existing timer with the same name
    /// is disposed first. On each tick a synthetic self-message is
    /// dispatched to the behavior's `on_message`. Not durable: the timer
    /// dies with the activation. A zero `period` fires once.
    pub async fn register_timer(
        &self,
        name: &str,
        message_type: &str,
        message: Option<String>,
        due: Duration,
        period: Duration,
    ) {
        let core = Arc::clone(&self.inner.core);
        let handle = self.inner.handle.clone();
        let timer_name = name.to_string();
        let message_type = message_type.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(due).await;
            loop {
                core.dispatch_timer(&handle, &timer_name, &message_type, message.clone())
                    .await;
                if period.is_zero() {
                    return;
                }
                tokio::time::sleep(period).await;
            }
        });

        let mut timers = self.inner.timers.lock().await;
        if let Some(existing) = timers.insert(name.to_string(), task) {
            existing.abort();
        }
    }

    /// Dispose the named timer. Unknown names are a no-op.
    pub async fn unregister_timer(&self, name: &str) {
        let mut timers = self.inner.timers.lock().await;
        if let Some(task) = timers.remove(name) {
            task.abort();
        }
    }

    /// Live timer count (finished one-shot timers are swept).
    pub async fn timer_count(&self) -> usize {
        let mut timers = self.inner.timers.lock().await;
        timers.retain(|_, task| !task.is_finished());
        timers.len()
    }

    pub(crate) async fn abort_timers(&self) {
        let mut timers = self.inner.timers.lock().await;
        for (_, task) in timers.drain() {
            task.abort();
        }
    }

    /// Install a durable reminder. Survives deactivation; a tick reactivates
    /// the agent and dispatches the same synthetic self-message shape timers
    /// use. A zero `period` fires once.
    pub async fn register_reminder(
        &self,
        name: &str,
        message_type: &str,
        message: Option<String>,
        due: Duration,
        period: Duration,
    ) -> RuntimeResult<()> {
        let payload = serde_json::json!({
            "messageType": message_type,
            "message": message,
        });
        self.inner
            .core
            .reminders()
            .register_or_update(&self.inner.handle, name, payload, due, period)
            .await
            .map_err(AgentRuntimeError::from)
    }

    /// Remove a durable reminder. Unknown names are a no-op.
    pub async fn unregister_reminder(&self, name: &str) -> RuntimeResult<()> {
        self.inner
            .core
            .reminders()
            .unregister(&self.inner.handle, name)
            .await
            .map_err(AgentRuntimeError::from)
    }

    pub async fn reminder_count(&self) -> usize {
        self.inner.core.reminders().count(&self.inner.handle).await
    }

    // ── State ─────────────────────────────────────────────────────────────

    /// Stage a custom-state merge: `deletes` are applied before `changes`
    /// under a single persistent write at the next flush.
    pub async fn stage_custom_state(&self, changes: HashMap<String, Value>, deletes: Vec<String>) {
        self.inner.state.stage_custom_state(changes, deletes).await;
    }

    /// Apply staged custom-state updates now.
    pub async fn flush_custom_state(&self) -> RuntimeResult<bool> {
        self.inner.state.flush_custom_state().await
    }

    pub async fn custom_state(&self) -> HashMap<String, Value> {
        self.inner.state.custom_state().await
    }

    // ── Chat history ──────────────────────────────────────────────────────

    /// The chat-history provider for `thread_id`, created on first use.
    pub async fn chat_history(&self, thread_id: &str) -> Arc<ChatHistoryProvider> {
        let mut histories = self.inner.histories.lock().await;
        if let Some(provider) = histories.get(thread_id) {
            return Arc::clone(provider);
        }
        let provider = Arc::new(ChatHistoryProvider::new(
            Arc::clone(&self.inner.state),
            thread_id,
        ));
        histories.insert(thread_id.to_string(), Arc::clone(&provider));
        provider
    }

    /// Flush every tracked chat-history provider. Attempts all providers and
    /// returns the first error afterwards.
    pub async fn flush_histories(&self) -> RuntimeResult<()> {
        let providers: Vec<Arc<ChatHistoryProvider>> = {
            let histories = self.inner.histories.lock().await;
            histories.values().cloned().collect()
        };
        let mut first_error = None;
        for provider in providers {
            if let Err(err) = provider.flush().await {
                log::warn!(
                    "history flush for '{}' thread '{}' failed: {}",
                    self.inner.handle,
                    provider.thread_id(),
                    err
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ── Models ────────────────────────────────────────────────────────────

    /// Resolve a chat model: the configuration's preference list first, then
    /// the cluster default.
    pub async fn model(&self) -> RuntimeResult<Arc<dyn CompletionClient>> {
        let preferred = self
            .configuration()
            .await
            .map(|cfg| cfg.models)
            .unwrap_or_default();
        self.inner
            .core
            .models()
            .resolve(&preferred)
            .await
            .ok_or_else(|| {
                AgentRuntimeError::Completion(format!(
                    "no chat model available for '{}'",
                    self.inner.handle
                ))
            })
    }

    fn normalize_outbound(&self, mut message: AgentMessage) -> RuntimeResult<AgentMessage> {
        if message.from_handle.is_empty() {
            message.from_handle = self.inner.handle.clone();
        }
        handle::validate(&message.to_handle)?;
        if let Some(owner) = handle::owner_of(&self.inner.handle) {
            message.to_handle =
                handle::ensure_prefix(&message.to_handle, &handle::owner_prefix(owner));
        }
        Ok(message)
    }
}
