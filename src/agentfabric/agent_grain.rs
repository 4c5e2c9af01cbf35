//! The agent entity: single-activation hosting of user code.
//!
//! An agent grain rehydrates its persistent document on activation,
//! instantiates the configured behavior (the *proxy*) through the behavior
//! registry, subscribes to its own chat and event streams, and registers
//! with the management directory. Message dispatch runs under the per-key
//! serializer the catalog provides, so user code never sees two handlers at
//! once.
//!
//! Request-response traffic arrives as a direct invocation; stream traffic
//! arrives through the subscriptions. A stream-delivered `Request` whose
//! response is addressed back at the original sender is routed onto the
//! sender's chat stream automatically.

use crate::agentfabric::behavior::{AgentBehavior, AgentHost};
use crate::agentfabric::cluster::ClusterCore;
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::handle;
use crate::agentfabric::health::{AgentHealthStatus, HealthDetail, HealthState};
use crate::agentfabric::message::{
    AgentConfiguration, AgentMessage, MessageKind, EVENT_MESSAGE_TYPE, REMINDER_NAME_ARG,
};
use crate::agentfabric::state::AgentStateCell;
use async_trait::async_trait;
use chrono::Utc;
use fabric::{FabricError, Grain, StreamSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Flush attempts on deactivation, with linear backoff between them.
const DEACTIVATION_FLUSH_ATTEMPTS: u32 = 3;
const DEACTIVATION_FLUSH_BACKOFF: Duration = Duration::from_millis(100);

/// Single-activation hosted agent.
pub struct AgentGrain {
    handle: String,
    core: Arc<ClusterCore>,
    host: Option<AgentHost>,
    proxy: Option<Box<dyn AgentBehavior>>,
    subscriptions: Vec<StreamSubscription>,
    activated_at: Instant,
    messages_processed: u64,
}

impl AgentGrain {
    pub(crate) fn new(handle: &str, core: Arc<ClusterCore>) -> Self {
        Self {
            handle: handle.to_string(),
            core,
            host: None,
            proxy: None,
            subscriptions: Vec::new(),
            activated_at: Instant::now(),
            messages_processed: 0,
        }
    }

    fn host(&self) -> RuntimeResult<&AgentHost> {
        self.host.as_ref().ok_or_else(|| {
            AgentRuntimeError::SubstratePermanent(format!(
                "agent '{}' invoked before activation",
                self.handle
            ))
        })
    }

    /// Handle a directly delivered message (request-response RPC).
    ///
    /// Requires a configured agent. A `message_type` of `"event"` routes to
    /// the behavior's `on_event` instead and yields no response. After every
    /// dispatch all tracked chat-history providers are flushed.
    pub async fn handle_message(
        &mut self,
        message: AgentMessage,
    ) -> RuntimeResult<Option<AgentMessage>> {
        let host = self.host()?.clone();
        let Some(proxy) = self.proxy.as_mut() else {
            return Err(AgentRuntimeError::NotConfigured(self.handle.clone()));
        };

        let outcome = if message.message_type == EVENT_MESSAGE_TYPE {
            proxy.on_event(message).await.map(|()| None)
        } else {
            proxy.on_message(message).await
        };
        self.messages_processed += 1;

        if let Err(err) = host.flush_histories().await {
            log::warn!("post-dispatch history flush for '{}' failed: {}", self.handle, err);
        }

        outcome.map_err(|err| AgentRuntimeError::HandlerFault(err.to_string()))
    }

    /// Intake from this agent's chat stream. Responses to stream-delivered
    /// requests are published back on the sender's chat stream; handler
    /// faults are logged and swallowed so the stream never stalls.
    pub async fn handle_chat_stream(&mut self, message: AgentMessage) {
        let original_kind = message.kind;
        let original_sender = message.from_handle.clone();

        match self.handle_message(message).await {
            Ok(Some(response)) => {
                let responds_to_sender = original_kind == MessageKind::Request
                    && response.to_handle == original_sender;
                if !responds_to_sender {
                    return;
                }
                // The sender's handle is already fully qualified (it may be
                // a bare client handle); publish on its chat stream verbatim.
                if let Err(err) = self.core.publish_chat(&original_sender, response).await {
                    log::warn!(
                        "response routing from '{}' to '{}' failed: {}",
                        self.handle,
                        original_sender,
                        err
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::error!("chat-stream dispatch for '{}' failed: {}", self.handle, err);
            }
        }
    }

    /// Intake from this agent's event streams. No response; faults are
    /// logged and swallowed.
    pub async fn handle_event_stream(&mut self, event: AgentMessage) {
        let Some(proxy) = self.proxy.as_mut() else {
            log::warn!("event for unconfigured agent '{}' dropped", self.handle);
            return;
        };
        if let Err(err) = proxy.on_event(event).await {
            log::error!("event dispatch for '{}' failed: {}", self.handle, err);
        }
    }

    /// Dispatch a timer or reminder tick as a synthetic self-message.
    pub async fn dispatch_scheduled(
        &mut self,
        name: &str,
        message_type: &str,
        message: Option<String>,
    ) {
        let synthetic = AgentMessage {
            from_handle: self.handle.clone(),
            to_handle: self.handle.clone(),
            message: message.unwrap_or_default(),
            message_type: message_type.to_string(),
            kind: MessageKind::Response,
            channel: None,
            args: [(REMINDER_NAME_ARG.to_string(), name.to_string())]
                .into_iter()
                .collect(),
        };
        if self.proxy.is_none() {
            log::warn!(
                "scheduled callback '{}' for unconfigured agent '{}' dropped",
                name,
                self.handle
            );
            return;
        }
        if let Err(err) = self.handle_message(synthetic).await {
            log::error!(
                "scheduled callback '{}' for '{}' failed: {}",
                name,
                self.handle,
                err
            );
        }
    }

    /// Apply `configuration` to this agent.
    ///
    /// An already configured agent returns its current health unless a
    /// reconfigure is forced. Otherwise the behavior is (re)built, streams
    /// are (re)created, the configuration persists, and the agent registers
    /// with the management directory.
    pub async fn configure(
        &mut self,
        configuration: AgentConfiguration,
        detail: HealthDetail,
    ) -> RuntimeResult<AgentHealthStatus> {
        if self.proxy.is_some() && !configuration.force_reconfigure {
            return Ok(self.health(detail).await);
        }

        handle::validate(&configuration.handle)?;
        let host = self.host()?.clone();

        // Make the new configuration visible to the behavior before its
        // initialization hook runs (model resolution reads it). Restored on
        // failure.
        let previous_configuration = host.state().configuration().await;
        host.state().set_configuration(Some(configuration.clone())).await;

        let built = match self.core.behaviors().create(&configuration, host.clone()).await {
            Ok(mut proxy) => proxy
                .on_initialize()
                .await
                .map(|()| proxy)
                .map_err(|err| AgentRuntimeError::HandlerFault(format!("on_initialize: {}", err))),
            Err(err) => Err(err),
        };
        let proxy = match built {
            Ok(proxy) => proxy,
            Err(err) => {
                host.state().set_configuration(previous_configuration).await;
                return Err(err);
            }
        };

        if let Some(mut previous) = self.proxy.replace(proxy) {
            previous.dispose().await;
        }
        host.state().persist().await?;

        self.resubscribe(&configuration).await;
        self.core
            .registry()
            .register_agent(
                &self.handle,
                &configuration.agent_type,
                handle::owner_of(&self.handle).map(str::to_string),
            )
            .await;

        log::debug!(
            "agent '{}' configured as '{}'",
            self.handle,
            configuration.agent_type
        );
        Ok(self.health(detail).await)
    }

    /// Compose this agent's health snapshot. At `Full` detail the proxy's
    /// own report is embedded and the states combine worst-of.
    pub async fn health(&self, detail: HealthDetail) -> AgentHealthStatus {
        let configuration = match self.host.as_ref() {
            Some(host) => host.configuration().await,
            None => None,
        };
        let is_configured = self.proxy.is_some();

        let mut status = AgentHealthStatus {
            handle: self.handle.clone(),
            state: if is_configured {
                HealthState::Healthy
            } else {
                HealthState::NotConfigured
            },
            is_configured,
            timestamp: Utc::now(),
            agent_type: configuration.as_ref().map(|cfg| cfg.agent_type.clone()),
            uptime_seconds: Some(self.activated_at.elapsed().as_secs()),
            messages_processed: Some(self.messages_processed),
            active_timer_count: None,
            active_reminder_count: None,
            stream_count: Some(if is_configured {
                2 + self.subscriptions.len()
            } else {
                0
            }),
            active_streams: Some(if is_configured {
                let mut streams = vec![
                    format!("AgentChat/{}", self.handle),
                    format!("AgentEvent/{}", self.handle),
                ];
                streams.extend(self.subscriptions.iter().map(|s| s.stream.to_string()));
                streams
            } else {
                Vec::new()
            }),
            proxy_health: None,
            diagnostics: None,
            configuration: None,
        };

        if let Some(host) = self.host.as_ref() {
            status.active_timer_count = Some(host.timer_count().await);
            status.active_reminder_count = Some(host.reminder_count().await);
        }

        if detail == HealthDetail::Full {
            status.configuration = configuration;
            if let Some(proxy) = self.proxy.as_ref() {
                status = status.with_proxy(proxy.health());
            }
        }
        status
    }

    async fn resubscribe(&mut self, configuration: &AgentConfiguration) {
        self.core.ensure_agent_intakes(&self.handle).await;
        for subscription in self.subscriptions.drain(..) {
            self.core.streams().unsubscribe(&subscription).await;
        }
        self.subscriptions = self
            .core
            .subscribe_extra_streams(&self.handle, &configuration.streams)
            .await;
    }
}

#[async_trait]
impl Grain for AgentGrain {
    async fn on_activate(&mut self) -> Result<(), FabricError> {
        self.activated_at = Instant::now();
        let state = Arc::new(AgentStateCell::load(self.core.store().clone(), &self.handle).await);
        let host = AgentHost::new(&self.handle, Arc::clone(&self.core), Arc::clone(&state));
        self.host = Some(host.clone());

        let Some(configuration) = state.configuration().await else {
            return Ok(());
        };

        // Rehydrate the configured behavior. A failure here clears the
        // configuration and the agent continues uninitialized.
        match self.core.behaviors().create(&configuration, host.clone()).await {
            Ok(mut proxy) => match proxy.on_initialize().await {
                Ok(()) => {
                    self.proxy = Some(proxy);
                    self.resubscribe(&configuration).await;
                    self.core
                        .registry()
                        .register_agent(
                            &self.handle,
                            &configuration.agent_type,
                            handle::owner_of(&self.handle).map(str::to_string),
                        )
                        .await;
                }
                Err(err) => {
                    log::error!(
                        "agent '{}' behavior initialization failed, clearing configuration: {}",
                        self.handle,
                        err
                    );
                    state.set_configuration(None).await;
                    let _ = state.persist().await;
                }
            },
            Err(err) => {
                log::error!(
                    "agent '{}' behavior instantiation failed, clearing configuration: {}",
                    self.handle,
                    err
                );
                state.set_configuration(None).await;
                let _ = state.persist().await;
            }
        }
        Ok(())
    }

    async fn on_deactivate(&mut self) {
        if let Some(host) = self.host.clone() {
            for attempt in 1..=DEACTIVATION_FLUSH_ATTEMPTS {
                match host.flush_histories().await {
                    Ok(()) => break,
                    Err(err) => {
                        log::warn!(
                            "deactivation flush for '{}' attempt {}/{} failed: {}",
                            self.handle,
                            attempt,
                            DEACTIVATION_FLUSH_ATTEMPTS,
                            err
                        );
                        if attempt < DEACTIVATION_FLUSH_ATTEMPTS {
                            tokio::time::sleep(DEACTIVATION_FLUSH_BACKOFF * attempt).await;
                        }
                    }
                }
            }
            if let Err(err) = host.flush_custom_state().await {
                log::error!(
                    "custom-state flush for '{}' on deactivation failed: {}",
                    self.handle,
                    err
                );
            }
            host.abort_timers().await;
        }

        if let Some(mut proxy) = self.proxy.take() {
            proxy.dispose().await;
        }
        for subscription in self.subscriptions.drain(..) {
            self.core.streams().unsubscribe(&subscription).await;
        }
        self.core.registry().deactivate_agent(&self.handle).await;
    }
}
