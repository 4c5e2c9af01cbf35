//! The external client's handle into the cluster.
//!
//! A [`ClientContext`] binds one client handle: it installs itself as an
//! observer at the client entity, forwards send/receive operations, and
//! keeps the observer subscription alive with a lazy refresh: every
//! operation first re-subscribes when more than three minutes have elapsed,
//! comfortably inside the five-minute observer TTL.
//!
//! The [`ClientContextFactory`] offers two modes: [`create`] hands the
//! caller a context it owns and must dispose, while [`get_or_create`] keeps
//! one shared context per handle behind a one-shot lazy future, so two
//! concurrent requests for the same handle run a single initialization.
//! Failed initializations are evicted so the next call retries; a cached
//! context found disposed is replaced with a fresh one.
//!
//! [`create`]: ClientContextFactory::create
//! [`get_or_create`]: ClientContextFactory::get_or_create

use crate::agentfabric::cluster::ClusterCore;
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::handle;
use crate::agentfabric::health::AgentHealthStatus;
use crate::agentfabric::message::{AgentConfiguration, AgentMessage};
use crate::agentfabric::observer::MessageObserver;
use crate::agentfabric::state::TrackedAgent;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Re-subscribe when this much time has passed since the last refresh.
const OBSERVER_REFRESH_AFTER: Duration = Duration::from_secs(3 * 60);

/// TTL of the client-side tracked-agent cache used for bulk checks.
const TRACKED_CACHE_TTL: Duration = Duration::from_secs(5);

/// The object reference this context installs at the client entity. Fans
/// incoming messages out to the application's handlers, swallowing handler
/// errors so the observer itself never gets dropped for an application bug.
/// Messages arriving before any handler is attached (the client entity
/// drains its pending buffer the moment the context subscribes) are held and
/// replayed to the first handler.
struct ContextObserver {
    client_id: String,
    handlers: RwLock<Vec<Arc<dyn MessageObserver>>>,
    undelivered: Mutex<Vec<AgentMessage>>,
}

impl ContextObserver {
    async fn deliver(&self, message: AgentMessage, handlers: &[Arc<dyn MessageObserver>]) {
        for handler in handlers {
            if let Err(err) = handler.on_message_received(message.clone()).await {
                log::warn!(
                    "message handler for client '{}' failed: {}",
                    self.client_id,
                    err
                );
            }
        }
    }
}

#[async_trait]
impl MessageObserver for ContextObserver {
    async fn on_message_received(
        &self,
        message: AgentMessage,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let handlers = self.handlers.read().await.clone();
        if handlers.is_empty() {
            self.undelivered.lock().await.push(message);
            return Ok(());
        }
        self.deliver(message, &handlers).await;
        Ok(())
    }
}

/// One client's connection to the cluster.
pub struct ClientContext {
    client_id: String,
    core: Arc<ClusterCore>,
    observer: Arc<ContextObserver>,
    last_refresh: Mutex<Instant>,
    tracked_cache: Mutex<Option<(Instant, Vec<TrackedAgent>)>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("client_id", &self.client_id)
            .finish()
    }
}

impl ClientContext {
    /// Connect `client_id`: validate the handle and install the observer,
    /// retrying per the client options before giving up terminally.
    pub(crate) async fn connect(
        core: Arc<ClusterCore>,
        client_id: &str,
    ) -> RuntimeResult<Arc<Self>> {
        handle::validate(client_id)?;
        let context = Arc::new(Self {
            client_id: client_id.to_string(),
            observer: Arc::new(ContextObserver {
                client_id: client_id.to_string(),
                handlers: RwLock::new(Vec::new()),
                undelivered: Mutex::new(Vec::new()),
            }),
            last_refresh: Mutex::new(Instant::now()),
            tracked_cache: Mutex::new(None),
            disposed: AtomicBool::new(false),
            core,
        });

        let options = context.core.client_options().clone();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match context
                .core
                .subscribe_observer(&context.client_id, context.observer_ref())
                .await
            {
                Ok(()) => break,
                Err(err @ AgentRuntimeError::SubstrateTransient(_))
                    if attempt < options.connection_retry_count =>
                {
                    log::warn!(
                        "client '{}' connect attempt {}/{} failed: {}",
                        context.client_id,
                        attempt,
                        options.connection_retry_count,
                        err
                    );
                    tokio::time::sleep(options.connection_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(context)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Attach an application handler for messages delivered to this client.
    /// Messages that arrived before the first handler are replayed to it in
    /// arrival order.
    pub async fn add_message_handler(&self, handler: Arc<dyn MessageObserver>) -> RuntimeResult<()> {
        self.ensure_live()?;
        self.observer.handlers.write().await.push(Arc::clone(&handler));
        let backlog = std::mem::take(&mut *self.observer.undelivered.lock().await);
        for message in backlog {
            if let Err(err) = handler.on_message_received(message).await {
                log::warn!(
                    "message handler for client '{}' failed on replay: {}",
                    self.client_id,
                    err
                );
            }
        }
        Ok(())
    }

    pub async fn clear_message_handlers(&self) {
        self.observer.handlers.write().await.clear();
    }

    /// Re-subscribe the observer right now. Useful after attaching message
    /// handlers: the client entity drains any pending messages into the
    /// observer set on every subscribe.
    pub async fn refresh_subscription(&self) -> RuntimeResult<()> {
        self.ensure_live()?;
        self.core
            .subscribe_observer(&self.client_id, self.observer_ref())
            .await?;
        *self.last_refresh.lock().await = Instant::now();
        Ok(())
    }

    /// Request-response RPC to an agent via the client entity.
    pub async fn send_and_receive(
        &self,
        message: AgentMessage,
    ) -> RuntimeResult<Option<AgentMessage>> {
        self.ensure_live()?;
        self.maybe_refresh().await;
        self.core
            .client_send_and_receive(&self.client_id, message)
            .await
    }

    /// Fire-and-forget chat-stream send.
    pub async fn send_message(&self, message: AgentMessage) -> RuntimeResult<()> {
        self.ensure_live()?;
        self.maybe_refresh().await;
        self.core.client_send_message(&self.client_id, message).await
    }

    /// Event publish, optionally onto a named fan-out stream.
    pub async fn send_event(
        &self,
        message: AgentMessage,
        stream_name: Option<&str>,
    ) -> RuntimeResult<()> {
        self.ensure_live()?;
        self.maybe_refresh().await;
        self.core
            .client_send_event(&self.client_id, message, stream_name.map(str::to_string))
            .await
    }

    /// Create (or reuse) an agent owned by this client.
    pub async fn create_agent(
        &self,
        configuration: AgentConfiguration,
    ) -> RuntimeResult<AgentHealthStatus> {
        self.ensure_live()?;
        self.maybe_refresh().await;
        self.core
            .client_create_agent(&self.client_id, configuration)
            .await
    }

    /// The tracked-agent directory, fetched from the client entity.
    pub async fn tracked_agents(&self) -> RuntimeResult<Vec<TrackedAgent>> {
        self.ensure_live()?;
        self.maybe_refresh().await;
        self.core.client_tracked_agents(&self.client_id).await
    }

    /// Bulk-check variant of [`is_agent_tracked`](Self::is_agent_tracked)
    /// served from a five-second read-through cache. Deliberately not
    /// invalidated by [`create_agent`](Self::create_agent); UI bulk checks
    /// tolerate the staleness.
    pub async fn is_agent_tracked_cached(&self, agent_handle: &str) -> RuntimeResult<bool> {
        self.ensure_live()?;
        let qualified =
            handle::ensure_prefix(agent_handle, &handle::owner_prefix(&self.client_id));

        let mut cache = self.tracked_cache.lock().await;
        let fresh = cache
            .as_ref()
            .map(|(at, _)| at.elapsed() < TRACKED_CACHE_TTL)
            .unwrap_or(false);
        if !fresh {
            let tracked = self.core.client_tracked_agents(&self.client_id).await?;
            *cache = Some((Instant::now(), tracked));
        }
        Ok(cache
            .as_ref()
            .map(|(_, tracked)| tracked.iter().any(|agent| agent.handle == qualified))
            .unwrap_or(false))
    }

    /// Authoritative directory lookup at the client entity.
    pub async fn is_agent_tracked(&self, agent_handle: &str) -> RuntimeResult<bool> {
        self.ensure_live()?;
        self.maybe_refresh().await;
        self.core
            .client_is_agent_tracked(&self.client_id, agent_handle)
            .await
    }

    /// Unsubscribe and mark disposed. Subsequent operations fail with
    /// [`AgentRuntimeError::Disposed`]. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self
            .core
            .unsubscribe_observer(&self.client_id, self.observer_ref())
            .await
        {
            log::warn!(
                "client '{}' unsubscribe on dispose failed: {}",
                self.client_id,
                err
            );
        }
        self.clear_message_handlers().await;
    }

    fn observer_ref(&self) -> Arc<dyn MessageObserver> {
        Arc::clone(&self.observer) as Arc<dyn MessageObserver>
    }

    fn ensure_live(&self) -> RuntimeResult<()> {
        if self.is_disposed() {
            return Err(AgentRuntimeError::Disposed(self.client_id.clone()));
        }
        Ok(())
    }

    /// Lazy observer refresh: re-subscribe when the last refresh is older
    /// than three minutes (observers live five).
    async fn maybe_refresh(&self) {
        let mut last_refresh = self.last_refresh.lock().await;
        if last_refresh.elapsed() <= OBSERVER_REFRESH_AFTER {
            return;
        }
        match self
            .core
            .subscribe_observer(&self.client_id, self.observer_ref())
            .await
        {
            Ok(()) => *last_refresh = Instant::now(),
            Err(err) => {
                log::warn!(
                    "observer refresh for client '{}' failed: {}",
                    self.client_id,
                    err
                );
            }
        }
    }
}

type SharedInit = Shared<BoxFuture<'static, Result<Arc<ClientContext>, AgentRuntimeError>>>;

/// Builds and caches client contexts.
pub struct ClientContextFactory {
    core: Arc<ClusterCore>,
    cache: Mutex<HashMap<String, SharedInit>>,
}

impl ClientContextFactory {
    pub(crate) fn new(core: Arc<ClusterCore>) -> Self {
        Self {
            core,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh context the caller owns; dispose it when done.
    pub async fn create(&self, client_id: &str) -> RuntimeResult<Arc<ClientContext>> {
        ClientContext::connect(Arc::clone(&self.core), client_id).await
    }

    /// One shared, factory-managed context per handle. Concurrent calls for
    /// the same handle share a single initialization; failed or disposed
    /// entries are evicted and rebuilt.
    pub async fn get_or_create(&self, client_id: &str) -> RuntimeResult<Arc<ClientContext>> {
        loop {
            let init = {
                let mut cache = self.cache.lock().await;
                cache
                    .entry(client_id.to_string())
                    .or_insert_with(|| {
                        let core = Arc::clone(&self.core);
                        let client_id = client_id.to_string();
                        async move { ClientContext::connect(core, &client_id).await }
                            .boxed()
                            .shared()
                    })
                    .clone()
            };

            match init.await {
                Ok(context) if context.is_disposed() => {
                    // Stale entry: replace it and build anew.
                    self.cache.lock().await.remove(client_id);
                }
                Ok(context) => return Ok(context),
                Err(err) => {
                    self.cache.lock().await.remove(client_id);
                    return Err(err);
                }
            }
        }
    }

    /// Drop the cached entry for `client_id` without touching the context.
    pub async fn evict(&self, client_id: &str) {
        self.cache.lock().await.remove(client_id);
    }
}
