//! Thread-scoped chat-history providers.
//!
//! A [`ChatHistoryProvider`] is one agent's view over one conversation
//! thread: a lazily loaded stored log plus an in-memory pending buffer of
//! messages produced since the last flush. The chat framework calls
//! [`invoking`](ChatHistoryProvider::invoking) to read a consistent snapshot
//! before a model turn and [`invoked`](ChatHistoryProvider::invoked) to
//! append the turn's traffic afterwards; the hosting agent flushes batches to
//! the persistent document at the end of each message dispatch and on
//! deactivation.
//!
//! # Forks
//!
//! A fork snapshots the current `stored ++ pending` sequence as a shared
//! read-only list (no copy per reader) and accumulates new messages in a
//! private buffer. The planner reasons on forks so its internal model calls
//! never pollute the user-facing thread; a fork can later persist either just
//! its new suffix or the whole union to a thread id of the caller's choice.

use crate::agentfabric::completion::ChatMessage;
use crate::agentfabric::error::RuntimeResult;
use crate::agentfabric::state::{AgentStateCell, StoredChatMessage};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The traffic of one model invocation, as handed to
/// [`ChatHistoryProvider::invoked`].
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Messages the caller sent this turn.
    pub request_messages: Vec<ChatMessage>,
    /// Messages injected by context providers this turn.
    pub provider_messages: Vec<ChatMessage>,
    /// Messages the model produced this turn.
    pub response_messages: Vec<ChatMessage>,
    /// Set when the invocation raised; failed turns are not recorded.
    pub failed: bool,
}

struct ProviderInner {
    loaded: bool,
    stored: Vec<ChatMessage>,
    pending: Vec<ChatMessage>,
    /// Set when the in-memory document has flushed batches that did not
    /// reach storage yet; a later flush retries the persist.
    dirty: bool,
}

/// Per-thread append log with lazy load and batched flush.
pub struct ChatHistoryProvider {
    state: Arc<AgentStateCell>,
    thread_id: String,
    inner: Mutex<ProviderInner>,
}

impl ChatHistoryProvider {
    pub fn new(state: Arc<AgentStateCell>, thread_id: impl Into<String>) -> Self {
        Self {
            state,
            thread_id: thread_id.into(),
            inner: Mutex::new(ProviderInner {
                loaded: false,
                stored: Vec::new(),
                pending: Vec::new(),
                dirty: false,
            }),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The persistent document this provider writes through to.
    pub fn state(&self) -> &Arc<AgentStateCell> {
        &self.state
    }

    /// A consistent snapshot of `stored ++ pending`, loading the stored log
    /// on first use.
    pub async fn invoking(&self) -> Vec<ChatMessage> {
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        let mut snapshot = inner.stored.clone();
        snapshot.extend(inner.pending.iter().cloned());
        snapshot
    }

    /// Record a completed invocation. Failed invocations are ignored.
    pub async fn invoked(&self, context: &InvocationContext) {
        if context.failed {
            return;
        }
        let mut inner = self.inner.lock().await;
        self.ensure_loaded(&mut inner).await;
        inner.pending.extend(context.request_messages.iter().cloned());
        inner.pending.extend(context.provider_messages.iter().cloned());
        inner.pending.extend(context.response_messages.iter().cloned());
    }

    /// Convert the pending buffer into stored messages, append them to the
    /// thread, and persist. Idempotent when there is nothing to do; returns
    /// `true` when a batch (or a previously unpersisted one) was written.
    pub async fn flush(&self) -> RuntimeResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.pending.is_empty() && !inner.dirty {
            return Ok(false);
        }

        if !inner.pending.is_empty() {
            self.ensure_loaded(&mut inner).await;
            let batch: Vec<StoredChatMessage> = inner
                .pending
                .iter()
                .map(StoredChatMessage::from_chat)
                .collect();
            self.state.add_thread_messages(&self.thread_id, batch).await;
            let pending = std::mem::take(&mut inner.pending);
            inner.stored.extend(pending);
            inner.dirty = true;
        }

        self.state.persist().await?;
        inner.dirty = false;
        Ok(true)
    }

    /// Replace the whole thread with `messages` and reset the in-memory
    /// cache from the provided list. Used by compaction.
    pub async fn replace_and_reset(&self, messages: Vec<StoredChatMessage>) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        self.state
            .replace_thread_messages(&self.thread_id, messages.clone())
            .await;
        inner.stored = messages.iter().map(StoredChatMessage::to_chat).collect();
        inner.pending.clear();
        inner.loaded = true;
        self.state.persist().await?;
        inner.dirty = false;
        Ok(())
    }

    /// Snapshot the current sequence as a read-only original and open a
    /// fork with a private append buffer.
    pub async fn fork(&self) -> ForkedChatHistoryProvider {
        let original = Arc::new(self.invoking().await);
        ForkedChatHistoryProvider {
            state: Arc::clone(&self.state),
            original,
            fresh: Mutex::new(Vec::new()),
        }
    }

    async fn ensure_loaded(&self, inner: &mut ProviderInner) {
        if inner.loaded {
            return;
        }
        inner.stored = self
            .state
            .thread_messages(&self.thread_id)
            .await
            .iter()
            .map(StoredChatMessage::to_chat)
            .collect();
        inner.loaded = true;
    }
}

/// A read-only snapshot of a thread plus a private buffer for new messages.
pub struct ForkedChatHistoryProvider {
    state: Arc<AgentStateCell>,
    original: Arc<Vec<ChatMessage>>,
    fresh: Mutex<Vec<ChatMessage>>,
}

impl ForkedChatHistoryProvider {
    /// `original ++ new` as one sequence.
    pub async fn invoking(&self) -> Vec<ChatMessage> {
        let fresh = self.fresh.lock().await;
        let mut snapshot = (*self.original).clone();
        snapshot.extend(fresh.iter().cloned());
        snapshot
    }

    /// Record a completed invocation into the private buffer only.
    pub async fn invoked(&self, context: &InvocationContext) {
        if context.failed {
            return;
        }
        let mut fresh = self.fresh.lock().await;
        fresh.extend(context.request_messages.iter().cloned());
        fresh.extend(context.provider_messages.iter().cloned());
        fresh.extend(context.response_messages.iter().cloned());
    }

    /// Messages accumulated since the fork.
    pub async fn new_messages(&self) -> Vec<ChatMessage> {
        self.fresh.lock().await.clone()
    }

    /// Append only the fork's new messages to `thread_id` and persist.
    pub async fn persist_new(&self, thread_id: &str) -> RuntimeResult<()> {
        let batch: Vec<StoredChatMessage> = {
            let fresh = self.fresh.lock().await;
            fresh.iter().map(StoredChatMessage::from_chat).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.state.add_thread_messages(thread_id, batch).await;
        self.state.persist().await
    }

    /// Write `original ++ new` as the whole content of `thread_id` and
    /// persist.
    pub async fn persist_all(&self, thread_id: &str) -> RuntimeResult<()> {
        let union: Vec<StoredChatMessage> = {
            let fresh = self.fresh.lock().await;
            self.original
                .iter()
                .chain(fresh.iter())
                .map(StoredChatMessage::from_chat)
                .collect()
        };
        self.state.replace_thread_messages(thread_id, union).await;
        self.state.persist().await
    }
}
