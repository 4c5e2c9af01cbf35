//! Persistent entity state: the durable documents behind agents and clients.
//!
//! Both grain kinds persist whole-document snapshots through the substrate
//! [`StateStore`](fabric::StateStore): the agent slot `agentMessages` holds
//! configuration, per-thread message logs, and custom key/value state; the
//! client slot `clientState` holds the tracked-agent directory and the
//! pending-message buffer. The single-activation invariant makes each
//! document single-writer, so writes are total replacements with no
//! dirty-tracking.
//!
//! Custom-state updates use merge semantics: behaviors stage
//! `(changes, deletes)` pairs, and a flush applies delete-then-set under one
//! persistent write.

use crate::agentfabric::completion::{ChatMessage, MessageContent, Role};
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::message::{AgentConfiguration, AgentMessage};
use chrono::{DateTime, Utc};
use fabric::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Storage kind for agent entities.
pub const AGENT_STATE_KIND: &str = "agent";
/// Storage kind for client entities.
pub const CLIENT_STATE_KIND: &str = "client";
/// Slot holding the agent document.
pub const AGENT_STATE_SLOT: &str = "agentMessages";
/// Slot holding the client document.
pub const CLIENT_STATE_SLOT: &str = "clientState";

/// A chat message at rest. Contents are kept as their serialized JSON array
/// so storage stays opaque to future content kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChatMessage {
    pub role: Role,
    pub author_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub contents_json: String,
}

impl StoredChatMessage {
    /// Freeze a live [`ChatMessage`] with the current timestamp.
    pub fn from_chat(message: &ChatMessage) -> Self {
        let contents_json = serde_json::to_string(&message.contents)
            .unwrap_or_else(|_| "[]".to_string());
        Self {
            role: message.role,
            author_name: message.author_name.clone(),
            timestamp: Utc::now(),
            contents_json,
        }
    }

    /// Thaw back into a live [`ChatMessage`]. Unreadable contents degrade to
    /// a single text element carrying the raw JSON rather than dropping the
    /// message.
    pub fn to_chat(&self) -> ChatMessage {
        let contents: Vec<MessageContent> = serde_json::from_str(&self.contents_json)
            .unwrap_or_else(|_| {
                vec![MessageContent::Text {
                    text: self.contents_json.clone(),
                }]
            });
        ChatMessage {
            role: self.role,
            author_name: self.author_name.clone(),
            contents,
        }
    }

    /// The token-estimator weight of this message: role + author + contents
    /// lengths, four characters per token.
    pub fn estimated_tokens(&self) -> usize {
        let chars = self.role.as_str().len()
            + self.author_name.as_deref().map(str::len).unwrap_or(0)
            + self.contents_json.len();
        chars / 4
    }
}

/// One entry in a client's tracked-agent directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedAgent {
    pub handle: String,
    pub agent_type: String,
}

/// Persistent document of a client entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientGrainState {
    pub tracked_agents: HashMap<String, TrackedAgent>,
    pub pending_messages: Vec<AgentMessage>,
    /// When the pending buffer was last persisted; drives the stale purge at
    /// rehydration.
    pub pending_messages_persisted: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

impl Default for ClientGrainState {
    fn default() -> Self {
        Self {
            tracked_agents: HashMap::new(),
            pending_messages: Vec::new(),
            pending_messages_persisted: None,
            last_modified: Utc::now(),
        }
    }
}

impl ClientGrainState {
    /// Read the persisted document for `client_id`, falling back to an empty
    /// default when none exists or the read fails.
    pub async fn load(store: &dyn StateStore, client_id: &str) -> Self {
        match store.read(CLIENT_STATE_KIND, client_id, CLIENT_STATE_SLOT).await {
            Ok(Some(doc)) => serde_json::from_value(doc).unwrap_or_else(|err| {
                log::error!("client state for '{}' is unreadable: {}", client_id, err);
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(err) => {
                log::error!("client state read for '{}' failed: {}", client_id, err);
                Self::default()
            }
        }
    }

    /// Persist this document for `client_id`.
    pub async fn persist(&self, store: &dyn StateStore, client_id: &str) -> RuntimeResult<()> {
        let doc = serde_json::to_value(self)
            .map_err(|e| AgentRuntimeError::Persistence(format!("client state: {}", e)))?;
        store
            .write(CLIENT_STATE_KIND, client_id, CLIENT_STATE_SLOT, &doc)
            .await
            .map_err(AgentRuntimeError::from)
    }
}

/// Persistent document of an agent entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentGrainState {
    pub configuration: Option<AgentConfiguration>,
    pub message_threads: HashMap<String, Vec<StoredChatMessage>>,
    pub custom_state: HashMap<String, Value>,
    pub last_modified: DateTime<Utc>,
}

impl Default for AgentGrainState {
    fn default() -> Self {
        Self {
            configuration: None,
            message_threads: HashMap::new(),
            custom_state: HashMap::new(),
            last_modified: Utc::now(),
        }
    }
}

/// Staged custom-state merge: deletes are applied before changes.
#[derive(Default)]
struct StagedCustomState {
    changes: HashMap<String, Value>,
    deletes: Vec<String>,
}

impl StagedCustomState {
    fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.deletes.is_empty()
    }
}

/// Shared handle to one agent's persistent document.
///
/// The cell is owned by the agent activation and shared with its chat-history
/// providers; the single-activation invariant keeps it single-writer. All
/// mutators update `last_modified`; none persist implicitly; callers batch
/// work and call [`persist`](AgentStateCell::persist) at the write points
/// (configuration change, history flush, deactivation).
pub struct AgentStateCell {
    store: Arc<dyn StateStore>,
    handle: String,
    state: RwLock<AgentGrainState>,
    staged: Mutex<StagedCustomState>,
}

impl AgentStateCell {
    /// Rehydrate the document for `handle`, falling back to an empty default
    /// when none exists or the read fails.
    pub async fn load(store: Arc<dyn StateStore>, handle: &str) -> Self {
        let state = match store.read(AGENT_STATE_KIND, handle, AGENT_STATE_SLOT).await {
            Ok(Some(doc)) => serde_json::from_value(doc).unwrap_or_else(|err| {
                log::error!("agent state for '{}' is unreadable: {}", handle, err);
                AgentGrainState::default()
            }),
            Ok(None) => AgentGrainState::default(),
            Err(err) => {
                log::error!("agent state read for '{}' failed: {}", handle, err);
                AgentGrainState::default()
            }
        };
        Self {
            store,
            handle: handle.to_string(),
            state: RwLock::new(state),
            staged: Mutex::new(StagedCustomState::default()),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub async fn configuration(&self) -> Option<AgentConfiguration> {
        self.state.read().await.configuration.clone()
    }

    pub async fn set_configuration(&self, configuration: Option<AgentConfiguration>) {
        let mut state = self.state.write().await;
        state.configuration = configuration;
        state.last_modified = Utc::now();
    }

    /// Stored messages of `thread_id` (empty when the thread is unknown).
    pub async fn thread_messages(&self, thread_id: &str) -> Vec<StoredChatMessage> {
        self.state
            .read()
            .await
            .message_threads
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn thread_ids(&self) -> Vec<String> {
        self.state.read().await.message_threads.keys().cloned().collect()
    }

    /// Append `batch` to `thread_id`.
    pub async fn add_thread_messages(&self, thread_id: &str, batch: Vec<StoredChatMessage>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        state
            .message_threads
            .entry(thread_id.to_string())
            .or_default()
            .extend(batch);
        state.last_modified = Utc::now();
    }

    /// Replace the whole log of `thread_id`. Used by compaction and fork
    /// persistence.
    pub async fn replace_thread_messages(&self, thread_id: &str, messages: Vec<StoredChatMessage>) {
        let mut state = self.state.write().await;
        state.message_threads.insert(thread_id.to_string(), messages);
        state.last_modified = Utc::now();
    }

    /// Current custom-state snapshot (staged updates not yet applied).
    pub async fn custom_state(&self) -> HashMap<String, Value> {
        self.state.read().await.custom_state.clone()
    }

    /// Stage a `(changes, deletes)` merge for the next flush.
    pub async fn stage_custom_state(&self, changes: HashMap<String, Value>, deletes: Vec<String>) {
        let mut staged = self.staged.lock().await;
        staged.deletes.extend(deletes);
        staged.changes.extend(changes);
    }

    /// Apply staged custom-state updates (delete-then-set) and persist.
    /// Returns `true` when anything was applied. A no-op when nothing is
    /// staged.
    pub async fn flush_custom_state(&self) -> RuntimeResult<bool> {
        let staged = {
            let mut staged = self.staged.lock().await;
            if staged.is_empty() {
                return Ok(false);
            }
            std::mem::take(&mut *staged)
        };

        {
            let mut state = self.state.write().await;
            for key in &staged.deletes {
                state.custom_state.remove(key);
            }
            for (key, value) in staged.changes {
                state.custom_state.insert(key, value);
            }
            state.last_modified = Utc::now();
        }
        self.persist().await?;
        Ok(true)
    }

    /// Write the whole document. Failures are logged here and surfaced to
    /// the caller, which decides whether to abort; the in-memory state keeps
    /// the change either way.
    pub async fn persist(&self) -> RuntimeResult<()> {
        let doc = {
            let state = self.state.read().await;
            serde_json::to_value(&*state)
                .map_err(|e| AgentRuntimeError::Persistence(format!("agent state: {}", e)))?
        };
        self.store
            .write(AGENT_STATE_KIND, &self.handle, AGENT_STATE_SLOT, &doc)
            .await
            .map_err(|err| {
                log::error!("agent state write for '{}' failed: {}", self.handle, err);
                AgentRuntimeError::from(err)
            })
    }
}
