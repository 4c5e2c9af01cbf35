//! Provider-agnostic chat-completion primitives.
//!
//! The runtime never talks HTTP to a model vendor; it consumes the
//! [`CompletionClient`] trait and leaves the wiring to the embedding
//! application. A [`ModelRegistry`] maps model aliases (the names carried in
//! `AgentConfiguration::models` and the compaction settings) to client
//! instances at cluster startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Chat roles as stored and sent to models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One element of a message's contents array. Kept as an enum so providers
/// can extend contents beyond plain text without changing the storage shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
}

/// An in-memory chat message: role, optional author, contents array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub author_name: Option<String>,
    pub contents: Vec<MessageContent>,
}

impl ChatMessage {
    /// A plain-text message.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            author_name: None,
            contents: vec![MessageContent::Text { text: text.into() }],
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author_name = Some(author.into());
        self
    }

    /// Concatenated text of all text contents.
    pub fn display_text(&self) -> String {
        self.contents
            .iter()
            .map(|content| match content {
                MessageContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A chat-completion backend. Implementations wrap whatever provider the
/// embedding application uses; tests use scripted mocks.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send the conversation and return the assistant's reply.
    async fn complete(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChatMessage, Box<dyn Error + Send + Sync>>;

    /// The provider-side model name, for logging.
    fn model_name(&self) -> &str;
}

/// Alias-to-client directory populated at cluster startup.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<dyn CompletionClient>>>,
    default_alias: RwLock<Option<String>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under `alias`. The first registration becomes the
    /// default model unless [`set_default`](Self::set_default) overrides it.
    pub async fn register(&self, alias: impl Into<String>, client: Arc<dyn CompletionClient>) {
        let alias = alias.into();
        let mut models = self.models.write().await;
        let mut default_alias = self.default_alias.write().await;
        if default_alias.is_none() {
            *default_alias = Some(alias.clone());
        }
        models.insert(alias, client);
    }

    pub async fn set_default(&self, alias: impl Into<String>) {
        *self.default_alias.write().await = Some(alias.into());
    }

    pub async fn get(&self, alias: &str) -> Option<Arc<dyn CompletionClient>> {
        self.models.read().await.get(alias).cloned()
    }

    /// Resolve the first available alias from `preferred`, falling back to
    /// the default model.
    pub async fn resolve(&self, preferred: &[String]) -> Option<Arc<dyn CompletionClient>> {
        let models = self.models.read().await;
        for alias in preferred {
            if let Some(client) = models.get(alias) {
                return Some(Arc::clone(client));
            }
        }
        let default_alias = self.default_alias.read().await;
        default_alias
            .as_deref()
            .and_then(|alias| models.get(alias).cloned())
    }
}
