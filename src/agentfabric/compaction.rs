//! Token-estimate-driven thread compaction.
//!
//! When a thread's estimated token weight crosses a threshold, the
//! compaction service asks a chat model to summarize an old prefix of the
//! thread and replaces that prefix with a single synthetic system message.
//! The estimator is deliberately crude (role, author, and serialized
//! contents lengths at four characters per token) because it only gates the
//! decision to compact, not the model call itself.
//!
//! Compaction never fails a caller: any error along the way is logged and
//! reported as a no-op result.

use crate::agentfabric::chat_history::ChatHistoryProvider;
use crate::agentfabric::completion::{ChatMessage, CompletionClient, MessageContent, Role};
use crate::agentfabric::state::StoredChatMessage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Author name stamped on synthetic summary messages.
const COMPACTION_AUTHOR: &str = "compaction";

/// Prefix of the synthetic summary content.
const COMPACTED_HEADER: &str = "[Compacted History]";

/// Knobs for the compaction pass, usually parsed from the agent's
/// configuration args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// How many trailing messages to keep verbatim.
    pub keep_last_n: usize,
    /// The model's context budget; compaction is a no-op when unknown.
    pub max_context_tokens: Option<usize>,
    /// Fraction of the budget that triggers compaction, in `[0, 1]`.
    pub threshold: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_last_n: 10,
            max_context_tokens: None,
            threshold: 0.8,
        }
    }
}

impl CompactionConfig {
    /// Parse from configuration args. Missing keys keep their defaults;
    /// unparsable values are ignored.
    ///
    /// Recognized keys: `CompactionEnabled`, `CompactionKeepLastN`,
    /// `CompactionMaxContextTokens`, `CompactionThreshold`.
    pub fn from_args(args: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(enabled) = args.get("CompactionEnabled").and_then(|v| v.parse().ok()) {
            config.enabled = enabled;
        }
        if let Some(keep) = args.get("CompactionKeepLastN").and_then(|v| v.parse().ok()) {
            config.keep_last_n = keep;
        }
        if let Some(max) = args
            .get("CompactionMaxContextTokens")
            .and_then(|v| v.parse().ok())
        {
            config.max_context_tokens = Some(max);
        }
        if let Some(threshold) = args.get("CompactionThreshold").and_then(|v| v.parse().ok()) {
            config.threshold = threshold;
        }
        config
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactionResult {
    pub was_compacted: bool,
    pub original_message_count: usize,
    pub compacted_message_count: usize,
    pub estimated_tokens_before: usize,
    pub estimated_tokens_after: usize,
}

impl CompactionResult {
    fn no_op(count: usize, tokens: usize) -> Self {
        Self {
            was_compacted: false,
            original_message_count: count,
            compacted_message_count: count,
            estimated_tokens_before: tokens,
            estimated_tokens_after: tokens,
        }
    }
}

/// Stateless summarizer; one logical invocation per `(thread, provider)` at
/// a time, serialized by the calling agent activation.
pub struct CompactionService;

impl CompactionService {
    /// Run one compaction pass over `provider`'s thread.
    pub async fn compact(
        provider: &ChatHistoryProvider,
        config: &CompactionConfig,
        model: Arc<dyn CompletionClient>,
    ) -> CompactionResult {
        let Some(max_context_tokens) = config.max_context_tokens else {
            return CompactionResult::default();
        };
        if !config.enabled {
            return CompactionResult::default();
        }

        if let Err(err) = provider.flush().await {
            log::warn!(
                "compaction flush for thread '{}' failed: {}",
                provider.thread_id(),
                err
            );
            return CompactionResult::default();
        }

        let messages = provider.state().thread_messages(provider.thread_id()).await;
        let total = messages.len();
        let tokens_before: usize = messages.iter().map(StoredChatMessage::estimated_tokens).sum();

        let trigger = (max_context_tokens as f64 * config.threshold) as usize;
        if tokens_before <= trigger {
            return CompactionResult::no_op(total, tokens_before);
        }

        let mut keep = config.keep_last_n.min(total);
        let mut split = total - keep;
        if split == 0 && total > 2 {
            // Force progress: keep at most half, never fewer than two.
            keep = (total / 2).max(2);
            split = total - keep;
        }
        // Tool results must stay behind the assistant message that called
        // them; a suffix starting with tool messages would orphan them.
        while split < total && messages[split].role == Role::Tool {
            split += 1;
        }
        if split == 0 {
            return CompactionResult::no_op(total, tokens_before);
        }

        let summary = match Self::summarize(&messages[..split], model).await {
            Ok(summary) => summary,
            Err(err) => {
                log::warn!(
                    "compaction summary for thread '{}' failed: {}",
                    provider.thread_id(),
                    err
                );
                return CompactionResult::no_op(total, tokens_before);
            }
        };

        let contents = vec![MessageContent::Text {
            text: format!("{}\n{}", COMPACTED_HEADER, summary),
        }];
        let summary_message = StoredChatMessage {
            role: Role::System,
            author_name: Some(COMPACTION_AUTHOR.to_string()),
            timestamp: Utc::now(),
            contents_json: serde_json::to_string(&contents).unwrap_or_else(|_| "[]".to_string()),
        };

        let mut compacted = Vec::with_capacity(total - split + 1);
        compacted.push(summary_message);
        compacted.extend(messages[split..].iter().cloned());
        let compacted_count = compacted.len();
        let tokens_after: usize = compacted.iter().map(StoredChatMessage::estimated_tokens).sum();

        if let Err(err) = provider.replace_and_reset(compacted).await {
            log::error!(
                "compaction replace for thread '{}' failed: {}",
                provider.thread_id(),
                err
            );
            return CompactionResult::no_op(total, tokens_before);
        }

        log::debug!(
            "compacted thread '{}': {} -> {} messages, ~{} -> ~{} tokens",
            provider.thread_id(),
            total,
            compacted_count,
            tokens_before,
            tokens_after
        );
        CompactionResult {
            was_compacted: true,
            original_message_count: total,
            compacted_message_count: compacted_count,
            estimated_tokens_before: tokens_before,
            estimated_tokens_after: tokens_after,
        }
    }

    /// Render the prefix as plain text and ask the model for a summary that
    /// preserves decisions, facts, open tasks, and topic.
    async fn summarize(
        prefix: &[StoredChatMessage],
        model: Arc<dyn CompletionClient>,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let mut rendition = String::new();
        for message in prefix {
            let author = message
                .author_name
                .as_deref()
                .map(|name| format!(" ({})", name))
                .unwrap_or_default();
            rendition.push_str(&format!(
                "{}{}: {}\n",
                message.role.as_str(),
                author,
                message.to_chat().display_text()
            ));
        }

        let request = vec![
            ChatMessage::text(
                Role::System,
                "You compact conversation history. Summarize the transcript below, \
                 preserving decisions made, established facts, open tasks, and the \
                 current topic. Be concise but lose nothing a future turn depends on.",
            ),
            ChatMessage::text(Role::User, rendition),
        ];
        let response = model.complete(&request).await?;
        Ok(response.display_text())
    }
}
