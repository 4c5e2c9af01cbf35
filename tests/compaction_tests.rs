use agentfabric::chat_history::ChatHistoryProvider;
use agentfabric::compaction::{CompactionConfig, CompactionService};
use agentfabric::completion::{ChatMessage, CompletionClient, Role};
use agentfabric::state::{AgentStateCell, StoredChatMessage};
use async_trait::async_trait;
use fabric::{MemoryStateStore, StateStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct MockSummarizer {
    calls: AtomicUsize,
    fail: bool,
}

impl MockSummarizer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }
}

#[async_trait]
impl CompletionClient for MockSummarizer {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<ChatMessage, Box<dyn std::error::Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("summarizer offline".into());
        }
        Ok(ChatMessage::text(Role::Assistant, "decisions, facts, open tasks"))
    }

    fn model_name(&self) -> &str {
        "mock-summarizer"
    }
}

async fn provider_with_messages(messages: Vec<StoredChatMessage>) -> ChatHistoryProvider {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let cell = Arc::new(AgentStateCell::load(store, "u1:bot").await);
    cell.replace_thread_messages("default", messages).await;
    ChatHistoryProvider::new(cell, "default")
}

fn chatty_message(role: Role, words: usize) -> StoredChatMessage {
    StoredChatMessage::from_chat(&ChatMessage::text(role, "word ".repeat(words)))
}

fn config(max_tokens: usize, keep_last_n: usize) -> CompactionConfig {
    CompactionConfig {
        enabled: true,
        keep_last_n,
        max_context_tokens: Some(max_tokens),
        threshold: 0.5,
    }
}

#[tokio::test]
async fn disabled_or_unbounded_config_is_a_no_op() {
    let provider = provider_with_messages(vec![chatty_message(Role::User, 400)]).await;

    let mut disabled = config(10, 2);
    disabled.enabled = false;
    let result = CompactionService::compact(&provider, &disabled, MockSummarizer::new()).await;
    assert!(!result.was_compacted);

    let unbounded = CompactionConfig {
        max_context_tokens: None,
        ..config(10, 2)
    };
    let result = CompactionService::compact(&provider, &unbounded, MockSummarizer::new()).await;
    assert!(!result.was_compacted);
}

#[tokio::test]
async fn under_threshold_is_a_no_op() {
    let provider = provider_with_messages(vec![
        chatty_message(Role::User, 5),
        chatty_message(Role::Assistant, 5),
        chatty_message(Role::User, 5),
    ])
    .await;
    let model = MockSummarizer::new();
    let result = CompactionService::compact(&provider, &config(100_000, 2), model.clone()).await;

    assert!(!result.was_compacted);
    assert_eq!(result.original_message_count, 3);
    assert_eq!(result.compacted_message_count, 3);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn compacts_old_prefix_into_a_summary_message() {
    let messages: Vec<StoredChatMessage> = (0..8)
        .map(|i| {
            chatty_message(
                if i % 2 == 0 { Role::User } else { Role::Assistant },
                200,
            )
        })
        .collect();
    let suffix_texts: Vec<String> = messages[6..]
        .iter()
        .map(|m| m.contents_json.clone())
        .collect();
    let provider = provider_with_messages(messages).await;

    let result =
        CompactionService::compact(&provider, &config(100, 2), MockSummarizer::new()).await;

    assert!(result.was_compacted);
    assert_eq!(result.original_message_count, 8);
    assert_eq!(result.compacted_message_count, 3);
    assert!(result.estimated_tokens_after <= result.estimated_tokens_before);

    let stored = provider.state().thread_messages("default").await;
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].role, Role::System);
    assert_eq!(stored[0].author_name.as_deref(), Some("compaction"));
    assert!(stored[0]
        .to_chat()
        .display_text()
        .starts_with("[Compacted History]"));
    // The kept suffix is the original tail, verbatim.
    assert_eq!(stored[1].contents_json, suffix_texts[0]);
    assert_eq!(stored[2].contents_json, suffix_texts[1]);
}

#[tokio::test]
async fn forced_floor_keeps_half_but_at_least_two() {
    // Four heavy messages with keep_last_n well above the total: the floor
    // forces keep = max(2, 4/2) = 2, so the new list is summary + 2.
    let messages: Vec<StoredChatMessage> =
        (0..4).map(|_| chatty_message(Role::User, 300)).collect();
    let provider = provider_with_messages(messages).await;

    let result =
        CompactionService::compact(&provider, &config(100, 10), MockSummarizer::new()).await;

    assert!(result.was_compacted);
    assert_eq!(result.original_message_count, 4);
    assert_eq!(result.compacted_message_count, 3);
}

#[tokio::test]
async fn two_message_thread_is_never_compacted() {
    let messages = vec![
        chatty_message(Role::User, 500),
        chatty_message(Role::Assistant, 500),
    ];
    let provider = provider_with_messages(messages).await;
    let model = MockSummarizer::new();

    let result = CompactionService::compact(&provider, &config(50, 10), model.clone()).await;

    assert!(!result.was_compacted);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.state().thread_messages("default").await.len(), 2);
}

#[tokio::test]
async fn split_advances_past_leading_tool_messages() {
    // Index 2 and 3 are tool results; a split at 2 would orphan them from
    // their assistant call, so the split advances to 4.
    let messages = vec![
        chatty_message(Role::User, 200),
        chatty_message(Role::Assistant, 200),
        chatty_message(Role::Tool, 200),
        chatty_message(Role::Tool, 200),
        chatty_message(Role::Assistant, 200),
        chatty_message(Role::User, 200),
    ];
    let provider = provider_with_messages(messages).await;

    // keep_last_n = 4 puts the naive split right at the tool prefix.
    let result =
        CompactionService::compact(&provider, &config(100, 4), MockSummarizer::new()).await;

    assert!(result.was_compacted);
    let stored = provider.state().thread_messages("default").await;
    // summary + the two messages after the tool run.
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[1].role, Role::Assistant);
    assert_eq!(stored[2].role, Role::User);
}

#[tokio::test]
async fn summarizer_failure_degrades_to_a_no_op() {
    let messages: Vec<StoredChatMessage> =
        (0..6).map(|_| chatty_message(Role::User, 300)).collect();
    let provider = provider_with_messages(messages).await;

    let result =
        CompactionService::compact(&provider, &config(100, 2), MockSummarizer::failing()).await;

    assert!(!result.was_compacted);
    assert_eq!(provider.state().thread_messages("default").await.len(), 6);
}

#[test]
fn config_parses_from_agent_args() {
    let args = HashMap::from([
        ("CompactionEnabled".to_string(), "false".to_string()),
        ("CompactionKeepLastN".to_string(), "7".to_string()),
        ("CompactionMaxContextTokens".to_string(), "32000".to_string()),
        ("CompactionThreshold".to_string(), "0.65".to_string()),
    ]);
    let config = CompactionConfig::from_args(&args);
    assert!(!config.enabled);
    assert_eq!(config.keep_last_n, 7);
    assert_eq!(config.max_context_tokens, Some(32_000));
    assert!((config.threshold - 0.65).abs() < f64::EPSILON);

    let defaults = CompactionConfig::from_args(&HashMap::new());
    assert_eq!(defaults, CompactionConfig::default());
}
