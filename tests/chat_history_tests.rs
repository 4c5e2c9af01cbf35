use agentfabric::chat_history::{ChatHistoryProvider, InvocationContext};
use agentfabric::completion::{ChatMessage, Role};
use agentfabric::state::{AgentStateCell, StoredChatMessage};
use fabric::{MemoryStateStore, StateStore};
use std::sync::Arc;

async fn provider_with_store() -> (Arc<dyn StateStore>, ChatHistoryProvider) {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let cell = Arc::new(AgentStateCell::load(Arc::clone(&store), "u1:bot").await);
    (store, ChatHistoryProvider::new(cell, "default"))
}

fn turn(user: &str, assistant: &str) -> InvocationContext {
    InvocationContext {
        request_messages: vec![ChatMessage::text(Role::User, user)],
        response_messages: vec![ChatMessage::text(Role::Assistant, assistant)],
        ..Default::default()
    }
}

#[tokio::test]
async fn invoking_returns_stored_plus_pending() {
    let (_store, provider) = provider_with_store().await;
    assert!(provider.invoking().await.is_empty());

    provider.invoked(&turn("hi", "hello")).await;
    let snapshot = provider.invoking().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].display_text(), "hi");
    assert_eq!(snapshot[1].display_text(), "hello");
}

#[tokio::test]
async fn failed_invocations_are_not_recorded() {
    let (_store, provider) = provider_with_store().await;
    let mut context = turn("hi", "hello");
    context.failed = true;
    provider.invoked(&context).await;
    assert!(provider.invoking().await.is_empty());
}

#[tokio::test]
async fn flush_persists_batches_and_is_idempotent() {
    let (_store, provider) = provider_with_store().await;
    provider.invoked(&turn("q1", "a1")).await;

    assert!(provider.flush().await.unwrap());
    // Nothing pending: flushing again does nothing.
    assert!(!provider.flush().await.unwrap());

    let stored = provider.state().thread_messages("default").await;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[1].role, Role::Assistant);

    // The in-memory view is unchanged by the flush.
    assert_eq!(provider.invoking().await.len(), 2);
}

#[tokio::test]
async fn lazy_load_picks_up_preexisting_thread_state() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    {
        let cell = Arc::new(AgentStateCell::load(Arc::clone(&store), "u1:bot").await);
        cell.add_thread_messages(
            "default",
            vec![StoredChatMessage::from_chat(&ChatMessage::text(
                Role::User,
                "earlier turn",
            ))],
        )
        .await;
        cell.persist().await.unwrap();
    }

    let cell = Arc::new(AgentStateCell::load(store, "u1:bot").await);
    let provider = ChatHistoryProvider::new(cell, "default");
    let snapshot = provider.invoking().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].display_text(), "earlier turn");
}

#[tokio::test]
async fn replace_and_reset_swaps_the_cache() {
    let (_store, provider) = provider_with_store().await;
    provider.invoked(&turn("q1", "a1")).await;
    provider.flush().await.unwrap();
    provider.invoked(&turn("q2", "a2")).await;

    let replacement = vec![StoredChatMessage::from_chat(&ChatMessage::text(
        Role::System,
        "[Compacted History]\nsummary",
    ))];
    provider.replace_and_reset(replacement).await.unwrap();

    let snapshot = provider.invoking().await;
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].display_text().starts_with("[Compacted History]"));
    assert_eq!(provider.state().thread_messages("default").await.len(), 1);
}

#[tokio::test]
async fn fork_reads_original_plus_new_and_never_touches_the_thread() {
    let (_store, provider) = provider_with_store().await;
    provider.invoked(&turn("q1", "a1")).await;
    provider.flush().await.unwrap();
    provider.invoked(&turn("q2", "a2")).await;

    let fork = provider.fork().await;
    assert_eq!(fork.invoking().await.len(), 4);

    fork.invoked(&turn("planner probe", "planner answer")).await;
    assert_eq!(fork.invoking().await.len(), 6);
    assert_eq!(fork.new_messages().await.len(), 2);

    // The upstream provider saw none of the fork's traffic.
    assert_eq!(provider.invoking().await.len(), 4);
    assert_eq!(provider.state().thread_messages("default").await.len(), 2);
}

#[tokio::test]
async fn fork_persists_new_suffix_or_whole_union() {
    let (_store, provider) = provider_with_store().await;
    provider.invoked(&turn("q1", "a1")).await;
    provider.flush().await.unwrap();

    let fork = provider.fork().await;
    fork.invoked(&turn("scratch", "work")).await;

    fork.persist_new("fork-new").await.unwrap();
    assert_eq!(provider.state().thread_messages("fork-new").await.len(), 2);

    fork.persist_all("fork-all").await.unwrap();
    assert_eq!(provider.state().thread_messages("fork-all").await.len(), 4);

    // The original thread is untouched by either write.
    assert_eq!(provider.state().thread_messages("default").await.len(), 2);
}
