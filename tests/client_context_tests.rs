use agentfabric::cluster::AgentCluster;
use agentfabric::config::ClusterOptions;
use agentfabric::error::AgentRuntimeError;
use agentfabric::message::AgentMessage;
use futures_util::future::join_all;
use std::sync::Arc;

async fn cluster() -> AgentCluster {
    AgentCluster::start(ClusterOptions::default()).await.unwrap()
}

#[tokio::test]
async fn get_or_create_shares_one_context_per_handle() {
    let cluster = cluster().await;
    let factory = cluster.context_factory();

    let contexts = join_all((0..8).map(|_| factory.get_or_create("u1"))).await;
    let first = contexts[0].as_ref().unwrap();
    for context in &contexts {
        let context = context.as_ref().unwrap();
        assert!(Arc::ptr_eq(first, context));
    }

    // A different handle gets its own context.
    let other = factory.get_or_create("u2").await.unwrap();
    assert!(!Arc::ptr_eq(first, &other));
}

#[tokio::test]
async fn create_always_builds_a_fresh_context() {
    let cluster = cluster().await;
    let factory = cluster.context_factory();
    let first = factory.create("u1").await.unwrap();
    let second = factory.create("u1").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn disposed_context_rejects_operations() {
    let cluster = cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();

    context.dispose().await;
    assert!(context.is_disposed());

    let err = context
        .send_and_receive(AgentMessage::request("u1", "bot", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentRuntimeError::Disposed(_)));
    let err = context.tracked_agents().await.unwrap_err();
    assert!(matches!(err, AgentRuntimeError::Disposed(_)));

    // Dispose is idempotent.
    context.dispose().await;
}

#[tokio::test]
async fn disposed_cached_context_is_replaced_on_next_get() {
    let cluster = cluster().await;
    let factory = cluster.context_factory();

    let first = factory.get_or_create("u1").await.unwrap();
    first.dispose().await;

    let second = factory.get_or_create("u1").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_disposed());
}

#[tokio::test]
async fn invalid_handles_are_rejected_and_evicted() {
    let cluster = cluster().await;
    let factory = cluster.context_factory();

    let err = factory.get_or_create("").await.unwrap_err();
    assert!(matches!(err, AgentRuntimeError::InvalidHandle(_)));

    // The failed entry was evicted; a valid handle still works.
    assert!(factory.get_or_create("u1").await.is_ok());
}

#[tokio::test]
async fn tracked_cache_serves_bulk_checks_with_bounded_staleness() {
    let cluster = cluster().await;
    cluster
        .behaviors()
        .register(
            "echo",
            Arc::new(|_cfg, _host| {
                struct Echo;
                #[async_trait::async_trait]
                impl agentfabric::behavior::AgentBehavior for Echo {
                    async fn on_message(
                        &mut self,
                        message: AgentMessage,
                    ) -> Result<Option<AgentMessage>, Box<dyn std::error::Error + Send + Sync>>
                    {
                        Ok(Some(message.respond("ok")))
                    }
                }
                Box::new(Echo)
            }),
        )
        .await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();

    // Prime the cache while nothing is tracked.
    assert!(!context.is_agent_tracked_cached("bot").await.unwrap());

    context
        .create_agent(agentfabric::message::AgentConfiguration::new("echo", "bot"))
        .await
        .unwrap();

    // The cached view may still say "not tracked" (five-second staleness is
    // documented behavior); the authoritative lookup sees it immediately.
    assert!(context.is_agent_tracked("bot").await.unwrap());
}
