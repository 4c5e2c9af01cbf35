use agentfabric::registry::{ManagementRegistry, RegistrationStatus};
use std::time::Duration;

#[tokio::test]
async fn register_list_and_get() {
    let registry = ManagementRegistry::new();
    registry
        .register_agent("u1:bot", "echo", Some("u1".into()))
        .await;
    registry.register_agent("u1:plan", "plan-execute", Some("u1".into())).await;
    registry.register_client("u1").await;

    let agents = registry.list_agents(None).await;
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].handle, "u1:bot");
    assert_eq!(agents[1].handle, "u1:plan");

    let agent = registry.get_agent("u1:bot").await.unwrap();
    assert_eq!(agent.agent_type, "echo");
    assert_eq!(agent.client_handle.as_deref(), Some("u1"));
    assert_eq!(agent.status, RegistrationStatus::Active);
    assert!(registry.get_agent("u1:ghost").await.is_none());
}

#[tokio::test]
async fn re_registration_refreshes_instead_of_duplicating() {
    let registry = ManagementRegistry::new();
    registry.register_agent("u1:bot", "echo", None).await;
    registry.deactivate_agent("u1:bot").await;
    registry.register_agent("u1:bot", "planner", None).await;

    let agents = registry.list_agents(None).await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_type, "planner");
    assert_eq!(agents[0].status, RegistrationStatus::Active);
}

#[tokio::test]
async fn status_filter_separates_live_from_deactivated() {
    let registry = ManagementRegistry::new();
    registry.register_agent("u1:a", "echo", None).await;
    registry.register_agent("u1:b", "echo", None).await;
    registry.deactivate_agent("u1:b").await;

    let active = registry.list_agents(Some(RegistrationStatus::Active)).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].handle, "u1:a");
    let gone = registry
        .list_agents(Some(RegistrationStatus::Deactivated))
        .await;
    assert_eq!(gone.len(), 1);
    assert_eq!(gone[0].handle, "u1:b");
}

#[tokio::test]
async fn statistics_count_both_kinds() {
    let registry = ManagementRegistry::new();
    registry.register_agent("u1:a", "echo", None).await;
    registry.register_agent("u1:b", "echo", None).await;
    registry.deactivate_agent("u1:b").await;
    registry.register_client("u1").await;

    let stats = registry.statistics().await;
    assert_eq!(stats.total_agents, 2);
    assert_eq!(stats.active_agents, 1);
    assert_eq!(stats.total_clients, 1);
    assert_eq!(stats.active_clients, 1);
    assert!(stats.oldest_registration.is_some());
    assert!(stats.newest_registration >= stats.oldest_registration);
}

#[tokio::test]
async fn purge_drops_entries_not_seen_recently() {
    let registry = ManagementRegistry::new();
    registry.register_agent("u1:old", "echo", None).await;
    registry.register_client("u1").await;

    // Everything was last seen before "now": a zero-hour cutoff removes it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let removed = registry.purge_older_than(0).await;
    assert_eq!(removed, 2);
    assert!(registry.list_agents(None).await.is_empty());
    assert!(registry.list_clients(None).await.is_empty());

    // Fresh entries survive a one-hour cutoff.
    registry.register_agent("u1:new", "echo", None).await;
    assert_eq!(registry.purge_older_than(1).await, 0);
    assert_eq!(registry.list_agents(None).await.len(), 1);
}
