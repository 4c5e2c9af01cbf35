use agentfabric::behavior::{AgentBehavior, AgentHost, BehaviorResult};
use agentfabric::cluster::AgentCluster;
use agentfabric::config::{ClusterOptions, ClusteringMode};
use agentfabric::error::AgentRuntimeError;
use agentfabric::health::{HealthDetail, HealthState};
use agentfabric::message::{AgentConfiguration, AgentMessage, MessageKind, REMINDER_NAME_ARG};
use agentfabric::observer::MessageObserver;
use agentfabric::state::ClientGrainState;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fabric::{FileStateStore, StateStore, StreamId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// ── Test behaviors ────────────────────────────────────────────────────────

struct EchoBehavior;

#[async_trait]
impl AgentBehavior for EchoBehavior {
    async fn on_message(&mut self, message: AgentMessage) -> BehaviorResult<Option<AgentMessage>> {
        Ok(Some(message.respond(format!("echo:{}", message.message))))
    }
}

struct TickBehavior {
    host: AgentHost,
    ticks: Arc<AtomicUsize>,
    events: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentBehavior for TickBehavior {
    async fn on_initialize(&mut self) -> BehaviorResult<()> {
        self.host
            .register_timer(
                "tick",
                "timer-tick",
                None,
                Duration::from_millis(30),
                Duration::from_millis(30),
            )
            .await;
        Ok(())
    }

    async fn on_message(&mut self, message: AgentMessage) -> BehaviorResult<Option<AgentMessage>> {
        if message.message_type == "timer-tick"
            && message.args.get(REMINDER_NAME_ARG).map(String::as_str) == Some("tick")
        {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(None)
    }

    async fn on_event(&mut self, _event: AgentMessage) -> BehaviorResult<()> {
        self.events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct WakeBehavior {
    host: AgentHost,
    wakes: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentBehavior for WakeBehavior {
    async fn on_message(&mut self, message: AgentMessage) -> BehaviorResult<Option<AgentMessage>> {
        match message.message_type.as_str() {
            "arm" => {
                self.host
                    .register_reminder(
                        "wake",
                        "reminder-wake",
                        None,
                        Duration::from_millis(150),
                        Duration::ZERO,
                    )
                    .await?;
                Ok(Some(message.respond("armed")))
            }
            "reminder-wake" => {
                self.wakes.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

struct RecordingObserver {
    received: Mutex<Vec<AgentMessage>>,
}

impl RecordingObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    async fn messages(&self) -> Vec<AgentMessage> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl MessageObserver for RecordingObserver {
    async fn on_message_received(
        &self,
        message: AgentMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.received.lock().await.push(message);
        Ok(())
    }
}

async fn start_cluster() -> AgentCluster {
    let _ = env_logger::builder().is_test(true).try_init();
    let cluster = AgentCluster::start(ClusterOptions::default()).await.unwrap();
    cluster
        .behaviors()
        .register("echo", Arc::new(|_cfg, _host| Box::new(EchoBehavior)))
        .await;
    cluster
}

// ── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn request_response_round_trip() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();

    context
        .create_agent(AgentConfiguration::new("echo", "echo"))
        .await
        .unwrap();

    let response = context
        .send_and_receive(AgentMessage::request("u1", "echo", "x"))
        .await
        .unwrap()
        .expect("echo agent must respond");

    assert_eq!(response.from_handle, "u1:echo");
    assert_eq!(response.to_handle, "u1");
    assert_eq!(response.message, "echo:x");
    assert_eq!(response.kind, MessageKind::Response);
}

#[tokio::test]
async fn create_agent_normalizes_and_never_double_prefixes() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();

    let health = context
        .create_agent(AgentConfiguration::new("echo", "bot"))
        .await
        .unwrap();
    assert_eq!(health.handle, "u1:bot");
    assert!(health.is_configured);

    // Second create with the already-qualified handle: no double prefix,
    // and the cached health path answers without reconfiguring.
    let health = context
        .create_agent(AgentConfiguration::new("echo", "u1:bot"))
        .await
        .unwrap();
    assert_eq!(health.handle, "u1:bot");

    let tracked = context.tracked_agents().await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].handle, "u1:bot");
    assert_eq!(tracked[0].agent_type, "echo");
    assert!(context.is_agent_tracked("bot").await.unwrap());
    assert!(context.is_agent_tracked("u1:bot").await.unwrap());
    assert!(!context.is_agent_tracked("other").await.unwrap());
}

#[tokio::test]
async fn unknown_agent_type_fails_configuration() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();

    let err = context
        .create_agent(AgentConfiguration::new("no-such-type", "bot"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentRuntimeError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn unconfigured_agent_rejects_messages() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();

    let err = context
        .send_and_receive(AgentMessage::request("u1", "ghost", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentRuntimeError::NotConfigured(_)));
}

#[tokio::test]
async fn pending_messages_drain_to_the_next_observer_in_order() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();

    // Activate the client grain, then drop the observer.
    let bootstrap = factory.create("u1").await.unwrap();
    bootstrap.dispose().await;

    // Two messages arrive while nobody observes.
    for text in ["first", "second"] {
        let message = AgentMessage::one_way("u1:a", "u1", text);
        cluster
            .streams()
            .publish(&StreamId::chat("u1"), serde_json::to_value(&message).unwrap())
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let context = factory.create("u1").await.unwrap();
    let observer = RecordingObserver::new();
    context.add_message_handler(observer.clone()).await.unwrap();
    context.refresh_subscription().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = observer.messages().await;
    assert_eq!(received.len(), 2, "buffered messages drain exactly once");
    assert_eq!(received[0].message, "first");
    assert_eq!(received[1].message, "second");

    // The queue is cleared: another refresh delivers nothing new.
    context.refresh_subscription().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observer.messages().await.len(), 2);
}

#[tokio::test]
async fn stream_request_routes_the_response_back_to_the_sender() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    let observer = RecordingObserver::new();
    context.add_message_handler(observer.clone()).await.unwrap();

    context
        .create_agent(AgentConfiguration::new("echo", "echo"))
        .await
        .unwrap();

    // Fire-and-forget request over the chat stream; the echo response must
    // come back over this client's own chat stream.
    context
        .send_message(AgentMessage::request("", "echo", "ping"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let received = observer.messages().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message, "echo:ping");
    assert_eq!(received[0].from_handle, "u1:echo");
}

#[tokio::test]
async fn stale_pending_messages_are_purged_at_rehydration() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().to_str().unwrap().to_string();

    // Seed persisted client state: one message persisted two hours ago, as
    // if a previous activation wrote it and the host then went away.
    {
        let store = FileStateStore::new(dir.path());
        let mut state = ClientGrainState::default();
        state
            .pending_messages
            .push(AgentMessage::one_way("u1:a", "u1", "ancient news"));
        state.pending_messages_persisted = Some(Utc::now() - ChronoDuration::hours(2));
        let doc = serde_json::to_value(&state).unwrap();
        store.write("client", "u1", "clientState", &doc).await.unwrap();
    }

    let options = ClusterOptions {
        clustering_mode: ClusteringMode::Relational,
        connection_string: Some(location),
        ..Default::default()
    };
    let cluster = AgentCluster::start(options).await.unwrap();
    let factory = cluster.context_factory();

    let context = factory.create("u1").await.unwrap();
    let observer = RecordingObserver::new();
    context.add_message_handler(observer.clone()).await.unwrap();
    context.refresh_subscription().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        observer.messages().await.is_empty(),
        "messages older than an hour must be discarded"
    );
}

#[tokio::test]
async fn recent_pending_messages_survive_rehydration() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().to_str().unwrap().to_string();
    {
        let store = FileStateStore::new(dir.path());
        let mut state = ClientGrainState::default();
        state
            .pending_messages
            .push(AgentMessage::one_way("u1:a", "u1", "fresh news"));
        state.pending_messages_persisted = Some(Utc::now() - ChronoDuration::minutes(10));
        let doc = serde_json::to_value(&state).unwrap();
        store.write("client", "u1", "clientState", &doc).await.unwrap();
    }

    let options = ClusterOptions {
        clustering_mode: ClusteringMode::Relational,
        connection_string: Some(location),
        ..Default::default()
    };
    let cluster = AgentCluster::start(options).await.unwrap();
    let factory = cluster.context_factory();

    let context = factory.create("u1").await.unwrap();
    let observer = RecordingObserver::new();
    context.add_message_handler(observer.clone()).await.unwrap();
    context.refresh_subscription().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = observer.messages().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message, "fresh news");
}

#[tokio::test]
async fn timers_tick_and_die_with_the_activation() {
    let cluster = start_cluster().await;
    let ticks = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(AtomicUsize::new(0));
    {
        let ticks = Arc::clone(&ticks);
        let events = Arc::clone(&events);
        cluster
            .behaviors()
            .register(
                "ticker",
                Arc::new(move |_cfg, host| {
                    Box::new(TickBehavior {
                        host,
                        ticks: Arc::clone(&ticks),
                        events: Arc::clone(&events),
                    })
                }),
            )
            .await;
    }

    let health = cluster
        .configure_agent(
            AgentConfiguration::new("ticker", "u1:ticker"),
            HealthDetail::Basic,
        )
        .await
        .unwrap();
    assert!(health.is_configured);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let ticked = ticks.load(Ordering::SeqCst);
    assert!(ticked >= 2, "expected several ticks, saw {}", ticked);

    let health = cluster
        .agent_health("u1:ticker", HealthDetail::Basic)
        .await
        .unwrap();
    assert_eq!(health.active_timer_count, Some(1));

    // Timers are per-activation: deactivating stops the ticking.
    assert!(cluster.deactivate_agent("u1:ticker").await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;
    let after_deactivation = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_deactivation);
}

#[tokio::test]
async fn reminders_survive_deactivation_and_reactivate_the_agent() {
    let cluster = start_cluster().await;
    let wakes = Arc::new(AtomicUsize::new(0));
    {
        let wakes = Arc::clone(&wakes);
        cluster
            .behaviors()
            .register(
                "waker",
                Arc::new(move |_cfg, host| {
                    Box::new(WakeBehavior {
                        host,
                        wakes: Arc::clone(&wakes),
                    })
                }),
            )
            .await;
    }

    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    context
        .create_agent(AgentConfiguration::new("waker", "waker"))
        .await
        .unwrap();
    context
        .send_and_receive(AgentMessage::request("u1", "waker", "").with_message_type("arm"))
        .await
        .unwrap();

    // Deactivate before the reminder is due; the tick must reactivate the
    // agent and reach its behavior.
    assert!(cluster.deactivate_agent("u1:waker").await.unwrap());
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(wakes.load(Ordering::SeqCst), 1);
    let health = cluster
        .agent_health("u1:waker", HealthDetail::Basic)
        .await
        .unwrap();
    assert_eq!(health.state, HealthState::Healthy);
}

#[tokio::test]
async fn events_reach_on_event_including_named_streams() {
    let cluster = start_cluster().await;
    let ticks = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(AtomicUsize::new(0));
    {
        let ticks = Arc::clone(&ticks);
        let events = Arc::clone(&events);
        cluster
            .behaviors()
            .register(
                "listener",
                Arc::new(move |_cfg, host| {
                    Box::new(TickBehavior {
                        host,
                        ticks: Arc::clone(&ticks),
                        events: Arc::clone(&events),
                    })
                }),
            )
            .await;
    }

    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    let mut configuration = AgentConfiguration::new("listener", "listener");
    configuration.streams = vec!["alerts".into()];
    context.create_agent(configuration).await.unwrap();

    // Direct event to the agent's own event stream.
    context
        .send_event(AgentMessage::one_way("", "listener", "direct"), None)
        .await
        .unwrap();
    // Fan-out event on a named stream the agent also subscribed.
    context
        .send_event(AgentMessage::one_way("", "everyone", "broadcast"), Some("alerts"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(events.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn full_health_combines_agent_and_proxy_state() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    context
        .create_agent(AgentConfiguration::new("echo", "echo"))
        .await
        .unwrap();

    let health = cluster
        .agent_health("u1:echo", HealthDetail::Full)
        .await
        .unwrap();
    assert!(health.is_configured);
    assert_eq!(health.state, HealthState::Healthy);
    assert!(health.proxy_health.is_some());
    assert!(health.configuration.is_some());
    assert_eq!(health.agent_type.as_deref(), Some("echo"));

    let unconfigured = cluster
        .agent_health("u1:nobody", HealthDetail::Full)
        .await
        .unwrap();
    assert_eq!(unconfigured.state, HealthState::NotConfigured);
    assert!(!unconfigured.is_configured);
}

#[tokio::test]
async fn management_registry_tracks_lifecycles() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    context
        .create_agent(AgentConfiguration::new("echo", "echo"))
        .await
        .unwrap();

    let agent = cluster.management().get_agent("u1:echo").await.unwrap();
    assert_eq!(agent.agent_type, "echo");
    assert_eq!(agent.client_handle.as_deref(), Some("u1"));

    let stats = cluster.management().statistics().await;
    assert_eq!(stats.active_agents, 1);
    assert_eq!(stats.active_clients, 1);

    cluster.deactivate_agent("u1:echo").await.unwrap();
    let stats = cluster.management().statistics().await;
    assert_eq!(stats.active_agents, 0);
    assert_eq!(stats.total_agents, 1);
}

#[tokio::test]
async fn chat_traffic_counts_into_health() {
    let cluster = start_cluster().await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    context
        .create_agent(AgentConfiguration::new("echo", "echo"))
        .await
        .unwrap();

    for _ in 0..3 {
        context
            .send_and_receive(AgentMessage::request("u1", "echo", "x"))
            .await
            .unwrap();
    }
    let health = cluster
        .agent_health("u1:echo", HealthDetail::Basic)
        .await
        .unwrap();
    assert_eq!(health.messages_processed, Some(3));
}

#[tokio::test]
async fn graceful_shutdown_persists_and_deactivates_everything() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().to_str().unwrap().to_string();
    let options = ClusterOptions {
        clustering_mode: ClusteringMode::Relational,
        connection_string: Some(location.clone()),
        ..Default::default()
    };
    let cluster = AgentCluster::start(options.clone()).await.unwrap();
    cluster
        .behaviors()
        .register("echo", Arc::new(|_cfg, _host| Box::new(EchoBehavior)))
        .await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    context
        .create_agent(AgentConfiguration::new("echo", "bot"))
        .await
        .unwrap();
    cluster.shutdown().await;

    // A new cluster over the same storage sees the tracked agent and the
    // persisted configuration.
    let cluster = AgentCluster::start(options).await.unwrap();
    cluster
        .behaviors()
        .register("echo", Arc::new(|_cfg, _host| Box::new(EchoBehavior)))
        .await;
    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    assert!(context.is_agent_tracked("bot").await.unwrap());

    let response = context
        .send_and_receive(AgentMessage::request("u1", "bot", "back"))
        .await
        .unwrap()
        .expect("rehydrated agent must respond");
    assert_eq!(response.message, "echo:back");
}

#[tokio::test]
async fn custom_state_flushes_on_deactivation() {
    struct StatefulBehavior {
        host: AgentHost,
    }

    #[async_trait]
    impl AgentBehavior for StatefulBehavior {
        async fn on_message(
            &mut self,
            message: AgentMessage,
        ) -> BehaviorResult<Option<AgentMessage>> {
            self.host
                .stage_custom_state(
                    HashMap::from([(
                        "lastMessage".to_string(),
                        serde_json::json!(message.message),
                    )]),
                    Vec::new(),
                )
                .await;
            Ok(Some(message.respond("noted")))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().to_str().unwrap().to_string();
    let options = ClusterOptions {
        clustering_mode: ClusteringMode::Relational,
        connection_string: Some(location),
        ..Default::default()
    };
    let cluster = AgentCluster::start(options).await.unwrap();
    cluster
        .behaviors()
        .register(
            "stateful",
            Arc::new(|_cfg, host| Box::new(StatefulBehavior { host })),
        )
        .await;

    let factory = cluster.context_factory();
    let context = factory.create("u1").await.unwrap();
    context
        .create_agent(AgentConfiguration::new("stateful", "keeper"))
        .await
        .unwrap();
    context
        .send_and_receive(AgentMessage::request("u1", "keeper", "remember me"))
        .await
        .unwrap();
    cluster.deactivate_agent("u1:keeper").await.unwrap();

    // Read the persisted document straight from storage.
    let store = FileStateStore::new(dir.path());
    let doc = store
        .read("agent", "u1:keeper", "agentMessages")
        .await
        .unwrap()
        .expect("agent document must exist");
    assert_eq!(doc["customState"]["lastMessage"], "remember me");
}
