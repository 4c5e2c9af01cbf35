use async_trait::async_trait;
use fabric::{MemoryStateStore, ReminderHandler, ReminderService, StateStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct TickLog {
    ticks: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl ReminderHandler for TickLog {
    async fn on_reminder(&self, entity_key: &str, name: &str, payload: &Value) {
        self.ticks
            .lock()
            .await
            .push((entity_key.to_string(), name.to_string(), payload.clone()));
    }
}

fn tick_log() -> Arc<TickLog> {
    Arc::new(TickLog {
        ticks: Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn one_shot_reminder_fires_once_and_unregisters() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let service = ReminderService::new(Arc::clone(&store));
    let log = tick_log();
    service.set_handler(log.clone()).await;

    service
        .register_or_update(
            "u1:plan",
            "retry-wi-001",
            json!({ "messageType": "retry" }),
            Duration::from_millis(20),
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(service.count("u1:plan").await, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let ticks = log.ticks.lock().await;
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].0, "u1:plan");
    assert_eq!(ticks[0].1, "retry-wi-001");
    drop(ticks);

    assert_eq!(service.count("u1:plan").await, 0);
    // The persisted table is gone too.
    assert!(store.list_keys("reminders").await.unwrap().is_empty());
}

#[tokio::test]
async fn periodic_reminder_keeps_firing_until_unregistered() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let service = ReminderService::new(store);
    let log = tick_log();
    service.set_handler(log.clone()).await;

    service
        .register_or_update(
            "u1:bot",
            "heartbeat",
            json!({}),
            Duration::from_millis(10),
            Duration::from_millis(25),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    service.unregister("u1:bot", "heartbeat").await.unwrap();
    let fired = log.ticks.lock().await.len();
    assert!(fired >= 2, "expected several ticks, saw {}", fired);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(log.ticks.lock().await.len(), fired);
    assert_eq!(service.count("u1:bot").await, 0);
}

#[tokio::test]
async fn register_same_name_replaces_previous_schedule() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let service = ReminderService::new(store);
    let log = tick_log();
    service.set_handler(log.clone()).await;

    service
        .register_or_update(
            "u1:bot",
            "poll",
            json!({ "generation": 1 }),
            Duration::from_millis(10),
            Duration::ZERO,
        )
        .await
        .unwrap();
    // Replace before the first tick; only the second payload may fire.
    service
        .register_or_update(
            "u1:bot",
            "poll",
            json!({ "generation": 2 }),
            Duration::from_millis(30),
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(service.count("u1:bot").await, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let ticks = log.ticks.lock().await;
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].2["generation"], 2);
}

#[tokio::test]
async fn unregister_unknown_name_is_a_no_op() {
    let service = ReminderService::new(Arc::new(MemoryStateStore::new()));
    service.unregister("u1:bot", "never-registered").await.unwrap();
}

#[tokio::test]
async fn resume_re_arms_persisted_reminders() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    {
        let service = ReminderService::new(Arc::clone(&store));
        service
            .register_or_update(
                "u1:plan",
                "retry-wi-002",
                json!({ "messageType": "retry" }),
                Duration::from_millis(20),
                Duration::ZERO,
            )
            .await
            .unwrap();
        // Simulate a host crash: timers die, the table stays persisted.
        service.shutdown().await;
    }

    let service = ReminderService::new(store);
    let log = tick_log();
    service.set_handler(log.clone()).await;
    let resumed = service.resume().await.unwrap();
    assert_eq!(resumed, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let ticks = log.ticks.lock().await;
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].1, "retry-wi-002");
}
