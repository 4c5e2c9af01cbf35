use agentfabric::message::AgentMessage;
use agentfabric::observer::{MessageObserver, ObserverManager};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountingObserver {
    received: AtomicUsize,
    fail: AtomicBool,
}

impl CountingObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageObserver for CountingObserver {
    async fn on_message_received(
        &self,
        _message: AgentMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("observer broke".into());
        }
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn message() -> AgentMessage {
    AgentMessage::one_way("u1:bot", "u1", "hello")
}

#[tokio::test]
async fn subscribing_twice_with_one_reference_does_not_duplicate() {
    let mut manager = ObserverManager::new(Duration::from_secs(60));
    let observer = CountingObserver::new();
    manager.subscribe(observer.clone());
    manager.subscribe(observer.clone());

    assert_eq!(manager.count(), 1);
    let delivered = manager.notify(&message()).await;
    assert_eq!(delivered, 1);
    assert_eq!(observer.received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_observers_are_not_notified() {
    let mut manager = ObserverManager::new(Duration::from_millis(30));
    let observer = CountingObserver::new();
    manager.subscribe(observer.clone());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let delivered = manager.notify(&message()).await;
    assert_eq!(delivered, 0);
    assert_eq!(observer.received.load(Ordering::SeqCst), 0);
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn resubscribing_refreshes_the_ttl() {
    let mut manager = ObserverManager::new(Duration::from_millis(80));
    let observer = CountingObserver::new();
    manager.subscribe(observer.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.subscribe(observer.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 100ms after the first subscribe but only 50ms after the refresh.
    assert_eq!(manager.notify(&message()).await, 1);
}

#[tokio::test]
async fn failing_observer_is_dropped_without_breaking_fanout() {
    let mut manager = ObserverManager::new(Duration::from_secs(60));
    let healthy = CountingObserver::new();
    let broken = CountingObserver::new();
    broken.fail.store(true, Ordering::SeqCst);
    manager.subscribe(broken.clone());
    manager.subscribe(healthy.clone());

    let delivered = manager.notify(&message()).await;
    assert_eq!(delivered, 1);
    assert_eq!(healthy.received.load(Ordering::SeqCst), 1);
    // The broken observer is gone; the next fan-out reaches one observer.
    assert_eq!(manager.count(), 1);
    assert_eq!(manager.notify(&message()).await, 1);
}

#[tokio::test]
async fn unsubscribe_removes_only_the_given_reference() {
    let mut manager = ObserverManager::new(Duration::from_secs(60));
    let first = CountingObserver::new();
    let second = CountingObserver::new();
    manager.subscribe(first.clone());
    manager.subscribe(second.clone());

    let first_ref: Arc<dyn MessageObserver> = first.clone();
    manager.unsubscribe(&first_ref);
    assert_eq!(manager.count(), 1);

    manager.notify(&message()).await;
    assert_eq!(first.received.load(Ordering::SeqCst), 0);
    assert_eq!(second.received.load(Ordering::SeqCst), 1);
}
