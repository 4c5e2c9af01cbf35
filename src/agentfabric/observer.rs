//! Observer subscriptions with TTL expiry and fan-out.
//!
//! A client entity keeps a set of observer references installed by external
//! processes. Entries expire after a cluster-wide TTL unless refreshed by a
//! repeated subscribe; the client-side context re-subscribes lazily well
//! inside that window. Fan-out swallows per-observer failures so one broken
//! observer never breaks delivery to the rest; failing observers are
//! dropped from the set.

use crate::agentfabric::message::AgentMessage;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cluster-wide observer time-to-live.
pub const OBSERVER_TTL: Duration = Duration::from_secs(5 * 60);

/// Callback target installed by an external client.
#[async_trait]
pub trait MessageObserver: Send + Sync {
    async fn on_message_received(
        &self,
        message: AgentMessage,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

struct ObserverEntry {
    observer: Arc<dyn MessageObserver>,
    last_seen: Instant,
}

/// TTL'd set of observer references. Owned by a single activation, so no
/// internal locking; the per-entity serializer is the lock.
pub struct ObserverManager {
    ttl: Duration,
    entries: Vec<ObserverEntry>,
}

impl ObserverManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Vec::new(),
        }
    }

    /// Insert `observer`, or refresh its TTL when the same reference is
    /// already subscribed (no duplicate notifications).
    pub fn subscribe(&mut self, observer: Arc<dyn MessageObserver>) {
        for entry in &mut self.entries {
            if Arc::ptr_eq(&entry.observer, &observer) {
                entry.last_seen = Instant::now();
                return;
            }
        }
        self.entries.push(ObserverEntry {
            observer,
            last_seen: Instant::now(),
        });
    }

    /// Remove `observer`. Unknown references are a no-op.
    pub fn unsubscribe(&mut self, observer: &Arc<dyn MessageObserver>) {
        self.entries
            .retain(|entry| !Arc::ptr_eq(&entry.observer, observer));
    }

    /// Deliver `message` to every live observer, dropping expired entries
    /// first and failing entries afterwards. Returns the number of
    /// successful deliveries.
    pub async fn notify(&mut self, message: &AgentMessage) -> usize {
        self.sweep_expired();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            match entry.observer.on_message_received(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    log::warn!("observer callback failed, dropping observer: {}", err);
                    failed.push(index);
                }
            }
        }
        for index in failed.into_iter().rev() {
            self.entries.remove(index);
        }
        delivered
    }

    /// Live observer count after an expiry sweep.
    pub fn count(&mut self) -> usize {
        self.sweep_expired();
        self.entries.len()
    }

    fn sweep_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|entry| entry.last_seen.elapsed() < ttl);
    }
}

impl Default for ObserverManager {
    fn default() -> Self {
        Self::new(OBSERVER_TTL)
    }
}
