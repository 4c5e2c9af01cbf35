//! Publish/subscribe streams addressed by `(namespace, key)`.
//!
//! Streams carry JSON payloads with a monotonically increasing sequence token
//! per stream. Every subscriber gets its own delivery queue and a dedicated
//! delivery task: messages are handed to the subscriber's handler in sequence
//! order, one at a time. A handler error is logged and swallowed so one bad
//! subscriber never stalls the stream for the others.
//!
//! Namespaces are fixed: [`StreamNamespace::AgentChat`] for conversational
//! traffic and [`StreamNamespace::AgentEvent`] for fire-and-forget events.
//! A stream key is usually an agent or client handle, but event streams may
//! use arbitrary fan-out names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// The two stream namespaces of the messaging plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamNamespace {
    /// Conversational messages dispatched to an agent's `on_message`.
    AgentChat,
    /// Fire-and-forget events dispatched to an agent's `on_event`.
    AgentEvent,
}

impl StreamNamespace {
    /// The literal wire name of the namespace.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamNamespace::AgentChat => "AgentChat",
            StreamNamespace::AgentEvent => "AgentEvent",
        }
    }
}

impl fmt::Display for StreamNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one stream: `(namespace, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub namespace: StreamNamespace,
    pub key: String,
}

impl StreamId {
    /// The chat stream of `key`.
    pub fn chat(key: impl Into<String>) -> Self {
        Self {
            namespace: StreamNamespace::AgentChat,
            key: key.into(),
        }
    }

    /// The event stream of `key`.
    pub fn event(key: impl Into<String>) -> Self {
        Self {
            namespace: StreamNamespace::AgentEvent,
            key: key.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// One delivered stream message.
#[derive(Debug, Clone)]
pub struct StreamEnvelope {
    pub stream: StreamId,
    /// Monotonically increasing per stream, starting at 1.
    pub sequence: u64,
    pub payload: Value,
}

/// Subscriber callback. Errors are logged and swallowed by the delivery task.
#[async_trait::async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_stream_message(
        &self,
        envelope: StreamEnvelope,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Handle returned by [`StreamBus::subscribe`]; pass it back to
/// [`StreamBus::unsubscribe`] to detach.
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub stream: StreamId,
    id: Uuid,
}

struct SubscriberSlot {
    id: Uuid,
    tx: mpsc::UnboundedSender<StreamEnvelope>,
}

#[derive(Default)]
struct Topic {
    sequence: u64,
    subscribers: Vec<SubscriberSlot>,
}

/// The cluster-wide stream provider.
pub struct StreamBus {
    provider: String,
    topics: Mutex<HashMap<StreamId, Topic>>,
}

impl StreamBus {
    /// Create a bus under a single cluster-wide provider name.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// The provider name chosen at cluster startup.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Publish `payload` on `stream`, returning the assigned sequence token.
    /// Publishing to a stream with no subscribers still advances the token.
    pub async fn publish(&self, stream: &StreamId, payload: Value) -> u64 {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(stream.clone()).or_default();
        topic.sequence += 1;
        let sequence = topic.sequence;

        topic.subscribers.retain(|slot| {
            let envelope = StreamEnvelope {
                stream: stream.clone(),
                sequence,
                payload: payload.clone(),
            };
            if slot.tx.send(envelope).is_err() {
                log::warn!("stream {} dropping dead subscriber {}", stream, slot.id);
                false
            } else {
                true
            }
        });
        sequence
    }

    /// Attach `handler` to `stream`. Delivery is in-order and one message at
    /// a time per subscription.
    pub async fn subscribe(
        &self,
        stream: &StreamId,
        handler: Arc<dyn StreamHandler>,
    ) -> StreamSubscription {
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamEnvelope>();
        let id = Uuid::new_v4();
        let stream_name = stream.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let sequence = envelope.sequence;
                if let Err(err) = handler.on_stream_message(envelope).await {
                    log::warn!(
                        "stream {} handler failed at sequence {}: {}",
                        stream_name,
                        sequence,
                        err
                    );
                }
            }
        });

        let mut topics = self.topics.lock().await;
        let topic = topics.entry(stream.clone()).or_default();
        topic.subscribers.push(SubscriberSlot { id, tx });
        StreamSubscription {
            stream: stream.clone(),
            id,
        }
    }

    /// Detach a subscription. Messages already queued for the subscriber are
    /// still delivered; the delivery task drains and exits on its own.
    /// Unknown subscriptions are a no-op.
    pub async fn unsubscribe(&self, subscription: &StreamSubscription) {
        let mut topics = self.topics.lock().await;
        if let Some(topic) = topics.get_mut(&subscription.stream) {
            topic.subscribers.retain(|slot| slot.id != subscription.id);
        }
    }

    /// Current subscriber count for `stream`.
    pub async fn subscriber_count(&self, stream: &StreamId) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(stream)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }
}
