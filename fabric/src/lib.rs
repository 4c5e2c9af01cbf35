//! In-process cluster substrate for agent runtimes.
//!
//! This crate supplies the four platform services an agent-hosting layer needs
//! without pinning it to any particular clustering technology:
//!
//! - [`catalog`]: single-activation routing: at most one live activation per
//!   string key, with per-key FIFO execution and idle deactivation.
//! - [`state_store`]: a durable key/value document store addressed by
//!   `(kind, key, slot)`, with in-memory and on-disk implementations.
//! - [`streams`]: publish/subscribe streams addressed by `(namespace, key)`
//!   with a monotonically increasing sequence token per stream and in-order,
//!   one-at-a-time delivery per subscriber.
//! - [`reminders`]: durable scheduled callbacks that survive process
//!   restarts and re-arm from storage.
//!
//! # Architecture
//!
//! ```text
//! Catalog<G>                       StreamBus
//!   ├─ "u1:bot" ──► Activation     ├─ (AgentChat,  "u1")     seq=41
//!   ├─ "u1"     ──► Activation     ├─ (AgentChat,  "u1:bot") seq=7
//!   └─ idle sweeper                └─ (AgentEvent, "alerts")  seq=112
//!
//! StateStore                       ReminderService
//!   ├─ (agent,  "u1:bot", agentMessages)   ├─ "u1:plan" / "retry-wi-003"
//!   └─ (client, "u1",     clientState)     └─ resume() re-arms from storage
//! ```
//!
//! The hosting layer decides what a grain *is*; this crate only guarantees the
//! distributed-systems contracts: one activation per key, serialized execution,
//! durable slots, ordered streams, durable timers.

pub mod catalog;
pub mod reminders;
pub mod state_store;
pub mod streams;

pub use catalog::{Catalog, Grain};
pub use reminders::{ReminderEntry, ReminderHandler, ReminderService};
pub use state_store::{FileStateStore, MemoryStateStore, StateStore};
pub use streams::{StreamBus, StreamEnvelope, StreamHandler, StreamId, StreamNamespace, StreamSubscription};

use std::error::Error;
use std::fmt;

/// Errors surfaced by the substrate services.
#[derive(Debug, Clone)]
pub enum FabricError {
    /// A read or write against the backing state store failed.
    Persistence(String),

    /// A grain's `on_activate` hook failed; the activation was discarded.
    ActivationFailed(String),

    /// The activation vanished while an invocation was queued against it.
    /// Callers may retry; the next invocation re-activates the key.
    ActivationLost(String),

    /// A stream operation referenced a subscription that no longer exists.
    SubscriptionGone(String),

    /// A reminder operation referenced an unknown entry.
    ReminderNotFound(String),
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricError::Persistence(msg) => write!(f, "persistence failure: {}", msg),
            FabricError::ActivationFailed(msg) => write!(f, "activation failed: {}", msg),
            FabricError::ActivationLost(key) => write!(f, "activation lost for key: {}", key),
            FabricError::SubscriptionGone(msg) => write!(f, "subscription gone: {}", msg),
            FabricError::ReminderNotFound(msg) => write!(f, "reminder not found: {}", msg),
        }
    }
}

impl Error for FabricError {}
