//! Runtime error taxonomy.
//!
//! Every externally callable operation either returns a result or raises an
//! [`AgentRuntimeError`] carrying the taxonomy kind and a free-form message.
//! Faults raised by user-supplied behavior code travel as boxed errors and
//! are wrapped into [`AgentRuntimeError::HandlerFault`] at the hosting
//! boundary.

use fabric::FabricError;
use std::error::Error;
use std::fmt;

/// Result alias used across the runtime's fallible surfaces.
pub type RuntimeResult<T> = Result<T, AgentRuntimeError>;

/// The runtime's error taxonomy.
#[derive(Debug, Clone)]
pub enum AgentRuntimeError {
    /// The operation requires a configured agent.
    NotConfigured(String),

    /// A client context was used after disposal.
    Disposed(String),

    /// A handle was empty or malformed.
    InvalidHandle(String),

    /// A configuration was missing its `agent_type`, or the alias has no
    /// registered behavior factory.
    InvalidConfiguration(String),

    /// A persistent-state write failed. In-memory state is kept; the next
    /// successful write carries the accumulated change.
    Persistence(String),

    /// A substrate operation (routing, stream, connect) failed but is
    /// considered retryable.
    SubstrateTransient(String),

    /// A substrate operation failed terminally.
    SubstratePermanent(String),

    /// User-supplied `on_message`/`on_event` code returned an error.
    HandlerFault(String),

    /// A chat-model call failed or no model was available for the request.
    Completion(String),

    /// A work item kept answering `NeedsInfo` past the follow-up budget.
    FollowUpExhausted(String),
}

impl fmt::Display for AgentRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRuntimeError::NotConfigured(handle) => {
                write!(f, "agent '{}' is not configured", handle)
            }
            AgentRuntimeError::Disposed(handle) => {
                write!(f, "client context '{}' is disposed", handle)
            }
            AgentRuntimeError::InvalidHandle(msg) => write!(f, "invalid handle: {}", msg),
            AgentRuntimeError::InvalidConfiguration(msg) => {
                write!(f, "invalid configuration: {}", msg)
            }
            AgentRuntimeError::Persistence(msg) => write!(f, "persistence failure: {}", msg),
            AgentRuntimeError::SubstrateTransient(msg) => {
                write!(f, "transient substrate failure: {}", msg)
            }
            AgentRuntimeError::SubstratePermanent(msg) => {
                write!(f, "substrate failure: {}", msg)
            }
            AgentRuntimeError::HandlerFault(msg) => write!(f, "handler fault: {}", msg),
            AgentRuntimeError::Completion(msg) => write!(f, "completion failure: {}", msg),
            AgentRuntimeError::FollowUpExhausted(msg) => {
                write!(f, "follow-up budget exhausted: {}", msg)
            }
        }
    }
}

impl Error for AgentRuntimeError {}

impl From<FabricError> for AgentRuntimeError {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::Persistence(msg) => AgentRuntimeError::Persistence(msg),
            // A lost activation heals on the next routed call.
            FabricError::ActivationLost(key) => {
                AgentRuntimeError::SubstrateTransient(format!("activation lost: {}", key))
            }
            FabricError::SubscriptionGone(msg) => AgentRuntimeError::SubstrateTransient(msg),
            FabricError::ActivationFailed(msg) => AgentRuntimeError::SubstratePermanent(msg),
            FabricError::ReminderNotFound(msg) => AgentRuntimeError::SubstratePermanent(msg),
        }
    }
}
