//! The wire-level message schema of the messaging plane.
//!
//! An [`AgentMessage`] travels three ways: as a direct request/response RPC
//! between entities, as a chat-stream publication dispatched to an agent's
//! `on_message`, and as an event-stream publication dispatched to
//! `on_event`. The same struct also shapes the synthetic self-messages that
//! timers and reminders construct, so user code handles every delivery path
//! uniformly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message type tag that routes a directly delivered message to `on_event`
/// instead of `on_message`.
pub const EVENT_MESSAGE_TYPE: &str = "event";

/// Message type a worker agent answers with to signal a retryable failure.
pub const ERROR_TRANSIENT_MESSAGE_TYPE: &str = "agent-error-transient";

/// Message type a worker agent answers with to signal a terminal failure.
pub const ERROR_MESSAGE_TYPE: &str = "agent-error";

/// Args key carrying the timer/reminder name on scheduled self-messages.
pub const REMINDER_NAME_ARG: &str = "reminderName";

/// Delivery contract of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Expects a reply whose `to_handle` equals this message's `from_handle`.
    Request,
    /// A reply to an earlier `Request`.
    Response,
    /// Fire-and-forget.
    #[default]
    OneWay,
}

/// A message exchanged between agents and clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentMessage {
    /// Qualified sender handle; filled by the router when left empty.
    pub from_handle: String,
    /// Qualified target handle; normalized by the sending entity.
    pub to_handle: String,
    /// Opaque text payload.
    pub message: String,
    /// Free-form tag; see the `*_MESSAGE_TYPE` constants for the values the
    /// runtime itself interprets.
    pub message_type: String,
    pub kind: MessageKind,
    /// Optional routing channel, e.g. `"agent"` for plan-execute dispatch.
    pub channel: Option<String>,
    /// Structured metadata.
    pub args: HashMap<String, String>,
}

impl AgentMessage {
    /// A `Request` from `from` to `to` carrying `text`.
    pub fn request(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from_handle: from.into(),
            to_handle: to.into(),
            message: text.into(),
            kind: MessageKind::Request,
            ..Default::default()
        }
    }

    /// A fire-and-forget message from `from` to `to` carrying `text`.
    pub fn one_way(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from_handle: from.into(),
            to_handle: to.into(),
            message: text.into(),
            kind: MessageKind::OneWay,
            ..Default::default()
        }
    }

    /// A `Response` to this message, addressed back at its sender.
    pub fn respond(&self, text: impl Into<String>) -> Self {
        Self {
            from_handle: self.to_handle.clone(),
            to_handle: self.from_handle.clone(),
            message: text.into(),
            kind: MessageKind::Response,
            ..Default::default()
        }
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Everything needed to host user code behind a handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfiguration {
    /// Alias resolved against the behavior registry.
    pub agent_type: String,
    /// Agent handle; normalized to the owner-qualified form on create.
    pub handle: String,
    pub system_prompt: Option<String>,
    /// Additional event streams to subscribe beyond the agent's own pair.
    pub streams: Vec<String>,
    pub plugins: Vec<String>,
    pub tools: Vec<String>,
    /// Chat model aliases the agent may use, in preference order.
    pub models: Vec<String>,
    /// Free-form configuration passed through to the behavior.
    pub args: HashMap<String, String>,
    /// Reconfigure even when the agent is already configured.
    pub force_reconfigure: bool,
}

impl AgentConfiguration {
    pub fn new(agent_type: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            handle: handle.into(),
            ..Default::default()
        }
    }
}
