//! Handle normalization utilities.
//!
//! A handle is a string identifier. The fully qualified form is
//! `owner:agent`, where `owner` is a client handle and `agent` is the
//! agent-local name; a bare client handle carries no colon. Every routing
//! surface normalizes target handles with [`ensure_prefix`] before use, so
//! callers may pass either form interchangeably.

use crate::agentfabric::error::AgentRuntimeError;

/// The owner prefix for a client id: `clientId + ":"`.
///
/// # Example
///
/// ```rust
/// use agentfabric::handle::owner_prefix;
///
/// assert_eq!(owner_prefix("u1"), "u1:");
/// ```
pub fn owner_prefix(client_id: &str) -> String {
    format!("{}:", client_id)
}

/// Return `handle` unchanged if it already starts with `prefix`, else
/// prepend `prefix`. Applying it twice is idempotent.
///
/// # Example
///
/// ```rust
/// use agentfabric::handle::ensure_prefix;
///
/// assert_eq!(ensure_prefix("bot", "u1:"), "u1:bot");
/// assert_eq!(ensure_prefix("u1:bot", "u1:"), "u1:bot");
/// assert_eq!(ensure_prefix(&ensure_prefix("bot", "u1:"), "u1:"), "u1:bot");
/// ```
pub fn ensure_prefix(handle: &str, prefix: &str) -> String {
    if handle.starts_with(prefix) {
        handle.to_string()
    } else {
        format!("{}{}", prefix, handle)
    }
}

/// Inverse of [`ensure_prefix`] for handles that carry `prefix`; handles
/// without it are returned unchanged.
///
/// # Example
///
/// ```rust
/// use agentfabric::handle::{ensure_prefix, strip_prefix};
///
/// assert_eq!(strip_prefix("u1:bot", "u1:"), "bot");
/// assert_eq!(strip_prefix("bot", "u1:"), "bot");
/// assert_eq!(strip_prefix(&ensure_prefix("bot", "u1:"), "u1:"), "bot");
/// ```
pub fn strip_prefix(handle: &str, prefix: &str) -> String {
    handle
        .strip_prefix(prefix)
        .unwrap_or(handle)
        .to_string()
}

/// The owner portion of a qualified handle, if any.
///
/// # Example
///
/// ```rust
/// use agentfabric::handle::owner_of;
///
/// assert_eq!(owner_of("u1:bot"), Some("u1"));
/// assert_eq!(owner_of("u1"), None);
/// ```
pub fn owner_of(handle: &str) -> Option<&str> {
    handle.split_once(':').map(|(owner, _)| owner)
}

/// The agent-local portion of a handle (the whole handle when unqualified).
pub fn local_part(handle: &str) -> &str {
    handle
        .split_once(':')
        .map(|(_, local)| local)
        .unwrap_or(handle)
}

/// Reject empty or malformed handles before they reach the routing plane.
///
/// A valid handle is non-empty, contains no whitespace, and neither starts
/// nor ends with the owner separator.
pub fn validate(handle: &str) -> Result<(), AgentRuntimeError> {
    if handle.is_empty() {
        return Err(AgentRuntimeError::InvalidHandle("handle is empty".into()));
    }
    if handle.chars().any(char::is_whitespace) {
        return Err(AgentRuntimeError::InvalidHandle(format!(
            "handle '{}' contains whitespace",
            handle
        )));
    }
    if handle.starts_with(':') || handle.ends_with(':') {
        return Err(AgentRuntimeError::InvalidHandle(format!(
            "handle '{}' has a dangling owner separator",
            handle
        )));
    }
    Ok(())
}
