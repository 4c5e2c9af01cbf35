// src/lib.rs

// Import the top-level `agentfabric` module.
pub mod agentfabric;

// Re-export the module tree at the crate root so call sites read
// `agentfabric::cluster::AgentCluster` instead of walking the hierarchy.
pub use agentfabric::{
    behavior, chat_history, client_context, cluster, compaction, completion, config, error,
    executor, handle, health, message, observer, plan, plan_validator, planner, registry, state,
};

// Re-exporting key items for easier external access.
pub use agentfabric::behavior::{AgentBehavior, AgentHost, BehaviorRegistry};
pub use agentfabric::client_context::{ClientContext, ClientContextFactory};
pub use agentfabric::cluster::AgentCluster;
pub use agentfabric::completion::{ChatMessage, CompletionClient, ModelRegistry, Role};
pub use agentfabric::error::{AgentRuntimeError, RuntimeResult};
pub use agentfabric::message::{AgentConfiguration, AgentMessage, MessageKind};
