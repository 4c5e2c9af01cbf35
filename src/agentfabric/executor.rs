//! The plan execution loop: dispatch, retry, follow-up.
//!
//! One [`PlanExecutor`] drives one plan on a single logical thread. Each
//! cycle picks the first item in the validated execution order whose
//! dependencies are complete, composes a dispatch message (model-written,
//! with a plain `Title: Description` fallback), sends it to the owning agent
//! over the messaging plane, and classifies the reply:
//!
//! - `agent-error-transient` schedules a durable `retry-<id>` reminder, up
//!   to the retry budget; a reminder survives the planner agent
//!   deactivating and reactivates it to resume the loop;
//! - `agent-error` marks the item failed and replans;
//! - anything else goes to a model evaluator that answers `completed`,
//!   `needs_info` (with a follow-up message to send), or `failed`. The
//!   evaluator enforces data completeness: a reply that merely claims the
//!   work happened without the deliverable is `needs_info`.
//!
//! [`PlanExecuteBehavior`] packages a planner plus an executor as an
//! [`AgentBehavior`], so the planning agent rides the same messaging plane
//! as the agents it orchestrates.

use crate::agentfabric::behavior::{AgentBehavior, AgentHost, BehaviorResult};
use crate::agentfabric::compaction::{CompactionConfig, CompactionService};
use crate::agentfabric::completion::{ChatMessage, CompletionClient, Role};
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::handle;
use crate::agentfabric::health::{HealthState, ProxyHealth};
use crate::agentfabric::message::{
    AgentMessage, MessageKind, ERROR_MESSAGE_TYPE, ERROR_TRANSIENT_MESSAGE_TYPE,
};
use crate::agentfabric::plan::{TaskTracking, WorkItem, WorkItemStatus};
use crate::agentfabric::planner::{
    extract_json_object, AgentProfile, StatusUpdate, TaskPlanner,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Message type of the synthetic self-message a retry reminder dispatches.
pub const RETRY_MESSAGE_TYPE: &str = "plan-retry";

/// Reminder name prefix for retry reminders: `retry-<workItemId>`.
const RETRY_REMINDER_PREFIX: &str = "retry-";

/// The dispatch channel marking plan-execute traffic.
const DISPATCH_CHANNEL: &str = "agent";

/// Custom-state key the plan persists under between activations.
const PLAN_STATE_KEY: &str = "taskTracking";

/// Tuning for the execution loop.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Re-dispatches allowed after transient failures, per item.
    pub max_retries: u32,
    /// Delay before a retry reminder fires.
    pub retry_delay: Duration,
    /// Sleep between cycles when nothing is actionable.
    pub poll_delay: Duration,
    /// Consecutive no-progress cycles before the loop gives up.
    pub max_stall_cycles: u32,
    /// `needs_info` round-trips allowed per item.
    pub max_follow_ups: u32,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            poll_delay: Duration::from_secs(5),
            max_stall_cycles: 12,
            max_follow_ups: 2,
        }
    }
}

/// How an execution run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionVerdict {
    /// Every item settled and none failed.
    Succeeded,
    /// At least one item is `failed`.
    Failed,
    /// The loop saw no progress for `max_stall_cycles` cycles.
    Stalled,
}

/// Observability hooks for the loop. All default to no-ops.
#[async_trait]
pub trait ExecutionEvents: Send + Sync {
    async fn on_item_dispatched(&self, _item: &WorkItem) {}
    async fn on_item_completed(&self, _item_id: &str, _result: &str) {}
    async fn on_item_failed(&self, _item_id: &str, _error: &str) {}
    async fn on_execution_complete(&self, _verdict: ExecutionVerdict, _plan: &TaskTracking) {}
}

/// The executor's seam onto the messaging plane. [`AgentHost`] implements it
/// for production; tests substitute scripted dispatchers.
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// The plan agent's own qualified handle (its owner prefix resolves
    /// work-item owners to agent handles).
    fn self_handle(&self) -> String;

    /// Request-response send to a worker agent.
    async fn dispatch(&self, message: AgentMessage) -> RuntimeResult<Option<AgentMessage>>;

    /// Schedule a durable retry callback that eventually reaches
    /// [`PlanExecutor::handle_retry_due`] with `item_id`.
    async fn schedule_retry(
        &self,
        reminder_name: &str,
        item_id: &str,
        delay: Duration,
    ) -> RuntimeResult<()>;

    /// Persist the current plan so a reactivated planner agent can resume
    /// it. Defaults to a no-op for dispatchers without durable state.
    async fn persist_plan(&self, _plan: &TaskTracking) -> RuntimeResult<()> {
        Ok(())
    }
}

#[async_trait]
impl WorkDispatcher for AgentHost {
    fn self_handle(&self) -> String {
        self.handle().to_string()
    }

    async fn dispatch(&self, message: AgentMessage) -> RuntimeResult<Option<AgentMessage>> {
        self.send_and_receive(message).await
    }

    async fn schedule_retry(
        &self,
        reminder_name: &str,
        item_id: &str,
        delay: Duration,
    ) -> RuntimeResult<()> {
        self.register_reminder(
            reminder_name,
            RETRY_MESSAGE_TYPE,
            Some(item_id.to_string()),
            delay,
            Duration::ZERO,
        )
        .await
    }

    async fn persist_plan(&self, plan: &TaskTracking) -> RuntimeResult<()> {
        let value = serde_json::to_value(plan)
            .map_err(|e| AgentRuntimeError::Persistence(format!("plan serialization: {}", e)))?;
        self.stage_custom_state(HashMap::from([(PLAN_STATE_KEY.to_string(), value)]), Vec::new())
            .await;
        self.flush_custom_state().await?;
        Ok(())
    }
}

/// Evaluator verdict over a worker's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EvaluationOutcome {
    Completed,
    NeedsInfo,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Evaluation {
    outcome: EvaluationOutcome,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    follow_up_message: Option<String>,
}

#[derive(Default)]
struct ExecState {
    plan: Option<TaskTracking>,
    is_executing: bool,
    retry_counts: HashMap<String, u32>,
    pending_retries: HashSet<String>,
    follow_up_counts: HashMap<String, u32>,
    stall_cycles: u32,
    last_completed_count: usize,
}

/// Single-logical-thread executor for one plan.
pub struct PlanExecutor {
    dispatcher: Arc<dyn WorkDispatcher>,
    model: Arc<dyn CompletionClient>,
    planner: Arc<TaskPlanner>,
    options: ExecutorOptions,
    events: RwLock<Option<Arc<dyn ExecutionEvents>>>,
    resolve_agent_handle: RwLock<Option<Arc<dyn Fn(&str) -> String + Send + Sync>>>,
    state: Mutex<ExecState>,
    weak_self: Weak<PlanExecutor>,
}

impl PlanExecutor {
    pub fn new(
        dispatcher: Arc<dyn WorkDispatcher>,
        model: Arc<dyn CompletionClient>,
        planner: Arc<TaskPlanner>,
        options: ExecutorOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            dispatcher,
            model,
            planner,
            options,
            events: RwLock::new(None),
            resolve_agent_handle: RwLock::new(None),
            state: Mutex::new(ExecState::default()),
            weak_self: weak_self.clone(),
        })
    }

    /// Install observability hooks.
    pub async fn set_events(&self, events: Arc<dyn ExecutionEvents>) {
        *self.events.write().await = Some(events);
    }

    /// Override owner-to-handle resolution (default: prepend this agent's
    /// owner prefix to the work item's owner id).
    pub async fn set_handle_resolver(&self, resolver: Arc<dyn Fn(&str) -> String + Send + Sync>) {
        *self.resolve_agent_handle.write().await = Some(resolver);
    }

    /// Adopt `plan` without starting the loop. Used when rehydrating a
    /// persisted plan: a retry reminder (or the next objective) restarts
    /// execution.
    pub async fn adopt(&self, plan: TaskTracking) {
        let mut state = self.state.lock().await;
        state.last_completed_count = plan.completed_ids().len();
        state.stall_cycles = 0;
        state.plan = Some(plan);
    }

    /// Adopt `plan` and make sure the loop is running.
    pub async fn execute(&self, plan: TaskTracking) {
        {
            let mut state = self.state.lock().await;
            state.last_completed_count = plan.completed_ids().len();
            state.stall_cycles = 0;
            state.plan = Some(plan.clone());
            self.ensure_running(&mut state);
        }
        if let Err(err) = self.dispatcher.persist_plan(&plan).await {
            log::warn!("plan persistence failed: {}", err);
        }
    }

    pub async fn plan_snapshot(&self) -> Option<TaskTracking> {
        self.state.lock().await.plan.clone()
    }

    pub async fn is_executing(&self) -> bool {
        self.state.lock().await.is_executing
    }

    /// Stop the loop after the current cycle.
    pub async fn stop(&self) {
        self.state.lock().await.is_executing = false;
    }

    /// A `retry-<id>` reminder fired: release the item back to the loop and
    /// restart it if the plan still has work (the reminder may have
    /// reactivated us after a deactivation).
    pub async fn handle_retry_due(&self, item_id: &str) {
        let mut state = self.state.lock().await;
        state.pending_retries.remove(item_id);
        let has_work = state
            .plan
            .as_ref()
            .map(|plan| !plan.is_settled())
            .unwrap_or(false);
        if has_work {
            self.ensure_running(&mut state);
        }
    }

    fn ensure_running(&self, state: &mut ExecState) {
        if state.is_executing {
            return;
        }
        state.is_executing = true;
        let Some(executor) = self.weak_self.upgrade() else {
            state.is_executing = false;
            return;
        };
        tokio::spawn(async move {
            executor.run_loop().await;
        });
    }

    async fn run_loop(&self) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                if !state.is_executing {
                    return;
                }
                let Some(plan) = state.plan.as_ref() else {
                    state.is_executing = false;
                    return;
                };
                pick_next(plan, &state.pending_retries)
            };

            let Some(item) = next else {
                match self.idle_cycle().await {
                    Some((verdict, plan)) => {
                        self.emit_complete(verdict, &plan).await;
                        return;
                    }
                    None => {
                        tokio::time::sleep(self.options.poll_delay).await;
                        continue;
                    }
                }
            };

            self.process_item(item).await;
        }
    }

    /// Nothing dispatchable this cycle: decide between completion, stall,
    /// and another poll.
    async fn idle_cycle(&self) -> Option<(ExecutionVerdict, TaskTracking)> {
        let mut state = self.state.lock().await;
        let Some(plan) = state.plan.clone() else {
            state.is_executing = false;
            return None;
        };

        let has_actionable = plan.all_work.iter().any(|item| {
            matches!(
                item.status,
                WorkItemStatus::Pending | WorkItemStatus::InProgress
            )
        });
        if !has_actionable && state.pending_retries.is_empty() {
            let failed = plan
                .all_work
                .iter()
                .any(|item| item.status == WorkItemStatus::Failed);
            let verdict = if failed {
                ExecutionVerdict::Failed
            } else {
                ExecutionVerdict::Succeeded
            };
            state.is_executing = false;
            return Some((verdict, plan));
        }

        let completed_now = plan.completed_ids().len();
        if completed_now > state.last_completed_count {
            state.last_completed_count = completed_now;
            state.stall_cycles = 0;
        } else {
            state.stall_cycles += 1;
        }
        if state.stall_cycles >= self.options.max_stall_cycles {
            log::warn!(
                "execution stalled after {} no-progress cycles",
                state.stall_cycles
            );
            state.is_executing = false;
            return Some((ExecutionVerdict::Stalled, plan));
        }
        None
    }

    async fn process_item(&self, item: WorkItem) {
        {
            let mut state = self.state.lock().await;
            state.stall_cycles = 0;
            if let Some(plan) = state.plan.as_mut() {
                if let Some(tracked) = plan.work_item_mut(&item.id) {
                    tracked.status = WorkItemStatus::InProgress;
                    tracked.attempts += 1;
                }
            }
        }

        let dispatch_text = self.compose_dispatch(&item).await;
        let target = self.resolve_target(&item).await;
        let request = AgentMessage {
            from_handle: self.dispatcher.self_handle(),
            to_handle: target,
            message: dispatch_text,
            message_type: String::new(),
            kind: MessageKind::Request,
            channel: Some(DISPATCH_CHANNEL.to_string()),
            args: HashMap::new(),
        };

        if let Some(events) = self.events.read().await.clone() {
            events.on_item_dispatched(&item).await;
        }
        log::debug!("dispatching '{}' to '{}'", item.id, request.to_handle);

        let mut outcome = self.dispatcher.dispatch(request).await;
        loop {
            match outcome {
                Err(AgentRuntimeError::SubstrateTransient(msg)) => {
                    return self.transient_failure(&item, &msg).await;
                }
                Err(err) => {
                    return self.permanent_failure(&item, &err.to_string()).await;
                }
                Ok(None) => {
                    return self
                        .permanent_failure(&item, "agent returned no response")
                        .await;
                }
                Ok(Some(reply)) if reply.message_type == ERROR_TRANSIENT_MESSAGE_TYPE => {
                    return self.transient_failure(&item, &reply.message).await;
                }
                Ok(Some(reply)) if reply.message_type == ERROR_MESSAGE_TYPE => {
                    return self.permanent_failure(&item, &reply.message).await;
                }
                Ok(Some(reply)) => {
                    let evaluation = self.evaluate_reply(&item, &reply.message).await;
                    match evaluation.outcome {
                        EvaluationOutcome::Completed => {
                            let result = evaluation
                                .summary
                                .filter(|summary| !summary.is_empty())
                                .unwrap_or_else(|| reply.message.clone());
                            return self.complete_item(&item, &result).await;
                        }
                        EvaluationOutcome::Failed => {
                            let error = evaluation
                                .summary
                                .unwrap_or_else(|| "evaluator marked the item failed".into());
                            return self.permanent_failure(&item, &error).await;
                        }
                        EvaluationOutcome::NeedsInfo => {
                            let follow_ups = {
                                let mut state = self.state.lock().await;
                                let count =
                                    state.follow_up_counts.entry(item.id.clone()).or_insert(0);
                                *count += 1;
                                *count
                            };
                            if follow_ups > self.options.max_follow_ups {
                                let error = AgentRuntimeError::FollowUpExhausted(format!(
                                    "'{}' still incomplete after {} follow-ups",
                                    item.id, self.options.max_follow_ups
                                ));
                                return self.permanent_failure(&item, &error.to_string()).await;
                            }
                            let follow_up = evaluation.follow_up_message.unwrap_or_else(|| {
                                "Your previous answer described the work but did not include \
                                 the deliverable data. Reply with the concrete output itself."
                                    .to_string()
                            });
                            log::debug!(
                                "follow-up {}/{} for '{}'",
                                follow_ups,
                                self.options.max_follow_ups,
                                item.id
                            );
                            let target = self.resolve_target(&item).await;
                            outcome = self
                                .dispatcher
                                .dispatch(AgentMessage {
                                    from_handle: self.dispatcher.self_handle(),
                                    to_handle: target,
                                    message: follow_up,
                                    message_type: String::new(),
                                    kind: MessageKind::Request,
                                    channel: Some(DISPATCH_CHANNEL.to_string()),
                                    args: HashMap::new(),
                                })
                                .await;
                        }
                    }
                }
            }
        }
    }

    async fn complete_item(&self, item: &WorkItem, result: &str) {
        {
            let mut state = self.state.lock().await;
            state.retry_counts.remove(&item.id);
            state.pending_retries.remove(&item.id);
            state.follow_up_counts.remove(&item.id);
        }
        if let Some(events) = self.events.read().await.clone() {
            events.on_item_completed(&item.id, result).await;
        }
        log::debug!("work item '{}' completed", item.id);
        self.apply_replan(&item.id, WorkItemStatus::Completed, result)
            .await;
    }

    async fn transient_failure(&self, item: &WorkItem, error: &str) {
        let retries = {
            let mut state = self.state.lock().await;
            let count = state.retry_counts.entry(item.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if retries > self.options.max_retries {
            log::warn!(
                "'{}' exhausted {} retries: {}",
                item.id,
                self.options.max_retries,
                error
            );
            return self.permanent_failure(item, error).await;
        }

        {
            let mut state = self.state.lock().await;
            state.pending_retries.insert(item.id.clone());
            if let Some(plan) = state.plan.as_mut() {
                if let Some(tracked) = plan.work_item_mut(&item.id) {
                    tracked.status = WorkItemStatus::Pending;
                }
            }
        }
        let reminder = format!("{}{}", RETRY_REMINDER_PREFIX, item.id);
        log::debug!(
            "'{}' hit a transient failure (retry {}/{}): {}",
            item.id,
            retries,
            self.options.max_retries,
            error
        );
        if let Err(err) = self
            .dispatcher
            .schedule_retry(&reminder, &item.id, self.options.retry_delay)
            .await
        {
            log::error!("could not schedule retry for '{}': {}", item.id, err);
            let mut state = self.state.lock().await;
            state.pending_retries.remove(&item.id);
        }
    }

    async fn permanent_failure(&self, item: &WorkItem, error: &str) {
        {
            let mut state = self.state.lock().await;
            state.retry_counts.remove(&item.id);
            state.pending_retries.remove(&item.id);
            state.follow_up_counts.remove(&item.id);
        }
        if let Some(events) = self.events.read().await.clone() {
            events.on_item_failed(&item.id, error).await;
        }
        log::warn!("work item '{}' failed permanently: {}", item.id, error);
        self.apply_replan(&item.id, WorkItemStatus::Failed, error)
            .await;
    }

    /// Replan with one status update. A failing replanner never blocks the
    /// loop: the update is applied in code instead.
    async fn apply_replan(&self, item_id: &str, status: WorkItemStatus, result: &str) {
        let previous = { self.state.lock().await.plan.clone() };
        let Some(previous) = previous else {
            return;
        };
        let update = StatusUpdate {
            work_item_id: item_id.to_string(),
            new_status: status,
            result: Some(result.to_string()),
        };
        let adopted = match self.planner.replan(&previous, &[update], None).await {
            Ok((plan, _)) => {
                let mut state = self.state.lock().await;
                state.plan = Some(plan.clone());
                plan
            }
            Err(err) => {
                log::warn!("replan after '{}' failed, applying update in code: {}", item_id, err);
                let mut state = self.state.lock().await;
                let Some(plan) = state.plan.as_mut() else {
                    return;
                };
                if let Some(tracked) = plan.work_item_mut(item_id) {
                    tracked.status = status;
                    tracked.result = Some(result.to_string());
                }
                plan.clone()
            }
        };
        if let Err(err) = self.dispatcher.persist_plan(&adopted).await {
            log::warn!("plan persistence failed: {}", err);
        }
    }

    /// Model-composed dispatch message seeded with the item and every
    /// completed result; falls back to `Title: Description`.
    async fn compose_dispatch(&self, item: &WorkItem) -> String {
        let fallback = format!("{}: {}", item.title, item.description);
        let plan = { self.state.lock().await.plan.clone() };
        let Some(plan) = plan else {
            return fallback;
        };

        let mut dependency_results = String::new();
        let mut other_results = String::new();
        for completed in plan
            .all_work
            .iter()
            .filter(|other| other.status == WorkItemStatus::Completed)
        {
            let Some(result) = completed.result.as_deref() else {
                continue;
            };
            let line = format!("- {} \"{}\": {}\n", completed.id, completed.title, result);
            if item.dependency_ids.contains(&completed.id) {
                dependency_results.push_str(&line);
            } else {
                other_results.push_str(&line);
            }
        }

        let prompt = format!(
            "Write the message dispatching this work item to its agent.\n\n\
             Work item {} \"{}\": {}\nSuccess criteria: {}\n\n\
             Results of its dependencies (include these in full where the \
             agent needs them):\n{}\n\
             Results of other completed work:\n{}\n\
             Reply with only the dispatch message text.",
            item.id,
            item.title,
            item.description,
            item.success_criteria.as_deref().unwrap_or("(none given)"),
            if dependency_results.is_empty() {
                "(none)\n".to_string()
            } else {
                dependency_results
            },
            if other_results.is_empty() {
                "(none)\n".to_string()
            } else {
                other_results
            },
        );
        let request = vec![
            ChatMessage::text(Role::System, "You write precise task dispatch messages."),
            ChatMessage::text(Role::User, prompt),
        ];
        match self.model.complete(&request).await {
            Ok(response) => {
                let text = response.display_text();
                if text.trim().is_empty() {
                    fallback
                } else {
                    text
                }
            }
            Err(err) => {
                log::warn!("dispatch composition for '{}' failed: {}", item.id, err);
                fallback
            }
        }
    }

    /// Model evaluation of a worker reply. Evaluator failures default to
    /// `completed` so a broken evaluator never wedges the plan.
    async fn evaluate_reply(&self, item: &WorkItem, reply: &str) -> Evaluation {
        let prompt = format!(
            "Work item {} \"{}\": {}\nSuccess criteria: {}\n\nAgent reply:\n{}\n\n\
             Classify the reply. It is \"completed\" only when it contains the \
             concrete deliverable data; a reply that merely claims the work was \
             done is \"needs_info\", and your followUpMessage must instruct the \
             agent to produce the data itself. \"failed\" means the agent cannot \
             do the work.\n\n\
             Respond with exactly this JSON shape:\n\
             {{\"outcome\": \"completed\", \"summary\": \"...\", \
             \"followUpMessage\": null}}",
            item.id,
            item.title,
            item.description,
            item.success_criteria.as_deref().unwrap_or("(none given)"),
            reply
        );
        let request = vec![
            ChatMessage::text(Role::System, "You evaluate agent work results."),
            ChatMessage::text(Role::User, prompt),
        ];
        let parsed = match self.model.complete(&request).await {
            Ok(response) => {
                let text = response.display_text();
                extract_evaluation(&text)
            }
            Err(err) => {
                log::warn!("evaluator call for '{}' failed: {}", item.id, err);
                None
            }
        };
        parsed.unwrap_or(Evaluation {
            outcome: EvaluationOutcome::Completed,
            summary: None,
            follow_up_message: None,
        })
    }

    async fn resolve_target(&self, item: &WorkItem) -> String {
        let owner = item.owner.clone().unwrap_or_default();
        if let Some(resolver) = self.resolve_agent_handle.read().await.clone() {
            return resolver(&owner);
        }
        match handle::owner_of(&self.dispatcher.self_handle()) {
            Some(prefix_owner) => {
                handle::ensure_prefix(&owner, &handle::owner_prefix(prefix_owner))
            }
            None => owner,
        }
    }

    async fn emit_complete(&self, verdict: ExecutionVerdict, plan: &TaskTracking) {
        log::info!(
            "plan execution finished: {:?} ({} items)",
            verdict,
            plan.all_work.len()
        );
        if let Some(events) = self.events.read().await.clone() {
            events.on_execution_complete(verdict, plan).await;
        }
    }
}

/// First item in execution order that is pending or in progress, not waiting
/// on a retry, and whose dependencies are all complete.
fn pick_next(plan: &TaskTracking, pending_retries: &HashSet<String>) -> Option<WorkItem> {
    let completed: HashSet<&str> = plan
        .all_work
        .iter()
        .filter(|item| item.status == WorkItemStatus::Completed)
        .map(|item| item.id.as_str())
        .collect();

    for id in &plan.execution_order {
        if pending_retries.contains(id) {
            continue;
        }
        let Some(item) = plan.work_item(id) else {
            continue;
        };
        if !matches!(
            item.status,
            WorkItemStatus::Pending | WorkItemStatus::InProgress
        ) {
            continue;
        }
        if item
            .dependency_ids
            .iter()
            .all(|dep| completed.contains(dep.as_str()))
        {
            return Some(item.clone());
        }
    }
    None
}

fn extract_evaluation(text: &str) -> Option<Evaluation> {
    let value = extract_json_object(text, &[r#""outcome""#])?;
    serde_json::from_value(value).ok()
}

// ── The planning agent ────────────────────────────────────────────────────

/// Conversation thread the planning agent records its traffic under.
const PLANNER_THREAD: &str = "planner";

/// An [`AgentBehavior`] that plans on each incoming objective and drives the
/// execution loop against the cluster's other agents.
///
/// Configuration args:
/// - `agents`: JSON array of agent profiles
///   (`[{"agentId": "...", "capabilities": ["..."]}]`);
/// - `MaxRetries`, `RetryDelaySeconds`, `PollDelaySeconds`,
///   `MaxStallCycles`, `MaxFollowUps`: executor tuning;
/// - the `Compaction*` keys of [`CompactionConfig::from_args`]: planner
///   thread compaction.
pub struct PlanExecuteBehavior {
    host: AgentHost,
    agents: Vec<AgentProfile>,
    options: ExecutorOptions,
    compaction: CompactionConfig,
    planner: Option<Arc<TaskPlanner>>,
    executor: Option<Arc<PlanExecutor>>,
}

impl PlanExecuteBehavior {
    pub fn new(args: &HashMap<String, String>, host: AgentHost) -> Self {
        let agents: Vec<AgentProfile> = args
            .get("agents")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let compaction = CompactionConfig::from_args(args);
        let mut options = ExecutorOptions::default();
        if let Some(max_retries) = args.get("MaxRetries").and_then(|v| v.parse().ok()) {
            options.max_retries = max_retries;
        }
        if let Some(secs) = args.get("RetryDelaySeconds").and_then(|v| v.parse().ok()) {
            options.retry_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = args.get("PollDelaySeconds").and_then(|v| v.parse().ok()) {
            options.poll_delay = Duration::from_secs(secs);
        }
        if let Some(cycles) = args.get("MaxStallCycles").and_then(|v| v.parse().ok()) {
            options.max_stall_cycles = cycles;
        }
        if let Some(follow_ups) = args.get("MaxFollowUps").and_then(|v| v.parse().ok()) {
            options.max_follow_ups = follow_ups;
        }
        Self {
            host,
            agents,
            options,
            compaction,
            planner: None,
            executor: None,
        }
    }

    /// The factory to register under this behavior's type alias.
    pub fn factory() -> crate::agentfabric::behavior::BehaviorFactory {
        Arc::new(|configuration, host| {
            Box::new(PlanExecuteBehavior::new(&configuration.args, host))
        })
    }
}

#[async_trait]
impl AgentBehavior for PlanExecuteBehavior {
    async fn on_initialize(&mut self) -> BehaviorResult<()> {
        let model = self.host.model().await?;
        let planner = Arc::new(TaskPlanner::new(
            Arc::clone(&model),
            self.agents.clone(),
        ));
        let executor = PlanExecutor::new(
            Arc::new(self.host.clone()),
            model,
            Arc::clone(&planner),
            self.options.clone(),
        );

        // Rehydrate a plan persisted by a previous activation; a retry
        // reminder or the next objective resumes it.
        let custom_state = self.host.custom_state().await;
        if let Some(value) = custom_state.get(PLAN_STATE_KEY) {
            match serde_json::from_value::<TaskTracking>(value.clone()) {
                Ok(plan) => executor.adopt(plan).await,
                Err(err) => log::warn!("persisted plan is unreadable, starting fresh: {}", err),
            }
        }

        self.planner = Some(planner);
        self.executor = Some(executor);
        Ok(())
    }

    async fn on_message(&mut self, message: AgentMessage) -> BehaviorResult<Option<AgentMessage>> {
        let (Some(planner), Some(executor)) = (self.planner.as_ref(), self.executor.as_ref())
        else {
            return Err("plan-execute behavior used before initialization".into());
        };

        // Retry reminders re-enter here as synthetic self-messages.
        if message.message_type == RETRY_MESSAGE_TYPE {
            executor.handle_retry_due(message.message.trim()).await;
            return Ok(None);
        }

        let history = self.host.chat_history(PLANNER_THREAD).await;
        history
            .invoked(&crate::agentfabric::chat_history::InvocationContext {
                request_messages: vec![ChatMessage::text(Role::User, message.message.clone())],
                ..Default::default()
            })
            .await;

        // Plan on a fork so planner traffic stays out of the user thread.
        let fork = history.fork().await;
        let (plan, _report) = planner.plan(&fork, &message.message).await?;
        let summary = plan.summary.clone();
        let item_count = plan.all_work.len();
        executor.execute(plan).await;

        // Long-running plans accumulate history; compact the thread when the
        // estimate crosses the configured budget.
        if let Ok(model) = self.host.model().await {
            let result =
                CompactionService::compact(&history, &self.compaction, model).await;
            if result.was_compacted {
                log::debug!(
                    "planner thread compacted: {} -> {} messages",
                    result.original_message_count,
                    result.compacted_message_count
                );
            }
        }

        let response = message.respond(format!(
            "Plan accepted: {} ({} work items). Execution started.",
            summary, item_count
        ));
        Ok(Some(response))
    }

    async fn dispose(&mut self) {
        if let Some(executor) = self.executor.as_ref() {
            executor.stop().await;
        }
    }

    fn health(&self) -> ProxyHealth {
        let mut health = ProxyHealth::default();
        if self.planner.is_none() {
            health.state = HealthState::Degraded;
            health
                .diagnostics
                .insert("planner".into(), "not initialized".into());
        }
        health
            .diagnostics
            .insert("agents".into(), self.agents.len().to_string());
        health
    }
}
