//! LLM-orchestrated planning and replanning.
//!
//! The planner turns a conversation plus an objective into a validated
//! [`TaskTracking`]. It operates on a *fork* of the upstream thread so its
//! internal model calls never pollute the user-facing history.
//!
//! Planning runs in two phases:
//!
//! - **Phase 1, parallel extractions.** Summary, work items + blockers, and
//!   phase + strategy pivots are extracted concurrently under a single
//!   five-minute deadline. Extractions that miss the deadline are dropped;
//!   downstream phases operate on whatever completed.
//! - **Phase 2, sequential refinement.** Pending items are bound to
//!   `(agent, capability)` pairs (the capability must exactly match one the
//!   agent advertises), and a validation call prunes items no agent can
//!   execute. Items that end phase 2 without a binding are removed.
//!
//! Every plan leaving this module has passed the deterministic validator;
//! whatever ordering the model proposed is overridden.

use crate::agentfabric::chat_history::{ForkedChatHistoryProvider, InvocationContext};
use crate::agentfabric::completion::{ChatMessage, CompletionClient, Role};
use crate::agentfabric::error::{AgentRuntimeError, RuntimeResult};
use crate::agentfabric::plan::{
    AgentAssignment, Blocker, PlanDiff, PlanPhase, TaskTracking, WorkItem, WorkItemStatus,
    WorkPriority,
};
use crate::agentfabric::plan_validator::{validate, PlanValidation};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// Overall deadline for the phase-1 extractions.
const PHASE_ONE_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// How many trailing conversation messages are rendered into prompts.
const TRANSCRIPT_WINDOW: usize = 40;

/// One executing agent the planner may bind work to.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub description: Option<String>,
}

/// A code-applied status change fed into a replan.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub work_item_id: String,
    pub new_status: WorkItemStatus,
    pub result: Option<String>,
}

/// LLM-backed planner bound to a chat model and an agent roster.
pub struct TaskPlanner {
    model: Arc<dyn CompletionClient>,
    agents: Vec<AgentProfile>,
    phase_one_deadline: Duration,
}

// ── LLM response shapes ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LlmWorkItem {
    id: String,
    title: String,
    description: String,
    owner: Option<String>,
    dependency_ids: Vec<String>,
    success_criteria: Option<String>,
    estimated_complexity: Option<String>,
    priority: Option<WorkPriority>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkExtraction {
    work_items: Vec<LlmWorkItem>,
    blockers: Vec<Blocker>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PhaseExtraction {
    phase: Option<PlanPhase>,
    strategy_pivots: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AssignmentExtraction {
    assignments: Vec<AgentAssignment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OrderingExtraction {
    remove_work_item_ids: Vec<String>,
    plan_rationale: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PlanUpdateExtraction {
    summary: Option<String>,
    work_items: Vec<LlmWorkItem>,
    blockers: Vec<Blocker>,
    phase: Option<PlanPhase>,
    strategy_pivots: Vec<String>,
}

impl TaskPlanner {
    pub fn new(model: Arc<dyn CompletionClient>, agents: Vec<AgentProfile>) -> Self {
        Self {
            model,
            agents,
            phase_one_deadline: PHASE_ONE_DEADLINE,
        }
    }

    /// Override the phase-1 deadline (tests shrink it).
    pub fn with_phase_one_deadline(mut self, deadline: Duration) -> Self {
        self.phase_one_deadline = deadline;
        self
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    /// Produce a fresh plan for `objective` from the forked conversation.
    pub async fn plan(
        &self,
        history: &ForkedChatHistoryProvider,
        objective: &str,
    ) -> RuntimeResult<(TaskTracking, PlanValidation)> {
        let plan_id = Uuid::new_v4();
        log::debug!("planning turn {} started ({})", plan_id, preview(objective));
        let transcript = render_transcript(&history.invoking().await);
        let deadline = self.phase_one_deadline;

        let (summary, extraction, phase) = tokio::join!(
            timeout(deadline, self.extract_summary(&transcript, objective)),
            timeout(deadline, self.extract_work(&transcript, objective)),
            timeout(deadline, self.extract_phase(&transcript)),
        );

        let summary = match summary {
            Ok(Ok(summary)) => summary,
            Ok(Err(err)) => {
                log::warn!("summary extraction failed: {}", err);
                objective.to_string()
            }
            Err(_) => {
                log::warn!("summary extraction missed the phase-1 deadline");
                objective.to_string()
            }
        };
        let extraction = match extraction {
            Ok(Ok(extraction)) => extraction,
            Ok(Err(err)) => {
                log::warn!("work extraction failed: {}", err);
                WorkExtraction::default()
            }
            Err(_) => {
                log::warn!("work extraction missed the phase-1 deadline");
                WorkExtraction::default()
            }
        };
        let phase = match phase {
            Ok(Ok(phase)) => phase,
            Ok(Err(err)) => {
                log::warn!("phase extraction failed: {}", err);
                PhaseExtraction::default()
            }
            Err(_) => {
                log::warn!("phase extraction missed the phase-1 deadline");
                PhaseExtraction::default()
            }
        };

        let mut items = normalize_items(extraction.work_items);
        let assignments = self.assign_agents(&mut items).await;
        let ordering = self.prune_and_order(&items).await;
        retain_executable(&mut items, &assignments, &ordering.remove_work_item_ids);

        let mut plan = TaskTracking {
            summary,
            all_work: items,
            blockers: extraction.blockers,
            agent_assignments: assignments,
            phase: phase.phase.unwrap_or_default(),
            strategy_pivots: phase.strategy_pivots,
            plan_rationale: ordering.plan_rationale,
            planned_at: Utc::now(),
            ..Default::default()
        };
        let report = validate(&mut plan);
        log::debug!(
            "planning turn {} produced {} work items",
            plan_id,
            plan.all_work.len()
        );

        history
            .invoked(&InvocationContext {
                request_messages: vec![ChatMessage::text(Role::User, objective)],
                response_messages: vec![
                    ChatMessage::text(Role::Assistant, plan.summary.clone())
                        .with_author("planner"),
                ],
                ..Default::default()
            })
            .await;
        Ok((plan, report))
    }

    /// Produce the next plan version from `previous`.
    ///
    /// Status updates are applied in code before anything reaches the model,
    /// and the model is told so. With no updates and no new context the
    /// previous plan is returned untouched apart from its version.
    pub async fn replan(
        &self,
        previous: &TaskTracking,
        status_updates: &[StatusUpdate],
        additional_context: Option<&str>,
    ) -> RuntimeResult<(TaskTracking, PlanValidation)> {
        let mut updated = previous.clone();
        for update in status_updates {
            if let Some(item) = updated.work_item_mut(&update.work_item_id) {
                item.status = update.new_status;
                if let Some(result) = &update.result {
                    item.result = Some(result.clone());
                }
            }
        }
        updated.plan_version = previous.plan_version + 1;
        updated.planned_at = Utc::now();

        if status_updates.is_empty() && additional_context.is_none() {
            updated.last_replan_diff = Some(PlanDiff::default());
            return Ok((updated, PlanValidation::default()));
        }

        let revised = match self.request_plan_update(&updated, additional_context).await {
            Ok(revised) => revised,
            Err(err) => {
                // Keep the code-applied truth and move on; a broken model
                // must not stall execution.
                log::warn!("replan model call failed, keeping applied statuses: {}", err);
                let mut fallback = updated;
                fallback.last_replan_diff = Some(diff_plans(previous, &fallback));
                let report = validate(&mut fallback);
                return Ok((fallback, report));
            }
        };

        let mut items = normalize_items(revised.work_items);
        // Code-applied statuses and results win over anything the model
        // inferred from the conversation.
        for item in &mut items {
            if let Some(applied) = updated.work_item(&item.id) {
                item.status = applied.status;
                item.result = applied.result.clone();
                item.attempts = applied.attempts;
                if item.owner.is_none() {
                    item.owner = applied.owner.clone();
                }
            }
        }

        let assignments = self.assign_agents(&mut items).await;
        let ordering = self.prune_and_order(&items).await;
        retain_executable(&mut items, &assignments, &ordering.remove_work_item_ids);

        let mut plan = TaskTracking {
            summary: revised.summary.unwrap_or_else(|| updated.summary.clone()),
            all_work: items,
            blockers: revised.blockers,
            agent_assignments: assignments,
            phase: revised.phase.unwrap_or(updated.phase),
            strategy_pivots: if revised.strategy_pivots.is_empty() {
                updated.strategy_pivots.clone()
            } else {
                revised.strategy_pivots
            },
            plan_rationale: ordering.plan_rationale.or_else(|| updated.plan_rationale.clone()),
            effort_level: updated.effort_level,
            plan_version: updated.plan_version,
            planned_at: updated.planned_at,
            last_replan_diff: None,
            execution_order: Vec::new(),
            critical_path: Vec::new(),
        };
        plan.last_replan_diff = Some(diff_plans(previous, &plan));
        let report = validate(&mut plan);
        Ok((plan, report))
    }

    // ── Phase 1 extractions ───────────────────────────────────────────────

    async fn extract_summary(&self, transcript: &str, objective: &str) -> RuntimeResult<String> {
        let prompt = format!(
            "Conversation so far:\n{}\n\nObjective: {}\n\n\
             Summarize the current status, the objective, and the rationale \
             for pursuing it. One sentence to one paragraph of plain text.",
            transcript, objective
        );
        self.complete_text(
            "You are the planning summarizer for a team of agents.",
            prompt,
        )
        .await
    }

    async fn extract_work(&self, transcript: &str, objective: &str) -> RuntimeResult<WorkExtraction> {
        let mut roster = String::new();
        for agent in &self.agents {
            roster.push_str(&format!(
                "- {} (capabilities: {})\n",
                agent.agent_id,
                agent.capabilities.join(", ")
            ));
        }
        let prompt = format!(
            "Conversation so far:\n{}\n\nObjective: {}\n\nAvailable agents:\n{}\n\
             Decompose the objective into work items that the available agents \
             can execute. Every item needs an id of the form wi-NNN, a title, a \
             description, an owner drawn from the agent ids above, dependencyIds \
             referencing only ids in this response, successCriteria, and \
             estimatedComplexity. Also list blockers.\n\n\
             Respond with exactly this JSON shape:\n\
             {{\"workItems\": [{{\"id\": \"wi-001\", \"title\": \"...\", \
             \"description\": \"...\", \"owner\": \"agent-id\", \
             \"dependencyIds\": [], \"successCriteria\": \"...\", \
             \"estimatedComplexity\": \"low\"}}], \
             \"blockers\": [{{\"description\": \"...\", \"blocksWorkItemIds\": []}}]}}",
            transcript, objective, roster
        );
        let response = self
            .complete_text("You are the work decomposition planner.", prompt)
            .await?;
        parse_response(&response, &[r#""workItems""#, r#""blockers""#])
    }

    async fn extract_phase(&self, transcript: &str) -> RuntimeResult<PhaseExtraction> {
        let prompt = format!(
            "Conversation so far:\n{}\n\n\
             Which phase is this effort in (planning, execution, recovery, \
             complete), and which strategy pivots have happened?\n\n\
             Respond with exactly this JSON shape:\n\
             {{\"phase\": \"planning\", \"strategyPivots\": []}}",
            transcript
        );
        let response = self
            .complete_text("You classify planning phases.", prompt)
            .await?;
        parse_response(&response, &[r#""phase""#, r#""strategyPivots""#])
    }

    // ── Phase 2 refinement ────────────────────────────────────────────────

    /// Bind pending items to `(agent, capability)` pairs. Bindings whose
    /// capability is not an exact match for the agent are discarded.
    async fn assign_agents(&self, items: &mut [WorkItem]) -> Vec<AgentAssignment> {
        let assignable: Vec<&WorkItem> = items
            .iter()
            .filter(|item| {
                matches!(
                    item.status,
                    WorkItemStatus::Pending | WorkItemStatus::InProgress
                )
            })
            .collect();
        if assignable.is_empty() || self.agents.is_empty() {
            return Vec::new();
        }

        let mut listing = String::new();
        for item in &assignable {
            listing.push_str(&format!(
                "- {} \"{}\": {}\n",
                item.id, item.title, item.description
            ));
        }
        let mut roster = String::new();
        for agent in &self.agents {
            roster.push_str(&format!(
                "- {} (capabilities: {}){}\n",
                agent.agent_id,
                agent.capabilities.join(", "),
                agent
                    .description
                    .as_deref()
                    .map(|d| format!(" - {}", d))
                    .unwrap_or_default()
            ));
        }
        let prompt = format!(
            "Work items:\n{}\nAgents:\n{}\n\
             Bind every work item to one agent and one of that agent's listed \
             capabilities, with a short rationale. The capability must be \
             copied exactly from the agent's list.\n\n\
             Respond with exactly this JSON shape:\n\
             {{\"assignments\": [{{\"workItemId\": \"wi-001\", \"agentId\": \
             \"agent-id\", \"capability\": \"...\", \"rationale\": \"...\"}}]}}",
            listing, roster
        );

        let extraction: AssignmentExtraction = match self
            .complete_text("You match work to agent capabilities.", prompt)
            .await
            .and_then(|response| parse_response(&response, &[r#""assignments""#]))
        {
            Ok(extraction) => extraction,
            Err(err) => {
                log::warn!("agent assignment failed: {}", err);
                AssignmentExtraction::default()
            }
        };

        let capabilities: HashMap<&str, &AgentProfile> = self
            .agents
            .iter()
            .map(|agent| (agent.agent_id.as_str(), agent))
            .collect();
        let mut kept = Vec::new();
        for assignment in extraction.assignments {
            let Some(agent) = capabilities.get(assignment.agent_id.as_str()) else {
                log::debug!("assignment to unknown agent '{}' dropped", assignment.agent_id);
                continue;
            };
            if !agent.capabilities.iter().any(|c| c == &assignment.capability) {
                log::debug!(
                    "assignment of '{}' with unmatched capability '{}' dropped",
                    assignment.work_item_id,
                    assignment.capability
                );
                continue;
            }
            if let Some(item) = items
                .iter_mut()
                .find(|item| item.id == assignment.work_item_id)
            {
                item.owner = Some(assignment.agent_id.clone());
                kept.push(assignment);
            }
        }
        kept
    }

    /// Ask the model which items no agent should attempt (human-only work,
    /// leftovers without a plausible executor) and for the plan rationale.
    async fn prune_and_order(&self, items: &[WorkItem]) -> OrderingExtraction {
        if items.is_empty() {
            return OrderingExtraction::default();
        }
        let mut listing = String::new();
        for item in items {
            listing.push_str(&format!(
                "- {} \"{}\" owner={} deps=[{}]\n",
                item.id,
                item.title,
                item.owner.as_deref().unwrap_or("<unbound>"),
                item.dependency_ids.join(", ")
            ));
        }
        let prompt = format!(
            "Work items:\n{}\n\
             List the ids of items that should be removed because they are \
             not executable by an agent (human-only work, or no owner could \
             be bound), and give a one-paragraph rationale for the plan.\n\n\
             Respond with exactly this JSON shape:\n\
             {{\"removeWorkItemIds\": [], \"planRationale\": \"...\"}}",
            listing
        );
        match self
            .complete_text("You validate agent execution plans.", prompt)
            .await
            .and_then(|response| {
                parse_response(&response, &[r#""removeWorkItemIds""#, r#""planRationale""#])
            })
        {
            Ok(extraction) => extraction,
            Err(err) => {
                log::warn!("plan validation call failed: {}", err);
                OrderingExtraction::default()
            }
        }
    }

    async fn request_plan_update(
        &self,
        applied: &TaskTracking,
        additional_context: Option<&str>,
    ) -> RuntimeResult<PlanUpdateExtraction> {
        let plan_json = serde_json::to_string_pretty(applied)
            .map_err(|e| AgentRuntimeError::Completion(format!("plan serialization: {}", e)))?;
        let context = additional_context
            .map(|ctx| format!("\nNew context:\n{}\n", ctx))
            .unwrap_or_default();
        let prompt = format!(
            "Current plan (status updates have ALREADY been applied in code; \
             do not infer further status changes from anything else):\n{}\n{}\
             Return the updated plan: summary, all work items including \
             unchanged completed ones, blockers, phase, and strategy pivots.\n\n\
             Respond with exactly this JSON shape:\n\
             {{\"summary\": \"...\", \"workItems\": [...], \"blockers\": [...], \
             \"phase\": \"execution\", \"strategyPivots\": []}}",
            plan_json, context
        );
        let response = self
            .complete_text("You maintain agent execution plans.", prompt)
            .await?;
        parse_response(&response, &[r#""workItems""#, r#""summary""#])
    }

    async fn complete_text(&self, system: &str, user: String) -> RuntimeResult<String> {
        let request = vec![
            ChatMessage::text(Role::System, system),
            ChatMessage::text(Role::User, user),
        ];
        let response = self
            .model
            .complete(&request)
            .await
            .map_err(|e| AgentRuntimeError::Completion(e.to_string()))?;
        Ok(response.display_text())
    }
}

/// Keep items an agent can actually execute: settled items stay; pending and
/// in-progress items need a surviving `(agent, capability)` binding and must
/// not be flagged for removal by the validation call.
fn retain_executable(
    items: &mut Vec<WorkItem>,
    assignments: &[AgentAssignment],
    remove_ids: &[String],
) {
    let bound: HashSet<&str> = assignments
        .iter()
        .map(|assignment| assignment.work_item_id.as_str())
        .collect();
    let removals: HashSet<&str> = remove_ids.iter().map(String::as_str).collect();
    items.retain(|item| {
        if removals.contains(item.id.as_str()) {
            return false;
        }
        match item.status {
            WorkItemStatus::Pending | WorkItemStatus::InProgress => {
                bound.contains(item.id.as_str())
            }
            _ => true,
        }
    });
}

/// Turn LLM work items into model items with unique `wi-NNN` ids and
/// dependencies restricted to ids present in the same response.
fn normalize_items(raw: Vec<LlmWorkItem>) -> Vec<WorkItem> {
    let mut used: HashSet<String> = HashSet::new();
    let mut items: Vec<WorkItem> = Vec::with_capacity(raw.len());
    for (index, llm_item) in raw.into_iter().enumerate() {
        let mut id = llm_item.id.trim().to_string();
        if id.is_empty() {
            id = format!("wi-{:03}", index + 1);
        }
        while !used.insert(id.clone()) {
            id = format!("{}-dup", id);
        }
        items.push(WorkItem {
            id,
            title: llm_item.title,
            description: llm_item.description,
            owner: llm_item.owner.filter(|owner| !owner.is_empty()),
            dependency_ids: llm_item.dependency_ids,
            success_criteria: llm_item.success_criteria,
            estimated_complexity: llm_item.estimated_complexity,
            priority: llm_item.priority.unwrap_or_default(),
            ..Default::default()
        });
    }

    let ids: HashSet<String> = items.iter().map(|item| item.id.clone()).collect();
    for item in &mut items {
        item.dependency_ids.retain(|dep| ids.contains(dep));
    }
    items
}

/// Compare two plan versions; every id list is deduplicated so duplicate-id
/// model output cannot double-count.
fn diff_plans(previous: &TaskTracking, next: &TaskTracking) -> PlanDiff {
    let previous_items: HashMap<&str, &WorkItem> = previous
        .all_work
        .iter()
        .map(|item| (item.id.as_str(), item))
        .collect();
    let next_items: HashMap<&str, &WorkItem> = next
        .all_work
        .iter()
        .map(|item| (item.id.as_str(), item))
        .collect();

    let mut added = BTreeSet::new();
    let mut status_changed = BTreeSet::new();
    let mut dependency_changed = BTreeSet::new();
    let mut reassigned = BTreeSet::new();
    for (id, item) in &next_items {
        match previous_items.get(id) {
            None => {
                added.insert((*id).to_string());
            }
            Some(previous_item) => {
                if previous_item.status != item.status {
                    status_changed.insert((*id).to_string());
                }
                let previous_deps: BTreeSet<&String> =
                    previous_item.dependency_ids.iter().collect();
                let next_deps: BTreeSet<&String> = item.dependency_ids.iter().collect();
                if previous_deps != next_deps {
                    dependency_changed.insert((*id).to_string());
                }
                if previous_item.owner != item.owner {
                    reassigned.insert((*id).to_string());
                }
            }
        }
    }
    let removed: BTreeSet<String> = previous_items
        .keys()
        .filter(|id| !next_items.contains_key(*id))
        .map(|id| (*id).to_string())
        .collect();

    PlanDiff {
        added_work_item_ids: added.into_iter().collect(),
        removed_work_item_ids: removed.into_iter().collect(),
        status_changed_work_item_ids: status_changed.into_iter().collect(),
        dependency_changed_work_item_ids: dependency_changed.into_iter().collect(),
        reassigned_work_item_ids: reassigned.into_iter().collect(),
    }
}

/// Render the trailing window of a conversation as `role: text` lines.
fn render_transcript(messages: &[ChatMessage]) -> String {
    let start = messages.len().saturating_sub(TRANSCRIPT_WINDOW);
    let mut transcript = String::new();
    for message in &messages[start..] {
        transcript.push_str(&format!(
            "{}: {}\n",
            message.role.as_str(),
            message.display_text()
        ));
    }
    if transcript.is_empty() {
        transcript.push_str("(no prior conversation)\n");
    }
    transcript
}

/// Extract the JSON object anchored by `markers` from a model response and
/// deserialize it.
fn parse_response<T: serde::de::DeserializeOwned>(
    response: &str,
    markers: &[&str],
) -> RuntimeResult<T> {
    let value = extract_json_object(response, markers).ok_or_else(|| {
        AgentRuntimeError::Completion(format!(
            "no JSON object in model response: {}",
            preview(response)
        ))
    })?;
    serde_json::from_value(value)
        .map_err(|e| AgentRuntimeError::Completion(format!("malformed model JSON: {}", e)))
}

/// Isolate a JSON object from a model response that may wrap it in prose or
/// code fences.
///
/// Anchors on the first of `markers` present (a quoted schema key such as
/// `"workItems"`), walks back to the `{` that opens the enclosing object,
/// and brace-counts forward to its matching `}`, so stray braces in the
/// surrounding text never widen the parsed span. Brace counting assumes the
/// fragment itself is balanced. When no marker is present, the outermost
/// brace span is tried as a last resort.
pub(crate) fn extract_json_object(response: &str, markers: &[&str]) -> Option<Value> {
    for marker in markers {
        let Some(marker_idx) = response.find(marker) else {
            continue;
        };
        let Some(start) = enclosing_object_start(response, marker_idx) else {
            continue;
        };
        let Some(end) = matching_brace_end(response, start) else {
            continue;
        };
        if let Ok(value) = serde_json::from_str(&response[start..end]) {
            return Some(value);
        }
    }

    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

/// Walk backward from `from` to the `{` that opens the object containing it.
fn enclosing_object_start(response: &str, from: usize) -> Option<usize> {
    let bytes = response.as_bytes();
    let mut depth: usize = 0;
    for idx in (0..from).rev() {
        match bytes[idx] {
            b'}' => depth += 1,
            b'{' => {
                if depth == 0 {
                    return Some(idx);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Brace-count from the `{` at `start` to one past its matching `}`.
fn matching_brace_end(response: &str, start: usize) -> Option<usize> {
    let bytes = response.as_bytes();
    let mut depth: usize = 0;
    for (idx, byte) in bytes.iter().enumerate().skip(start) {
        match *byte {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    let normalized = text.replace('\n', " ");
    let mut chars = normalized.chars();
    let preview: String = chars.by_ref().take(120).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}
