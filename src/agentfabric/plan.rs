//! The task-planning data model.
//!
//! A [`TaskTracking`] is a validated DAG of [`WorkItem`]s with owner
//! bindings, blockers, and a deterministic execution order. Plans are
//! produced by the LLM-backed planner, repaired by the deterministic
//! validator, and consumed by the execution loop; all three speak this
//! model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Work item lifecycle states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    Failed,
}

impl WorkItemStatus {
    /// Ready-set tie-break rank: completed, in_progress, pending, blocked,
    /// failed, cancelled.
    pub(crate) fn rank(self) -> u8 {
        match self {
            WorkItemStatus::Completed => 0,
            WorkItemStatus::InProgress => 1,
            WorkItemStatus::Pending => 2,
            WorkItemStatus::Blocked => 3,
            WorkItemStatus::Failed => 4,
            WorkItemStatus::Cancelled => 5,
        }
    }
}

/// Work item priorities, highest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl WorkPriority {
    pub(crate) fn rank(self) -> u8 {
        match self {
            WorkPriority::Critical => 0,
            WorkPriority::High => 1,
            WorkPriority::Medium => 2,
            WorkPriority::Low => 3,
        }
    }
}

/// Which stage of its life a plan is in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    #[default]
    Planning,
    Execution,
    Recovery,
    Complete,
}

/// How much planning effort the caller asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffortLevel {
    Quick,
    #[default]
    Standard,
    Thorough,
}

/// One unit of work in a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkItem {
    /// Stable id, conventionally `wi-NNN`.
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: WorkItemStatus,
    pub priority: WorkPriority,
    /// Bound executing agent id, once assignment has run.
    pub owner: Option<String>,
    /// Deliverable captured when the item completes.
    pub result: Option<String>,
    pub blocked_reason: Option<String>,
    pub parent_id: Option<String>,
    pub sub_tasks: Vec<String>,
    /// Ids this item waits on; the validator guarantees these form a DAG.
    pub dependency_ids: Vec<String>,
    pub success_criteria: Option<String>,
    /// Dispatch attempts so far (retries included).
    pub attempts: u32,
    pub estimated_complexity: Option<String>,
    /// 1-based position in the validated execution order.
    pub execution_order: usize,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_dependencies<I, S>(mut self, dependency_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_ids = dependency_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: WorkPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Something standing in the way of one or more work items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Blocker {
    pub description: String,
    pub blocks_work_item_ids: Vec<String>,
}

/// Binding of a work item to an agent capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentAssignment {
    pub work_item_id: String,
    pub agent_id: String,
    pub capability: String,
    pub rationale: Option<String>,
}

/// What changed between two plan versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanDiff {
    pub added_work_item_ids: Vec<String>,
    pub removed_work_item_ids: Vec<String>,
    pub status_changed_work_item_ids: Vec<String>,
    pub dependency_changed_work_item_ids: Vec<String>,
    pub reassigned_work_item_ids: Vec<String>,
}

impl PlanDiff {
    pub fn is_empty(&self) -> bool {
        self.added_work_item_ids.is_empty()
            && self.removed_work_item_ids.is_empty()
            && self.status_changed_work_item_ids.is_empty()
            && self.dependency_changed_work_item_ids.is_empty()
            && self.reassigned_work_item_ids.is_empty()
    }
}

/// A full plan: the DAG of work plus everything the executor needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskTracking {
    pub summary: String,
    pub all_work: Vec<WorkItem>,
    pub blockers: Vec<Blocker>,
    pub agent_assignments: Vec<AgentAssignment>,
    pub phase: PlanPhase,
    pub strategy_pivots: Vec<String>,
    /// Validated topological order of `all_work` ids.
    pub execution_order: Vec<String>,
    /// Longest dependency chain through the plan.
    pub critical_path: Vec<String>,
    pub plan_rationale: Option<String>,
    pub effort_level: EffortLevel,
    /// Monotonic version, starting at 1.
    pub plan_version: u32,
    pub planned_at: DateTime<Utc>,
    pub last_replan_diff: Option<PlanDiff>,
}

impl Default for TaskTracking {
    fn default() -> Self {
        Self {
            summary: String::new(),
            all_work: Vec::new(),
            blockers: Vec::new(),
            agent_assignments: Vec::new(),
            phase: PlanPhase::default(),
            strategy_pivots: Vec::new(),
            execution_order: Vec::new(),
            critical_path: Vec::new(),
            plan_rationale: None,
            effort_level: EffortLevel::default(),
            plan_version: 1,
            planned_at: Utc::now(),
            last_replan_diff: None,
        }
    }
}

impl TaskTracking {
    pub fn work_item(&self, id: &str) -> Option<&WorkItem> {
        self.all_work.iter().find(|item| item.id == id)
    }

    pub fn work_item_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.all_work.iter_mut().find(|item| item.id == id)
    }

    /// Ids of completed items, in `all_work` order.
    pub fn completed_ids(&self) -> Vec<String> {
        self.all_work
            .iter()
            .filter(|item| item.status == WorkItemStatus::Completed)
            .map(|item| item.id.clone())
            .collect()
    }

    /// True when no item can make further progress.
    pub fn is_settled(&self) -> bool {
        self.all_work.iter().all(|item| {
            matches!(
                item.status,
                WorkItemStatus::Completed | WorkItemStatus::Failed | WorkItemStatus::Cancelled
            )
        })
    }
}
