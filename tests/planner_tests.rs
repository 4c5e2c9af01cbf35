use agentfabric::chat_history::ChatHistoryProvider;
use agentfabric::completion::{ChatMessage, CompletionClient, Role};
use agentfabric::plan::{TaskTracking, WorkItem, WorkItemStatus};
use agentfabric::planner::{AgentProfile, StatusUpdate, TaskPlanner};
use agentfabric::state::AgentStateCell;
use async_trait::async_trait;
use fabric::{MemoryStateStore, StateStore};
use std::sync::Arc;

/// Routes prompts to canned answers by recognizing which planner call is
/// being made.
struct ScriptedPlannerModel {
    work_items_json: String,
    assignments_json: String,
}

impl ScriptedPlannerModel {
    fn new(work_items_json: &str, assignments_json: &str) -> Arc<Self> {
        Arc::new(Self {
            work_items_json: work_items_json.to_string(),
            assignments_json: assignments_json.to_string(),
        })
    }
}

#[async_trait]
impl CompletionClient for ScriptedPlannerModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ChatMessage, Box<dyn std::error::Error + Send + Sync>> {
        let prompt = messages
            .last()
            .map(|message| message.display_text())
            .unwrap_or_default();
        let reply = if prompt.contains("Summarize the current status") {
            "Collect the data, then report on it.".to_string()
        } else if prompt.contains("Decompose the objective") {
            self.work_items_json.clone()
        } else if prompt.contains("Which phase is this effort in") {
            r#"{"phase": "execution", "strategyPivots": ["switched data source"]}"#.to_string()
        } else if prompt.contains("Bind every work item") {
            self.assignments_json.clone()
        } else if prompt.contains("should be removed") {
            r#"{"removeWorkItemIds": [], "planRationale": "small linear plan"}"#.to_string()
        } else if prompt.contains("Return the updated plan") {
            return Err("replanner model unavailable".into());
        } else {
            return Err(format!("unexpected prompt: {}", prompt).into());
        };
        Ok(ChatMessage::text(Role::Assistant, reply))
    }

    fn model_name(&self) -> &str {
        "mock-planner"
    }
}

fn roster() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            agent_id: "collector".into(),
            capabilities: vec!["search".into(), "fetch".into()],
            description: Some("Finds and fetches data".into()),
        },
        AgentProfile {
            agent_id: "writer".into(),
            capabilities: vec!["summarize".into()],
            description: None,
        },
    ]
}

async fn forked_history() -> (Arc<AgentStateCell>, ChatHistoryProvider) {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let cell = Arc::new(AgentStateCell::load(store, "u1:plan").await);
    let provider = ChatHistoryProvider::new(Arc::clone(&cell), "planner");
    (cell, provider)
}

#[tokio::test]
async fn plan_builds_a_validated_bound_plan() {
    // The work-items answer arrives the way real models send it: wrapped in
    // prose with stray braces and a markdown fence around the actual JSON.
    let work_items_json = format!(
        "Here is the decomposition {{as requested}}:\n```json\n{}\n```\nLet me know.",
        r#"{"workItems": [
            {"id": "wi-001", "title": "Fetch sources", "description": "Pull the dataset",
             "dependencyIds": [], "successCriteria": "rows on disk", "estimatedComplexity": "low"},
            {"id": "wi-002", "title": "Write report", "description": "Summarize findings",
             "dependencyIds": ["wi-001", "wi-404"], "successCriteria": "report text"}
        ], "blockers": [{"description": "api quota", "blocksWorkItemIds": ["wi-001"]}]}"#
    );
    let model = ScriptedPlannerModel::new(
        &work_items_json,
        r#"{"assignments": [
            {"workItemId": "wi-001", "agentId": "collector", "capability": "fetch", "rationale": "data work"},
            {"workItemId": "wi-002", "agentId": "writer", "capability": "summarize", "rationale": "writing work"}
        ]}"#,
    );
    let planner = TaskPlanner::new(model, roster());
    let (_cell, provider) = forked_history().await;
    let fork = provider.fork().await;

    let (plan, report) = planner.plan(&fork, "produce a report").await.unwrap();

    assert_eq!(plan.summary, "Collect the data, then report on it.");
    assert_eq!(plan.plan_version, 1);
    assert_eq!(plan.all_work.len(), 2);
    assert_eq!(plan.execution_order, vec!["wi-001", "wi-002"]);
    assert!(!report.has_cycles);

    // The dangling wi-404 dependency never survives normalization.
    let report_item = plan.work_item("wi-002").unwrap();
    assert_eq!(report_item.dependency_ids, vec!["wi-001"]);
    assert_eq!(report_item.owner.as_deref(), Some("writer"));
    assert_eq!(plan.blockers.len(), 1);
    assert_eq!(plan.strategy_pivots, vec!["switched data source"]);
    assert_eq!(plan.agent_assignments.len(), 2);
}

#[tokio::test]
async fn items_without_an_exact_capability_binding_are_removed() {
    let model = ScriptedPlannerModel::new(
        r#"{"workItems": [
            {"id": "wi-001", "title": "Fetch", "description": "d", "dependencyIds": []},
            {"id": "wi-002", "title": "Interview humans", "description": "d", "dependencyIds": []}
        ], "blockers": []}"#,
        // wi-002's capability is not in the collector's list, so the
        // binding is dropped and the item falls out of the plan.
        r#"{"assignments": [
            {"workItemId": "wi-001", "agentId": "collector", "capability": "fetch"},
            {"workItemId": "wi-002", "agentId": "collector", "capability": "interviewing"}
        ]}"#,
    );
    let planner = TaskPlanner::new(model, roster());
    let (_cell, provider) = forked_history().await;
    let fork = provider.fork().await;

    let (plan, _) = planner.plan(&fork, "objective").await.unwrap();

    assert_eq!(plan.all_work.len(), 1);
    assert_eq!(plan.all_work[0].id, "wi-001");
    assert_eq!(plan.agent_assignments.len(), 1);
}

#[tokio::test]
async fn planner_traffic_stays_on_the_fork() {
    let model = ScriptedPlannerModel::new(
        r#"{"workItems": [], "blockers": []}"#,
        r#"{"assignments": []}"#,
    );
    let planner = TaskPlanner::new(model, roster());
    let (cell, provider) = forked_history().await;
    let fork = provider.fork().await;

    planner.plan(&fork, "objective").await.unwrap();

    // The fork recorded the planning turn; the real thread did not.
    assert!(!fork.new_messages().await.is_empty());
    assert!(cell.thread_messages("planner").await.is_empty());
}

fn settled_plan() -> TaskTracking {
    let mut first = WorkItem::new("wi-001", "fetch");
    first.owner = Some("collector".into());
    first.status = WorkItemStatus::Completed;
    first.result = Some("42 rows".into());
    let mut second = WorkItem::new("wi-002", "report").with_dependencies(["wi-001"]);
    second.owner = Some("writer".into());
    let mut plan = TaskTracking {
        summary: "fetch then report".into(),
        all_work: vec![first, second],
        ..Default::default()
    };
    agentfabric::plan_validator::validate(&mut plan);
    plan
}

#[tokio::test]
async fn empty_status_updates_only_bump_the_version() {
    let model = ScriptedPlannerModel::new("{}", "{}");
    let planner = TaskPlanner::new(model, roster());
    let previous = settled_plan();

    let (next, _) = planner.replan(&previous, &[], None).await.unwrap();

    assert_eq!(next.plan_version, previous.plan_version + 1);
    assert_eq!(next.all_work, previous.all_work);
    assert_eq!(next.execution_order, previous.execution_order);
    assert_eq!(next.summary, previous.summary);
    assert!(next.last_replan_diff.unwrap().is_empty());
}

#[tokio::test]
async fn replan_applies_status_updates_in_code_when_the_model_fails() {
    // ScriptedPlannerModel fails the "Return the updated plan" call, so the
    // replanner must fall back to the code-applied update.
    let model = ScriptedPlannerModel::new("{}", r#"{"assignments": []}"#);
    let planner = TaskPlanner::new(model, roster());
    let previous = settled_plan();

    let updates = vec![StatusUpdate {
        work_item_id: "wi-002".into(),
        new_status: WorkItemStatus::Completed,
        result: Some("report.md written".into()),
    }];
    let (next, _) = planner.replan(&previous, &updates, None).await.unwrap();

    assert_eq!(next.plan_version, previous.plan_version + 1);
    let item = next.work_item("wi-002").unwrap();
    assert_eq!(item.status, WorkItemStatus::Completed);
    assert_eq!(item.result.as_deref(), Some("report.md written"));

    let diff = next.last_replan_diff.unwrap();
    assert_eq!(diff.status_changed_work_item_ids, vec!["wi-002"]);
    assert!(diff.added_work_item_ids.is_empty());
    assert!(diff.removed_work_item_ids.is_empty());
}

#[tokio::test]
async fn replan_diff_laws_hold() {
    let model = ScriptedPlannerModel::new("{}", r#"{"assignments": []}"#);
    let planner = TaskPlanner::new(model, roster());
    let previous = settled_plan();

    let updates = vec![StatusUpdate {
        work_item_id: "wi-002".into(),
        new_status: WorkItemStatus::Failed,
        result: Some("agent gave up".into()),
    }];
    let (next, _) = planner.replan(&previous, &updates, None).await.unwrap();

    let diff = next.last_replan_diff.clone().unwrap();
    let added: std::collections::HashSet<_> = diff.added_work_item_ids.iter().collect();
    let removed: std::collections::HashSet<_> = diff.removed_work_item_ids.iter().collect();
    assert!(added.is_disjoint(&removed));
    for id in &diff.reassigned_work_item_ids {
        let before = previous.work_item(id).map(|item| item.owner.clone());
        let after = next.work_item(id).map(|item| item.owner.clone());
        assert_ne!(before, after);
    }
}
