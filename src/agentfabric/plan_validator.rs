//! Deterministic plan repair and ordering.
//!
//! Model-produced plans arrive with duplicate ids, dangling references, and
//! occasionally cycles. [`validate`] fixes a [`TaskTracking`] in place and
//! recomputes its ordering, so every plan the executor touches satisfies:
//!
//! 1. ids in `all_work` are unique (last occurrence wins);
//! 2. every reference (dependencies, parents, blockers, assignments) points
//!    at a real id;
//! 3. the dependency graph is acyclic (back edges removed);
//! 4. `execution_order` is a topological extension of the dependencies,
//!    with ties broken by status rank, then priority, then id;
//! 5. `critical_path` is the longest dependency chain, listed in execution
//!    order;
//! 6. each item's `execution_order` field is its 1-based position.
//!
//! The validator always wins over whatever ordering the model proposed.

use crate::agentfabric::plan::{TaskTracking, WorkItem};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// What the validator had to repair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanValidation {
    /// Whether the validated plan still contains cycles (always `false`; a
    /// back edge is removed for every cycle found).
    pub has_cycles: bool,
    /// Dependency edges `(item, dependency)` removed to break cycles.
    pub broken_edges: Vec<(String, String)>,
    /// Duplicate work-item ids dropped (earlier occurrences).
    pub removed_duplicates: usize,
    /// Dangling references filtered out of dependencies, parents, blockers,
    /// and assignments.
    pub dropped_references: usize,
}

/// Repair `plan` in place and recompute its ordering.
pub fn validate(plan: &mut TaskTracking) -> PlanValidation {
    let mut report = PlanValidation::default();

    dedupe_work_items(plan, &mut report);
    drop_orphan_references(plan, &mut report);
    break_cycles(plan, &mut report);
    let order = topological_order(plan);
    plan.critical_path = critical_path(plan, &order);
    plan.execution_order = order;
    for (position, id) in plan.execution_order.clone().iter().enumerate() {
        if let Some(item) = plan.work_item_mut(id) {
            item.execution_order = position + 1;
        }
    }

    if !report.broken_edges.is_empty() {
        log::warn!(
            "plan validation removed {} cyclic dependency edge(s)",
            report.broken_edges.len()
        );
    }
    report
}

/// Keep the last occurrence of each id.
fn dedupe_work_items(plan: &mut TaskTracking, report: &mut PlanValidation) {
    let mut seen = HashSet::new();
    let mut kept: Vec<WorkItem> = Vec::with_capacity(plan.all_work.len());
    for item in plan.all_work.drain(..).rev() {
        if seen.insert(item.id.clone()) {
            kept.push(item);
        } else {
            report.removed_duplicates += 1;
        }
    }
    kept.reverse();
    plan.all_work = kept;
}

fn drop_orphan_references(plan: &mut TaskTracking, report: &mut PlanValidation) {
    let ids: HashSet<String> = plan.all_work.iter().map(|item| item.id.clone()).collect();

    for item in &mut plan.all_work {
        let before = item.dependency_ids.len();
        item.dependency_ids.retain(|dep| ids.contains(dep));
        report.dropped_references += before - item.dependency_ids.len();

        if let Some(parent) = item.parent_id.as_ref() {
            if !ids.contains(parent) {
                item.parent_id = None;
                report.dropped_references += 1;
            }
        }
    }
    for blocker in &mut plan.blockers {
        let before = blocker.blocks_work_item_ids.len();
        blocker.blocks_work_item_ids.retain(|id| ids.contains(id));
        report.dropped_references += before - blocker.blocks_work_item_ids.len();
    }
    let before = plan.agent_assignments.len();
    plan.agent_assignments
        .retain(|assignment| ids.contains(&assignment.work_item_id));
    report.dropped_references += before - plan.agent_assignments.len();
}

/// Remove one back edge per DFS pass until the graph is clean.
fn break_cycles(plan: &mut TaskTracking, report: &mut PlanValidation) {
    loop {
        let Some((item, dependency)) = find_back_edge(plan) else {
            break;
        };
        if let Some(work_item) = plan.work_item_mut(&item) {
            work_item.dependency_ids.retain(|dep| dep != &dependency);
        }
        report.broken_edges.push((item, dependency));
    }
    report.has_cycles = false;
}

fn find_back_edge(plan: &TaskTracking) -> Option<(String, String)> {
    let deps: BTreeMap<&str, Vec<&str>> = plan
        .all_work
        .iter()
        .map(|item| {
            let mut sorted: Vec<&str> = item.dependency_ids.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            (item.id.as_str(), sorted)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    for node in deps.keys() {
        if !visited.contains(*node) {
            if let Some(edge) = dfs_back_edge(node, &deps, &mut visited, &mut in_stack) {
                return Some(edge);
            }
        }
    }
    None
}

fn dfs_back_edge<'a>(
    node: &'a str,
    deps: &BTreeMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    in_stack: &mut HashSet<&'a str>,
) -> Option<(String, String)> {
    visited.insert(node);
    in_stack.insert(node);
    if let Some(dependencies) = deps.get(node) {
        for dependency in dependencies {
            if in_stack.contains(dependency) {
                return Some((node.to_string(), dependency.to_string()));
            }
            if !visited.contains(dependency) {
                if let Some(edge) = dfs_back_edge(dependency, deps, visited, in_stack) {
                    return Some(edge);
                }
            }
        }
    }
    in_stack.remove(node);
    None
}

/// Kahn's algorithm with a priority-aware ready set: ties break by status
/// rank, then priority, then id.
fn topological_order(plan: &TaskTracking) -> Vec<String> {
    let items: HashMap<&str, &WorkItem> = plan
        .all_work
        .iter()
        .map(|item| (item.id.as_str(), item))
        .collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for item in &plan.all_work {
        in_degree.insert(item.id.as_str(), item.dependency_ids.len());
        for dependency in &item.dependency_ids {
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(item.id.as_str());
        }
    }

    let ready_key = |id: &str| match items.get(id) {
        Some(item) => (item.status.rank(), item.priority.rank(), id.to_string()),
        None => (u8::MAX, u8::MAX, id.to_string()),
    };

    let mut ready: BTreeSet<(u8, u8, String)> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| ready_key(id))
        .collect();

    let mut order = Vec::with_capacity(plan.all_work.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        let id = next.2;
        if let Some(children) = dependents.get(id.as_str()) {
            for child in children.clone() {
                let degree = in_degree.entry(child).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.insert(ready_key(child));
                }
            }
        }
        order.push(id);
    }
    order
}

/// The longest dependency chain: the item with the largest transitive
/// dependency closure, with that closure listed in execution order ahead of
/// it.
fn critical_path(plan: &TaskTracking, execution_order: &[String]) -> Vec<String> {
    let deps: HashMap<&str, &[String]> = plan
        .all_work
        .iter()
        .map(|item| (item.id.as_str(), item.dependency_ids.as_slice()))
        .collect();

    let mut closures: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut ids: Vec<&str> = deps.keys().copied().collect();
    ids.sort_unstable();
    for id in &ids {
        closure_of(id, &deps, &mut closures);
    }

    let mut best: Option<(&str, usize)> = None;
    for id in &ids {
        let weight = closures.get(*id).map(BTreeSet::len).unwrap_or(0) + 1;
        let better = match best {
            Some((_, best_weight)) => weight > best_weight,
            None => true,
        };
        if better {
            best = Some((id, weight));
        }
    }
    let Some((terminal, _)) = best else {
        return Vec::new();
    };

    let members = closures.remove(terminal).unwrap_or_default();
    let mut path: Vec<String> = execution_order
        .iter()
        .filter(|id| members.contains(*id))
        .cloned()
        .collect();
    path.push(terminal.to_string());
    path
}

fn closure_of<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    closures: &mut HashMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    if let Some(existing) = closures.get(id) {
        return existing.clone();
    }
    // Seed before recursing; the validator has already removed cycles, this
    // only guards pathological input.
    closures.insert(id.to_string(), BTreeSet::new());

    let mut members = BTreeSet::new();
    if let Some(direct) = deps.get(id) {
        for dependency in direct.iter() {
            members.insert(dependency.clone());
            members.extend(closure_of(dependency, deps, closures));
        }
    }
    closures.insert(id.to_string(), members.clone());
    members
}
