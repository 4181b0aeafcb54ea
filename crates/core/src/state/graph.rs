//! # Graph Algorithms
//!
//! Pure functions over task sets: cycle detection, supersession chains,
//! readiness and resume reconciliation. Nothing here touches the filesystem.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::tasks::{NewTask, Task, TaskId, TaskStatus};

/// Detects a cycle in a dependency map (`task -> tasks it waits on`) using DFS.
/// Returns the offending path, first node repeated at the end.
pub fn detect_cycle(edges: &BTreeMap<TaskId, BTreeSet<TaskId>>) -> Option<Vec<TaskId>> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();

    for node in edges.keys() {
        if dfs_cycle(node, edges, &mut visited, &mut on_stack, &mut path) {
            return Some(path);
        }
    }

    None
}

fn dfs_cycle(
    node: &str,
    edges: &BTreeMap<TaskId, BTreeSet<TaskId>>,
    visited: &mut HashSet<TaskId>,
    on_stack: &mut HashSet<TaskId>,
    path: &mut Vec<TaskId>,
) -> bool {
    if on_stack.contains(node) {
        // Trim the path to the cycle itself
        if let Some(start) = path.iter().position(|n| n == node) {
            path.drain(..start);
        }
        path.push(node.to_string());
        return true;
    }

    if !visited.insert(node.to_string()) {
        return false;
    }

    on_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(deps) = edges.get(node) {
        for dep in deps {
            if dfs_cycle(dep, edges, visited, on_stack, path) {
                return true;
            }
        }
    }

    on_stack.remove(node);
    path.pop();
    false
}

/// Replacement chains: retry, remediation and escalation tasks name the task
/// they stand in for, so dependents follow the newest link of the chain.
#[derive(Debug, Default)]
pub struct Supersession {
    /// original -> replacement
    next: HashMap<TaskId, TaskId>,
    /// replacement -> original
    prev: HashMap<TaskId, TaskId>,
}

impl Supersession {
    pub fn build(tasks: &[Task]) -> Self {
        let mut ordered: Vec<&Task> = tasks.iter().filter(|t| t.replaces.is_some()).collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut chains = Self::default();
        for task in ordered {
            if let Some(original) = &task.replaces {
                // Newest replacement wins if a task was replaced twice
                chains.next.insert(original.clone(), task.id.clone());
                chains.prev.insert(task.id.clone(), original.clone());
            }
        }
        chains
    }

    pub fn is_superseded(&self, id: &str) -> bool {
        self.next.contains_key(id)
    }

    /// Newest task standing in for `id` (itself if never replaced)
    pub fn head<'a>(&'a self, mut id: &'a str) -> &'a str {
        let mut guard = 0;
        while let Some(next) = self.next.get(id) {
            id = next.as_str();
            guard += 1;
            if guard > self.next.len() {
                break;
            }
        }
        id
    }

    /// First task of the chain `id` belongs to
    pub fn root<'a>(&'a self, mut id: &'a str) -> &'a str {
        let mut guard = 0;
        while let Some(prev) = self.prev.get(id) {
            id = prev.as_str();
            guard += 1;
            if guard > self.prev.len() {
                break;
            }
        }
        id
    }

    /// Ids of the chain starting at `root`, oldest first
    pub fn chain<'a>(&'a self, root: &'a str) -> Vec<&'a str> {
        let mut out = vec![root];
        let mut id = root;
        while let Some(next) = self.next.get(id) {
            if out.len() > self.next.len() {
                break;
            }
            out.push(next.as_str());
            id = next.as_str();
        }
        out
    }
}

/// Whether a dependency is satisfied: the newest task of its chain completed
pub fn dependency_satisfied(
    dep: &str,
    by_id: &HashMap<&str, &Task>,
    chains: &Supersession,
) -> bool {
    by_id
        .get(chains.head(dep))
        .is_some_and(|t| t.status == TaskStatus::Completed)
}

/// Whether a task counts as done for pipeline completion
pub fn is_resolved(task: &Task, by_id: &HashMap<&str, &Task>, chains: &Supersession) -> bool {
    dependency_satisfied(&task.id, by_id, chains)
}

/// Pending, non-superseded tasks whose dependencies are all satisfied,
/// optionally filtered by owner. Ordered by creation time.
pub fn ready_tasks(tasks: &[Task], owner: Option<&str>) -> Vec<Task> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let chains = Supersession::build(tasks);

    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| owner.map_or(true, |o| t.owner == o))
        .filter(|t| !chains.is_superseded(&t.id))
        .filter(|t| {
            t.blocked_by
                .iter()
                .all(|dep| dependency_satisfied(dep, &by_id, &chains))
        })
        .cloned()
        .collect();

    ready.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    ready
}

/// Expected tasks missing from the actual graph, in expected order.
///
/// Used on resume: the pipeline template is the expected graph and whatever
/// survived the interruption is the actual one.
pub fn reconcile(expected: &[NewTask], actual: &[Task]) -> Vec<NewTask> {
    let present: HashSet<&str> = actual.iter().map(|t| t.id.as_str()).collect();
    expected
        .iter()
        .filter(|spec| !present.contains(spec.task_id().as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn edges(pairs: &[(&str, Vec<&str>)]) -> BTreeMap<TaskId, BTreeSet<TaskId>> {
        pairs
            .iter()
            .map(|(k, deps)| (k.to_string(), deps.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    fn task(id: &str, status: TaskStatus, deps: &[&str], offset: i64) -> Task {
        let at = Utc::now() + Duration::milliseconds(offset);
        Task {
            id: id.to_string(),
            subject: id.to_uppercase(),
            owner: "executor".to_string(),
            status,
            blocked_by: deps.iter().map(|d| d.to_string()).collect(),
            context_ref: None,
            phase: "IMPL".to_string(),
            kind: Default::default(),
            replaces: None,
            created_at: at,
            updated_at: at,
            version: 1,
        }
    }

    #[test]
    fn test_no_cycle() {
        let graph = edges(&[
            ("a", vec!["b", "c"]),
            ("b", vec!["d"]),
            ("c", vec!["d"]),
            ("d", vec![]),
        ]);
        assert!(detect_cycle(&graph).is_none());
    }

    #[test]
    fn test_simple_cycle() {
        let graph = edges(&[("a", vec!["b"]), ("b", vec!["c"]), ("c", vec!["a"])]);
        let cycle = detect_cycle(&graph).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_cycle() {
        let graph = edges(&[("a", vec!["a"])]);
        assert_eq!(detect_cycle(&graph).unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_cycle_through_forward_reference() {
        // "b" is only referenced, never declared with its own edges
        let graph = edges(&[("a", vec!["b"]), ("c", vec!["a"])]);
        assert!(detect_cycle(&graph).is_none());

        let graph = edges(&[("a", vec!["b"]), ("b", vec!["a"])]);
        assert!(detect_cycle(&graph).is_some());
    }

    #[test]
    fn test_ready_respects_dependencies() {
        let tasks = vec![
            task("a", TaskStatus::Completed, &[], 0),
            task("b", TaskStatus::Pending, &["a"], 1),
            task("c", TaskStatus::Pending, &["b"], 2),
        ];
        let ready = ready_tasks(&tasks, None);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "b");
    }

    #[test]
    fn test_ready_follows_replacement_chain() {
        let mut retry = task("a-r1", TaskStatus::Pending, &[], 5);
        retry.replaces = Some("a".to_string());
        let tasks = vec![
            task("a", TaskStatus::Failed, &[], 0),
            task("b", TaskStatus::Pending, &["a"], 1),
            retry,
        ];

        let ready: Vec<String> = ready_tasks(&tasks, None).into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["a-r1"]);

        let mut done = tasks.clone();
        done[2].status = TaskStatus::Completed;
        let ready: Vec<String> = ready_tasks(&done, None).into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn test_superseded_pending_task_is_never_ready() {
        let mut retry = task("a-r1", TaskStatus::Pending, &[], 5);
        retry.replaces = Some("a".to_string());
        let tasks = vec![task("a", TaskStatus::Pending, &[], 0), retry];

        let ready: Vec<String> = ready_tasks(&tasks, None).into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["a-r1"]);
    }

    #[test]
    fn test_chain_navigation() {
        let mut r1 = task("a-r1", TaskStatus::Failed, &[], 1);
        r1.replaces = Some("a".into());
        let mut r2 = task("a-r2", TaskStatus::Pending, &[], 2);
        r2.replaces = Some("a-r1".into());
        let tasks = vec![task("a", TaskStatus::Failed, &[], 0), r1, r2];

        let chains = Supersession::build(&tasks);
        assert_eq!(chains.head("a"), "a-r2");
        assert_eq!(chains.root("a-r2"), "a");
        assert_eq!(chains.chain("a"), vec!["a", "a-r1", "a-r2"]);
    }

    #[test]
    fn test_reconcile_returns_missing_only() {
        let expected = vec![
            NewTask::new("PLAN-001", "planner"),
            NewTask::new("IMPL-001", "executor").with_deps(["plan-001"]),
            NewTask::new("TEST-001", "tester").with_deps(["impl-001"]),
        ];
        let actual = vec![task("plan-001", TaskStatus::Completed, &[], 0)];

        let missing: Vec<String> = reconcile(&expected, &actual)
            .into_iter()
            .map(|t| t.subject)
            .collect();
        assert_eq!(missing, vec!["IMPL-001", "TEST-001"]);
        assert!(reconcile(&expected[..1], &actual).is_empty());
    }
}
