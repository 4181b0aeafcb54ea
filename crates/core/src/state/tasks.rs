//! # Task Graph Store
//!
//! Durable dependency graph of a session's units of work.
//!
//! Each task lives in `tasks/<task_id>.json` and is updated by its owning
//! worker through optimistic version checks. Structure (which tasks exist and
//! what they wait on) lives in `tasks/graph.json`, a single versioned index, so
//! the cycle check always runs against a consistent snapshot of every edge.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::graph::{self, Supersession};
use super::io::{list_names, RuntimePaths};
use super::versioned::VersionedFile;
use crate::error::{BatonError, Result};

pub type TaskId = String;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Transitions a worker may perform on its own task
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Pending, Self::Blocked)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Materialised from the pipeline template
    #[default]
    Work,
    /// Another attempt at a failed task
    Retry,
    /// Fix for defects found by a validator
    Remediation,
    /// Re-run of a validator after remediation
    Revalidation,
    /// Handed to the escalation role after retries ran out
    Escalation,
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Phase-prefixed identifier, e.g. `PLAN-101`
    pub subject: String,
    /// Role that owns the task
    pub owner: String,
    pub status: TaskStatus,
    #[serde(rename = "blockedBy")]
    pub blocked_by: BTreeSet<TaskId>,
    /// Opaque pointer to the task's input artifact
    #[serde(default)]
    pub context_ref: Option<String>,
    pub phase: String,
    #[serde(default)]
    pub kind: TaskKind,
    /// Task this one stands in for
    #[serde(default)]
    pub replaces: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Record version, filled in on load
    #[serde(skip)]
    pub version: u64,
}

/// Arguments for [`TaskGraphStore::create_task`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub subject: String,
    pub owner: String,
    pub deps: BTreeSet<TaskId>,
    pub context_ref: Option<String>,
    pub phase: Option<String>,
    pub kind: TaskKind,
    pub replaces: Option<TaskId>,
}

impl NewTask {
    pub fn new(subject: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            owner: owner.into(),
            deps: BTreeSet::new(),
            context_ref: None,
            phase: None,
            kind: TaskKind::Work,
            replaces: None,
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context_ref: impl Into<String>) -> Self {
        self.context_ref = Some(context_ref.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    /// Mark the new task as standing in for `original`
    pub fn replacing(mut self, original: impl Into<TaskId>, kind: TaskKind) -> Self {
        self.replaces = Some(original.into());
        self.kind = kind;
        self
    }

    /// Id the task will be stored under
    pub fn task_id(&self) -> TaskId {
        task_id_for(&self.subject)
    }
}

/// Derive the task id from its subject: lowercase, non-alphanumerics as `-`
pub fn task_id_for(subject: &str) -> TaskId {
    let mut id = String::with_capacity(subject.len());
    for c in subject.trim().chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.ends_with('-') {
            id.push('-');
        }
    }
    id.trim_matches('-').to_string()
}

/// Phase prefix of a subject (`PLAN-101` -> `PLAN`)
pub fn phase_of(subject: &str) -> &str {
    subject.split('-').next().unwrap_or(subject)
}

fn subject_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Z][A-Z0-9]*(-[A-Za-z0-9]+)+$").expect("subject pattern is valid")
    })
}

/// Structural index: every task and the tasks it waits on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphIndex {
    pub edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

/// Task counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskSummary {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut summary = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

/// Store for one session's task graph
#[derive(Debug, Clone)]
pub struct TaskGraphStore {
    dir: PathBuf,
    index: VersionedFile<GraphIndex>,
}

impl TaskGraphStore {
    /// Store for the tasks of an active session
    pub fn new(paths: &RuntimePaths, session_id: &str) -> Self {
        Self::at(paths.tasks_dir(session_id))
    }

    /// Store rooted at an explicit tasks directory (used on archived sessions)
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let index = VersionedFile::new(dir.join("graph.json"), "task graph");
        Self { dir, index }
    }

    fn task_file(&self, id: &str) -> VersionedFile<Task> {
        VersionedFile::new(self.dir.join(format!("{id}.json")), format!("task {id}"))
    }

    /// Create a task. Dependencies may name tasks that do not exist yet.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        if !subject_pattern().is_match(&new.subject) {
            return Err(BatonError::validation(format!(
                "task subject '{}' must look like PHASE-123",
                new.subject
            )));
        }
        if new.owner.trim().is_empty() {
            return Err(BatonError::validation("task owner must not be empty"));
        }

        let id = new.task_id();
        let mut exists = false;

        self.index
            .update(|current| {
                let mut index = current.cloned().unwrap_or_default();
                if index.edges.contains_key(&id) {
                    exists = true;
                    return Ok(None);
                }
                index.edges.insert(id.clone(), new.deps.clone());
                if let Some(path) = graph::detect_cycle(&index.edges) {
                    return Err(BatonError::DependencyCycle { path });
                }
                Ok(Some(index))
            })
            .await?;

        let file = self.task_file(&id);
        if exists && file.load().await?.is_some() {
            return Err(BatonError::DuplicateSubject {
                subject: new.subject,
            });
        }

        let edges = self.edges_of(&id).await?.unwrap_or_else(|| new.deps.clone());
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            phase: new
                .phase
                .clone()
                .unwrap_or_else(|| phase_of(&new.subject).to_string()),
            subject: new.subject.clone(),
            owner: new.owner,
            status: TaskStatus::Pending,
            blocked_by: edges,
            context_ref: new.context_ref,
            kind: new.kind,
            replaces: new.replaces,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        match file.create(task).await {
            Ok(mut record) => {
                record.data.version = record.version;
                if exists {
                    tracing::warn!(task_id = %id, "Repaired task missing its record");
                }
                tracing::debug!(task_id = %id, owner = %record.data.owner, "Task created");
                Ok(record.data)
            }
            Err(BatonError::StaleWrite { .. }) => Err(BatonError::DuplicateSubject {
                subject: new.subject,
            }),
            Err(e) => Err(e),
        }
    }

    async fn edges_of(&self, id: &str) -> Result<Option<BTreeSet<TaskId>>> {
        Ok(self
            .index
            .load()
            .await?
            .and_then(|index| index.data.edges.get(id).cloned()))
    }

    /// Add an edge `task_id` waits on `dep_id`; the task must still be pending
    pub async fn add_dependency(&self, task_id: &str, dep_id: &str) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(BatonError::validation(format!(
                "cannot add dependencies to {} task '{}'",
                task.status, task_id
            )));
        }

        self.index
            .update(|current| {
                let mut index = current.cloned().unwrap_or_default();
                let deps = index.edges.entry(task_id.to_string()).or_default();
                if !deps.insert(dep_id.to_string()) {
                    return Ok(None);
                }
                if let Some(path) = graph::detect_cycle(&index.edges) {
                    return Err(BatonError::DependencyCycle { path });
                }
                Ok(Some(index))
            })
            .await?;

        self.modify(task_id, |task| {
            if task.blocked_by.insert(dep_id.to_string()) {
                task.updated_at = Utc::now();
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let record = self
            .task_file(id)
            .load()
            .await?
            .ok_or_else(|| BatonError::TaskNotFound(id.to_string()))?;

        // The index is authoritative for edges
        let mut task = record.data;
        task.version = record.version;
        if let Some(edges) = self.edges_of(id).await? {
            task.blocked_by.extend(edges);
        }
        Ok(task)
    }

    /// Every task with a record, oldest first
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let index = self.index.load().await?.map(|r| r.data).unwrap_or_default();
        let mut ids: BTreeSet<TaskId> = index.edges.keys().cloned().collect();

        // Records written before their index entry (older layouts, manual edits)
        for name in list_names(&self.dir, false).await? {
            if let Some(id) = name.strip_suffix(".json") {
                if id != "graph" {
                    ids.insert(id.to_string());
                }
            }
        }

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            match self.task_file(&id).load().await? {
                Some(record) => {
                    let mut task = record.data;
                    task.version = record.version;
                    if let Some(edges) = index.edges.get(&id) {
                        task.blocked_by.extend(edges.iter().cloned());
                    }
                    tasks.push(task);
                }
                None => tracing::debug!(task_id = %id, "Indexed task has no record yet"),
            }
        }

        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Ready tasks, optionally for a single owner
    pub async fn list_ready(&self, owner: Option<&str>) -> Result<Vec<Task>> {
        let tasks = self.list_tasks().await?;
        Ok(graph::ready_tasks(&tasks, owner))
    }

    /// Apply a worker's status transition
    pub async fn update_status(&self, task_id: &str, new_status: TaskStatus) -> Result<Task> {
        self.modify(task_id, |task| {
            if !task.status.can_transition_to(new_status) {
                return Err(BatonError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status.to_string(),
                    to: new_status.to_string(),
                });
            }
            task.status = new_status;
            task.updated_at = Utc::now();
            Ok(true)
        })
        .await
    }

    /// Coordinator-side unblock: `blocked -> pending`, only once every
    /// dependency is satisfied
    pub async fn force_unblock(&self, task_id: &str) -> Result<Task> {
        let tasks = self.list_tasks().await?;
        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let chains = Supersession::build(&tasks);
        let task = tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| BatonError::TaskNotFound(task_id.to_string()))?;

        if let Some(dep) = task
            .blocked_by
            .iter()
            .find(|dep| !graph::dependency_satisfied(dep, &by_id, &chains))
        {
            return Err(BatonError::validation(format!(
                "cannot unblock '{}': dependency '{}' is not completed",
                task_id, dep
            )));
        }

        self.modify(task_id, |task| {
            if task.status != TaskStatus::Blocked {
                return Err(BatonError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status.to_string(),
                    to: TaskStatus::Pending.to_string(),
                });
            }
            task.status = TaskStatus::Pending;
            task.updated_at = Utc::now();
            Ok(true)
        })
        .await
    }

    pub async fn summary(&self) -> Result<TaskSummary> {
        Ok(TaskSummary::from_tasks(&self.list_tasks().await?))
    }

    /// Read-modify-write of one task record; `f` returns whether it changed
    async fn modify<F>(&self, task_id: &str, mut f: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<bool>,
    {
        let record = self
            .task_file(task_id)
            .update(|current| {
                let Some(current) = current else {
                    return Err(BatonError::TaskNotFound(task_id.to_string()));
                };
                let mut task = current.clone();
                Ok(if f(&mut task)? { Some(task) } else { None })
            })
            .await?
            .ok_or_else(|| BatonError::TaskNotFound(task_id.to_string()))?;
        let mut task = record.data;
        task.version = record.version;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path) -> TaskGraphStore {
        TaskGraphStore::new(&RuntimePaths::new(dir), "s1")
    }

    #[test]
    fn test_task_id_for_subject() {
        assert_eq!(task_id_for("PLAN-101"), "plan-101");
        assert_eq!(task_id_for("TEST-001-FIX1"), "test-001-fix1");
        assert_eq!(task_id_for(" IMPL 2 "), "impl-2");
        assert_eq!(phase_of("REVIEW-003"), "REVIEW");
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        let all = [Pending, InProgress, Blocked, Completed, Failed];
        let legal = [
            (Pending, InProgress),
            (InProgress, Completed),
            (InProgress, Failed),
            (Pending, Blocked),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let task = store
            .create_task(NewTask::new("PLAN-101", "planner").with_context("docs/plan.md"))
            .await
            .unwrap();
        assert_eq!(task.id, "plan-101");
        assert_eq!(task.phase, "PLAN");
        assert_eq!(task.status, TaskStatus::Pending);

        let loaded = store.get_task("plan-101").await.unwrap();
        assert_eq!(loaded.context_ref.as_deref(), Some("docs/plan.md"));
    }

    #[tokio::test]
    async fn test_duplicate_subject_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .create_task(NewTask::new("PLAN-101", "planner"))
            .await
            .unwrap();
        let err = store
            .create_task(NewTask::new("PLAN-101", "executor"))
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::DuplicateSubject { .. }));
    }

    #[tokio::test]
    async fn test_malformed_subject_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        for subject in ["plan-1", "PLAN", "PLAN-", "-PLAN-1"] {
            let err = store
                .create_task(NewTask::new(subject, "planner"))
                .await
                .unwrap_err();
            assert!(matches!(err, BatonError::Validation(_)), "{subject}");
        }
    }

    #[tokio::test]
    async fn test_cycle_rejected_and_graph_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .create_task(NewTask::new("IMPL-001", "executor").with_deps(["test-001"]))
            .await
            .unwrap();
        let err = store
            .create_task(NewTask::new("TEST-001", "tester").with_deps(["impl-001"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::DependencyCycle { .. }));

        let self_loop = store
            .create_task(NewTask::new("PLAN-001", "planner").with_deps(["plan-001"]))
            .await
            .unwrap_err();
        assert!(matches!(self_loop, BatonError::DependencyCycle { .. }));

        assert_eq!(store.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_dependency_cycle_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store.create_task(NewTask::new("PLAN-001", "planner")).await.unwrap();
        store
            .create_task(NewTask::new("IMPL-001", "executor").with_deps(["plan-001"]))
            .await
            .unwrap();

        let err = store.add_dependency("plan-001", "impl-001").await.unwrap_err();
        assert!(matches!(err, BatonError::DependencyCycle { .. }));

        store.create_task(NewTask::new("RESEARCH-001", "analyst")).await.unwrap();
        let task = store.add_dependency("plan-001", "research-001").await.unwrap();
        assert!(task.blocked_by.contains("research-001"));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create_task(NewTask::new("PLAN-001", "planner")).await.unwrap();

        let err = store
            .update_status("plan-001", TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, BatonError::InvalidTransition { .. }));

        store
            .update_status("plan-001", TaskStatus::InProgress)
            .await
            .unwrap();
        let done = store
            .update_status("plan-001", TaskStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let again = store
            .update_status("plan-001", TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(again, BatonError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_force_unblock_requires_satisfied_edges() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.create_task(NewTask::new("PLAN-001", "planner")).await.unwrap();
        store
            .create_task(NewTask::new("IMPL-001", "executor").with_deps(["plan-001"]))
            .await
            .unwrap();
        store
            .update_status("impl-001", TaskStatus::Blocked)
            .await
            .unwrap();

        assert!(store.force_unblock("impl-001").await.is_err());

        store
            .update_status("plan-001", TaskStatus::InProgress)
            .await
            .unwrap();
        store
            .update_status("plan-001", TaskStatus::Completed)
            .await
            .unwrap();
        let task = store.force_unblock("impl-001").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_repairs_task_indexed_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        // Crash between the index write and the record write
        store
            .index
            .update(|current| {
                let mut index = current.cloned().unwrap_or_default();
                index.edges.insert("plan-001".to_string(), BTreeSet::new());
                Ok(Some(index))
            })
            .await
            .unwrap();
        assert!(store.list_tasks().await.unwrap().is_empty());

        let repaired = store
            .create_task(NewTask::new("PLAN-001", "planner"))
            .await
            .unwrap();
        assert_eq!(repaired.id, "plan-001");
        assert_eq!(store.summary().await.unwrap().total, 1);
    }
}
