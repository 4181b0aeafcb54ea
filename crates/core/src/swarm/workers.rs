//! # Worker Lifecycle
//!
//! Spawns one worker per task and supervises it until it has left exactly one
//! terminal message (`task_complete`, `task_blocked` or `error`) on the bus.
//!
//! Workers are either in-process ([`Worker`] implementations) or external
//! processes ([`ProcessSpec`]). External workers learn where to report from
//! their environment and use `baton report` (a [`WorkerReporter`]) to do so.
//! Whatever a worker does, the supervisor guarantees the terminal message:
//! timeouts, panics and silent exits are reported as `error` on its behalf.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{BatonError, Result};
use crate::state::io::{RuntimePaths, RUNTIME_PATH_ENV};
use crate::state::messages::{Message, MessageBus, MessageType, COORDINATOR};
use crate::state::tasks::{Task, TaskGraphStore, TaskId, TaskStatus};

use super::quality::QualityReport;

pub const SESSION_ID_ENV: &str = "BATON_SESSION_ID";
pub const TASK_ID_ENV: &str = "BATON_TASK_ID";
pub const ROLE_ENV: &str = "BATON_ROLE";
pub const CONTEXT_REF_ENV: &str = "BATON_CONTEXT_REF";

/// How a spawn relates to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Stop-Wait: the caller blocks until the terminal message
    Sync,
    /// Spawn-and-Stop: the caller resumes on the terminal message
    Async,
}

impl std::fmt::Display for SpawnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sync => "sync",
            Self::Async => "async",
        })
    }
}

/// External worker command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides the global worker timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// What an in-process worker hands back on success
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub summary: String,
    pub artifact_ref: Option<String>,
    /// Set by validating workers
    pub quality: Option<QualityReport>,
}

impl WorkerOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn with_quality(mut self, report: QualityReport) -> Self {
        self.quality = Some(report);
        self
    }
}

/// Outcome of a worker's pre-check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    /// The worker cannot start; the task is reported blocked
    Decline(String),
}

/// In-process worker for one role
#[async_trait]
pub trait Worker: Send + Sync {
    async fn preflight(&self, _task: &Task) -> Preflight {
        Preflight::Ready
    }

    async fn execute(&self, task: &Task) -> anyhow::Result<WorkerOutput>;
}

/// How a role is served
#[derive(Clone)]
pub enum WorkerBinding {
    InProcess(Arc<dyn Worker>),
    Process(ProcessSpec),
}

impl std::fmt::Debug for WorkerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("InProcess(..)"),
            Self::Process(spec) => f.debug_tuple("Process").field(spec).finish(),
        }
    }
}

/// Role -> binding
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    bindings: HashMap<String, WorkerBinding>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of external workers, as configured
    pub fn from_specs(specs: &HashMap<String, ProcessSpec>) -> Self {
        specs
            .iter()
            .fold(Self::new(), |registry, (role, spec)| {
                registry.with_process(role, spec.clone())
            })
    }

    pub fn with_worker(mut self, role: &str, worker: impl Worker + 'static) -> Self {
        self.bindings
            .insert(role.to_string(), WorkerBinding::InProcess(Arc::new(worker)));
        self
    }

    pub fn with_process(mut self, role: &str, spec: ProcessSpec) -> Self {
        self.bindings
            .insert(role.to_string(), WorkerBinding::Process(spec));
        self
    }

    pub fn get(&self, role: &str) -> Result<&WorkerBinding> {
        self.bindings
            .get(role)
            .ok_or_else(|| BatonError::UnknownRole(role.to_string()))
    }

    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.bindings.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }

    /// Fail on the first role without a binding
    pub fn validate<'a>(&self, roles: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for role in roles {
            self.get(role)?;
        }
        Ok(())
    }
}

/// Worker-side half of the bus contract for one task.
///
/// Terminal reports consume the reporter, so a worker holding one can send at
/// most one of them.
#[derive(Debug, Clone)]
pub struct WorkerReporter {
    tasks: TaskGraphStore,
    bus: MessageBus,
    role: String,
    task_id: TaskId,
}

impl WorkerReporter {
    pub fn new(tasks: TaskGraphStore, bus: MessageBus, role: &str, task_id: &str) -> Self {
        Self {
            tasks,
            bus,
            role: role.to_string(),
            task_id: task_id.to_string(),
        }
    }

    /// Reporter for a task of a session on disk (external workers)
    pub fn for_session(paths: &RuntimePaths, session_id: &str, role: &str, task_id: &str) -> Self {
        Self::new(
            TaskGraphStore::new(paths, session_id),
            MessageBus::new(paths, session_id),
            role,
            task_id,
        )
    }

    fn message(&self, kind: MessageType, summary: impl Into<String>) -> Message {
        Message::new(self.role.clone(), COORDINATOR, kind, summary).for_task(self.task_id.clone())
    }

    /// Claim the task (`pending -> in_progress`); repeated claims are no-ops
    pub async fn started(&self) -> Result<Task> {
        let task = self.tasks.get_task(&self.task_id).await?;
        if task.status == TaskStatus::InProgress {
            return Ok(task);
        }
        let task = self
            .tasks
            .update_status(&self.task_id, TaskStatus::InProgress)
            .await?;
        self.bus
            .log(&self.message(MessageType::TaskStarted, format!("{} started", task.subject)))
            .await?;
        Ok(task)
    }

    /// Non-terminal request for a human decision
    pub async fn discuss(&self, summary: &str) -> Result<String> {
        self.bus
            .log(&self.message(MessageType::DiscussionNeeded, summary))
            .await
    }

    /// Finish the task; claims it first if the worker never reported `started`
    pub async fn complete(self, output: WorkerOutput) -> Result<String> {
        self.started().await?;
        self.tasks
            .update_status(&self.task_id, TaskStatus::Completed)
            .await?;

        let mut message = self.message(MessageType::TaskComplete, output.summary);
        if let Some(artifact_ref) = output.artifact_ref {
            message = message.with_ref(artifact_ref);
        }
        if let Some(quality) = output.quality {
            message = message.with_payload(serde_json::to_value(quality)?);
        }
        self.bus.log(&message).await
    }

    /// Decline the task (`pending -> blocked`)
    pub async fn blocked(self, reason: &str) -> Result<String> {
        self.tasks
            .update_status(&self.task_id, TaskStatus::Blocked)
            .await?;
        self.bus
            .log(&self.message(MessageType::TaskBlocked, reason))
            .await
    }

    /// Report an unrecoverable error; an in-progress task is marked failed
    pub async fn error(self, summary: &str) -> Result<String> {
        let task = self.tasks.get_task(&self.task_id).await?;
        if task.status == TaskStatus::InProgress {
            match self
                .tasks
                .update_status(&self.task_id, TaskStatus::Failed)
                .await
            {
                Ok(_) | Err(BatonError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.bus
            .log(&self.message(MessageType::Error, summary))
            .await
    }
}

/// Lifecycle of a spawned worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    /// Left its own terminal message
    Reported,
    /// Declined in preflight
    Declined,
    TimedOut,
    /// Panicked, failed to start or exited without reporting
    Crashed,
}

/// Transient record of one spawn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub role: String,
    pub task_id: TaskId,
    pub mode: SpawnMode,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
}

/// Aborts the wrapped task when dropped, so an aborted supervisor takes its
/// worker down with it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// How a worker process ended
enum ProcessExit {
    Exited(std::process::ExitStatus),
    /// Waiting on the child failed
    Lost(std::io::Error),
    TimedOut,
}

struct Supervision {
    binding: WorkerBinding,
    task: Task,
    reporter: WorkerReporter,
    bus: MessageBus,
    runtime_root: std::path::PathBuf,
    session_id: String,
    limit: Duration,
    handle: WorkerHandle,
    /// Bus offset when this attempt began; earlier reports belong to
    /// earlier attempts
    since: u64,
}

/// Run `supervision` on its own task so that a panic inside it still ends in
/// a terminal message and a finished handle
async fn supervise(supervision: Supervision) -> WorkerHandle {
    let mut handle = supervision.handle.clone();
    let bus = supervision.bus.clone();
    let reporter = supervision.reporter.clone();
    let since = supervision.since;

    let mut inner = AbortOnDrop(tokio::spawn(supervision.run()));
    match (&mut inner.0).await {
        Ok(finished) => finished,
        Err(e) => {
            tracing::error!(task_id = %handle.task_id, role = %handle.role, error = %e, "Supervisor task failed");
            report_unless_terminal(&bus, reporter, since, &format!("supervisor failed: {e}")).await;
            handle.status = WorkerStatus::Crashed;
            bus.notify();
            handle
        }
    }
}

/// Leave an `error` for the task unless this attempt already ended
async fn report_unless_terminal(bus: &MessageBus, reporter: WorkerReporter, since: u64, summary: &str) {
    let task_id = reporter.task_id.clone();
    match bus.terminal_since(&task_id, since).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(e) = reporter.error(summary).await {
                tracing::error!(task_id = %task_id, error = %e, "Could not report worker error");
            }
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Could not read the bus; reporting error anyway");
            if let Err(e) = reporter.error(summary).await {
                tracing::error!(task_id = %task_id, error = %e, "Could not report worker error");
            }
        }
    }
}

impl Supervision {
    async fn run(mut self) -> WorkerHandle {
        let result = match self.binding.clone() {
            WorkerBinding::InProcess(worker) => self.run_in_process(worker).await,
            WorkerBinding::Process(spec) => self.run_process(&spec).await,
        };

        self.handle.status = match result {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(
                    task_id = %self.handle.task_id,
                    role = %self.handle.role,
                    error = %e,
                    "Worker supervision failed"
                );
                report_unless_terminal(
                    &self.bus,
                    self.reporter.clone(),
                    self.since,
                    &format!("supervisor error: {e}"),
                )
                .await;
                WorkerStatus::Crashed
            }
        };

        tracing::info!(
            worker_id = %self.handle.worker_id,
            task_id = %self.handle.task_id,
            status = ?self.handle.status,
            "Worker finished"
        );
        // Wakes the coordinator even when the report came from another process
        self.bus.notify();
        self.handle
    }

    fn timeout_error(&self) -> BatonError {
        BatonError::WorkerTimeout {
            task_id: self.handle.task_id.clone(),
            role: self.handle.role.clone(),
            after_secs: self.limit.as_secs(),
        }
    }

    async fn run_in_process(&self, worker: Arc<dyn Worker>) -> Result<WorkerStatus> {
        let reporter = self.reporter.clone();
        if let Preflight::Decline(reason) = worker.preflight(&self.task).await {
            reporter.blocked(&reason).await?;
            return Ok(WorkerStatus::Declined);
        }
        let task = reporter.started().await?;

        let mut inner = AbortOnDrop(tokio::spawn(async move { worker.execute(&task).await }));
        match tokio::time::timeout(self.limit, &mut inner.0).await {
            Ok(Ok(Ok(output))) => {
                reporter.complete(output).await?;
                Ok(WorkerStatus::Reported)
            }
            Ok(Ok(Err(e))) => {
                let reported = BatonError::WorkerReported {
                    task_id: self.handle.task_id.clone(),
                    role: self.handle.role.clone(),
                    summary: format!("{e:#}"),
                };
                reporter.error(&reported.to_string()).await?;
                Ok(WorkerStatus::Reported)
            }
            Ok(Err(join)) => {
                reporter.error(&format!("worker panicked: {join}")).await?;
                Ok(WorkerStatus::Crashed)
            }
            Err(_) => {
                drop(inner);
                reporter.error(&self.timeout_error().to_string()).await?;
                Ok(WorkerStatus::TimedOut)
            }
        }
    }

    /// The process claims the task itself (`baton report --kind started`, or
    /// implicitly on `complete`), so it may still decline with `blocked`
    async fn run_process(&self, spec: &ProcessSpec) -> Result<WorkerStatus> {
        let reporter = self.reporter.clone();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env(RUNTIME_PATH_ENV, &self.runtime_root)
            .env(SESSION_ID_ENV, &self.session_id)
            .env(TASK_ID_ENV, &self.task.id)
            .env(ROLE_ENV, &self.handle.role)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(context_ref) = &self.task.context_ref {
            command.env(CONTEXT_REF_ENV, context_ref);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                reporter
                    .error(&format!("failed to start '{}': {}", spec.program, e))
                    .await?;
                return Ok(WorkerStatus::Crashed);
            }
        };

        let exit = match tokio::time::timeout(self.limit, child.wait()).await {
            Ok(Ok(status)) => ProcessExit::Exited(status),
            Ok(Err(e)) => ProcessExit::Lost(e),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(task_id = %self.task.id, error = %e, "Failed to kill timed out worker");
                }
                ProcessExit::TimedOut
            }
        };

        if let Some(terminal) = self.bus.terminal_since(&self.task.id, self.since).await? {
            return Ok(if terminal.kind == MessageType::TaskBlocked {
                WorkerStatus::Declined
            } else {
                WorkerStatus::Reported
            });
        }

        match exit {
            ProcessExit::Exited(status) => {
                reporter
                    .error(&format!("worker exited with {status} without reporting"))
                    .await?;
                Ok(WorkerStatus::Crashed)
            }
            ProcessExit::Lost(e) => {
                reporter
                    .error(&format!("lost track of worker process: {e}"))
                    .await?;
                Ok(WorkerStatus::Crashed)
            }
            ProcessExit::TimedOut => {
                reporter.error(&self.timeout_error().to_string()).await?;
                Ok(WorkerStatus::TimedOut)
            }
        }
    }
}

/// Spawns and tracks the workers of one session
pub struct WorkerLifecycleManager {
    registry: Arc<WorkerRegistry>,
    paths: RuntimePaths,
    session_id: String,
    tasks: TaskGraphStore,
    bus: MessageBus,
    timeout: Duration,
    running: HashMap<TaskId, WorkerHandle>,
    join_set: JoinSet<WorkerHandle>,
    /// Supervisor task -> the task it supervises
    task_ids: HashMap<tokio::task::Id, TaskId>,
}

impl WorkerLifecycleManager {
    /// `bus` must be the coordinator's own handle so in-process reports wake it
    pub fn new(
        registry: Arc<WorkerRegistry>,
        paths: RuntimePaths,
        session_id: &str,
        bus: MessageBus,
        timeout: Duration,
    ) -> Self {
        let tasks = TaskGraphStore::new(&paths, session_id);
        Self {
            registry,
            paths,
            session_id: session_id.to_string(),
            tasks,
            bus,
            timeout,
            running: HashMap::new(),
            join_set: JoinSet::new(),
            task_ids: HashMap::new(),
        }
    }

    async fn prepare(&self, task: Task, mode: SpawnMode) -> Result<Supervision> {
        let binding = self.registry.get(&task.owner)?.clone();
        let since = self.bus.end().await?;
        let limit = match &binding {
            WorkerBinding::Process(ProcessSpec {
                timeout_secs: Some(secs),
                ..
            }) => Duration::from_secs(*secs),
            _ => self.timeout,
        };

        let handle = WorkerHandle {
            worker_id: uuid::Uuid::new_v4().to_string(),
            role: task.owner.clone(),
            task_id: task.id.clone(),
            mode,
            status: WorkerStatus::Running,
            started_at: Utc::now(),
        };
        let reporter =
            WorkerReporter::new(self.tasks.clone(), self.bus.clone(), &task.owner, &task.id);

        tracing::info!(
            worker_id = %handle.worker_id,
            task_id = %task.id,
            role = %task.owner,
            mode = %mode,
            "Spawning worker"
        );

        Ok(Supervision {
            binding,
            task,
            reporter,
            bus: self.bus.clone(),
            runtime_root: self.paths.root().to_path_buf(),
            session_id: self.session_id.clone(),
            limit,
            handle,
            since,
        })
    }

    /// Spawn a worker for `task` in the given mode
    pub async fn spawn(&mut self, task: Task, mode: SpawnMode) -> Result<WorkerHandle> {
        match mode {
            SpawnMode::Sync => self.spawn_sync(task).await,
            SpawnMode::Async => self.spawn_async(task).await,
        }
    }

    /// Returns once the worker has left its terminal message
    pub async fn spawn_sync(&mut self, task: Task) -> Result<WorkerHandle> {
        let supervision = self.prepare(task, SpawnMode::Sync).await?;
        Ok(supervise(supervision).await)
    }

    /// Returns immediately; the worker's terminal message is the only signal
    pub async fn spawn_async(&mut self, task: Task) -> Result<WorkerHandle> {
        let supervision = self.prepare(task, SpawnMode::Async).await?;
        let handle = supervision.handle.clone();
        self.running.insert(handle.task_id.clone(), handle.clone());
        let abort = self.join_set.spawn(supervise(supervision));
        self.task_ids.insert(abort.id(), handle.task_id.clone());
        Ok(handle)
    }

    /// Collect async workers that have finished, without waiting
    pub fn reap(&mut self) -> Vec<WorkerHandle> {
        let mut finished = Vec::new();
        while let Some(result) = self.join_set.try_join_next_with_id() {
            self.collect(result, &mut finished);
        }
        finished
    }

    /// Wait for every async worker to finish
    pub async fn drain(&mut self) -> Vec<WorkerHandle> {
        let mut finished = Vec::new();
        while let Some(result) = self.join_set.join_next_with_id().await {
            self.collect(result, &mut finished);
        }
        finished
    }

    fn collect(
        &mut self,
        result: std::result::Result<(tokio::task::Id, WorkerHandle), tokio::task::JoinError>,
        finished: &mut Vec<WorkerHandle>,
    ) {
        let id = match &result {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        let task_id = self.task_ids.remove(&id);
        match result {
            Ok((_, handle)) => {
                self.running.remove(&handle.task_id);
                finished.push(handle);
            }
            Err(e) => {
                // `supervise` absorbs panics, so only an abort lands here
                tracing::error!(task_id = ?task_id, error = %e, "Supervisor task failed");
                if let Some(mut handle) = task_id.and_then(|id| self.running.remove(&id)) {
                    handle.status = WorkerStatus::Crashed;
                    finished.push(handle);
                }
            }
        }
    }

    /// Kill every running worker; their tasks are recovered on resume
    pub fn abort_all(&mut self) -> Vec<WorkerHandle> {
        self.join_set.abort_all();
        self.join_set.detach_all();
        self.task_ids.clear();
        self.running.drain().map(|(_, handle)| handle).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub fn in_flight_for(&self, role: &str) -> usize {
        self.running.values().filter(|h| h.role == role).count()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.running.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tasks::NewTask;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn execute(&self, task: &Task) -> anyhow::Result<WorkerOutput> {
            Ok(WorkerOutput::new(format!("did {}", task.subject)).with_ref("out.md"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Worker for Broken {
        async fn execute(&self, _task: &Task) -> anyhow::Result<WorkerOutput> {
            anyhow::bail!("compiler exploded")
        }
    }

    struct Slow;

    #[async_trait]
    impl Worker for Slow {
        async fn execute(&self, _task: &Task) -> anyhow::Result<WorkerOutput> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(WorkerOutput::new("late"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Worker for Panics {
        async fn execute(&self, _task: &Task) -> anyhow::Result<WorkerOutput> {
            panic!("worker bug")
        }
    }

    struct Reluctant;

    #[async_trait]
    impl Worker for Reluctant {
        async fn preflight(&self, _task: &Task) -> Preflight {
            Preflight::Decline("missing credentials".into())
        }

        async fn execute(&self, _task: &Task) -> anyhow::Result<WorkerOutput> {
            unreachable!("declined tasks never execute")
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        tasks: TaskGraphStore,
        bus: MessageBus,
        manager: WorkerLifecycleManager,
    }

    async fn fixture(registry: WorkerRegistry, timeout: Duration) -> (Fixture, Task) {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        let tasks = TaskGraphStore::new(&paths, "s1");
        let bus = MessageBus::new(&paths, "s1");
        let task = tasks
            .create_task(NewTask::new("IMPL-001", "executor"))
            .await
            .unwrap();
        let manager =
            WorkerLifecycleManager::new(Arc::new(registry), paths, "s1", bus.clone(), timeout);
        (
            Fixture {
                _dir: dir,
                tasks,
                bus,
                manager,
            },
            task,
        )
    }

    #[test]
    fn test_registry_rejects_unknown_role() {
        let registry = WorkerRegistry::new().with_worker("executor", Echo);
        assert!(registry.validate(["executor"]).is_ok());
        assert!(matches!(
            registry.validate(["executor", "tester"]),
            Err(BatonError::UnknownRole(role)) if role == "tester"
        ));
    }

    #[tokio::test]
    async fn test_sync_spawn_reports_completion() {
        let registry = WorkerRegistry::new().with_worker("executor", Echo);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        let handle = fx.manager.spawn(task, SpawnMode::Sync).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::Reported);
        assert_eq!(
            fx.tasks.get_task("impl-001").await.unwrap().status,
            TaskStatus::Completed
        );
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::TaskComplete);
        assert_eq!(terminal.artifact_ref.as_deref(), Some("out.md"));
    }

    #[tokio::test]
    async fn test_worker_error_marks_failed() {
        let registry = WorkerRegistry::new().with_worker("executor", Broken);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(
            fx.tasks.get_task("impl-001").await.unwrap().status,
            TaskStatus::Failed
        );
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::Error);
        assert!(terminal.summary.contains("compiler exploded"));
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_error() {
        let registry = WorkerRegistry::new().with_worker("executor", Slow);
        let (mut fx, task) = fixture(registry, Duration::from_millis(50)).await;

        let handle = fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::TimedOut);
        assert_eq!(
            fx.tasks.get_task("impl-001").await.unwrap().status,
            TaskStatus::Failed
        );
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert!(terminal.summary.contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let registry = WorkerRegistry::new().with_worker("executor", Panics);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        let handle = fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::Crashed);
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::Error);
    }

    #[tokio::test]
    async fn test_declined_task_is_blocked() {
        let registry = WorkerRegistry::new().with_worker("executor", Reluctant);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        let handle = fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::Declined);
        assert_eq!(
            fx.tasks.get_task("impl-001").await.unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_async_spawn_tracks_in_flight() {
        let registry = WorkerRegistry::new().with_worker("executor", Echo);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        fx.manager.spawn(task, SpawnMode::Async).await.unwrap();
        assert_eq!(fx.manager.in_flight_for("executor"), 1);
        assert!(fx.manager.is_running("impl-001"));

        let finished = fx.manager.drain().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(fx.manager.in_flight(), 0);
        assert!(fx.bus.terminal_for("impl-001").await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_process_exit_synthesizes_error() {
        let spec = ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            env: BTreeMap::new(),
            timeout_secs: None,
        };
        let registry = WorkerRegistry::new().with_process("executor", spec);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        let handle = fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::Crashed);
        // Never claimed, so it stays pending for the retry to supersede
        assert_eq!(
            fx.tasks.get_task("impl-001").await.unwrap().status,
            TaskStatus::Pending
        );
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::Error);
        assert!(terminal.summary.contains("without reporting"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_process_times_out() {
        let spec = ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
            env: BTreeMap::new(),
            timeout_secs: None,
        };
        let registry = WorkerRegistry::new().with_process("executor", spec);
        let (mut fx, task) = fixture(registry, Duration::from_millis(100)).await;

        let handle = fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::TimedOut);
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_earlier_attempt_report_does_not_count() {
        let spec = ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 0".into()],
            env: BTreeMap::new(),
            timeout_secs: None,
        };
        let registry = WorkerRegistry::new().with_process("executor", spec);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        // A previous attempt was declined and then force-unblocked
        WorkerReporter::new(fx.tasks.clone(), fx.bus.clone(), "executor", "impl-001")
            .blocked("no creds")
            .await
            .unwrap();
        fx.tasks.force_unblock("impl-001").await.unwrap();

        let handle = fx.manager.spawn_sync(task).await.unwrap();
        assert_eq!(handle.status, WorkerStatus::Crashed);
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::Error);
    }

    struct PanicsInPreflight;

    #[async_trait]
    impl Worker for PanicsInPreflight {
        async fn preflight(&self, _task: &Task) -> Preflight {
            panic!("preflight bug")
        }

        async fn execute(&self, _task: &Task) -> anyhow::Result<WorkerOutput> {
            unreachable!("preflight never returns")
        }
    }

    #[tokio::test]
    async fn test_supervisor_panic_is_reaped() {
        let registry = WorkerRegistry::new().with_worker("executor", PanicsInPreflight);
        let (mut fx, task) = fixture(registry, Duration::from_secs(5)).await;

        fx.manager.spawn_async(task).await.unwrap();
        let finished = fx.manager.drain().await;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, WorkerStatus::Crashed);
        assert_eq!(fx.manager.in_flight(), 0);
        let terminal = fx.bus.terminal_for("impl-001").await.unwrap().unwrap();
        assert_eq!(terminal.kind, MessageType::Error);
    }

    #[tokio::test]
    async fn test_complete_claims_unclaimed_task() {
        let (fx, _task) = fixture(WorkerRegistry::new(), Duration::from_secs(5)).await;
        let reporter = WorkerReporter::new(fx.tasks.clone(), fx.bus.clone(), "executor", "impl-001");

        reporter.complete(WorkerOutput::new("done")).await.unwrap();
        assert_eq!(
            fx.tasks.get_task("impl-001").await.unwrap().status,
            TaskStatus::Completed
        );
        let kinds: Vec<MessageType> = fx
            .bus
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MessageType::TaskStarted, MessageType::TaskComplete]);
    }
}
