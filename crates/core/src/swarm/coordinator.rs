//! # Coordinator
//!
//! The single control loop that owns a session: it creates the template's
//! tasks, dispatches ready work to workers, reacts to their terminal messages
//! and decides when the pipeline is done.
//!
//! ```text
//! Init -> Clarify -> CreateSession -> Dispatch -> {Wait | OnCallback | OnUserCommand}
//!      -> PhaseTransition -> ... -> Report -> Idle
//! ```
//!
//! The loop never sleeps on a timer. Between rounds it suspends on the
//! message bus (woken by every append and by worker supervisors) or on the
//! user command channel. Message handling is idempotent: a message whose task
//! was already compensated, gated or resolved is skipped, so duplicate
//! delivery and replay after a crash are harmless.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::error::BatonError;
use crate::state::archive::{ArchivalManager, ArchiveEntry};
use crate::state::graph::{self, Supersession};
use crate::state::io::{write_json, RuntimePaths};
use crate::state::messages::{Message, MessageBus, MessageType, BROADCAST, COORDINATOR};
use crate::state::sessions::{GateRecord, PipelineMode, Session, SessionStatus, SessionStore};
use crate::state::tasks::{NewTask, Task, TaskGraphStore, TaskId, TaskStatus, TaskSummary};

use super::compensation::{self, GapClosurePlan, RetryPlan};
use super::events::{PipelineEvent, PipelineEventKind};
use super::pipeline::{current_phase, PipelineTemplate};
use super::quality::{self, GateOutcome, QualityReport, Verdict};
use super::workers::{SpawnMode, WorkerHandle, WorkerLifecycleManager, WorkerRegistry, WorkerReporter};

/// Commands sent to a running coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorCommand {
    /// Stop dispatching; takes effect once in-flight work returns
    Pause,
    /// Kill running workers and leave the session paused
    Abort,
    /// Force a blocked task back to pending
    Unblock(TaskId),
}

/// Where the control loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Init,
    Clarify,
    CreateSession,
    Dispatch,
    Wait,
    OnCallback,
    OnUserCommand,
    PhaseTransition,
    Report,
    Idle,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed,
    Paused,
    /// Nothing left to run but work unresolved; the session is paused
    Escalated,
    Aborted,
}

impl PipelineOutcome {
    /// Process exit code: 0 for a finished pipeline, 2 for a resumable one
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Paused | Self::Escalated | Self::Aborted => 2,
        }
    }
}

impl std::fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Escalated => "escalated",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A task that ran out of retries and escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub subject: String,
    pub role: String,
    pub reason: String,
}

/// Written to `sessions/<id>/report.json` when a run ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub slug: String,
    pub mode: PipelineMode,
    pub outcome: PipelineOutcome,
    pub phase: String,
    pub tasks: TaskSummary,
    pub gates: Vec<GateRecord>,
    /// Validators accepted after the Fix-Verify cap ran out
    pub degraded: Vec<TaskId>,
    pub escalations: Vec<TaskId>,
    pub failures: Vec<FailureRecord>,
    /// Blocked or unfinished tasks left when the run stalled
    pub unresolved: Vec<TaskId>,
    pub generated_at: DateTime<Utc>,
}

/// Result of `start` or `resume`
#[derive(Debug)]
pub struct PipelineRun {
    pub session_id: String,
    pub outcome: PipelineOutcome,
    pub report: SessionReport,
    pub archive: Option<ArchiveEntry>,
    pub events: Vec<PipelineEvent>,
}

/// Per-run state of the loop
struct Run {
    session_id: String,
    template: PipelineTemplate,
    spawn_mode: SpawnMode,
    tasks: TaskGraphStore,
    bus: MessageBus,
    workers: WorkerLifecycleManager,
    cursor: u64,
    phase: String,
    counts: (usize, usize),
    handled: HashSet<(TaskId, MessageType)>,
    degraded: Vec<TaskId>,
    escalations: Vec<TaskId>,
    failures: Vec<FailureRecord>,
    commands: VecDeque<CoordinatorCommand>,
    pausing: bool,
}

impl Run {
    fn record_failure(&mut self, task: &Task, reason: &str) {
        if self.failures.iter().any(|f| f.task_id == task.id) {
            return;
        }
        self.failures.push(FailureRecord {
            task_id: task.id.clone(),
            subject: task.subject.clone(),
            role: task.owner.clone(),
            reason: reason.to_string(),
        });
    }
}

/// The session coordinator
pub struct Coordinator {
    config: OrchestratorConfig,
    paths: RuntimePaths,
    registry: Arc<WorkerRegistry>,
    sessions: SessionStore,
    state: ControlState,
    events: Vec<PipelineEvent>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
    command_rx: Option<mpsc::Receiver<CoordinatorCommand>>,
}

impl Coordinator {
    pub fn new(config: OrchestratorConfig, paths: RuntimePaths, registry: WorkerRegistry) -> Self {
        Self {
            sessions: SessionStore::new(paths.clone()),
            config,
            paths,
            registry: Arc::new(registry),
            state: ControlState::Idle,
            events: Vec::new(),
            event_tx: None,
            command_rx: None,
        }
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Accept `Pause`, `Abort` and `Unblock` commands while running
    pub fn with_inbox_channel(mut self, rx: mpsc::Receiver<CoordinatorCommand>) -> Self {
        self.command_rx = Some(rx);
        self
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    fn enter(&mut self, state: ControlState) {
        if self.state != state {
            tracing::trace!(from = ?self.state, to = ?state, "Control state");
            self.state = state;
        }
    }

    /// Emit an event
    async fn emit(&mut self, event: PipelineEvent) {
        self.events.push(event.clone());
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    fn event(run: &Run, kind: PipelineEventKind) -> PipelineEvent {
        PipelineEvent::new(kind, &run.session_id, COORDINATOR)
    }

    fn validate_roles(&self, template: &PipelineTemplate) -> Result<()> {
        let mut roles: Vec<&str> = template.roles().into_iter().collect();
        if let Some(role) = self.config.escalation_role.as_deref() {
            roles.push(role);
        }
        self.registry.validate(roles)?;
        Ok(())
    }

    fn open_run(&self, session: &Session, template: PipelineTemplate) -> Run {
        let bus = MessageBus::new(&self.paths, &session.session_id);
        let workers = WorkerLifecycleManager::new(
            self.registry.clone(),
            self.paths.clone(),
            &session.session_id,
            bus.clone(),
            self.config.worker_timeout(),
        );
        Run {
            session_id: session.session_id.clone(),
            spawn_mode: self.config.spawn_mode.unwrap_or(template.spawn_mode),
            template,
            tasks: TaskGraphStore::new(&self.paths, &session.session_id),
            bus,
            workers,
            cursor: session.bus_cursor,
            phase: session.phase.clone(),
            counts: (session.tasks_total, session.tasks_completed),
            handled: HashSet::new(),
            degraded: Vec::new(),
            escalations: Vec::new(),
            failures: Vec::new(),
            commands: VecDeque::new(),
            pausing: false,
        }
    }

    /// Start a new session for `scope` and run it until it completes or
    /// needs attention
    #[tracing::instrument(skip(self, scope), fields(mode = %mode, scope_preview = %scope.chars().take(50).collect::<String>()))]
    pub async fn start(&mut self, mode: PipelineMode, scope: &str) -> Result<PipelineRun> {
        self.events.clear();
        self.enter(ControlState::Init);
        self.config.validate()?;
        let template = PipelineTemplate::for_mode(mode);
        self.validate_roles(&template)?;

        self.enter(ControlState::Clarify);
        let scope = scope.trim();
        if scope.is_empty() {
            return Err(BatonError::validation("scope must not be empty").into());
        }

        self.enter(ControlState::CreateSession);
        let session = self
            .sessions
            .init_session(mode, scope)
            .await
            .context("Failed to create session")?;
        let mut run = self.open_run(&session, template);

        for new in run.template.tasks(scope) {
            self.create_task(&mut run, new).await?;
        }
        tracing::info!(session_id = %session.session_id, spawn_mode = %run.spawn_mode, "Pipeline started");
        let event = Self::event(&run, PipelineEventKind::PipelineStarted)
            .with_data(serde_json::json!({ "mode": mode, "scope": scope }));
        self.emit(event).await;

        self.execute(run).await
    }

    /// Continue an interrupted or paused session
    #[tracing::instrument(skip(self))]
    pub async fn resume(&mut self, session_id: &str) -> Result<PipelineRun> {
        self.events.clear();
        self.enter(ControlState::Init);
        self.config.validate()?;
        let session = self.sessions.read_session(session_id).await?;
        let template = PipelineTemplate::for_mode(session.mode);

        match session.status {
            SessionStatus::Active | SessionStatus::Paused | SessionStatus::Completed => {}
            other => {
                return Err(BatonError::InvalidSessionTransition {
                    session_id: session_id.to_string(),
                    from: other.to_string(),
                    to: SessionStatus::Active.to_string(),
                }
                .into())
            }
        }
        self.validate_roles(&template)?;

        let mut run = self.open_run(&session, template);
        if session.status == SessionStatus::Completed {
            // Finished earlier but never archived
            return self.finish(run, PipelineOutcome::Completed).await;
        }
        self.sessions.reclaim_slug(&session).await?;
        self.sessions
            .transition(session_id, SessionStatus::Active)
            .await?;

        let tasks = run.tasks.list_tasks().await?;
        for new in graph::reconcile(&run.template.tasks(&session.scope), &tasks) {
            tracing::info!(task_id = %new.task_id(), "Recreating missing template task");
            self.create_task(&mut run, new).await?;
        }
        self.recover_orphans(&mut run, &tasks).await?;

        tracing::info!(session_id, cursor = run.cursor, "Pipeline resumed");
        let event = Self::event(&run, PipelineEventKind::PipelineResumed);
        self.emit(event).await;

        self.execute(run).await
    }

    /// In-progress tasks whose worker died with the previous coordinator
    async fn recover_orphans(&mut self, run: &mut Run, tasks: &[Task]) -> Result<()> {
        for task in tasks.iter().filter(|t| t.status == TaskStatus::InProgress) {
            if run.bus.terminal_for(&task.id).await?.is_some() {
                continue;
            }
            tracing::warn!(task_id = %task.id, role = %task.owner, "Recovering orphaned task");
            WorkerReporter::new(run.tasks.clone(), run.bus.clone(), &task.owner, &task.id)
                .error("worker lost when the coordinator stopped")
                .await?;
            let event = Self::event(run, PipelineEventKind::OrphanRecovered).with_task(&task.id);
            self.emit(event).await;
        }
        Ok(())
    }

    async fn execute(&mut self, mut run: Run) -> Result<PipelineRun> {
        let outcome = match self.drive(&mut run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Leave the session resumable
                run.workers.abort_all();
                if let Err(pause) = self
                    .sessions
                    .transition(&run.session_id, SessionStatus::Paused)
                    .await
                {
                    tracing::warn!(session_id = %run.session_id, error = %pause, "Could not pause session");
                }
                self.enter(ControlState::Idle);
                return Err(e);
            }
        };
        self.finish(run, outcome).await
    }

    async fn drive(&mut self, run: &mut Run) -> Result<PipelineOutcome> {
        loop {
            for handle in run.workers.reap() {
                self.on_worker_finished(run, handle).await;
            }

            self.enter(ControlState::OnCallback);
            self.process_messages(run).await?;

            self.enter(ControlState::OnUserCommand);
            if let Some(outcome) = self.drain_commands(run).await? {
                return Ok(outcome);
            }
            if run.pausing && run.workers.in_flight() == 0 {
                return Ok(PipelineOutcome::Paused);
            }

            self.enter(ControlState::PhaseTransition);
            self.advance_phase(run).await?;

            if !run.pausing {
                self.enter(ControlState::Dispatch);
                if self.dispatch(run).await? {
                    // A Stop-Wait worker just reported; handle it first
                    continue;
                }
            }

            if run.workers.in_flight() == 0 && self.has_unread(run).await? {
                // A worker finished after the last poll; its report decides
                continue;
            }
            if let Some(outcome) = self.check_completion(run).await? {
                return Ok(outcome);
            }

            self.enter(ControlState::Wait);
            self.wait(run).await;
        }
    }

    /// Suspend until the bus moves or a command arrives
    async fn wait(&mut self, run: &mut Run) {
        let Some(rx) = self.command_rx.as_mut() else {
            run.bus.wait().await;
            return;
        };
        let closed = tokio::select! {
            _ = run.bus.wait() => false,
            command = rx.recv() => match command {
                Some(command) => {
                    run.commands.push_back(command);
                    false
                }
                None => true,
            },
        };
        if closed {
            self.command_rx = None;
        }
    }

    async fn create_task(&mut self, run: &mut Run, new: NewTask) -> Result<Option<Task>> {
        match run.tasks.create_task(new).await {
            Ok(task) => {
                let event = Self::event(run, PipelineEventKind::TaskCreated)
                    .with_task(&task.id)
                    .with_data(serde_json::json!({ "owner": task.owner, "kind": task.kind }));
                self.emit(event).await;
                Ok(Some(task))
            }
            // Created by an earlier pass over the same message
            Err(BatonError::DuplicateSubject { subject }) => {
                tracing::debug!(subject = %subject, "Task already exists");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn broadcast(&self, run: &Run, kind: MessageType, task_id: Option<&str>, summary: String) -> Result<()> {
        let mut message = Message::new(COORDINATOR, BROADCAST, kind, summary);
        if let Some(task_id) = task_id {
            message = message.for_task(task_id);
        }
        run.bus.log(&message).await?;
        Ok(())
    }

    async fn on_worker_finished(&mut self, run: &Run, handle: WorkerHandle) {
        tracing::debug!(task_id = %handle.task_id, status = ?handle.status, "Worker reaped");
        let event = Self::event(run, PipelineEventKind::WorkerFinished)
            .with_task(&handle.task_id)
            .with_data(serde_json::json!({
                "worker_id": handle.worker_id,
                "role": handle.role,
                "status": handle.status,
            }));
        self.emit(event).await;
    }

    /// OnCallback: handle everything logged since the persisted cursor
    async fn process_messages(&mut self, run: &mut Run) -> Result<()> {
        let mut inbox = run.bus.poll(COORDINATOR, run.cursor).await?;
        let mut deliveries = Vec::new();
        for item in inbox.by_ref() {
            match item {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => tracing::warn!(session_id = %run.session_id, error = %e, "Skipping malformed message"),
            }
        }
        let cursor = inbox.cursor();
        if cursor == run.cursor {
            return Ok(());
        }

        for delivery in deliveries {
            self.handle_message(run, delivery.message).await?;
        }

        run.cursor = cursor;
        self.sessions
            .modify(&run.session_id, |s| {
                s.bus_cursor = s.bus_cursor.max(cursor);
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn handle_message(&mut self, run: &mut Run, message: Message) -> Result<()> {
        if message.from == COORDINATOR {
            return Ok(());
        }
        let Some(task_id) = message.task_id.clone() else {
            if message.kind == MessageType::DiscussionNeeded {
                self.on_discussion(run, &message).await;
            }
            return Ok(());
        };

        let tasks = run.tasks.list_tasks().await?;
        let Some(task) = tasks.iter().find(|t| t.id == task_id).cloned() else {
            tracing::warn!(task_id = %task_id, kind = %message.kind, "Message for unknown task");
            return Ok(());
        };
        if Supersession::build(&tasks).is_superseded(&task.id) {
            tracing::debug!(task_id = %task.id, kind = %message.kind, "Task already compensated");
            return Ok(());
        }

        match message.kind {
            MessageType::TaskComplete => {
                if run.handled.insert((task.id.clone(), message.kind)) {
                    self.on_complete(run, &task, &tasks, &message).await?;
                }
            }
            MessageType::Error => {
                if run.handled.insert((task.id.clone(), message.kind)) {
                    self.on_error(run, &task, &tasks, &message).await?;
                }
            }
            // A repeated block after a forced unblock is legitimate, so key on status
            MessageType::TaskBlocked if task.status == TaskStatus::Blocked => {
                self.on_blocked(run, &task, &tasks, &message).await?;
            }
            MessageType::DiscussionNeeded => self.on_discussion(run, &message).await,
            _ => {}
        }
        Ok(())
    }

    async fn on_discussion(&mut self, run: &Run, message: &Message) {
        tracing::warn!(from = %message.from, task_id = ?message.task_id, summary = %message.summary, "Discussion needed");
        let mut event = Self::event(run, PipelineEventKind::DiscussionNeeded)
            .with_data(serde_json::json!({ "from": message.from, "summary": message.summary }));
        if let Some(task_id) = &message.task_id {
            event = event.with_task(task_id);
        }
        self.emit(event).await;
    }

    async fn on_complete(&mut self, run: &mut Run, task: &Task, tasks: &[Task], message: &Message) -> Result<()> {
        tracing::info!(task_id = %task.id, role = %task.owner, "Task completed");
        let event = Self::event(run, PipelineEventKind::TaskCompleted).with_task(&task.id);
        self.emit(event).await;

        let chains = Supersession::build(tasks);
        if !run.template.is_validating(chains.root(&task.id)) {
            return Ok(());
        }
        let session = self.sessions.read_session(&run.session_id).await?;
        if session.gate_results.iter().any(|g| g.task_id == task.id) {
            return Ok(());
        }

        let outcome = self.evaluate_gate(task, message);
        let record = GateRecord {
            task_id: task.id.clone(),
            verdict: outcome.verdict,
            score: outcome.score,
            critical: outcome.critical,
            iteration: compensation::gap_closure_iterations(task, tasks),
            at: Utc::now(),
        };
        self.sessions
            .modify(&run.session_id, |s| {
                if !s.gate_results.iter().any(|g| g.task_id == record.task_id) {
                    s.gate_results.push(record.clone());
                }
                Ok(())
            })
            .await?;
        tracing::info!(task_id = %task.id, verdict = %outcome.verdict, score = outcome.score, "Quality gate evaluated");
        let event = Self::event(run, PipelineEventKind::GateEvaluated)
            .with_task(&task.id)
            .with_data(serde_json::to_value(&record)?);
        self.emit(event).await;

        if !outcome.verdict.needs_remediation() {
            return Ok(());
        }

        match compensation::plan_gap_closure(
            task,
            tasks,
            run.template.remediation_role,
            self.config.gap_closure_cap,
            message.artifact_ref.as_deref(),
        ) {
            GapClosurePlan::Remediate {
                iteration,
                fix,
                revalidate,
            } => {
                let fix_id = fix.task_id();
                let revalidate_id = revalidate.task_id();
                self.create_task(run, fix).await?;
                self.create_task(run, revalidate).await?;
                self.broadcast(
                    run,
                    MessageType::GapClosure,
                    Some(task.id.as_str()),
                    format!(
                        "{} {}: remediation {} feeds re-validation {} (iteration {})",
                        task.subject, outcome.verdict, fix_id, revalidate_id, iteration
                    ),
                )
                .await?;
                let event = Self::event(run, PipelineEventKind::GapClosureStarted)
                    .with_task(&task.id)
                    .with_data(serde_json::json!({
                        "iteration": iteration,
                        "fix": fix_id,
                        "revalidate": revalidate_id,
                    }));
                self.emit(event).await;
            }
            GapClosurePlan::Exhausted { iterations } => {
                tracing::warn!(task_id = %task.id, iterations, "Gap closure exhausted, accepting degraded");
                if !run.degraded.contains(&task.id) {
                    run.degraded.push(task.id.clone());
                }
                self.broadcast(
                    run,
                    MessageType::GapClosure,
                    Some(task.id.as_str()),
                    format!(
                        "{} gap closure exhausted after {} iterations, accepted degraded",
                        task.subject, iterations
                    ),
                )
                .await?;
                let event = Self::event(run, PipelineEventKind::GapClosureExhausted)
                    .with_task(&task.id)
                    .with_data(serde_json::json!({ "iterations": iterations }));
                self.emit(event).await;
            }
        }
        Ok(())
    }

    /// No report passes; an unreadable one fails
    fn evaluate_gate(&self, task: &Task, message: &Message) -> GateOutcome {
        let Some(payload) = &message.payload else {
            return GateOutcome {
                verdict: Verdict::Pass,
                score: 10.0,
                critical: 0,
                warnings: 0,
            };
        };
        let evaluated = serde_json::from_value::<QualityReport>(payload.clone())
            .map_err(BatonError::from)
            .and_then(|report| quality::evaluate(&report, &self.config.quality));
        match evaluated {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Unreadable quality report");
                GateOutcome {
                    verdict: Verdict::Fail,
                    score: 0.0,
                    critical: 0,
                    warnings: 0,
                }
            }
        }
    }

    async fn on_error(&mut self, run: &mut Run, task: &Task, tasks: &[Task], message: &Message) -> Result<()> {
        tracing::warn!(task_id = %task.id, role = %task.owner, summary = %message.summary, "Task failed");
        let event = Self::event(run, PipelineEventKind::TaskFailed)
            .with_task(&task.id)
            .with_data(serde_json::json!({ "summary": message.summary }));
        self.emit(event).await;

        let plan = compensation::plan_retry(
            task,
            tasks,
            self.config.max_retries,
            self.config.escalation_role.as_deref(),
        );
        self.apply_retry_plan(run, task, plan, &message.summary).await
    }

    async fn apply_retry_plan(&mut self, run: &mut Run, task: &Task, plan: RetryPlan, reason: &str) -> Result<()> {
        match plan {
            RetryPlan::Retry(new) => {
                let retry_id = new.task_id();
                self.create_task(run, new).await?;
                tracing::info!(task_id = %task.id, retry = %retry_id, "Retry scheduled");
                let event = Self::event(run, PipelineEventKind::RetryScheduled)
                    .with_task(&task.id)
                    .with_data(serde_json::json!({ "retry": retry_id }));
                self.emit(event).await;
            }
            RetryPlan::Escalate(new) => {
                let escalation_id = new.task_id();
                let owner = new.owner.clone();
                self.create_task(run, new).await?;
                if !run.escalations.contains(&escalation_id) {
                    run.escalations.push(escalation_id.clone());
                }
                self.broadcast(
                    run,
                    MessageType::Escalation,
                    Some(task.id.as_str()),
                    format!("{} escalated to {} as {}: {}", task.subject, owner, escalation_id, reason),
                )
                .await?;
                let event = Self::event(run, PipelineEventKind::Escalated)
                    .with_task(&task.id)
                    .with_data(serde_json::json!({ "escalation": escalation_id, "owner": owner }));
                self.emit(event).await;
            }
            RetryPlan::Exhausted => {
                tracing::error!(task_id = %task.id, reason, "Retries exhausted");
                run.record_failure(task, reason);
            }
        }
        Ok(())
    }

    async fn on_blocked(&mut self, run: &mut Run, task: &Task, tasks: &[Task], message: &Message) -> Result<()> {
        tracing::info!(task_id = %task.id, reason = %message.summary, "Task blocked");
        let event = Self::event(run, PipelineEventKind::TaskBlocked)
            .with_task(&task.id)
            .with_data(serde_json::json!({ "reason": message.summary }));
        self.emit(event).await;

        let root = Supersession::build(tasks).root(&task.id).to_string();
        let session = self.sessions.read_session(&run.session_id).await?;
        let unblocked = session.unblock_counts.get(&root).copied().unwrap_or(0);

        if unblocked < self.config.max_retries {
            match self.unblock(run, &task.id).await {
                Ok(()) => {
                    self.sessions
                        .modify(&run.session_id, |s| {
                            *s.unblock_counts.entry(root.clone()).or_default() += 1;
                            Ok(())
                        })
                        .await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Forced unblock refused, escalating")
                }
            }
        }

        let plan = compensation::plan_escalation(task, tasks, self.config.escalation_role.as_deref());
        self.apply_retry_plan(run, task, plan, &message.summary).await
    }

    async fn unblock(&mut self, run: &Run, task_id: &str) -> Result<()> {
        run.tasks.force_unblock(task_id).await?;
        tracing::info!(task_id, "Task force-unblocked");
        let event = Self::event(run, PipelineEventKind::TaskUnblocked).with_task(task_id);
        self.emit(event).await;
        Ok(())
    }

    /// OnUserCommand
    async fn drain_commands(&mut self, run: &mut Run) -> Result<Option<PipelineOutcome>> {
        if let Some(rx) = self.command_rx.as_mut() {
            while let Ok(command) = rx.try_recv() {
                run.commands.push_back(command);
            }
        }

        while let Some(command) = run.commands.pop_front() {
            tracing::info!(command = ?command, "User command");
            match command {
                CoordinatorCommand::Pause => {
                    if !run.pausing {
                        run.pausing = true;
                        let event = Self::event(run, PipelineEventKind::Paused)
                            .with_data(serde_json::json!({ "in_flight": run.workers.in_flight() }));
                        self.emit(event).await;
                    }
                }
                CoordinatorCommand::Abort => {
                    let killed = run.workers.abort_all();
                    let event = Self::event(run, PipelineEventKind::Aborted).with_data(
                        serde_json::json!({
                            "killed": killed.iter().map(|h| h.task_id.as_str()).collect::<Vec<_>>()
                        }),
                    );
                    self.emit(event).await;
                    return Ok(Some(PipelineOutcome::Aborted));
                }
                CoordinatorCommand::Unblock(task_id) => {
                    if let Err(e) = self.unblock(run, &task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "Unblock command refused");
                    }
                }
            }
        }
        Ok(None)
    }

    /// PhaseTransition: keep the session's phase and counters current
    async fn advance_phase(&mut self, run: &mut Run) -> Result<()> {
        let tasks = run.tasks.list_tasks().await?;
        let summary = TaskSummary::from_tasks(&tasks);
        let phase = current_phase(&tasks).unwrap_or_else(|| "REPORT".to_string());
        let counts = (summary.total, summary.completed);

        if phase == run.phase && counts == run.counts {
            return Ok(());
        }

        let changed = phase != run.phase;
        let previous = std::mem::replace(&mut run.phase, phase.clone());
        run.counts = counts;
        self.sessions
            .modify(&run.session_id, |s| {
                s.phase = phase.clone();
                s.tasks_total = counts.0;
                s.tasks_completed = counts.1;
                Ok(())
            })
            .await?;

        if changed {
            tracing::info!(session_id = %run.session_id, from = %previous, to = %phase, "Phase transition");
            let anchor = tasks.iter().find(|t| t.phase == phase).map(|t| t.id.as_str());
            let from = if previous.is_empty() { "-" } else { previous.as_str() };
            self.broadcast(
                run,
                MessageType::PhaseTransition,
                anchor,
                format!("phase {from} -> {phase}"),
            )
            .await?;
            let event = Self::event(run, PipelineEventKind::PhaseChanged)
                .with_data(serde_json::json!({ "from": previous, "to": phase }));
            self.emit(event).await;
        }
        Ok(())
    }

    /// Dispatch: one worker per ready task within the concurrency limits.
    /// Returns `true` when a Stop-Wait worker ran.
    async fn dispatch(&mut self, run: &mut Run) -> Result<bool> {
        let ready = run.tasks.list_ready(None).await?;
        for task in ready {
            if run.workers.is_running(&task.id) {
                continue;
            }
            if run.workers.in_flight() >= self.config.global_concurrency {
                break;
            }
            if run.workers.in_flight_for(&task.owner) >= self.config.per_role_concurrency {
                continue;
            }

            let event = Self::event(run, PipelineEventKind::WorkerSpawned)
                .with_task(&task.id)
                .with_data(serde_json::json!({ "role": task.owner, "mode": run.spawn_mode }));
            match run.spawn_mode {
                SpawnMode::Sync => {
                    self.emit(event).await;
                    let handle = run.workers.spawn_sync(task).await?;
                    self.on_worker_finished(run, handle).await;
                    return Ok(true);
                }
                SpawnMode::Async => {
                    run.workers.spawn_async(task).await?;
                    self.emit(event).await;
                }
            }
        }
        Ok(false)
    }

    /// Whether the coordinator's inbox holds messages past the cursor
    async fn has_unread(&self, run: &Run) -> Result<bool> {
        let mut inbox = run.bus.poll(COORDINATOR, run.cursor).await?;
        Ok(inbox.any(|item| item.is_ok()))
    }

    /// Only called with no unread reports, so every terminal message has been
    /// handled before a run is declared finished
    async fn check_completion(&mut self, run: &Run) -> Result<Option<PipelineOutcome>> {
        if run.workers.in_flight() > 0 {
            return Ok(None);
        }
        let tasks = run.tasks.list_tasks().await?;
        let chains = Supersession::build(&tasks);
        let live: Vec<&Task> = tasks.iter().filter(|t| !chains.is_superseded(&t.id)).collect();

        if !live.is_empty() && live.iter().all(|t| t.status == TaskStatus::Completed) {
            return Ok(Some(PipelineOutcome::Completed));
        }
        if !graph::ready_tasks(&tasks, None).is_empty() {
            return Ok(None);
        }

        tracing::warn!(session_id = %run.session_id, "Pipeline stalled: nothing ready, nothing running");
        let event = Self::event(run, PipelineEventKind::PipelineStalled).with_data(serde_json::json!({
            "unresolved": live
                .iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .map(|t| t.id.as_str())
                .collect::<Vec<_>>()
        }));
        self.emit(event).await;
        Ok(Some(PipelineOutcome::Escalated))
    }

    /// Report: persist the report, settle the session and archive it
    async fn finish(&mut self, run: Run, outcome: PipelineOutcome) -> Result<PipelineRun> {
        self.enter(ControlState::Report);
        let session_id = run.session_id.clone();
        let status = match outcome {
            PipelineOutcome::Completed => SessionStatus::Completed,
            _ => SessionStatus::Paused,
        };
        self.sessions
            .transition(&session_id, status)
            .await
            .with_context(|| format!("Failed to settle session {session_id}"))?;
        let session = self.sessions.read_session(&session_id).await?;

        let tasks = run.tasks.list_tasks().await?;
        let chains = Supersession::build(&tasks);
        let unresolved = tasks
            .iter()
            .filter(|t| !chains.is_superseded(&t.id) && t.status != TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        let report = SessionReport {
            session_id: session_id.clone(),
            slug: session.slug.clone(),
            mode: session.mode,
            outcome,
            phase: session.phase.clone(),
            tasks: TaskSummary::from_tasks(&tasks),
            gates: session.gate_results.clone(),
            degraded: run.degraded,
            escalations: run.escalations,
            failures: run.failures,
            unresolved,
            generated_at: Utc::now(),
        };
        write_json(&self.paths.report_file(&session_id), &report)
            .await
            .context("Failed to write session report")?;

        let kind = match outcome {
            PipelineOutcome::Completed => PipelineEventKind::PipelineCompleted,
            PipelineOutcome::Paused | PipelineOutcome::Escalated | PipelineOutcome::Aborted => {
                PipelineEventKind::Paused
            }
        };
        let event = PipelineEvent::new(kind, &session_id, COORDINATOR)
            .with_data(serde_json::json!({ "outcome": outcome }));
        self.emit(event).await;
        tracing::info!(session_id = %session_id, outcome = %outcome, "Pipeline finished");

        let mut archive = None;
        if outcome == PipelineOutcome::Completed && self.config.auto_archive {
            match ArchivalManager::new(self.paths.clone()).archive(&session_id).await {
                Ok(entry) => {
                    let event = PipelineEvent::new(PipelineEventKind::SessionArchived, &session_id, COORDINATOR)
                        .with_data(serde_json::json!({ "archive_path": entry.archive_path }));
                    self.emit(event).await;
                    archive = Some(entry);
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, hint = e.recovery_hint(), "Automatic archival failed")
                }
            }
        }

        self.enter(ControlState::Idle);
        Ok(PipelineRun {
            session_id,
            outcome,
            report,
            archive,
            events: std::mem::take(&mut self.events),
        })
    }
}
