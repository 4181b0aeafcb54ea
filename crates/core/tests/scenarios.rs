//! End-to-end behavior of the stores and the coordinator, driven by scripted
//! in-process workers.

use async_trait::async_trait;
use baton_core::state::tasks::NewTask;
use baton_core::swarm::quality::{self, QualityGateConfig, QualityReport};
use baton_core::swarm::{PipelineEventKind, PipelineTemplate, Verdict};
use baton_core::{
    ArchivalManager, BatonError, Coordinator, Message, MessageBus, MessageType, OrchestratorConfig,
    PipelineMode, PipelineOutcome, RuntimePaths, SessionStatus, SessionStore, Task,
    TaskGraphStore, TaskStatus, Worker, WorkerOutput, WorkerRegistry, WorkerReporter,
};

struct Done;

#[async_trait]
impl Worker for Done {
    async fn execute(&self, task: &Task) -> anyhow::Result<WorkerOutput> {
        Ok(WorkerOutput::new(format!("{} done", task.subject)))
    }
}

/// Validator that never passes
struct Noisy;

#[async_trait]
impl Worker for Noisy {
    async fn execute(&self, _task: &Task) -> anyhow::Result<WorkerOutput> {
        Ok(WorkerOutput::new("still broken").with_quality(QualityReport::from_scores(&[7.0, 6.5])))
    }
}

fn registry() -> WorkerRegistry {
    ["analyst", "planner", "executor", "tester", "reviewer"]
        .into_iter()
        .fold(WorkerRegistry::new(), |registry, role| registry.with_worker(role, Done))
}

fn quiet_config() -> OrchestratorConfig {
    OrchestratorConfig {
        auto_archive: false,
        ..OrchestratorConfig::default()
    }
}

#[tokio::test]
async fn scenario_a_readiness_follows_completion() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let session = SessionStore::new(paths.clone())
        .init_session(PipelineMode::ImplOnly, "scenario a")
        .await
        .unwrap();
    let tasks = TaskGraphStore::new(&paths, &session.session_id);

    tasks.create_task(NewTask::new("TASK-A", "executor")).await.unwrap();
    tasks
        .create_task(NewTask::new("TASK-B", "executor").with_deps(["task-a"]))
        .await
        .unwrap();

    let ready: Vec<_> = tasks.list_ready(None).await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, vec!["task-a"]);

    tasks.update_status("task-a", TaskStatus::InProgress).await.unwrap();
    tasks.update_status("task-a", TaskStatus::Completed).await.unwrap();

    let ready: Vec<_> = tasks.list_ready(None).await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, vec!["task-b"]);
}

#[tokio::test]
async fn scenario_b_duplicate_completion_is_handled_once() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let session = SessionStore::new(paths.clone())
        .init_session(PipelineMode::ImplOnly, "scenario b")
        .await
        .unwrap();
    let sid = session.session_id.clone();
    let tasks = TaskGraphStore::new(&paths, &sid);
    for new in PipelineTemplate::for_mode(PipelineMode::ImplOnly).tasks("scenario b") {
        tasks.create_task(new).await.unwrap();
    }

    // The planner reports completion, then the same report is delivered again
    let reporter = WorkerReporter::for_session(&paths, &sid, "planner", "plan-001");
    reporter.started().await.unwrap();
    reporter.complete(WorkerOutput::new("plan ready")).await.unwrap();
    MessageBus::new(&paths, &sid)
        .log(&Message::new("planner", "coordinator", MessageType::TaskComplete, "plan ready").for_task("plan-001"))
        .await
        .unwrap();

    let mut coordinator = Coordinator::new(quiet_config(), paths.clone(), registry());
    let run = coordinator.resume(&sid).await.unwrap();
    assert_eq!(run.outcome, PipelineOutcome::Completed);

    let completions = run
        .events
        .iter()
        .filter(|e| e.kind == PipelineEventKind::TaskCompleted)
        .filter(|e| e.task_id.as_deref() == Some("plan-001"))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(tasks.get_task("plan-001").await.unwrap().status, TaskStatus::Completed);
    assert!(matches!(
        tasks.update_status("plan-001", TaskStatus::Completed).await,
        Err(BatonError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn scenario_c_interrupted_archival_records_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let store = SessionStore::new(paths.clone());
    let session = store
        .init_session(PipelineMode::SpecOnly, "scenario c")
        .await
        .unwrap();
    let sid = session.session_id.clone();
    store.transition(&sid, SessionStatus::Completed).await.unwrap();

    // Crash right after phase 1 wrote its marker
    std::fs::write(paths.archiving_marker(&sid), b"").unwrap();

    let manager = ArchivalManager::new(paths.clone());
    let report = manager.recover().await.unwrap();
    assert_eq!(report.recovered.len(), 1);
    assert!(report.failed.is_empty());
    assert_eq!(manager.list_archived().await.unwrap().len(), 1);

    // Retrying is harmless
    manager.archive(&sid).await.unwrap();
    assert!(manager.recover().await.unwrap().is_empty());
    let archived = manager.list_archived().await.unwrap();
    assert_eq!(archived.iter().filter(|e| e.session_id == sid).count(), 1);
    assert!(!paths.session_dir(&sid).exists());
    assert_eq!(store.read_session(&sid).await.unwrap().status, SessionStatus::Archived);
}

#[test]
fn scenario_d_weighted_gate_needs_fix() {
    let report = QualityReport::from_scores(&[9.0, 7.0, 8.0, 6.0]);
    let outcome = quality::evaluate(&report, &QualityGateConfig::default()).unwrap();
    assert!((outcome.score - 7.5).abs() < 1e-9);
    assert_eq!(outcome.verdict, Verdict::NeedsFix);
}

#[tokio::test]
async fn at_most_one_live_session_per_slug() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let store = SessionStore::new(paths.clone());

    let first = store.init_session(PipelineMode::ImplOnly, "Checkout Flow").await.unwrap();
    let second = store.init_session(PipelineMode::FullLifecycle, "checkout flow").await;
    assert!(matches!(second, Err(BatonError::ActiveSessionExists { .. })));

    store.transition(&first.session_id, SessionStatus::Completed).await.unwrap();
    let third = store.init_session(PipelineMode::ImplOnly, "checkout flow").await.unwrap();
    assert_ne!(third.session_id, first.session_id);
    assert_eq!(store.list_active_sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn archive_round_trip_through_the_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let mut coordinator = Coordinator::new(OrchestratorConfig::default(), paths.clone(), registry());

    let run = coordinator.start(PipelineMode::FullLifecycle, "round trip").await.unwrap();
    assert_eq!(run.outcome, PipelineOutcome::Completed);

    let archived = ArchivalManager::new(paths.clone()).list_archived().await.unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].session_id, run.session_id);
    assert_eq!(archived[0].metrics.tasks.completed, 5);
    assert!(!paths.session_meta(&run.session_id).exists());
}

#[tokio::test]
async fn gap_closure_terminates_at_configured_cap() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let config = OrchestratorConfig {
        gap_closure_cap: 2,
        ..quiet_config()
    };
    let registry = registry().with_worker("tester", Noisy).with_worker("reviewer", Noisy);
    let mut coordinator = Coordinator::new(config, paths.clone(), registry);

    let run = coordinator.start(PipelineMode::FullLifecycle, "noisy validators").await.unwrap();
    assert_eq!(run.outcome, PipelineOutcome::Completed);

    let mut degraded = run.report.degraded.clone();
    degraded.sort();
    assert_eq!(degraded, vec!["review-001-rv2", "test-001-rv2"]);

    let tasks = TaskGraphStore::new(&paths, &run.session_id).list_tasks().await.unwrap();
    let fixes = tasks.iter().filter(|t| t.subject.contains("-FIX")).count();
    assert_eq!(fixes, 4);
    assert!(!tasks.iter().any(|t| t.subject.ends_with("-RV3")));
}
