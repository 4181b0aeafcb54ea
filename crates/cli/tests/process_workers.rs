//! External workers driving the bus through `baton report`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use baton_core::state::NewTask;
use baton_core::swarm::{ProcessSpec, SpawnMode, WorkerLifecycleManager, WorkerRegistry, WorkerStatus};
use baton_core::{MessageBus, MessageType, RuntimePaths, TaskGraphStore, TaskStatus};

fn report(args: &[&str]) -> ProcessSpec {
    let mut all = vec!["report".to_string()];
    all.extend(args.iter().map(|a| a.to_string()));
    ProcessSpec {
        program: env!("CARGO_BIN_EXE_baton").to_string(),
        args: all,
        env: BTreeMap::new(),
        timeout_secs: Some(30),
    }
}

async fn run_planner(spec: ProcessSpec) -> (tempfile::TempDir, TaskGraphStore, MessageBus, WorkerStatus) {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let tasks = TaskGraphStore::new(&paths, "s1");
    let bus = MessageBus::new(&paths, "s1");
    let task = tasks
        .create_task(NewTask::new("PLAN-001", "planner"))
        .await
        .unwrap();

    let registry = WorkerRegistry::new().with_process("planner", spec);
    let mut manager = WorkerLifecycleManager::new(
        Arc::new(registry),
        paths,
        "s1",
        bus.clone(),
        Duration::from_secs(30),
    );
    let handle = manager.spawn(task, SpawnMode::Sync).await.unwrap();
    (dir, tasks, bus, handle.status)
}

#[tokio::test]
async fn process_worker_can_decline() {
    let (_dir, tasks, bus, status) =
        run_planner(report(&["--kind", "blocked", "--summary", "no creds"])).await;

    assert_eq!(status, WorkerStatus::Declined);
    assert_eq!(
        tasks.get_task("plan-001").await.unwrap().status,
        TaskStatus::Blocked
    );
    let terminal = bus.terminal_for("plan-001").await.unwrap().unwrap();
    assert_eq!(terminal.kind, MessageType::TaskBlocked);
    assert_eq!(terminal.summary, "no creds");
}

#[tokio::test]
async fn process_worker_completes_without_explicit_claim() {
    let (_dir, tasks, bus, status) = run_planner(report(&[
        "--kind",
        "complete",
        "--summary",
        "plan written",
        "--ref",
        "plan.md",
    ]))
    .await;

    assert_eq!(status, WorkerStatus::Reported);
    assert_eq!(
        tasks.get_task("plan-001").await.unwrap().status,
        TaskStatus::Completed
    );
    let terminal = bus.terminal_for("plan-001").await.unwrap().unwrap();
    assert_eq!(terminal.kind, MessageType::TaskComplete);
    assert_eq!(terminal.artifact_ref.as_deref(), Some("plan.md"));

    let kinds: Vec<MessageType> = bus
        .read_all()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert_eq!(kinds, vec![MessageType::TaskStarted, MessageType::TaskComplete]);
}

#[cfg(unix)]
#[tokio::test]
async fn process_worker_reporting_error_fails_claimed_task() {
    let dir = tempfile::tempdir().unwrap();
    let paths = RuntimePaths::new(dir.path());
    let tasks = TaskGraphStore::new(&paths, "s1");
    let bus = MessageBus::new(&paths, "s1");
    let task = tasks
        .create_task(NewTask::new("IMPL-001", "executor"))
        .await
        .unwrap();

    let spec = ProcessSpec {
        program: "sh".into(),
        args: vec![
            "-c".into(),
            format!(
                "\"{bin}\" report --kind started && \"{bin}\" report --kind error --summary 'tests red'",
                bin = env!("CARGO_BIN_EXE_baton")
            ),
        ],
        env: BTreeMap::new(),
        timeout_secs: Some(30),
    };
    let registry = WorkerRegistry::new().with_process("executor", spec);
    let mut manager =
        WorkerLifecycleManager::new(Arc::new(registry), paths, "s1", bus.clone(), Duration::from_secs(30));

    let handle = manager.spawn(task, SpawnMode::Sync).await.unwrap();
    assert_eq!(handle.status, WorkerStatus::Reported);
    assert_eq!(
        tasks.get_task("impl-001").await.unwrap().status,
        TaskStatus::Failed
    );
    let terminal = bus.terminal_for("impl-001").await.unwrap().unwrap();
    assert_eq!(terminal.kind, MessageType::Error);
    assert_eq!(terminal.summary, "tests red");
}
