//! Baton CLI
//!
//! Runs the coordinator for a session and gives external worker processes
//! their side of the bus contract (`baton report`).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use baton_core::state::io::RUNTIME_PATH_ENV;
use baton_core::swarm::workers::{ROLE_ENV, SESSION_ID_ENV, TASK_ID_ENV};
use baton_core::swarm::{PipelineEventKind, QualityReport};
use baton_core::{
    ArchivalManager, BatonError, Coordinator, CoordinatorCommand, OrchestratorConfig,
    PipelineEvent, PipelineMode, PipelineRun, RuntimePaths, SessionStore, TaskGraphStore,
    WorkerOutput, WorkerRegistry, WorkerReporter,
};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Clone)]
#[command(author, version, about = "Baton - task orchestration engine")]
struct Args {
    /// Runtime directory (defaults to $BATON_RUNTIME_PATH or ./.baton)
    #[arg(long, global = true)]
    runtime: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start a new session and run its pipeline
    Start {
        /// spec-only, impl-only or full-lifecycle
        #[arg(long)]
        mode: PipelineMode,
        /// What the session is about
        scope: String,
    },
    /// Continue a paused or interrupted session
    Resume { session_id: String },
    /// Show one session, or list every session still in the active location
    Status { session_id: Option<String> },
    /// Report progress on a task (used by worker processes)
    Report {
        #[arg(long, value_enum)]
        kind: ReportKind,
        #[arg(long, default_value = "")]
        summary: String,
        /// Defaults to $BATON_TASK_ID
        #[arg(long)]
        task: Option<String>,
        /// Defaults to $BATON_SESSION_ID
        #[arg(long)]
        session: Option<String>,
        /// Defaults to $BATON_ROLE
        #[arg(long)]
        role: Option<String>,
        /// Artifact produced by the task
        #[arg(long = "ref")]
        artifact_ref: Option<String>,
        /// JSON quality report attached to a completion
        #[arg(long)]
        quality: Option<PathBuf>,
    },
    /// Archive a completed session
    Archive { session_id: String },
    /// Finish every interrupted archival
    Recover,
    /// List archived sessions
    Archived,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReportKind {
    Started,
    Complete,
    Blocked,
    Error,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_logging(args.log_json);

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(err) = e.downcast_ref::<BatonError>() {
                eprintln!("hint: {}", err.recovery_hint());
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    let filter = std::env::var("BATON_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

async fn run(args: Args) -> Result<u8> {
    let paths = args
        .runtime
        .map(RuntimePaths::new)
        .unwrap_or_else(RuntimePaths::from_env);

    match args.command {
        CliCommand::Start { mode, scope } => {
            let (mut coordinator, printer) = coordinator(&paths).await?;
            let run = coordinator.start(mode, &scope).await;
            drop(coordinator);
            let _ = printer.await;
            finish(run?)
        }
        CliCommand::Resume { session_id } => {
            let (mut coordinator, printer) = coordinator(&paths).await?;
            let run = coordinator.resume(&session_id).await;
            drop(coordinator);
            let _ = printer.await;
            finish(run?)
        }
        CliCommand::Status { session_id } => status(&paths, session_id.as_deref()).await,
        CliCommand::Report {
            kind,
            summary,
            task,
            session,
            role,
            artifact_ref,
            quality,
        } => {
            let session = from_env(session, SESSION_ID_ENV)?;
            let task = from_env(task, TASK_ID_ENV)?;
            let role = from_env(role, ROLE_ENV)?;
            let reporter = WorkerReporter::for_session(&paths, &session, &role, &task);

            match kind {
                ReportKind::Started => {
                    reporter.started().await?;
                }
                ReportKind::Complete => {
                    let mut output = WorkerOutput::new(summary);
                    if let Some(artifact_ref) = artifact_ref {
                        output = output.with_ref(artifact_ref);
                    }
                    if let Some(path) = quality {
                        let raw = tokio::fs::read(&path)
                            .await
                            .with_context(|| format!("Failed to read {}", path.display()))?;
                        let report: QualityReport = serde_json::from_slice(&raw)
                            .with_context(|| format!("Malformed quality report {}", path.display()))?;
                        output = output.with_quality(report);
                    }
                    reporter.complete(output).await?;
                }
                ReportKind::Blocked => {
                    reporter.blocked(&summary).await?;
                }
                ReportKind::Error => {
                    reporter.error(&summary).await?;
                }
            }
            Ok(0)
        }
        CliCommand::Archive { session_id } => {
            let entry = ArchivalManager::new(paths).archive(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(0)
        }
        CliCommand::Recover => {
            let report = ArchivalManager::new(paths).recover().await?;
            if report.is_empty() {
                println!("Nothing to recover");
            }
            for entry in &report.recovered {
                println!("Recovered {} -> {}", entry.session_id, entry.archive_path.display());
            }
            for (session_id, err) in &report.failed {
                eprintln!("Failed {session_id}: {err}");
                eprintln!("hint: {}", err.recovery_hint());
            }
            Ok(if report.failed.is_empty() { 0 } else { 1 })
        }
        CliCommand::Archived => {
            for entry in ArchivalManager::new(paths).list_archived().await? {
                println!(
                    "{}  {}  {}  {} tasks  [{}]",
                    entry.archived_at.format("%Y-%m-%d %H:%M"),
                    entry.session_id,
                    entry.mode,
                    entry.metrics.tasks.total,
                    entry.tags.join(", ")
                );
            }
            Ok(0)
        }
    }
}

fn from_env(value: Option<String>, var: &str) -> Result<String> {
    value
        .or_else(|| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing value: pass it explicitly or set {var}"))
}

/// Coordinator wired to Ctrl-C (pause, then abort) and an event printer
async fn coordinator(
    paths: &RuntimePaths,
) -> Result<(Coordinator, tokio::task::JoinHandle<()>)> {
    let config = OrchestratorConfig::load(paths)
        .await
        .with_context(|| format!("Failed to load config from {}", paths.config_file().display()))?;
    let registry = WorkerRegistry::from_specs(&config.workers);
    tracing::debug!(runtime = %paths.root().display(), env = RUNTIME_PATH_ENV, "Runtime directory");

    let (command_tx, command_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Pausing after in-flight work returns (Ctrl-C again to abort)");
            let _ = command_tx.send(CoordinatorCommand::Pause).await;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = command_tx.send(CoordinatorCommand::Abort).await;
        }
    });

    let (event_tx, mut event_rx) = mpsc::channel::<PipelineEvent>(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let coordinator = Coordinator::new(config, paths.clone(), registry)
        .with_event_channel(event_tx)
        .with_inbox_channel(command_rx);
    Ok((coordinator, printer))
}

fn print_event(event: &PipelineEvent) {
    let task = event.task_id.as_deref().unwrap_or("-");
    match event.kind {
        PipelineEventKind::WorkerFinished | PipelineEventKind::TaskCreated => {}
        kind => println!(
            "{}  {:<22} {}",
            event.timestamp.format("%H:%M:%S"),
            serde_json::to_value(kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            task
        ),
    }
}

fn finish(run: PipelineRun) -> Result<u8> {
    let report = &run.report;
    println!();
    println!("Session  {}", run.session_id);
    println!("Outcome  {}", run.outcome);
    println!(
        "Tasks    {}/{} completed, {} failed, {} blocked",
        report.tasks.completed, report.tasks.total, report.tasks.failed, report.tasks.blocked
    );
    for gate in &report.gates {
        println!("Gate     {} {} ({:.1})", gate.task_id, gate.verdict, gate.score);
    }
    for task_id in &report.degraded {
        println!("Degraded {task_id}");
    }
    for failure in &report.failures {
        println!("Failed   {} [{}]: {}", failure.task_id, failure.role, failure.reason);
    }
    if let Some(entry) = &run.archive {
        println!("Archived {}", entry.archive_path.display());
    }
    Ok(run.outcome.exit_code() as u8)
}

async fn status(paths: &RuntimePaths, session_id: Option<&str>) -> Result<u8> {
    let sessions = SessionStore::new(paths.clone());
    let Some(session_id) = session_id else {
        for session in sessions.list_sessions().await? {
            println!(
                "{}  {:<9} {:<14} {:<10} {}/{}",
                session.session_id,
                session.status.to_string(),
                session.mode.to_string(),
                if session.phase.is_empty() { "-" } else { session.phase.as_str() },
                session.tasks_completed,
                session.tasks_total
            );
        }
        return Ok(0);
    };

    let session = sessions.read_session(session_id).await?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    if session.status.is_live() || session.status == baton_core::SessionStatus::Completed {
        for task in TaskGraphStore::new(paths, session_id).list_tasks().await? {
            println!("  {:<20} {:<12} {}", task.id, task.status.to_string(), task.owner);
        }
    }
    Ok(0)
}
