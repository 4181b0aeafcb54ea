//! # Baton Core
//!
//! Task orchestration engine: a durable task graph, session lifecycle, an
//! append-only message bus, worker supervision, the coordinator control loop
//! and transactional archival.
//!
//! ## Architecture
//!
//! - `state/` - Durable stores: task graph, sessions, message bus, archive
//! - `swarm/` - Orchestration: pipeline templates, workers, quality gates,
//!   compensation planning and the coordinator
//! - `config` - `OrchestratorConfig`, loaded from `<runtime>/config.json`
//! - `error` - `BatonError`, shared by every store
//!
//! ## Usage
//!
//! ```rust,ignore
//! use baton_core::{Coordinator, OrchestratorConfig, PipelineMode, RuntimePaths, WorkerRegistry};
//!
//! let paths = RuntimePaths::from_env();
//! let config = OrchestratorConfig::load(&paths).await?;
//! let registry = WorkerRegistry::from_specs(&config.workers);
//! let mut coordinator = Coordinator::new(config, paths, registry);
//! let run = coordinator.start(PipelineMode::ImplOnly, "add login").await?;
//! std::process::exit(run.outcome.exit_code());
//! ```

pub mod config;
pub mod error;
pub mod state;
pub mod swarm;

pub use config::OrchestratorConfig;
pub use error::{ArchivalPhase, BatonError, Result};
pub use state::{
    ArchivalManager, ArchiveEntry, Message, MessageBus, MessageType, PipelineMode, RuntimePaths,
    Session, SessionStatus, SessionStore, Task, TaskGraphStore, TaskStatus,
};
pub use swarm::{
    Coordinator, CoordinatorCommand, PipelineEvent, PipelineOutcome, PipelineRun, Worker,
    WorkerOutput, WorkerRegistry, WorkerReporter,
};
