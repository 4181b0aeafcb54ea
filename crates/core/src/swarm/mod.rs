//! # Orchestration
//!
//! Drives a session's task graph through its pipeline.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Dispatch → Worker → terminal message → OnCallback → {gate | retry | escalate} → Dispatch
//! ```

pub mod compensation;
pub mod coordinator;
pub mod events;
pub mod pipeline;
pub mod quality;
pub mod workers;

pub use compensation::{GapClosurePlan, RetryPlan};
pub use coordinator::{
    ControlState, Coordinator, CoordinatorCommand, FailureRecord, PipelineOutcome, PipelineRun,
    SessionReport,
};
pub use events::{PipelineEvent, PipelineEventKind};
pub use pipeline::{PipelineTemplate, StageTemplate};
pub use quality::{GateOutcome, QualityGateConfig, QualityReport, Severity, Verdict};
pub use workers::{
    Preflight, ProcessSpec, SpawnMode, Worker, WorkerBinding, WorkerHandle,
    WorkerLifecycleManager, WorkerOutput, WorkerRegistry, WorkerReporter, WorkerStatus,
};
