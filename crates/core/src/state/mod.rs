//! # Durable State
//!
//! File-backed stores under the runtime directory. Every mutable record is a
//! `VersionedFile`; the message log is append-only.

pub mod archive;
pub mod graph;
pub mod io;
pub mod messages;
pub mod sessions;
pub mod tasks;
pub mod versioned;

pub use archive::{
    ArchivalManager, ArchiveEntry, ArchiveMetrics, RecoveryReport, Registry, RegistryEntry,
};
pub use io::{get_runtime_path, RuntimePaths, RUNTIME_PATH_ENV};
pub use messages::{Delivery, Inbox, Message, MessageBus, MessageType, BROADCAST, COORDINATOR};
pub use sessions::{GateRecord, PipelineMode, Session, SessionPatch, SessionStatus, SessionStore};
pub use tasks::{NewTask, Task, TaskGraphStore, TaskId, TaskKind, TaskStatus, TaskSummary};
pub use versioned::{Versioned, VersionedFile};
