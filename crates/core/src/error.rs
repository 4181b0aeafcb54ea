//! # Errors
//!
//! Typed errors raised by the stores and the worker layer. The coordinator
//! translates worker-level failures into compensating tasks; everything else
//! propagates to the caller as one of these variants.

use std::path::PathBuf;

use thiserror::Error;

/// Phase of an archival transaction, used to scope recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivalPhase {
    Marker,
    Analysis,
    Move,
    Manifest,
    Finalize,
    Registry,
}

impl std::fmt::Display for ArchivalPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Marker => "marker",
            Self::Analysis => "analysis",
            Self::Move => "move",
            Self::Manifest => "manifest",
            Self::Finalize => "finalize",
            Self::Registry => "registry",
        };
        f.write_str(name)
    }
}

/// Error type shared by every store and the worker layer
#[derive(Error, Debug)]
pub enum BatonError {
    /// Malformed record or argument
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task subject '{subject}' already exists in this session")]
    DuplicateSubject { subject: String },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("invalid transition for task '{task_id}': {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// Optimistic version check failed; re-read and retry
    #[error("stale write to {resource}: expected version {expected}, found {found}")]
    StaleWrite {
        resource: String,
        expected: u64,
        found: u64,
    },

    #[error("worker '{role}' timed out on task '{task_id}' after {after_secs}s")]
    WorkerTimeout {
        task_id: String,
        role: String,
        after_secs: u64,
    },

    #[error("worker '{role}' reported an error on task '{task_id}': {summary}")]
    WorkerReported {
        task_id: String,
        role: String,
        summary: String,
    },

    #[error("archival of '{session_id}' failed in {phase} phase: {message}")]
    ArchivalPhase {
        session_id: String,
        phase: ArchivalPhase,
        message: String,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid pipeline mode: {0}")]
    InvalidMode(String),

    #[error("no worker registered for role '{0}'")]
    UnknownRole(String),

    #[error("workflow '{slug}' already has a live session: {session_id}")]
    ActiveSessionExists { slug: String, session_id: String },

    #[error("invalid transition for session '{session_id}': {from} -> {to}")]
    InvalidSessionTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for the core stores
pub type Result<T> = std::result::Result<T, BatonError>;

impl BatonError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the caller can retry (possibly after re-reading state)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StaleWrite { .. }
                | Self::WorkerTimeout { .. }
                | Self::WorkerReported { .. }
                | Self::ArchivalPhase { .. }
                | Self::Io { .. }
        )
    }

    /// Recovery action shown to the user for this error
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::Serialization(_) => {
                "fix the malformed record or argument and retry"
            }
            Self::DuplicateSubject { .. } => "use a different task subject",
            Self::DependencyCycle { .. } => "remove one of the listed dependency edges",
            Self::InvalidTransition { .. } => "re-read the task; only the owning worker moves it forward",
            Self::StaleWrite { .. } => "re-read the record and retry the update",
            Self::WorkerTimeout { .. } | Self::WorkerReported { .. } => {
                "the coordinator retries automatically; inspect the session report if it escalates"
            }
            Self::ArchivalPhase { .. } => "run `baton recover` to finish the interrupted archival",
            Self::SessionNotFound(_) => "check the session id with `baton status`",
            Self::TaskNotFound(_) => "check the task id in the session's tasks directory",
            Self::InvalidMode(_) => "use one of: spec-only, impl-only, full-lifecycle",
            Self::UnknownRole(_) => "register a worker for the role in config.json",
            Self::ActiveSessionExists { .. } => "resume the existing session with `baton resume`",
            Self::InvalidSessionTransition { .. } => "check the session status with `baton status`",
            Self::Io { .. } => "check permissions and free space under the runtime directory",
        }
    }
}
