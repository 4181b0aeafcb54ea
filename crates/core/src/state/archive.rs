//! # Archival Transactions
//!
//! Moves a completed session from `sessions/<id>` to `archive/<id>` and
//! records it in `archive/manifest.json`.
//!
//! 1. **Marker**: create `.archiving` in the session directory and set the
//!    session to `archiving`. A marker already present means a previous run
//!    was interrupted and this one resumes it.
//! 2. **Analysis**: derive metrics and lessons by reading the session only.
//! 3. **Commit**: rename the directory into the archive, append the entry to
//!    the manifest (idempotent on `session_id`), then mark the session
//!    `archived` and delete the marker from its new location.
//! 4. **Registry**: best-effort update of `archive/registry.json`.
//!
//! A directory in the archive that still carries its marker was moved but
//! possibly not recorded; finishing it re-runs the analysis there and
//! completes the manifest append.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::io::{
    ensure_dir, file_exists, list_names, remove_if_exists, touch_new, RuntimePaths,
    ARCHIVING_MARKER, MESSAGES_LOG, TASKS_DIR,
};
use super::messages::{MessageBus, MessageType};
use super::sessions::{Session, SessionStatus, SessionStore};
use super::tasks::{TaskGraphStore, TaskKind, TaskStatus, TaskSummary};
use super::versioned::VersionedFile;
use crate::error::{ArchivalPhase, BatonError, Result};

/// Summary metrics derived in the analysis phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetrics {
    pub tasks: TaskSummary,
    pub messages_by_type: BTreeMap<String, usize>,
    pub gap_closure_iterations: u32,
    pub gate_verdicts: BTreeMap<String, usize>,
    pub escalations: usize,
    pub duration_secs: Option<i64>,
    pub artifact_files: u64,
    pub artifact_bytes: u64,
}

/// Historical record of one session; appended once, never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub session_id: String,
    pub slug: String,
    pub mode: String,
    pub archived_at: DateTime<Utc>,
    pub metrics: ArchiveMetrics,
    pub tags: Vec<String>,
    pub lessons: Vec<String>,
    pub archive_path: PathBuf,
}

/// Per-slug rollup kept in `archive/registry.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub last_session_id: String,
    pub sessions: u32,
    pub last_archived_at: Option<DateTime<Utc>>,
}

pub type Registry = BTreeMap<String, RegistryEntry>;

/// Outcome of [`ArchivalManager::recover`]
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<ArchiveEntry>,
    /// Sessions whose archival could not be finished, with the reason
    pub failed: Vec<(String, BatonError)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.failed.is_empty()
    }
}

/// Runs and recovers archival transactions
#[derive(Debug, Clone)]
pub struct ArchivalManager {
    paths: RuntimePaths,
    sessions: SessionStore,
    manifest: VersionedFile<Vec<ArchiveEntry>>,
    registry: VersionedFile<Registry>,
}

fn phase_error(session_id: &str, phase: ArchivalPhase, err: impl std::fmt::Display) -> BatonError {
    BatonError::ArchivalPhase {
        session_id: session_id.to_string(),
        phase,
        message: err.to_string(),
    }
}

impl ArchivalManager {
    pub fn new(paths: RuntimePaths) -> Self {
        let manifest = VersionedFile::new(paths.manifest(), "archive manifest");
        let registry = VersionedFile::new(paths.registry(), "archive registry");
        Self {
            sessions: SessionStore::new(paths.clone()),
            paths,
            manifest,
            registry,
        }
    }

    /// Archive a completed session, resuming an interrupted run if needed
    #[tracing::instrument(skip(self))]
    pub async fn archive(&self, session_id: &str) -> Result<ArchiveEntry> {
        let active_dir = self.paths.session_dir(session_id);
        let archived_dir = self.paths.archived_session_dir(session_id);

        if file_exists(&archived_dir).await {
            return self.finish_moved(session_id).await;
        }
        if !file_exists(&active_dir).await {
            return Err(BatonError::SessionNotFound(session_id.to_string()));
        }

        // Phase 1: marker
        let session = self.sessions.read_session(session_id).await?;
        let created = touch_new(&active_dir.join(ARCHIVING_MARKER))
            .await
            .map_err(|e| phase_error(session_id, ArchivalPhase::Marker, e))?;
        if created {
            if session.status != SessionStatus::Completed
                && session.status != SessionStatus::Archiving
            {
                remove_if_exists(&active_dir.join(ARCHIVING_MARKER)).await?;
                return Err(BatonError::InvalidSessionTransition {
                    session_id: session_id.to_string(),
                    from: session.status.to_string(),
                    to: SessionStatus::Archiving.to_string(),
                });
            }
            tracing::info!(session_id, "Archival started");
        } else {
            tracing::info!(session_id, "Resuming interrupted archival");
        }
        self.sessions
            .transition(session_id, SessionStatus::Archiving)
            .await
            .map_err(|e| phase_error(session_id, ArchivalPhase::Marker, e))?;

        // Phase 2: read-only analysis
        let entry = self
            .analyze(session_id, &active_dir)
            .await
            .map_err(|e| phase_error(session_id, ArchivalPhase::Analysis, e))?;

        // Phase 3a: single atomic rename
        ensure_dir(&self.paths.archive_dir()).await?;
        tokio::fs::rename(&active_dir, &archived_dir)
            .await
            .map_err(|e| phase_error(session_id, ArchivalPhase::Move, e))?;
        tracing::info!(session_id, to = %archived_dir.display(), "Session moved to archive");

        self.commit(entry).await
    }

    /// Finish a session already renamed into the archive
    async fn finish_moved(&self, session_id: &str) -> Result<ArchiveEntry> {
        let archived_dir = self.paths.archived_session_dir(session_id);
        if !file_exists(&archived_dir.join(ARCHIVING_MARKER)).await {
            // Fully archived earlier
            return self
                .find(session_id)
                .await?
                .ok_or_else(|| {
                    phase_error(
                        session_id,
                        ArchivalPhase::Manifest,
                        "archived without marker and missing from the manifest",
                    )
                });
        }

        tracing::info!(session_id, "Completing archival of moved session");
        if let Some(entry) = self.find(session_id).await? {
            return self.commit(entry).await;
        }
        let entry = self
            .analyze(session_id, &archived_dir)
            .await
            .map_err(|e| phase_error(session_id, ArchivalPhase::Analysis, e))?;
        self.commit(entry).await
    }

    /// Phases 3b, 3c and 4
    async fn commit(&self, entry: ArchiveEntry) -> Result<ArchiveEntry> {
        let session_id = entry.session_id.clone();

        let mut recorded = entry.clone();
        self.manifest
            .update(|current| {
                let entries = current.cloned().unwrap_or_default();
                if let Some(existing) = entries.iter().find(|e| e.session_id == session_id) {
                    recorded = existing.clone();
                    return Ok(None);
                }
                recorded = entry.clone();
                let mut entries = entries;
                entries.push(entry.clone());
                Ok(Some(entries))
            })
            .await
            .map_err(|e| phase_error(&session_id, ArchivalPhase::Manifest, e))?;

        self.sessions
            .transition(&session_id, SessionStatus::Archived)
            .await
            .map_err(|e| phase_error(&session_id, ArchivalPhase::Finalize, e))?;
        remove_if_exists(&self.paths.archived_session_dir(&session_id).join(ARCHIVING_MARKER))
            .await
            .map_err(|e| phase_error(&session_id, ArchivalPhase::Finalize, e))?;

        if let Err(e) = self.update_registry(&recorded).await {
            tracing::warn!(session_id = %session_id, error = %e, "Registry update failed");
        }

        tracing::info!(session_id = %session_id, "Session archived");
        Ok(recorded)
    }

    async fn update_registry(&self, entry: &ArchiveEntry) -> Result<()> {
        self.registry
            .update(|current| {
                let mut registry = current.cloned().unwrap_or_default();
                let slot = registry.entry(entry.slug.clone()).or_default();
                if slot.last_session_id == entry.session_id {
                    return Ok(None);
                }
                slot.last_session_id = entry.session_id.clone();
                slot.sessions += 1;
                slot.last_archived_at = Some(entry.archived_at);
                Ok(Some(registry))
            })
            .await
            .map(|_| ())
    }

    /// Read-only analysis of a session directory
    async fn analyze(&self, session_id: &str, dir: &Path) -> Result<ArchiveEntry> {
        let session = self.sessions.read_session(session_id).await?;
        let tasks = TaskGraphStore::at(dir.join(TASKS_DIR)).list_tasks().await?;
        let messages = MessageBus::at(dir.join(MESSAGES_LOG)).read_all().await?;

        let mut metrics = ArchiveMetrics {
            tasks: TaskSummary::from_tasks(&tasks),
            ..ArchiveMetrics::default()
        };
        for message in &messages {
            *metrics
                .messages_by_type
                .entry(message.kind.to_string())
                .or_default() += 1;
        }
        for gate in &session.gate_results {
            *metrics
                .gate_verdicts
                .entry(gate.verdict.to_string())
                .or_default() += 1;
        }
        metrics.gap_closure_iterations = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Revalidation)
            .count() as u32;
        metrics.escalations = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Escalation)
            .count();
        metrics.duration_secs = session
            .completed_at
            .map(|done| (done - session.created_at).num_seconds());

        let dir = dir.to_path_buf();
        let (files, bytes) = tokio::task::spawn_blocking(move || directory_size(&dir))
            .await
            .map_err(|e| BatonError::validation(format!("analysis task failed: {e}")))?;
        metrics.artifact_files = files;
        metrics.artifact_bytes = bytes;

        let lessons = derive_lessons(&session, &tasks, &messages);
        let mut tags = vec![session.mode.to_string(), session.slug.clone()];
        if metrics.escalations > 0 {
            tags.push("escalated".to_string());
        }
        if session
            .gate_results
            .iter()
            .any(|g| g.verdict.needs_remediation())
        {
            tags.push("remediated".to_string());
        }

        Ok(ArchiveEntry {
            session_id: session.session_id.clone(),
            slug: session.slug.clone(),
            mode: session.mode.to_string(),
            archived_at: Utc::now(),
            metrics,
            tags,
            lessons,
            archive_path: self.paths.archived_session_dir(session_id),
        })
    }

    /// Finish every interrupted archival found in either location. A session
    /// that cannot be finished is logged and skipped; the rest still run.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for (dir, in_archive) in [
            (self.paths.sessions_dir(), false),
            (self.paths.archive_dir(), true),
        ] {
            for id in list_names(&dir, true).await? {
                if !file_exists(&dir.join(&id).join(ARCHIVING_MARKER)).await {
                    continue;
                }
                tracing::info!(session_id = %id, in_archive, "Recovering archival");
                match self.archive(&id).await {
                    Ok(entry) => report.recovered.push(entry),
                    Err(e) => {
                        tracing::error!(session_id = %id, error = %e, "Archival recovery failed");
                        report.failed.push((id, e));
                    }
                }
            }
        }
        Ok(report)
    }

    /// Every archived session, in archival order
    pub async fn list_archived(&self) -> Result<Vec<ArchiveEntry>> {
        Ok(self
            .manifest
            .load()
            .await?
            .map(|record| record.data)
            .unwrap_or_default())
    }

    pub async fn find(&self, session_id: &str) -> Result<Option<ArchiveEntry>> {
        Ok(self
            .list_archived()
            .await?
            .into_iter()
            .find(|e| e.session_id == session_id))
    }

    pub async fn registry(&self) -> Result<Registry> {
        Ok(self
            .registry
            .load()
            .await?
            .map(|record| record.data)
            .unwrap_or_default())
    }
}

/// Files and bytes under `dir`; hidden entries such as the marker don't count
fn directory_size(dir: &Path) -> (u64, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            let len = e.metadata().map(|m| m.len()).unwrap_or(0);
            (files + 1, bytes + len)
        })
}

fn derive_lessons(
    session: &Session,
    tasks: &[super::tasks::Task],
    messages: &[super::messages::Message],
) -> Vec<String> {
    let mut lessons = Vec::new();

    for task in tasks.iter().filter(|t| t.kind == TaskKind::Escalation) {
        lessons.push(format!(
            "{} was escalated to {} after retries ran out",
            task.replaces.as_deref().unwrap_or(&task.subject),
            task.owner
        ));
    }

    let superseded: std::collections::HashSet<&str> =
        tasks.iter().filter_map(|t| t.replaces.as_deref()).collect();
    for task in tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed && !superseded.contains(t.id.as_str()))
    {
        let reason = messages
            .iter()
            .find(|m| m.kind == MessageType::Error && m.task_id.as_deref() == Some(&task.id))
            .map(|m| m.summary.as_str())
            .unwrap_or("no error reported");
        lessons.push(format!("{} failed: {}", task.subject, reason));
    }

    for gate in session.gate_results.iter().filter(|g| g.verdict.needs_remediation()) {
        if messages.iter().any(|m| {
            m.kind == MessageType::GapClosure
                && m.task_id.as_deref() == Some(&gate.task_id)
                && m.summary.contains("exhausted")
        }) {
            lessons.push(format!(
                "{} accepted degraded after {} remediation rounds (score {:.1})",
                gate.task_id, gate.iteration, gate.score
            ));
        }
    }

    lessons
}
