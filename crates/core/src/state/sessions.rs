//! # Session Store
//!
//! Top-level workflow runs. A session record lives in
//! `sessions/<session_id>/session.meta` while active and moves with its
//! directory to `archive/<session_id>/` once archived. Which session is live
//! for a workflow slug is recorded in `active/<slug>.json`, a versioned
//! pointer shared by every process touching the runtime directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::io::{ensure_dir, list_names, RuntimePaths, SESSION_META};
use super::tasks::TaskId;
use super::versioned::{VersionedFile, MAX_UPDATE_ATTEMPTS};
use crate::error::{BatonError, Result};
use crate::swarm::quality::Verdict;

/// Closed set of pipeline templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineMode {
    SpecOnly,
    ImplOnly,
    FullLifecycle,
}

impl PipelineMode {
    pub const ALL: [PipelineMode; 3] = [Self::SpecOnly, Self::ImplOnly, Self::FullLifecycle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecOnly => "spec-only",
            Self::ImplOnly => "impl-only",
            Self::FullLifecycle => "full-lifecycle",
        }
    }
}

impl FromStr for PipelineMode {
    type Err = BatonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s.trim())
            .ok_or_else(|| BatonError::InvalidMode(s.to_string()))
    }
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle: `active <-> paused -> completed -> archiving -> archived`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Archiving,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Paused, Self::Completed)
                | (Self::Completed, Self::Archiving)
                | (Self::Archiving, Self::Archived)
        )
    }

    /// Whether the session still holds its slug
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one quality gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub task_id: TaskId,
    pub verdict: Verdict,
    pub score: f64,
    pub critical: u32,
    /// Gap-closure iteration the gate ran in (0 for the first validation)
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

/// A workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Logical workflow this run belongs to
    pub slug: String,
    pub mode: PipelineMode,
    pub scope: String,
    pub status: SessionStatus,
    /// Current pipeline phase, e.g. `PLAN`
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub tasks_total: usize,
    #[serde(default)]
    pub tasks_completed: usize,
    /// Byte offset into `messages.log` consumed by the coordinator
    #[serde(default)]
    pub bus_cursor: u64,
    /// Forced unblocks per task chain root
    #[serde(default)]
    pub unblock_counts: BTreeMap<TaskId, u32>,
    #[serde(default)]
    pub gate_results: Vec<GateRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: u64,
}

/// Partial update for [`SessionStore::update_session`]
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub phase: Option<String>,
    pub tasks_total: Option<usize>,
    pub tasks_completed: Option<usize>,
    pub bus_cursor: Option<u64>,
}

impl SessionPatch {
    fn apply(&self, session: &mut Session) -> Result<()> {
        if let Some(status) = self.status {
            apply_status(session, status)?;
        }
        if let Some(phase) = &self.phase {
            session.phase = phase.clone();
        }
        if let Some(total) = self.tasks_total {
            session.tasks_total = total;
        }
        if let Some(completed) = self.tasks_completed {
            session.tasks_completed = completed;
        }
        if let Some(cursor) = self.bus_cursor {
            session.bus_cursor = cursor;
        }
        session.updated_at = Utc::now();
        Ok(())
    }
}

fn apply_status(session: &mut Session, status: SessionStatus) -> Result<()> {
    if session.status == status {
        return Ok(());
    }
    if !session.status.can_transition_to(status) {
        return Err(BatonError::InvalidSessionTransition {
            session_id: session.session_id.clone(),
            from: session.status.to_string(),
            to: status.to_string(),
        });
    }
    session.status = status;
    if status == SessionStatus::Completed {
        session.completed_at = Some(Utc::now());
    }
    Ok(())
}

/// Record behind `active/<slug>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePointer {
    pub slug: String,
    pub session_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Derive a workflow slug from a free-text scope
pub fn slugify(scope: &str) -> String {
    let mut slug = String::new();
    for c in scope.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug.to_string()
    }
}

fn generate_session_id(slug: &str) -> String {
    let now = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", slug, now.format("%Y%m%d-%H%M%S"), &suffix[..6])
}

/// Store for session records and active pointers
#[derive(Debug, Clone)]
pub struct SessionStore {
    paths: RuntimePaths,
}

impl SessionStore {
    pub fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    fn pointer(&self, slug: &str) -> VersionedFile<ActivePointer> {
        VersionedFile::new(self.paths.active_pointer(slug), format!("active pointer {slug}"))
    }

    fn meta_at(&self, path: PathBuf, session_id: &str) -> VersionedFile<Session> {
        VersionedFile::new(path, format!("session {session_id}"))
    }

    /// Record handle in whichever location currently holds the session
    async fn meta(&self, session_id: &str) -> Result<VersionedFile<Session>> {
        let active = self.meta_at(self.paths.session_meta(session_id), session_id);
        if active.exists().await? {
            return Ok(active);
        }
        let archived = self.meta_at(
            self.paths
                .archived_session_dir(session_id)
                .join(SESSION_META),
            session_id,
        );
        if archived.exists().await? {
            return Ok(archived);
        }
        Err(BatonError::SessionNotFound(session_id.to_string()))
    }

    /// Start a new session for `scope`, claiming its slug
    #[tracing::instrument(skip(self, scope), fields(mode = %mode))]
    pub async fn init_session(&self, mode: PipelineMode, scope: &str) -> Result<Session> {
        if scope.trim().is_empty() {
            return Err(BatonError::validation("session scope must not be empty"));
        }
        let slug = slugify(scope);
        let session_id = generate_session_id(&slug);
        let now = Utc::now();

        let session = Session {
            session_id: session_id.clone(),
            slug: slug.clone(),
            mode,
            scope: scope.trim().to_string(),
            status: SessionStatus::Active,
            phase: String::new(),
            tasks_total: 0,
            tasks_completed: 0,
            bus_cursor: 0,
            unblock_counts: BTreeMap::new(),
            gate_results: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        };

        // The record exists before the pointer names it, so a reader never
        // mistakes a freshly claimed slug for a stale one.
        ensure_dir(&self.paths.tasks_dir(&session_id)).await?;
        let record = self
            .meta_at(self.paths.session_meta(&session_id), &session_id)
            .create(session)
            .await?;

        if let Err(e) = self.claim_slug(&slug, &session_id).await {
            let dir = self.paths.session_dir(&session_id);
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(session_id = %session_id, error = %cleanup, "Failed to remove unclaimed session");
            }
            return Err(e);
        }

        tracing::info!(session_id = %session_id, slug = %slug, "Session created");
        let mut session = record.data;
        session.version = record.version;
        Ok(session)
    }

    async fn claim_slug(&self, slug: &str, session_id: &str) -> Result<()> {
        let pointer = self.pointer(slug);
        let mut last_err = None;

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = pointer.load().await?;
            let expected = current.as_ref().map_or(0, |c| c.version);

            if let Some(current) = &current {
                if current.data.session_id != session_id {
                    match self.read_session(&current.data.session_id).await {
                        Ok(holder) if holder.status.is_live() => {
                            return Err(BatonError::ActiveSessionExists {
                                slug: slug.to_string(),
                                session_id: holder.session_id,
                            });
                        }
                        Ok(_) | Err(BatonError::SessionNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            let claim = ActivePointer {
                slug: slug.to_string(),
                session_id: session_id.to_string(),
                claimed_at: Utc::now(),
            };
            match pointer.compare_and_swap(expected, claim).await {
                Ok(_) => return Ok(()),
                Err(e @ BatonError::StaleWrite { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| BatonError::validation("could not claim slug")))
    }

    /// Session currently holding `slug`, if it is still live
    pub async fn active_for_slug(&self, slug: &str) -> Result<Option<Session>> {
        let Some(pointer) = self.pointer(slug).load().await? else {
            return Ok(None);
        };
        match self.read_session(&pointer.data.session_id).await {
            Ok(session) if session.status.is_live() => Ok(Some(session)),
            Ok(_) | Err(BatonError::SessionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read_session(&self, session_id: &str) -> Result<Session> {
        let record = self
            .meta(session_id)
            .await?
            .load()
            .await?
            .ok_or_else(|| BatonError::SessionNotFound(session_id.to_string()))?;
        let mut session = record.data;
        session.version = record.version;
        Ok(session)
    }

    /// Apply `patch` only if the stored version still equals `expected_version`
    pub async fn update_session(
        &self,
        session_id: &str,
        expected_version: u64,
        patch: SessionPatch,
    ) -> Result<Session> {
        let file = self.meta(session_id).await?;
        let mut session = file
            .load()
            .await?
            .ok_or_else(|| BatonError::SessionNotFound(session_id.to_string()))?
            .data;
        patch.apply(&mut session)?;

        let record = file.compare_and_swap(expected_version, session).await?;
        let mut session = record.data;
        session.version = record.version;
        Ok(session)
    }

    /// Read-modify-write with re-read and retry on conflicts
    pub async fn modify<F>(&self, session_id: &str, mut f: F) -> Result<Session>
    where
        F: FnMut(&mut Session) -> Result<()>,
    {
        let file = self.meta(session_id).await?;
        let record = file
            .update(|current| {
                let Some(current) = current else {
                    return Err(BatonError::SessionNotFound(session_id.to_string()));
                };
                let mut session = current.clone();
                f(&mut session)?;
                session.updated_at = Utc::now();
                Ok(Some(session))
            })
            .await?
            .ok_or_else(|| BatonError::SessionNotFound(session_id.to_string()))?;
        let mut session = record.data;
        session.version = record.version;
        Ok(session)
    }

    /// Move the session through its state machine; same-status is a no-op
    pub async fn transition(&self, session_id: &str, status: SessionStatus) -> Result<Session> {
        let session = self.read_session(session_id).await?;
        if session.status == status {
            return Ok(session);
        }
        let from = session.status;
        let session = self
            .modify(session_id, |s| apply_status(s, status))
            .await?;
        tracing::info!(session_id = %session_id, from = %from, to = %status, "Session transition");
        Ok(session)
    }

    /// Sessions that are active or paused
    pub async fn list_active_sessions(&self) -> Result<Vec<Session>> {
        let mut live = Vec::new();
        for session in self.list_sessions().await? {
            if !session.status.is_live() {
                continue;
            }
            // A record whose init died before claiming the slug is not live
            if self.holds_slug(&session).await? {
                live.push(session);
            } else {
                tracing::debug!(session_id = %session.session_id, "Skipping session without slug claim");
            }
        }
        Ok(live)
    }

    /// Whether the active pointer for the session's slug names it
    pub async fn holds_slug(&self, session: &Session) -> Result<bool> {
        Ok(self
            .pointer(&session.slug)
            .load()
            .await?
            .is_some_and(|p| p.data.session_id == session.session_id))
    }

    /// Make sure the session holds its slug before it runs again. Fails with
    /// `ActiveSessionExists` if another live session took the slug.
    pub async fn reclaim_slug(&self, session: &Session) -> Result<()> {
        if self.holds_slug(session).await? {
            return Ok(());
        }
        tracing::warn!(session_id = %session.session_id, slug = %session.slug, "Reclaiming unclaimed slug");
        self.claim_slug(&session.slug, &session.session_id).await
    }

    /// Every session in the active location, newest first
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for id in list_names(&self.paths.sessions_dir(), true).await? {
            match self.read_session(&id).await {
                Ok(session) => sessions.push(session),
                Err(BatonError::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}
