//! # Message Bus
//!
//! Append-only JSON-lines log at `sessions/<id>/messages.log`; the only
//! channel between the coordinator and its workers.
//!
//! Every `log` is a single `O_APPEND` write followed by a sync, so lines from
//! concurrent writers never interleave and a sender's messages stay in send
//! order. Readers track a byte-offset cursor. A trailing line without its
//! newline is a write still in flight and is left for the next poll.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

use super::io::{ensure_dir, RuntimePaths};
use super::tasks::TaskId;
use crate::error::{BatonError, Result};

/// Address of the coordinator on the bus
pub const COORDINATOR: &str = "coordinator";

/// Address reaching every role
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskStarted,
    TaskComplete,
    TaskBlocked,
    DiscussionNeeded,
    GapClosure,
    Error,
    PhaseTransition,
    Escalation,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStarted => "task_started",
            Self::TaskComplete => "task_complete",
            Self::TaskBlocked => "task_blocked",
            Self::DiscussionNeeded => "discussion_needed",
            Self::GapClosure => "gap_closure",
            Self::Error => "error",
            Self::PhaseTransition => "phase_transition",
            Self::Escalation => "escalation",
        }
    }

    /// Whether this type ends a worker's turn on a task
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskComplete | Self::TaskBlocked | Self::Error)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bus message; immutable once appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub summary: String,
    #[serde(rename = "ref", default)]
    pub artifact_ref: Option<String>,
    /// Structured detail, e.g. a quality report
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            kind,
            task_id: None,
            summary: summary.into(),
            artifact_ref: None,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn addressed_to(&self, role: &str) -> bool {
        self.to == role || self.to == BROADCAST
    }
}

/// A message together with the cursor just past it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub cursor: u64,
}

/// Lazy, finite sequence of messages for one role, read from a snapshot of
/// the log taken at poll time
#[derive(Debug)]
pub struct Inbox {
    role: String,
    buf: Vec<u8>,
    pos: usize,
    base: u64,
}

impl Inbox {
    /// Cursor just past the last line consumed
    pub fn cursor(&self) -> u64 {
        self.base + self.pos as u64
    }
}

impl Iterator for Inbox {
    type Item = Result<Delivery>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = &self.buf[self.pos..];
            // No newline: torn or in-flight write
            let end = rest.iter().position(|b| *b == b'\n')?;
            let line = &rest[..end];
            let line_start = self.cursor();
            self.pos += end + 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<Message>(line) {
                Ok(message) if message.addressed_to(&self.role) => {
                    return Some(Ok(Delivery {
                        message,
                        cursor: self.cursor(),
                    }))
                }
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(BatonError::validation(format!(
                        "malformed message at offset {}: {}",
                        line_start, e
                    ))))
                }
            }
        }
    }
}

/// Handle to one session's message log
#[derive(Debug, Clone)]
pub struct MessageBus {
    path: PathBuf,
    notify: Arc<Notify>,
}

impl MessageBus {
    pub fn new(paths: &RuntimePaths, session_id: &str) -> Self {
        Self::at(paths.messages_log(session_id))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append `message`; returns its id
    pub async fn log(&self, message: &Message) -> Result<String> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent).await?;
        }

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| BatonError::io(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| BatonError::io(&self.path, e))?;
        file.sync_data()
            .await
            .map_err(|e| BatonError::io(&self.path, e))?;

        tracing::debug!(
            message_id = %message.id,
            kind = %message.kind,
            from = %message.from,
            to = %message.to,
            task_id = ?message.task_id,
            "Message logged"
        );
        self.notify.notify_one();
        Ok(message.id.clone())
    }

    /// Messages for `role` (or broadcast) appended after `since`
    pub async fn poll(&self, role: &str, since: u64) -> Result<Inbox> {
        let mut buf = Vec::new();
        match fs::File::open(&self.path).await {
            Ok(mut file) => {
                let len = file
                    .metadata()
                    .await
                    .map_err(|e| BatonError::io(&self.path, e))?
                    .len();
                if since < len {
                    file.seek(std::io::SeekFrom::Start(since))
                        .await
                        .map_err(|e| BatonError::io(&self.path, e))?;
                    file.read_to_end(&mut buf)
                        .await
                        .map_err(|e| BatonError::io(&self.path, e))?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BatonError::io(&self.path, e)),
        }

        Ok(Inbox {
            role: role.to_string(),
            buf,
            pos: 0,
            base: since,
        })
    }

    /// Suspend until the next `log` on this handle or an explicit `notify`
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wake a waiting coordinator, e.g. after an external worker exited
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Byte length of the log; messages logged later land past it
    pub async fn end(&self) -> Result<u64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(BatonError::io(&self.path, e)),
        }
    }

    /// Every well-formed message in the log, in append order
    pub async fn read_all(&self) -> Result<Vec<Message>> {
        self.read_from(0).await
    }

    /// Well-formed messages appended at or after byte offset `since`
    pub async fn read_from(&self, since: u64) -> Result<Vec<Message>> {
        let inbox = self.poll(BROADCAST, since).await?;
        let complete = inbox.buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

        let mut messages = Vec::new();
        for line in inbox.buf[..complete].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(log = %self.path.display(), error = %e, "Skipping malformed message")
                }
            }
        }
        Ok(messages)
    }

    /// Terminal message of the latest attempt at `task_id`, if it ended.
    /// A later `task_started` opens a new attempt and clears the earlier one.
    pub async fn terminal_for(&self, task_id: &str) -> Result<Option<Message>> {
        self.terminal_since(task_id, 0).await
    }

    /// Like [`terminal_for`](Self::terminal_for), looking only at messages
    /// logged at or after `since`
    pub async fn terminal_since(&self, task_id: &str, since: u64) -> Result<Option<Message>> {
        let mut terminal = None;
        for message in self.read_from(since).await? {
            if message.task_id.as_deref() != Some(task_id) {
                continue;
            }
            if message.kind == MessageType::TaskStarted {
                terminal = None;
            } else if message.kind.is_terminal() {
                terminal = Some(message);
            }
        }
        Ok(terminal)
    }
}
