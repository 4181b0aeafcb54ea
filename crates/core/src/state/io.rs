//! # IO Utilities
//!
//! Runtime directory layout and file primitives for the `.baton` directory.
//!
//! ```text
//! <root>/config.json
//! <root>/active/<slug>.json                 # active-session pointer
//! <root>/sessions/<session_id>/session.meta
//! <root>/sessions/<session_id>/tasks/<task_id>.json
//! <root>/sessions/<session_id>/tasks/graph.json
//! <root>/sessions/<session_id>/messages.log
//! <root>/sessions/<session_id>/.archiving
//! <root>/archive/<session_id>/...           # archived sessions
//! <root>/archive/manifest.json
//! <root>/archive/registry.json
//! ```

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{BatonError, Result};

/// Environment variable overriding the runtime root
pub const RUNTIME_PATH_ENV: &str = "BATON_RUNTIME_PATH";

/// Get the runtime directory path (.baton)
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var(RUNTIME_PATH_ENV) {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".baton")
}

/// Resolved locations of every persisted record
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl RuntimePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths rooted at `BATON_RUNTIME_PATH` or `./.baton`
    pub fn from_env() -> Self {
        Self::new(get_runtime_path())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn active_pointer(&self, slug: &str) -> PathBuf {
        self.active_dir().join(format!("{slug}.json"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    pub fn session_meta(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_META)
    }

    pub fn tasks_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(TASKS_DIR)
    }

    pub fn messages_log(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(MESSAGES_LOG)
    }

    pub fn archiving_marker(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(ARCHIVING_MARKER)
    }

    pub fn report_file(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(REPORT_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn archived_session_dir(&self, session_id: &str) -> PathBuf {
        self.archive_dir().join(session_id)
    }

    pub fn manifest(&self) -> PathBuf {
        self.archive_dir().join("manifest.json")
    }

    pub fn registry(&self) -> PathBuf {
        self.archive_dir().join("registry.json")
    }
}

/// File names inside a session directory; identical in both locations
pub const SESSION_META: &str = "session.meta";
pub const TASKS_DIR: &str = "tasks";
pub const MESSAGES_LOG: &str = "messages.log";
pub const ARCHIVING_MARKER: &str = ".archiving";
pub const REPORT_FILE: &str = "report.json";

/// Ensure a directory exists
pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| BatonError::io(path, e))
}

/// Check if a path exists
pub async fn file_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

/// Temp file next to `path`, unique per call
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Write `bytes` to a fresh temp file next to `path` and fsync it.
/// Returns the temp path; the caller publishes it.
pub(crate) async fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }

    let tmp = temp_path_for(path);
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| BatonError::io(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| BatonError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| BatonError::io(&tmp, e))?;
    Ok(tmp)
}

/// Replace `path` with `bytes` atomically (temp file + fsync + rename)
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(BatonError::io(path, e));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes).await
}

/// Read a JSON file; `Ok(None)` if it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                BatonError::validation(format!("malformed record {}: {}", path.display(), e))
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BatonError::io(path, e)),
    }
}

/// Create an empty file only if it does not exist yet. Returns `true` if created.
pub async fn touch_new(path: &Path) -> Result<bool> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => {
            file.sync_all().await.map_err(|e| BatonError::io(path, e))?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(BatonError::io(path, e)),
    }
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BatonError::io(path, e)),
    }
}

/// List entries of a directory by name, skipping dot-files.
/// A missing directory yields an empty list.
pub async fn list_names(dir: &Path, want_dirs: bool) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BatonError::io(dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BatonError::io(dir, e))?
    {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() != want_dirs {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            if !name.starts_with('.') {
                names.push(name);
            }
        }
    }

    names.sort();
    Ok(names)
}
