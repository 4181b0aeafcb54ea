//! # Versioned Records
//!
//! Optimistic-concurrency JSON records shared between independent processes.
//!
//! Every committed version is its own immutable file,
//! `.<name>.versions/<N>.json`, holding `{ "version": N, "writer": "...",
//! "data": ... }`. Writers never take locks: version N+1 is committed by
//! hard-linking a fully written temp file to `<N+1>.json`, which fails if any
//! other writer has ever committed N+1. Readers take the highest version
//! present. Version names are never freed: old versions are pruned by
//! replacing their contents with an empty tombstone, so a writer holding a
//! long-stale base can never re-commit a pruned number.
//!
//! `<file>` itself is a best-effort snapshot of the newest version for
//! humans and external tools. It is never read back.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::io::{atomic_write, list_names, write_temp};
use crate::error::{BatonError, Result};

/// Attempts made by [`VersionedFile::update`] before giving up on contention
pub const MAX_UPDATE_ATTEMPTS: usize = 64;

/// Versions kept with full contents behind the newest one
const KEEP_VERSIONS: u64 = 8;

/// Re-reads allowed when the version being read is pruned underneath us
const MAX_LOAD_ATTEMPTS: usize = 64;

/// A record together with its version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    /// Token of the write that produced this version
    #[serde(default)]
    pub writer: String,
    pub data: T,
}

/// Handle to a versioned JSON record on disk
pub struct VersionedFile<T> {
    path: PathBuf,
    versions_dir: PathBuf,
    resource: String,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for VersionedFile<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            versions_dir: self.versions_dir.clone(),
            resource: self.resource.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for VersionedFile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedFile")
            .field("path", &self.path)
            .field("resource", &self.resource)
            .finish()
    }
}

/// Outcome of reading a single version file
enum Slot<T> {
    Present(Versioned<T>),
    /// Tombstoned or removed since it was listed
    Pruned,
}

impl<T> VersionedFile<T>
where
    T: Serialize + DeserializeOwned,
{
    /// `resource` names the record in `StaleWrite` errors
    pub fn new(path: impl Into<PathBuf>, resource: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let versions_dir = path.with_file_name(format!(".{name}.versions"));
        Self {
            path,
            versions_dir,
            resource: resource.into(),
            _phantom: PhantomData,
        }
    }

    /// Snapshot path of the record
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn version_path(&self, version: u64) -> PathBuf {
        self.versions_dir.join(format!("{version}.json"))
    }

    fn stale(&self, expected: u64, found: u64) -> BatonError {
        BatonError::StaleWrite {
            resource: self.resource.clone(),
            expected,
            found,
        }
    }

    /// Highest committed version number, 0 when none exists
    async fn latest(&self) -> Result<u64> {
        let names = list_names(&self.versions_dir, false).await?;
        Ok(names
            .iter()
            .filter_map(|n| n.strip_suffix(".json")?.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    async fn read_version(&self, version: u64) -> Result<Slot<T>> {
        let path = self.version_path(version);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Slot::Pruned),
            Err(e) => return Err(BatonError::io(&path, e)),
        };
        if bytes.is_empty() {
            return Ok(Slot::Pruned);
        }
        let record = serde_json::from_slice(&bytes).map_err(|e| {
            BatonError::validation(format!("malformed record {}: {}", path.display(), e))
        })?;
        Ok(Slot::Present(record))
    }

    /// Load the newest committed version
    pub async fn load(&self) -> Result<Option<Versioned<T>>> {
        for _ in 0..MAX_LOAD_ATTEMPTS {
            let version = self.latest().await?;
            if version == 0 {
                return Ok(None);
            }
            match self.read_version(version).await? {
                Slot::Present(record) => return Ok(Some(record)),
                Slot::Pruned => tokio::task::yield_now().await,
            }
        }

        Err(BatonError::validation(format!(
            "{}: versions pruned faster than they could be read",
            self.resource
        )))
    }

    /// Current version number, 0 when the record does not exist
    pub async fn version(&self) -> Result<u64> {
        self.latest().await
    }

    /// Whether any version of the record has been committed
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.latest().await? > 0)
    }

    /// Write `data` as version `expected + 1`, failing with `StaleWrite` if the
    /// stored version is not `expected`
    pub async fn compare_and_swap(&self, expected: u64, data: T) -> Result<Versioned<T>> {
        let found = self.latest().await?;
        if found != expected {
            return Err(self.stale(expected, found));
        }

        let record = Versioned {
            version: expected + 1,
            writer: uuid::Uuid::new_v4().to_string(),
            data,
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let target = self.version_path(record.version);
        let tmp = write_temp(&target, &bytes).await?;

        let linked = fs::hard_link(&tmp, &target).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(self.stale(expected, record.version));
            }
            Err(e) => return Err(BatonError::io(&target, e)),
        }

        self.prune(record.version).await;
        self.refresh_snapshot(&record, &bytes).await;
        Ok(record)
    }

    /// Tombstone the version that just fell out of the keep window
    async fn prune(&self, committed: u64) {
        if committed <= KEEP_VERSIONS {
            return;
        }
        let old = self.version_path(committed - KEEP_VERSIONS);
        let result: Result<()> = async {
            let tmp = write_temp(&old, b"").await?;
            if let Err(e) = fs::rename(&tmp, &old).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(BatonError::io(&old, e));
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(resource = %self.resource, error = %e, "Failed to prune old version");
        }
    }

    /// Point the snapshot at the newest version. Losing a race to a newer
    /// writer only matters if that writer's snapshot landed first, so re-check.
    async fn refresh_snapshot(&self, record: &Versioned<T>, bytes: &[u8]) {
        let mut written = record.version;
        let mut result: Result<()> = atomic_write(&self.path, bytes).await;
        for _ in 0..4 {
            if result.is_err() {
                break;
            }
            match self.load().await {
                Ok(Some(newest)) if newest.version > written => {
                    written = newest.version;
                    result = match serde_json::to_vec_pretty(&newest) {
                        Ok(bytes) => atomic_write(&self.path, &bytes).await,
                        Err(e) => Err(e.into()),
                    };
                }
                Ok(_) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = result {
            tracing::warn!(resource = %self.resource, error = %e, "Failed to refresh snapshot");
        }
    }

    /// Create the record; fails with `StaleWrite` if it already exists
    pub async fn create(&self, data: T) -> Result<Versioned<T>> {
        self.compare_and_swap(0, data).await
    }

    /// Read-modify-write with automatic re-read and retry on conflicts.
    ///
    /// `f` receives the current data (`None` if the record does not exist)
    /// and returns the new data, or `None` to leave the record untouched.
    /// Returns the record as it stands afterwards.
    pub async fn update<F>(&self, mut f: F) -> Result<Option<Versioned<T>>>
    where
        F: FnMut(Option<&T>) -> Result<Option<T>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.load().await?;
            let expected = current.as_ref().map_or(0, |c| c.version);
            let Some(next) = f(current.as_ref().map(|c| &c.data))? else {
                return Ok(current);
            };

            match self.compare_and_swap(expected, next).await {
                Ok(record) => return Ok(Some(record)),
                Err(e @ BatonError::StaleWrite { .. }) => {
                    tracing::debug!(resource = %self.resource, attempt, "Stale write, retrying");
                    last_err = Some(e);
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| self.stale(0, 0)))
    }
}

/// Yield first, then sleep a small jittered interval so contenders spread out
async fn backoff(attempt: usize) {
    if attempt < 2 {
        tokio::task::yield_now().await;
        return;
    }
    let jitter = (uuid::Uuid::new_v4().as_u128() % 4) as u64;
    let millis = (attempt as u64).min(8) + jitter;
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
