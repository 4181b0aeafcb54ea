//! # Orchestrator Configuration
//!
//! Loaded from `<runtime>/config.json`. Every field has a default, so a
//! missing file or a partial file is fine; a malformed one is an error.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatonError, Result};
use crate::state::io::{read_json, write_json, RuntimePaths};
use crate::swarm::quality::QualityGateConfig;
use crate::swarm::workers::{ProcessSpec, SpawnMode};

/// Configuration for the coordinator and its workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Workers running at once across all roles
    pub global_concurrency: usize,
    /// Workers running at once for a single role
    pub per_role_concurrency: usize,
    /// Retries (and forced unblocks) per task chain before escalating
    pub max_retries: u32,
    /// Fix-Verify iterations per validator before accepting degraded
    pub gap_closure_cap: u32,
    pub worker_timeout_secs: u64,
    /// Overrides the mode template's spawn mode
    pub spawn_mode: Option<SpawnMode>,
    /// Role that takes over tasks whose retries ran out
    pub escalation_role: Option<String>,
    /// Archive sessions as soon as they complete
    pub auto_archive: bool,
    pub quality: QualityGateConfig,
    /// External worker per role
    pub workers: HashMap<String, ProcessSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 4,
            per_role_concurrency: 1,
            max_retries: 1,
            gap_closure_cap: 3,
            worker_timeout_secs: 600,
            spawn_mode: None,
            escalation_role: None,
            auto_archive: true,
            quality: QualityGateConfig::default(),
            workers: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from the runtime directory, defaults when the file is absent
    pub async fn load(paths: &RuntimePaths) -> Result<Self> {
        let config: Self = read_json(&paths.config_file()).await?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, paths: &RuntimePaths) -> Result<()> {
        write_json(&paths.config_file(), self).await
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_concurrency == 0 || self.per_role_concurrency == 0 {
            return Err(BatonError::validation("concurrency limits must be at least 1"));
        }
        if self.worker_timeout_secs == 0 {
            return Err(BatonError::validation("worker_timeout_secs must be at least 1"));
        }
        if self.quality.fail_below > self.quality.threshold {
            return Err(BatonError::validation(
                "quality.fail_below must not exceed quality.threshold",
            ));
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.global_concurrency, 4);
        assert_eq!(config.per_role_concurrency, 1);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.gap_closure_cap, 3);
        assert_eq!(config.quality.threshold, 8.0);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_partial_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        assert_eq!(
            OrchestratorConfig::load(&paths).await.unwrap(),
            OrchestratorConfig::default()
        );

        std::fs::write(
            paths.config_file(),
            r#"{"per_role_concurrency": 2, "workers": {"tester": {"program": "./run-tests"}}}"#,
        )
        .unwrap();
        let config = OrchestratorConfig::load(&paths).await.unwrap();
        assert_eq!(config.per_role_concurrency, 2);
        assert_eq!(config.global_concurrency, 4);
        assert_eq!(config.workers["tester"].program, "./run-tests");
    }

    #[tokio::test]
    async fn test_malformed_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::new(dir.path());
        std::fs::write(paths.config_file(), "{ nope").unwrap();
        assert!(matches!(
            OrchestratorConfig::load(&paths).await,
            Err(BatonError::Validation(_))
        ));

        std::fs::write(paths.config_file(), r#"{"global_concurrency": 0}"#).unwrap();
        assert!(OrchestratorConfig::load(&paths).await.is_err());
    }
}
