// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Engine configuration (`jobflow.toml`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{JobflowError, JobflowResult};
use crate::pipeline::duration;

/// Default config file looked up in the working directory
pub const CONFIG_FILE: &str = "jobflow.toml";

/// Where run-scoped artifacts live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackendKind {
    #[default]
    Memory,
    Filesystem,
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Jobs of one run executing at the same time
    pub max_parallel_jobs: usize,

    #[serde(with = "duration::required")]
    pub artifact_retention: Duration,

    #[serde(with = "duration::required")]
    pub history_retention: Duration,

    /// How long a cancelled step may take to exit before it is killed
    #[serde(with = "duration::required")]
    pub shutdown_grace: Duration,

    /// Root of run history and filesystem artifacts, relative to the
    /// working directory unless absolute
    pub state_dir: PathBuf,

    pub artifact_backend: ArtifactBackendKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            artifact_retention: Duration::from_secs(24 * 3600),
            history_retention: Duration::from_secs(7 * 24 * 3600),
            shutdown_grace: Duration::from_secs(10),
            state_dir: PathBuf::from(".jobflow"),
            artifact_backend: ArtifactBackendKind::Memory,
        }
    }
}

impl EngineConfig {
    /// Load from an explicit file, else `jobflow.toml` in `base_dir` if
    /// present, else defaults
    pub fn load(explicit: Option<&Path>, base_dir: &Path) -> JobflowResult<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = base_dir.join(CONFIG_FILE);
                if !candidate.exists() {
                    tracing::debug!("no {} found, using defaults", CONFIG_FILE);
                    return Ok(Self::default());
                }
                candidate
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|e| JobflowError::FileReadError {
            path: path.clone(),
            error: e.to_string(),
        })?;

        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> JobflowResult<Self> {
        let config: Self = toml::from_str(content)?;
        if config.max_parallel_jobs == 0 {
            return Err(JobflowError::Toml {
                message: "max_parallel_jobs must be at least 1".into(),
            });
        }
        Ok(config)
    }

    /// State directory resolved against `base_dir`
    pub fn state_dir(&self, base_dir: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            base_dir.join(&self.state_dir)
        }
    }
}
