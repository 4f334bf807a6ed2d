// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Persisted run history
//!
//! Every finished run's report is written as JSON to
//! `<state_dir>/runs/<run-id>.json`. Entries older than the retention window
//! are pruned.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::engine::{RunId, RunReport, StatusCounts, Verdict};
use crate::errors::{JobflowError, JobflowResult};

/// One line of `history list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline: String,
    pub git_ref: String,
    pub verdict: Verdict,
    pub started_at: u64,
    pub duration_ms: u64,
    pub counts: StatusCounts,
}

impl From<&RunReport> for RunSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id,
            pipeline: report.pipeline.clone(),
            git_ref: report.context.git_ref.clone(),
            verdict: report.verdict,
            started_at: report.started_at,
            duration_ms: report.duration_ms,
            counts: report.counts,
        }
    }
}

/// History statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    pub runs: usize,
    pub size_bytes: u64,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

impl HistoryStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;

        if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}

/// Filesystem log of finished runs
pub struct RunHistory {
    dir: PathBuf,
}

fn history_error(action: &str, e: impl std::fmt::Display) -> JobflowError {
    JobflowError::HistoryError {
        message: format!("{}: {}", action, e),
    }
}

impl RunHistory {
    /// History rooted at `<state_dir>/runs`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("runs"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Persist a finished run's report
    pub async fn save(&self, report: &RunReport) -> JobflowResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| history_error("Failed to create history directory", e))?;

        let path = self.path(report.run_id);
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| history_error("Failed to serialize run report", e))?;

        tokio::fs::write(&path, json)
            .await
            .map_err(|e| history_error("Failed to write run report", e))?;

        tracing::debug!(run = report.run_id, path = %path.display(), "run report saved");
        Ok(path)
    }

    /// Load one run's full report
    pub async fn load(&self, run_id: RunId) -> JobflowResult<RunReport> {
        let path = self.path(run_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobflowError::HistoryError {
                    message: format!("No recorded run with id {}", run_id),
                })
            }
            Err(e) => return Err(history_error("Failed to read run report", e)),
        };

        serde_json::from_str(&content).map_err(|e| history_error("Failed to parse run report", e))
    }

    /// Every readable report, oldest first
    async fn entries(&self) -> JobflowResult<Vec<(PathBuf, RunReport, u64)>> {
        let mut entries = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(history_error("Failed to read history directory", e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| history_error("Failed to read history entry", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            // Unreadable entries are skipped rather than failing the listing
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<RunReport>(&content) {
                Ok(report) => entries.push((path, report, content.len() as u64)),
                Err(e) => tracing::warn!(path = %path.display(), "skipping corrupt run report: {}", e),
            }
        }

        entries.sort_by_key(|(_, report, _)| report.run_id);
        Ok(entries)
    }

    /// Summaries of recorded runs, oldest first
    pub async fn list(&self) -> JobflowResult<Vec<RunSummary>> {
        Ok(self
            .entries()
            .await?
            .iter()
            .map(|(_, report, _)| RunSummary::from(report))
            .collect())
    }

    /// Id to assign to the next run so ids stay unique across invocations
    pub async fn next_run_id(&self) -> JobflowResult<RunId> {
        let last = self
            .entries()
            .await?
            .last()
            .map(|(_, report, _)| report.run_id)
            .unwrap_or(0);
        Ok(last + 1)
    }

    /// Remove runs that started more than `retention` ago
    pub async fn prune(&self, retention: Duration) -> JobflowResult<usize> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let cutoff = now.saturating_sub(retention.as_secs());

        let mut removed = 0;
        for (path, report, _) in self.entries().await? {
            if report.started_at < cutoff {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| history_error("Failed to remove run report", e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "pruned run history");
        }
        Ok(removed)
    }

    /// Remove all recorded runs
    pub async fn clear(&self) -> JobflowResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(history_error("Failed to clear run history", e)),
        }
    }

    pub async fn stats(&self) -> JobflowResult<HistoryStats> {
        let entries = self.entries().await?;

        Ok(HistoryStats {
            runs: entries.len(),
            size_bytes: entries.iter().map(|(_, _, size)| size).sum(),
            oldest: entries.iter().map(|(_, r, _)| r.started_at).min(),
            newest: entries.iter().map(|(_, r, _)| r.started_at).max(),
        })
    }
}
