// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Artifact store
//!
//! Artifacts are named payloads scoped to a run. Each name is written once,
//! and is readable only by jobs that transitively need the producer. After a
//! run completes its artifacts stay readable for the retention period, then
//! [`ArtifactStore::reclaim_expired`] drops them.

mod filesystem;
mod memory;

pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::engine::RunId;
use crate::errors::{JobflowError, JobflowResult};
use crate::pipeline::JobGraph;

/// Artifact contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactPayload {
    /// Inline bytes
    Bytes(Vec<u8>),
    /// Files in the producing workspace
    Files(Vec<PathBuf>),
}

impl ArtifactPayload {
    pub fn size(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Files(files) => files.len(),
        }
    }
}

/// A named payload written by one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub producer: String,
    pub payload: ArtifactPayload,
}

/// Storage behind the artifact store
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    /// Reserve a run id; false if the id already has stored state
    async fn claim_run(&self, run: RunId) -> JobflowResult<bool>;

    /// Insert unless the name already exists for the run; returns whether it
    /// was inserted. The check and the insert are one atomic operation.
    async fn insert(&self, run: RunId, artifact: Artifact) -> JobflowResult<bool>;

    async fn fetch(&self, run: RunId, name: &str) -> JobflowResult<Option<Artifact>>;

    /// Record when a run finished
    async fn mark_completed(&self, run: RunId, at: SystemTime) -> JobflowResult<()>;

    async fn completed_at(&self, run: RunId) -> JobflowResult<Option<SystemTime>>;

    /// Every finished run still stored, with its completion time
    async fn completed_runs(&self) -> JobflowResult<Vec<(RunId, SystemTime)>>;

    /// Drop every artifact of a run
    async fn remove_run(&self, run: RunId) -> JobflowResult<()>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Run-scoped artifact handoff between jobs
pub struct ArtifactStore {
    backend: Arc<dyn ArtifactBackend>,
    retention: Duration,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn ArtifactBackend>, retention: Duration) -> Self {
        Self { backend, retention }
    }

    /// In-memory store, used by tests and by default
    pub fn in_memory(retention: Duration) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), retention)
    }

    /// Reserve `run` for a new run; false if it already has stored artifacts
    pub async fn claim_run(&self, run: RunId) -> JobflowResult<bool> {
        self.backend.claim_run(run).await
    }

    /// Write an artifact; each name may be written once per run
    pub async fn put(
        &self,
        run: RunId,
        name: &str,
        producer: &str,
        payload: ArtifactPayload,
    ) -> JobflowResult<()> {
        let artifact = Artifact {
            name: name.to_string(),
            producer: producer.to_string(),
            payload,
        };

        if !self.backend.insert(run, artifact).await? {
            return Err(JobflowError::DuplicateArtifact {
                run,
                name: name.to_string(),
            });
        }

        tracing::debug!(run, artifact = name, producer, backend = self.backend.name(), "artifact stored");
        Ok(())
    }

    /// Read an artifact on behalf of `reader`
    ///
    /// Fails with `ArtifactNotFound` if the artifact is absent or expired, or
    /// if `reader` does not need its producer.
    pub async fn get(
        &self,
        run: RunId,
        name: &str,
        reader: &str,
        graph: &JobGraph,
    ) -> JobflowResult<Artifact> {
        let not_found = || JobflowError::ArtifactNotFound {
            run,
            name: name.to_string(),
        };

        if self.is_expired(run).await? {
            return Err(not_found());
        }

        let artifact = self.backend.fetch(run, name).await?.ok_or_else(not_found)?;

        if artifact.producer != reader && !graph.depends_on(reader, &artifact.producer) {
            tracing::debug!(
                run,
                artifact = name,
                reader,
                producer = %artifact.producer,
                "artifact hidden from job that does not need its producer"
            );
            return Err(not_found());
        }

        Ok(artifact)
    }

    /// Start the retention clock of a finished run
    pub async fn complete_run(&self, run: RunId) -> JobflowResult<()> {
        self.backend.mark_completed(run, SystemTime::now()).await
    }

    fn expired(&self, completed: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(completed)
            .is_ok_and(|age| age > self.retention)
    }

    async fn is_expired(&self, run: RunId) -> JobflowResult<bool> {
        Ok(self
            .backend
            .completed_at(run)
            .await?
            .is_some_and(|done| self.expired(done)))
    }

    /// Remove runs whose retention has elapsed; returns how many were dropped
    pub async fn reclaim_expired(&self) -> JobflowResult<usize> {
        let expired: Vec<RunId> = self
            .backend
            .completed_runs()
            .await?
            .into_iter()
            .filter(|(_, done)| self.expired(*done))
            .map(|(run, _)| run)
            .collect();

        for run in &expired {
            self.backend.remove_run(*run).await?;
            tracing::debug!(run, backend = self.backend.name(), "expired artifacts reclaimed");
        }

        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineDefinition;

    fn graph() -> JobGraph {
        let yaml = r#"
name: artifacts
jobs:
  - name: build
    steps: [{ run: "true" }]
  - name: test
    needs: [build]
    steps: [{ run: "true" }]
  - name: package
    needs: [test]
    steps: [{ run: "true" }]
  - name: lint
    steps: [{ run: "true" }]
"#;
        JobGraph::build(&PipelineDefinition::from_yaml(yaml).unwrap()).unwrap()
    }

    fn bytes(data: &str) -> ArtifactPayload {
        ArtifactPayload::Bytes(data.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_dependents_can_read() {
        let store = ArtifactStore::in_memory(Duration::from_secs(60));
        let graph = graph();

        store.put(1, "bin", "build", bytes("elf")).await.unwrap();

        let direct = store.get(1, "bin", "test", &graph).await.unwrap();
        assert_eq!(direct.payload, bytes("elf"));

        // transitive dependents see it too
        assert!(store.get(1, "bin", "package", &graph).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_dependent_gets_not_found() {
        let store = ArtifactStore::in_memory(Duration::from_secs(60));
        let graph = graph();

        store.put(1, "bin", "build", bytes("elf")).await.unwrap();

        assert!(matches!(
            store.get(1, "bin", "lint", &graph).await,
            Err(JobflowError::ArtifactNotFound { .. })
        ));
        assert!(matches!(
            store.get(2, "bin", "test", &graph).await,
            Err(JobflowError::ArtifactNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_write_rejected() {
        let store = ArtifactStore::in_memory(Duration::from_secs(60));

        store.put(1, "bin", "build", bytes("a")).await.unwrap();
        assert!(matches!(
            store.put(1, "bin", "test", bytes("b")).await,
            Err(JobflowError::DuplicateArtifact { .. })
        ));

        // Same name in another run is fine
        store.put(2, "bin", "build", bytes("c")).await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_expiry() {
        let store = ArtifactStore::in_memory(Duration::ZERO);
        let graph = graph();

        store.put(1, "bin", "build", bytes("elf")).await.unwrap();
        assert!(store.get(1, "bin", "test", &graph).await.is_ok());

        store.complete_run(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(store.get(1, "bin", "test", &graph).await.is_err());
        assert_eq!(store.reclaim_expired().await.unwrap(), 1);
        assert_eq!(store.reclaim_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claimed_run_cannot_be_claimed_again() {
        let store = ArtifactStore::in_memory(Duration::from_secs(60));

        assert!(store.claim_run(1).await.unwrap());
        assert!(!store.claim_run(1).await.unwrap());

        store.put(2, "bin", "build", bytes("elf")).await.unwrap();
        assert!(!store.claim_run(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaims_runs_finished_by_earlier_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().join("artifacts");

        let earlier = ArtifactStore::new(
            Arc::new(FilesystemBackend::new(root.clone()).unwrap()),
            Duration::from_secs(60),
        );
        earlier.put(1, "bin", "build", bytes("elf")).await.unwrap();
        earlier.complete_run(1).await.unwrap();
        earlier.put(2, "bin", "build", bytes("elf")).await.unwrap();
        drop(earlier);

        let later = ArtifactStore::new(
            Arc::new(FilesystemBackend::new(root.clone()).unwrap()),
            Duration::ZERO,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(later.reclaim_expired().await.unwrap(), 1);
        assert!(!root.join("1").exists());
        // Never completed, so never reclaimed
        assert!(root.join("2").exists());
    }
}
