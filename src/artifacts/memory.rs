// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! In-memory artifact backend

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::RwLock;

use super::{Artifact, ArtifactBackend};
use crate::engine::RunId;
use crate::errors::JobflowResult;

#[derive(Debug, Default)]
struct RunArtifacts {
    artifacts: HashMap<String, Artifact>,
    completed: Option<SystemTime>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    runs: RwLock<HashMap<RunId, RunArtifacts>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactBackend for MemoryBackend {
    async fn claim_run(&self, run: RunId) -> JobflowResult<bool> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run) {
            return Ok(false);
        }
        runs.insert(run, RunArtifacts::default());
        Ok(true)
    }

    async fn insert(&self, run: RunId, artifact: Artifact) -> JobflowResult<bool> {
        let mut runs = self.runs.write().await;
        let artifacts = &mut runs.entry(run).or_default().artifacts;

        if artifacts.contains_key(&artifact.name) {
            return Ok(false);
        }

        artifacts.insert(artifact.name.clone(), artifact);
        Ok(true)
    }

    async fn fetch(&self, run: RunId, name: &str) -> JobflowResult<Option<Artifact>> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run)
            .and_then(|run| run.artifacts.get(name))
            .cloned())
    }

    async fn mark_completed(&self, run: RunId, at: SystemTime) -> JobflowResult<()> {
        self.runs.write().await.entry(run).or_default().completed = Some(at);
        Ok(())
    }

    async fn completed_at(&self, run: RunId) -> JobflowResult<Option<SystemTime>> {
        Ok(self.runs.read().await.get(&run).and_then(|run| run.completed))
    }

    async fn completed_runs(&self) -> JobflowResult<Vec<(RunId, SystemTime)>> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .filter_map(|(id, run)| run.completed.map(|at| (*id, at)))
            .collect())
    }

    async fn remove_run(&self, run: RunId) -> JobflowResult<()> {
        self.runs.write().await.remove(&run);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
