// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 jobflow contributors

//! Filesystem artifact backend
//!
//! Stores each artifact as a JSON file under `<root>/<run-id>/`, keyed by the
//! BLAKE3 hash of its name. The payload digest is recorded alongside and
//! verified on every read. A finished run gets a `completed` marker holding
//! its completion time, so retention also applies to runs of earlier
//! processes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{Artifact, ArtifactBackend, ArtifactPayload};
use crate::engine::RunId;
use crate::errors::{JobflowError, JobflowResult};

const COMPLETED_MARKER: &str = "completed";

/// Filesystem-based artifact backend
pub struct FilesystemBackend {
    root: PathBuf,
    scratch: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredArtifact {
    name: String,
    producer: String,
    digest: String,
    payload: ArtifactPayload,
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> JobflowError {
    JobflowError::ArtifactStorage {
        message: format!("{}: {}", context, e),
    }
}

fn digest(payload: &ArtifactPayload) -> JobflowResult<String> {
    let bytes =
        serde_json::to_vec(payload).map_err(|e| storage_error("Failed to serialize payload", e))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

async fn read_marker(run_dir: &Path) -> JobflowResult<Option<SystemTime>> {
    let content = match tokio::fs::read_to_string(run_dir.join(COMPLETED_MARKER)).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(storage_error("Failed to read completion marker", e)),
    };

    let millis: u64 = content
        .trim()
        .parse()
        .map_err(|e| storage_error("Malformed completion marker", e))?;
    Ok(Some(UNIX_EPOCH + Duration::from_millis(millis)))
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`, creating the directory if needed
    pub fn new(root: PathBuf) -> JobflowResult<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root)
                .map_err(|e| storage_error("Failed to create artifact directory", e))?;
        }

        Ok(Self {
            root,
            scratch: AtomicU64::new(0),
        })
    }

    fn run_dir(&self, run: RunId) -> PathBuf {
        self.root.join(run.to_string())
    }

    fn artifact_path(&self, run: RunId, name: &str) -> PathBuf {
        let key = blake3::hash(name.as_bytes()).to_hex();
        self.run_dir(run).join(format!("{}.json", &key[..32]))
    }

    fn scratch_path(&self, run: RunId) -> PathBuf {
        let n = self.scratch.fetch_add(1, Ordering::Relaxed);
        self.run_dir(run)
            .join(format!(".{}-{}.tmp", std::process::id(), n))
    }
}

#[async_trait]
impl ArtifactBackend for FilesystemBackend {
    async fn claim_run(&self, run: RunId) -> JobflowResult<bool> {
        match tokio::fs::create_dir(self.run_dir(run)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(storage_error("Failed to create run directory", e)),
        }
    }

    async fn insert(&self, run: RunId, artifact: Artifact) -> JobflowResult<bool> {
        let path = self.artifact_path(run, &artifact.name);

        tokio::fs::create_dir_all(self.run_dir(run))
            .await
            .map_err(|e| storage_error("Failed to create run directory", e))?;

        let stored = StoredArtifact {
            digest: digest(&artifact.payload)?,
            name: artifact.name,
            producer: artifact.producer,
            payload: artifact.payload,
        };
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| storage_error("Failed to serialize artifact", e))?;

        // Written in full to a scratch file, then linked into place. The link
        // fails if the name exists, so the check and the insert are one step
        // and a failed write never leaves a partial artifact behind.
        let scratch = self.scratch_path(run);
        if let Err(e) = tokio::fs::write(&scratch, &json).await {
            let _ = tokio::fs::remove_file(&scratch).await;
            return Err(storage_error("Failed to write artifact", e));
        }

        let linked = tokio::fs::hard_link(&scratch, &path).await;
        let _ = tokio::fs::remove_file(&scratch).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(storage_error("Failed to store artifact", e)),
        }
    }

    async fn fetch(&self, run: RunId, name: &str) -> JobflowResult<Option<Artifact>> {
        let path = self.artifact_path(run, name);

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error("Failed to read artifact", e)),
        };

        let stored: StoredArtifact = serde_json::from_slice(&content)
            .map_err(|e| storage_error("Failed to parse artifact", e))?;

        if digest(&stored.payload)? != stored.digest {
            return Err(JobflowError::ArtifactStorage {
                message: format!("artifact '{}' of run {} failed its integrity check", name, run),
            });
        }

        Ok(Some(Artifact {
            name: stored.name,
            producer: stored.producer,
            payload: stored.payload,
        }))
    }

    async fn mark_completed(&self, run: RunId, at: SystemTime) -> JobflowResult<()> {
        let dir = self.run_dir(run);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_error("Failed to create run directory", e))?;

        let millis = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        tokio::fs::write(dir.join(COMPLETED_MARKER), millis.to_string())
            .await
            .map_err(|e| storage_error("Failed to write completion marker", e))
    }

    async fn completed_at(&self, run: RunId) -> JobflowResult<Option<SystemTime>> {
        read_marker(&self.run_dir(run)).await
    }

    async fn completed_runs(&self) -> JobflowResult<Vec<(RunId, SystemTime)>> {
        let mut runs = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(storage_error("Failed to read artifact directory", e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| storage_error("Failed to read artifact directory", e))?
        {
            let Some(run) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RunId>().ok())
            else {
                continue;
            };

            match read_marker(&entry.path()).await {
                Ok(Some(at)) => runs.push((run, at)),
                Ok(None) => {}
                Err(e) => tracing::warn!(run, "skipping run artifacts: {}", e),
            }
        }

        Ok(runs)
    }

    async fn remove_run(&self, run: RunId) -> JobflowResult<()> {
        match tokio::fs::remove_dir_all(self.run_dir(run)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("Failed to remove run artifacts", e)),
        }
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(name: &str, data: &[u8]) -> Artifact {
        Artifact {
            name: name.into(),
            producer: "build".into(),
            payload: ArtifactPayload::Bytes(data.to_vec()),
        }
    }

    #[tokio::test]
    async fn test_insert_fetch_and_duplicate() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().join("artifacts")).unwrap();

        assert!(backend.insert(1, artifact("bin", b"elf")).await.unwrap());
        assert!(!backend.insert(1, artifact("bin", b"other")).await.unwrap());

        let fetched = backend.fetch(1, "bin").await.unwrap().unwrap();
        assert_eq!(fetched.payload, ArtifactPayload::Bytes(b"elf".to_vec()));
        assert!(backend.fetch(1, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_artifact_fails_integrity_check() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();

        backend.insert(3, artifact("report", b"ok")).await.unwrap();

        let path = backend.artifact_path(3, "report");
        let mut stored: StoredArtifact =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        stored.payload = ArtifactPayload::Bytes(b"forged".to_vec());
        std::fs::write(&path, serde_json::to_vec(&stored).unwrap()).unwrap();

        assert!(matches!(
            backend.fetch(3, "report").await,
            Err(JobflowError::ArtifactStorage { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_run() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();

        backend.insert(5, artifact("bin", b"elf")).await.unwrap();
        backend.remove_run(5).await.unwrap();
        backend.remove_run(5).await.unwrap();

        assert!(backend.fetch(5, "bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_leaves_no_scratch_files() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();

        backend.insert(2, artifact("bin", b"elf")).await.unwrap();
        backend.insert(2, artifact("bin", b"again")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path().join("2"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn test_failed_write_does_not_block_retry() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();

        // A file where the run directory belongs makes every write fail
        std::fs::write(temp.path().join("4"), b"").unwrap();
        assert!(backend.insert(4, artifact("bin", b"elf")).await.is_err());

        std::fs::remove_file(temp.path().join("4")).unwrap();
        assert!(backend.insert(4, artifact("bin", b"elf")).await.unwrap());
        assert!(backend.fetch(4, "bin").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_run_once() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();

        assert!(backend.claim_run(1).await.unwrap());
        assert!(!backend.claim_run(1).await.unwrap());

        // Another process sees the same directory
        let other = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();
        assert!(!other.claim_run(1).await.unwrap());
        assert!(other.claim_run(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_survives_restart() {
        let temp = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();

        backend.insert(7, artifact("bin", b"elf")).await.unwrap();
        backend.insert(8, artifact("bin", b"elf")).await.unwrap();
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        backend.mark_completed(7, at).await.unwrap();

        let reopened = FilesystemBackend::new(temp.path().to_path_buf()).unwrap();
        assert_eq!(reopened.completed_at(7).await.unwrap(), Some(at));
        assert_eq!(reopened.completed_at(8).await.unwrap(), None);
        assert_eq!(reopened.completed_runs().await.unwrap(), vec![(7, at)]);

        // The marker is not mistaken for an artifact
        assert!(reopened.fetch(7, "bin").await.unwrap().is_some());
    }
}
