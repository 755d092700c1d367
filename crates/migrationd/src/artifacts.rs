//! On-disk artifact files.
//!
//! Each artifact owns a directory named after its UUID below the artifacts
//! root. One reader-writer lock guards all of them: imports hold a read
//! guard for as long as they use a file, while writes (uploads, downloads,
//! deletions) take the lock exclusively.
//!
//! The lock is fair, so a task holding an [`ArtifactFile`] must not wait on
//! the lock again. Everything a task needs is opened in one
//! [`ArtifactStore::open_all`] call, whose files share a single guard.

use crate::error::{MigrationError, MigrationResult};
use migration_types::Artifact;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use uuid::Uuid;

/// A file of an artifact, readable for as long as this value lives.
pub struct ArtifactFile {
    path: PathBuf,
    _guard: Arc<OwnedRwLockReadGuard<()>>,
}

impl ArtifactFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name, used as the volume name when importing.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    lock: Arc<RwLock<()>>,
    client: reqwest::Client,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> MigrationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;

        Ok(Self {
            root: root.into(),
            lock: Arc::new(RwLock::new(())),
            client,
        })
    }

    pub fn dir(&self, uuid: Uuid) -> PathBuf {
        self.root.join(uuid.to_string())
    }

    /// Returns true if the artifact has a local file or can fetch one.
    pub async fn is_available(&self, artifact: &Artifact) -> bool {
        if artifact.source_url.is_some() {
            return true;
        }
        let _guard = self.lock.read().await;
        matches!(first_file(&self.dir(artifact.uuid)).await, Ok(Some(_)))
    }

    /// Opens the artifact's file, downloading it first if it is only known
    /// by URL.
    pub async fn open(&self, artifact: &Artifact) -> MigrationResult<ArtifactFile> {
        self.open_all(&[artifact]).await?.pop().ok_or_else(|| no_files(artifact))
    }

    /// Opens the files of all `artifacts` under one read guard, in order.
    ///
    /// Artifacts only known by URL are downloaded first, under the write
    /// lock and before any guard is handed out.
    pub async fn open_all(&self, artifacts: &[&Artifact]) -> MigrationResult<Vec<ArtifactFile>> {
        let mut missing = Vec::new();
        {
            let _guard = self.lock.read().await;
            for artifact in artifacts {
                if first_file(&self.dir(artifact.uuid)).await?.is_none() {
                    missing.push(*artifact);
                }
            }
        }

        if !missing.is_empty() {
            let _write = self.lock.write().await;
            for artifact in missing {
                let dir = self.dir(artifact.uuid);
                // Another task may have fetched it while we waited.
                if first_file(&dir).await?.is_some() {
                    continue;
                }
                let url = artifact.source_url.as_deref().ok_or_else(|| no_files(artifact))?;
                self.fetch(url, &dir).await?;
            }
        }

        let guard = Arc::new(Arc::clone(&self.lock).read_owned().await);
        let mut files = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let path = first_file(&self.dir(artifact.uuid))
                .await?
                .ok_or_else(|| no_files(artifact))?;
            files.push(ArtifactFile {
                path,
                _guard: Arc::clone(&guard),
            });
        }
        Ok(files)
    }

    /// Stores `contents` as file `name` of artifact `uuid`.
    pub async fn write_file(&self, uuid: Uuid, name: &str, contents: &[u8]) -> MigrationResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name == ".." {
            return Err(MigrationError::Artifact(format!("Invalid file name: {:?}", name)));
        }

        let _write = self.lock.write().await;
        let dir = self.dir(uuid);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Removes every file of artifact `uuid`.
    pub async fn delete(&self, uuid: Uuid) -> MigrationResult<()> {
        let _write = self.lock.write().await;
        match tokio::fs::remove_dir_all(self.dir(uuid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, url: &str, dir: &Path) -> MigrationResult<()> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| MigrationError::Artifact(format!("Invalid artifact URL {}: {}", url, e)))?;
        let name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("artifact")
            .to_string();

        tracing::info!(url, "Fetching artifact");
        let response = self.client.get(parsed).send().await?.error_for_status()?;
        let body = response.bytes().await?;

        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(name), &body).await?;
        Ok(())
    }
}

fn no_files(artifact: &Artifact) -> MigrationError {
    MigrationError::Artifact(format!("Artifact {} has no files", artifact.uuid))
}

/// First regular file of `dir` in name order.
async fn first_file(dir: &Path) -> MigrationResult<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files.into_iter().next())
}
