// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Durable artifact and version-history documents.
//!
//! Two whole-file documents: artifacts keyed by id, and version lists keyed by
//! artifact id. Every write rewrites the full document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::StorageError;
use crate::model::{Artifact, ArtifactVersion};

pub type ArtifactDocument = BTreeMap<String, Artifact>;
pub type VersionDocument = BTreeMap<String, Vec<ArtifactVersion>>;

pub const ARTIFACTS_FILE: &str = "artifacts.json";
pub const VERSIONS_FILE: &str = "artifact_versions.json";

/// Trait for document backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn load_artifacts(&self) -> Result<ArtifactDocument, StorageError>;
    async fn save_artifacts(&self, artifacts: &ArtifactDocument) -> Result<(), StorageError>;
    async fn load_versions(&self) -> Result<VersionDocument, StorageError>;
    async fn save_versions(&self, versions: &VersionDocument) -> Result<(), StorageError>;
}

/// JSON files under a data directory, replaced atomically via rename.
#[derive(Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        let store = Self { dir };
        store.initialise(ARTIFACTS_FILE, &ArtifactDocument::new()).await?;
        store.initialise(VERSIONS_FILE, &VersionDocument::new()).await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an empty document where none exists yet. Runs before the store
    /// is shared, so it never races a locked write.
    async fn initialise<T: Serialize>(&self, name: &str, empty: &T) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::info!(path = %path.display(), "initialising empty document");
                self.write_document(name, empty).await
            }
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Reads never write; a document that vanished reads as empty until the
    /// next locked write recreates it.
    async fn read_document<T>(&self, name: &str) -> Result<T, StorageError>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "document missing, reading as empty");
                Ok(T::default())
            }
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn write_document<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let bytes = serde_json::to_vec_pretty(value)?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for JsonFileStore {
    async fn load_artifacts(&self) -> Result<ArtifactDocument, StorageError> {
        self.read_document(ARTIFACTS_FILE).await
    }

    async fn save_artifacts(&self, artifacts: &ArtifactDocument) -> Result<(), StorageError> {
        self.write_document(ARTIFACTS_FILE, artifacts).await
    }

    async fn load_versions(&self) -> Result<VersionDocument, StorageError> {
        self.read_document(VERSIONS_FILE).await
    }

    async fn save_versions(&self, versions: &VersionDocument) -> Result<(), StorageError> {
        self.write_document(VERSIONS_FILE, versions).await
    }
}

/// In-memory backend for testing
#[derive(Default)]
pub struct MemoryStore {
    artifacts: RwLock<ArtifactDocument>,
    versions: RwLock<VersionDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn load_artifacts(&self) -> Result<ArtifactDocument, StorageError> {
        Ok(self.artifacts.read().await.clone())
    }

    async fn save_artifacts(&self, artifacts: &ArtifactDocument) -> Result<(), StorageError> {
        *self.artifacts.write().await = artifacts.clone();
        Ok(())
    }

    async fn load_versions(&self) -> Result<VersionDocument, StorageError> {
        Ok(self.versions.read().await.clone())
    }

    async fn save_versions(&self, versions: &VersionDocument) -> Result<(), StorageError> {
        *self.versions.write().await = versions.clone();
        Ok(())
    }
}

/// Storage wrapper that serialises read-modify-write cycles.
#[derive(Clone)]
pub struct ArtifactStorage {
    backend: Arc<dyn ArtifactStore>,
    write_lock: Arc<Mutex<()>>,
}

impl ArtifactStorage {
    pub fn new(backend: impl ArtifactStore + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    pub async fn list(&self) -> Result<Vec<Artifact>, StorageError> {
        Ok(self.backend.load_artifacts().await?.into_values().collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Artifact>, StorageError> {
        Ok(self.backend.load_artifacts().await?.remove(id))
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.backend.load_artifacts().await?.contains_key(id))
    }

    pub async fn save(&self, artifact: &Artifact) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut artifacts = self.backend.load_artifacts().await?;
        artifacts.insert(artifact.id.clone(), artifact.clone());
        self.backend.save_artifacts(&artifacts).await
    }

    /// Remove an artifact and its history. Returns false if it was absent.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut artifacts = self.backend.load_artifacts().await?;
        let removed = artifacts.remove(id).is_some();
        if removed {
            self.backend.save_artifacts(&artifacts).await?;
        }

        let mut versions = self.backend.load_versions().await?;
        if versions.remove(id).is_some() {
            self.backend.save_versions(&versions).await?;
        }
        Ok(removed)
    }

    /// Versions ordered by version number.
    pub async fn versions(&self, id: &str) -> Result<Vec<ArtifactVersion>, StorageError> {
        let mut versions = self
            .backend
            .load_versions()
            .await?
            .remove(id)
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    /// Append a version and persist the updated artifact in one locked cycle.
    /// A version number already on record is refused. If the artifact write
    /// fails the version list is put back as it was.
    pub async fn commit_version(&self, artifact: &Artifact, version: &ArtifactVersion) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.backend.load_versions().await?;
        let taken = previous
            .get(&version.artifact_id)
            .is_some_and(|list| list.iter().any(|v| v.version == version.version));
        if taken {
            return Err(StorageError::VersionExists {
                artifact_id: version.artifact_id.clone(),
                version: version.version,
            });
        }

        let mut versions = previous.clone();
        versions
            .entry(version.artifact_id.clone())
            .or_default()
            .push(version.clone());
        self.backend.save_versions(&versions).await?;

        if let Err(error) = self.put_artifact(artifact).await {
            self.restore_versions(&artifact.id, &previous).await;
            return Err(error);
        }
        Ok(())
    }

    /// Drop one version record and persist the artifact's trimmed history.
    pub async fn remove_version(&self, artifact: &Artifact, version: u32) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;

        let previous = self.backend.load_versions().await?;
        let mut versions = previous.clone();
        let Some(list) = versions.get_mut(&artifact.id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|v| v.version != version);
        if list.len() == before {
            return Ok(false);
        }
        self.backend.save_versions(&versions).await?;

        if let Err(error) = self.put_artifact(artifact).await {
            self.restore_versions(&artifact.id, &previous).await;
            return Err(error);
        }
        Ok(true)
    }

    /// Caller holds `write_lock`.
    async fn put_artifact(&self, artifact: &Artifact) -> Result<(), StorageError> {
        let mut artifacts = self.backend.load_artifacts().await?;
        artifacts.insert(artifact.id.clone(), artifact.clone());
        self.backend.save_artifacts(&artifacts).await
    }

    async fn restore_versions(&self, artifact_id: &str, previous: &VersionDocument) {
        match self.backend.save_versions(previous).await {
            Ok(()) => tracing::warn!(artifact_id, "artifact write failed, version history restored"),
            Err(error) => {
                tracing::error!(artifact_id, %error, "artifact write failed and version history could not be restored")
            }
        }
    }
}

/// A mocked backend over shared in-memory documents. The `fail_on`-th
/// artifact write (counting from 1) fails with an i/o error.
#[cfg(test)]
pub(crate) fn flaky_store(fail_on: usize) -> MockArtifactStore {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let artifacts = Arc::new(std::sync::Mutex::new(ArtifactDocument::new()));
    let versions = Arc::new(std::sync::Mutex::new(VersionDocument::new()));
    let writes = AtomicUsize::new(0);
    let mut store = MockArtifactStore::new();

    let doc = artifacts.clone();
    store
        .expect_load_artifacts()
        .returning(move || Ok(doc.lock().unwrap().clone()));
    store
        .expect_save_artifacts()
        .returning(move |next: &ArtifactDocument| {
            if writes.fetch_add(1, Ordering::SeqCst) + 1 == fail_on {
                return Err(StorageError::io(ARTIFACTS_FILE, std::io::Error::other("disk full")));
            }
            *artifacts.lock().unwrap() = next.clone();
            Ok(())
        });

    let doc = versions.clone();
    store
        .expect_load_versions()
        .returning(move || Ok(doc.lock().unwrap().clone()));
    store
        .expect_save_versions()
        .returning(move |next: &VersionDocument| {
            *versions.lock().unwrap() = next.clone();
            Ok(())
        });
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CreatedBy, DiffSummary, PartialMetadata};
    use chrono::Utc;

    fn version(artifact: &Artifact, number: u32) -> ArtifactVersion {
        ArtifactVersion {
            id: format!("{}-v{number}", artifact.id),
            artifact_id: artifact.id.clone(),
            version: number,
            code: artifact.code.clone(),
            metadata: artifact.metadata.clone(),
            parent_version: number.checked_sub(1).filter(|p| *p > 0),
            created_at: Utc::now(),
            created_by: CreatedBy::User,
            change_description: String::new(),
            diff_summary: DiffSummary::default(),
            code_hash: String::new(),
        }
    }

    #[tokio::test]
    async fn missing_files_self_heal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(dir.path().join(ARTIFACTS_FILE).exists());
        assert!(dir.path().join(VERSIONS_FILE).exists());
        assert!(store.load_artifacts().await.unwrap().is_empty());
        assert!(store.load_versions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_never_recreate_a_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(JsonFileStore::open(dir.path()).await.unwrap());
        std::fs::remove_file(dir.path().join(ARTIFACTS_FILE)).unwrap();

        assert!(storage.list().await.unwrap().is_empty());
        assert!(!dir.path().join(ARTIFACTS_FILE).exists());

        storage
            .save(&Artifact::draft("a1", "x", PartialMetadata::default()))
            .await
            .unwrap();
        assert!(dir.path().join(ARTIFACTS_FILE).exists());
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_artifact_write_restores_history() {
        let storage = ArtifactStorage::new(flaky_store(2));
        let mut artifact = Artifact::draft("a1", "x", PartialMetadata::default());
        artifact.version = 1;
        artifact.history = vec![1];
        storage.commit_version(&artifact, &version(&artifact, 1)).await.unwrap();

        artifact.version = 2;
        artifact.history.push(2);
        let err = storage.commit_version(&artifact, &version(&artifact, 2)).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert_eq!(storage.versions("a1").await.unwrap().len(), 1);
        assert_eq!(storage.get("a1").await.unwrap().unwrap().version, 1);

        storage.commit_version(&artifact, &version(&artifact, 2)).await.unwrap();
        let numbers: Vec<u32> = storage.versions("a1").await.unwrap().iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn duplicate_version_number_is_refused() {
        let storage = ArtifactStorage::in_memory();
        let artifact = Artifact::draft("a1", "x", PartialMetadata::default());
        storage.commit_version(&artifact, &version(&artifact, 1)).await.unwrap();

        let err = storage.commit_version(&artifact, &version(&artifact, 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionExists { version: 1, .. }));
        assert_eq!(storage.versions("a1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(JsonFileStore::open(dir.path()).await.unwrap());
        let mut artifact = Artifact::draft("a1", "export default () => null", PartialMetadata::default());
        artifact.version = 1;
        artifact.history = vec![1];
        storage.commit_version(&artifact, &version(&artifact, 1)).await.unwrap();

        let reopened = ArtifactStorage::new(JsonFileStore::open(dir.path()).await.unwrap());
        assert_eq!(reopened.get("a1").await.unwrap(), Some(artifact));
        assert_eq!(reopened.versions("a1").await.unwrap().len(), 1);
        assert!(!dir.path().join(format!("{ARTIFACTS_FILE}.tmp")).exists());
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ARTIFACTS_FILE), b"{not json").unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load_artifacts().await,
            Err(StorageError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_history() {
        let storage = ArtifactStorage::in_memory();
        let artifact = Artifact::draft("a1", "x", PartialMetadata::default());
        storage.commit_version(&artifact, &version(&artifact, 1)).await.unwrap();

        assert!(storage.delete("a1").await.unwrap());
        assert!(storage.get("a1").await.unwrap().is_none());
        assert!(storage.versions("a1").await.unwrap().is_empty());
        assert!(!storage.delete("a1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_saves_are_not_lost() {
        let storage = ArtifactStorage::in_memory();
        let writes = (0..16).map(|i| {
            let storage = storage.clone();
            tokio::spawn(async move {
                let artifact = Artifact::draft(format!("a{i}"), "x", PartialMetadata::default());
                storage.save(&artifact).await.unwrap();
            })
        });
        for write in futures_util::future::join_all(writes).await {
            write.unwrap();
        }
        assert_eq!(storage.list().await.unwrap().len(), 16);
    }
}
