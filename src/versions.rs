// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Append-only version history.
//!
//! Every edit becomes a new immutable version numbered `current + 1`.
//! Rollback copies an old version's code into a new version, so the counter
//! never moves backwards. Diffs are positional: line `i` of one side is only
//! ever compared with line `i` of the other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::Metrics;
use crate::model::{Artifact, ArtifactVersion, CreatedBy, DiffSummary, PartialMetadata};
use crate::storage::ArtifactStorage;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineChange {
    /// 1-based line number.
    pub line: usize,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineDiff {
    pub summary: DiffSummary,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<LineChange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub from: ArtifactVersion,
    pub to: ArtifactVersion,
    pub diff: LineDiff,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u32>,
    pub created_at: chrono::DateTime<Utc>,
    pub created_by: CreatedBy,
    pub change_description: String,
    pub diff_summary: DiffSummary,
    pub code_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionHistory {
    pub artifact_id: String,
    pub current_version: u32,
    pub versions: Vec<VersionSummary>,
}

pub fn code_hash(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Positional line diff from `old` to `new`.
pub fn compute_diff(old: &str, new: &str) -> LineDiff {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let shared = old_lines.len().min(new_lines.len());

    let modified: Vec<LineChange> = (0..shared)
        .filter(|&i| old_lines[i] != new_lines[i])
        .map(|i| LineChange {
            line: i + 1,
            before: old_lines[i].to_string(),
            after: new_lines[i].to_string(),
        })
        .collect();
    let added: Vec<String> = new_lines[shared..].iter().map(|s| s.to_string()).collect();
    let removed: Vec<String> = old_lines[shared..].iter().map(|s| s.to_string()).collect();

    LineDiff {
        summary: DiffSummary {
            lines_added: added.len(),
            lines_removed: removed.len(),
            lines_modified: modified.len(),
        },
        added,
        removed,
        modified,
    }
}

pub struct ArtifactVersionManager {
    storage: ArtifactStorage,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    metrics: Option<Metrics>,
}

impl ArtifactVersionManager {
    pub fn new(storage: ArtifactStorage) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn storage(&self) -> &ArtifactStorage {
        &self.storage
    }

    async fn writer_lock(&self, artifact_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(artifact_id.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, artifact_id: &str) -> Result<Artifact, AppError> {
        self.storage
            .get(artifact_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("artifact {artifact_id} not found")))
    }

    pub async fn create_version(
        &self,
        artifact_id: &str,
        code: &str,
        change_description: &str,
        created_by: CreatedBy,
    ) -> Result<ArtifactVersion, AppError> {
        self.create_version_with_metadata(artifact_id, code, None, change_description, created_by)
            .await
    }

    /// Like `create_version`, also applying a metadata patch to the snapshot.
    pub async fn create_version_with_metadata(
        &self,
        artifact_id: &str,
        code: &str,
        patch: Option<PartialMetadata>,
        change_description: &str,
        created_by: CreatedBy,
    ) -> Result<ArtifactVersion, AppError> {
        let lock = self.writer_lock(artifact_id).await;
        let _guard = lock.lock().await;

        let artifact = self.load(artifact_id).await?;
        let (_, version) = self
            .append(artifact, code, patch, change_description, created_by)
            .await?;
        Ok(version)
    }

    /// Store a new artifact together with its version 1. Either both land
    /// or neither does.
    pub async fn create_initial_version(
        &self,
        draft: Artifact,
        created_by: CreatedBy,
    ) -> Result<Artifact, AppError> {
        let lock = self.writer_lock(&draft.id).await;
        let _guard = lock.lock().await;

        if self.storage.exists(&draft.id).await? {
            return Err(AppError::conflict(format!("artifact {} already exists", draft.id)));
        }
        let code = draft.code.clone();
        let (artifact, _) = self
            .append(draft, &code, None, "Initial version", created_by)
            .await?;
        Ok(artifact)
    }

    /// Caller holds the artifact's writer lock.
    async fn append(
        &self,
        mut artifact: Artifact,
        code: &str,
        patch: Option<PartialMetadata>,
        change_description: &str,
        created_by: CreatedBy,
    ) -> Result<(Artifact, ArtifactVersion), AppError> {
        let now = Utc::now();

        let previous_code = if artifact.version == 0 {
            ""
        } else {
            artifact.code.as_str()
        };
        let diff = compute_diff(previous_code, code);

        // A record left behind by an interrupted write still holds its number.
        let recorded = self
            .storage
            .versions(&artifact.id)
            .await?
            .last()
            .map_or(0, |v| v.version);
        let number = artifact.version.max(recorded) + 1;
        let parent_version = (artifact.version > 0).then_some(artifact.version);

        if let Some(patch) = patch {
            artifact.metadata.apply(patch, now);
        }
        artifact.metadata.updated_at = now;

        let version = ArtifactVersion {
            id: Uuid::new_v4().to_string(),
            artifact_id: artifact.id.clone(),
            version: number,
            code: code.to_string(),
            metadata: artifact.metadata.clone(),
            parent_version,
            created_at: now,
            created_by,
            change_description: change_description.to_string(),
            diff_summary: diff.summary,
            code_hash: code_hash(code),
        };

        artifact.code = code.to_string();
        artifact.version = number;
        artifact.history.push(number);

        self.storage.commit_version(&artifact, &version).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_version_created();
        }

        tracing::info!(
            artifact_id = %artifact.id,
            version = number,
            added = diff.summary.lines_added,
            removed = diff.summary.lines_removed,
            modified = diff.summary.lines_modified,
            "artifact version created"
        );
        Ok((artifact, version))
    }

    pub async fn get_versions(&self, artifact_id: &str) -> Result<Vec<ArtifactVersion>, AppError> {
        self.load(artifact_id).await?;
        Ok(self.storage.versions(artifact_id).await?)
    }

    pub async fn get_version(&self, artifact_id: &str, version: u32) -> Result<ArtifactVersion, AppError> {
        self.get_versions(artifact_id)
            .await?
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| {
                AppError::not_found(format!("version {version} of artifact {artifact_id} not found"))
            })
    }

    pub async fn get_current_version(&self, artifact_id: &str) -> Result<Option<ArtifactVersion>, AppError> {
        let artifact = self.load(artifact_id).await?;
        Ok(self
            .storage
            .versions(artifact_id)
            .await?
            .into_iter()
            .find(|v| v.version == artifact.version))
    }

    pub async fn version_history(&self, artifact_id: &str) -> Result<VersionHistory, AppError> {
        let artifact = self.load(artifact_id).await?;
        let versions = self
            .storage
            .versions(artifact_id)
            .await?
            .into_iter()
            .map(|v| VersionSummary {
                version: v.version,
                parent_version: v.parent_version,
                created_at: v.created_at,
                created_by: v.created_by,
                change_description: v.change_description,
                diff_summary: v.diff_summary,
                code_hash: v.code_hash,
            })
            .collect();

        Ok(VersionHistory {
            artifact_id: artifact.id,
            current_version: artifact.version,
            versions,
        })
    }

    pub async fn compare_versions(
        &self,
        artifact_id: &str,
        from: u32,
        to: u32,
    ) -> Result<VersionComparison, AppError> {
        let versions = self.get_versions(artifact_id).await?;
        let find = |number: u32| {
            versions
                .iter()
                .find(|v| v.version == number)
                .cloned()
                .ok_or_else(|| {
                    AppError::not_found(format!("version {number} of artifact {artifact_id} not found"))
                })
        };
        let from = find(from)?;
        let to = find(to)?;
        let diff = compute_diff(&from.code, &to.code);

        Ok(VersionComparison { from, to, diff })
    }

    /// Copy `target`'s code into a new version.
    pub async fn rollback_to_version(
        &self,
        artifact_id: &str,
        target: u32,
        created_by: CreatedBy,
    ) -> Result<ArtifactVersion, AppError> {
        let target_version = self.get_version(artifact_id, target).await?;
        tracing::info!(artifact_id, target, "rolling back artifact");
        self.create_version(
            artifact_id,
            &target_version.code,
            &format!("Rolled back to version {target}"),
            created_by,
        )
        .await
    }

    /// Refuses the current version and version 1.
    pub async fn delete_version(&self, artifact_id: &str, version: u32) -> Result<(), AppError> {
        let lock = self.writer_lock(artifact_id).await;
        let _guard = lock.lock().await;

        let mut artifact = self.load(artifact_id).await?;
        if version == artifact.version {
            return Err(AppError::conflict("cannot delete the current version"));
        }
        if version == 1 {
            return Err(AppError::conflict("cannot delete the initial version"));
        }

        artifact.history.retain(|v| *v != version);
        if !self.storage.remove_version(&artifact, version).await? {
            return Err(AppError::not_found(format!(
                "version {version} of artifact {artifact_id} not found"
            )));
        }
        tracing::info!(artifact_id, version, "artifact version deleted");
        Ok(())
    }

    /// Forget the writer lock of a deleted artifact.
    pub async fn forget(&self, artifact_id: &str) {
        self.locks.lock().await.remove(artifact_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartialMetadata;

    async fn manager_with(id: &str) -> ArtifactVersionManager {
        let storage = ArtifactStorage::in_memory();
        storage
            .save(&Artifact::draft(id, "", PartialMetadata::default()))
            .await
            .unwrap();
        ArtifactVersionManager::new(storage)
    }

    #[test]
    fn positional_diff_counts() {
        let diff = compute_diff("A", "A\nB");
        assert_eq!(diff.summary, DiffSummary { lines_added: 1, lines_removed: 0, lines_modified: 0 });
        assert_eq!(diff.added, vec!["B"]);

        let diff = compute_diff("a\nb\nc", "a\nx");
        assert_eq!(diff.summary, DiffSummary { lines_added: 0, lines_removed: 1, lines_modified: 1 });
        assert_eq!(diff.modified[0], LineChange { line: 2, before: "b".into(), after: "x".into() });
        assert_eq!(diff.removed, vec!["c"]);
    }

    #[test]
    fn insertion_in_the_middle_reads_as_modifications() {
        let diff = compute_diff("a\nb\nc", "a\nNEW\nb\nc");
        assert_eq!(diff.summary.lines_modified, 2);
        assert_eq!(diff.summary.lines_added, 1);
    }

    #[tokio::test]
    async fn versions_are_dense_and_linked() {
        let manager = manager_with("a1").await;
        for i in 1..=4 {
            let v = manager
                .create_version("a1", &format!("code {i}"), "edit", CreatedBy::Llm)
                .await
                .unwrap();
            assert_eq!(v.version, i);
            assert_eq!(v.parent_version, if i == 1 { None } else { Some(i - 1) });
            assert_eq!(v.code_hash, code_hash(&format!("code {i}")));
        }
        let history = manager.version_history("a1").await.unwrap();
        assert_eq!(history.current_version, 4);
        assert_eq!(history.versions.len(), 4);
    }

    #[tokio::test]
    async fn second_version_diff_against_first() {
        let manager = manager_with("a1").await;
        manager.create_version("a1", "A", "first", CreatedBy::User).await.unwrap();
        let second = manager.create_version("a1", "A\nB", "second", CreatedBy::User).await.unwrap();
        assert_eq!(second.diff_summary, DiffSummary { lines_added: 1, lines_removed: 0, lines_modified: 0 });
    }

    #[tokio::test]
    async fn rollback_appends_and_restores_code() {
        let manager = manager_with("a1").await;
        manager.create_version("a1", "one", "", CreatedBy::User).await.unwrap();
        manager.create_version("a1", "two", "", CreatedBy::User).await.unwrap();

        let rolled = manager.rollback_to_version("a1", 1, CreatedBy::User).await.unwrap();
        assert_eq!(rolled.version, 3);
        assert_eq!(rolled.parent_version, Some(2));
        assert_eq!(rolled.change_description, "Rolled back to version 1");

        let artifact = manager.storage().get("a1").await.unwrap().unwrap();
        assert_eq!(artifact.code, "one");
        assert_eq!(artifact.version, 3);
        assert_eq!(artifact.history, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn comparing_a_version_with_itself_is_empty() {
        let manager = manager_with("a1").await;
        manager.create_version("a1", "x\ny", "", CreatedBy::User).await.unwrap();
        let comparison = manager.compare_versions("a1", 1, 1).await.unwrap();
        assert!(comparison.diff.summary.is_empty());
        assert!(comparison.diff.added.is_empty());
        assert!(comparison.diff.removed.is_empty());
        assert!(comparison.diff.modified.is_empty());
    }

    #[tokio::test]
    async fn delete_version_guards() {
        let manager = manager_with("a1").await;
        for code in ["a", "b", "c"] {
            manager.create_version("a1", code, "", CreatedBy::User).await.unwrap();
        }

        assert!(matches!(manager.delete_version("a1", 3).await, Err(AppError::Conflict(_))));
        assert!(matches!(manager.delete_version("a1", 1).await, Err(AppError::Conflict(_))));
        assert!(matches!(manager.delete_version("a1", 9).await, Err(AppError::NotFound(_))));

        manager.delete_version("a1", 2).await.unwrap();
        let numbers: Vec<u32> = manager
            .get_versions("a1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(manager.storage().get("a1").await.unwrap().unwrap().history, vec![1, 3]);

        let next = manager.create_version("a1", "d", "", CreatedBy::User).await.unwrap();
        assert_eq!(next.version, 4);
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let manager = ArtifactVersionManager::new(ArtifactStorage::in_memory());
        let err = manager
            .create_version("nope", "x", "", CreatedBy::User)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(matches!(manager.get_version("nope", 1).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn metadata_patch_lands_in_snapshot() {
        let manager = manager_with("a1").await;
        let patch = PartialMetadata {
            title: Some("Renamed".into()),
            ..PartialMetadata::default()
        };
        let v = manager
            .create_version_with_metadata("a1", "x", Some(patch), "rename", CreatedBy::User)
            .await
            .unwrap();
        assert_eq!(v.metadata.title, "Renamed");
        assert_eq!(manager.get_current_version("a1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn initial_version_lands_with_the_artifact() {
        let manager = ArtifactVersionManager::new(ArtifactStorage::in_memory());
        let draft = Artifact::draft("a1", "first", PartialMetadata::default());
        let artifact = manager
            .create_initial_version(draft.clone(), CreatedBy::Llm)
            .await
            .unwrap();
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.history, vec![1]);
        assert_eq!(manager.get_versions("a1").await.unwrap().len(), 1);

        let err = manager.create_initial_version(draft, CreatedBy::Llm).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_write_does_not_burn_a_version_number() {
        let storage = ArtifactStorage::new(crate::storage::flaky_store(3));
        storage
            .save(&Artifact::draft("a1", "", PartialMetadata::default()))
            .await
            .unwrap();
        let manager = ArtifactVersionManager::new(storage);
        manager.create_version("a1", "one", "", CreatedBy::User).await.unwrap();

        let err = manager.create_version("a1", "two", "", CreatedBy::User).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));

        let retried = manager.create_version("a1", "two", "", CreatedBy::User).await.unwrap();
        assert_eq!(retried.version, 2);
        let numbers: Vec<u32> = manager
            .get_versions("a1")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(manager.storage().get("a1").await.unwrap().unwrap().history, vec![1, 2]);
    }

    #[tokio::test]
    async fn numbering_skips_past_an_orphaned_record() {
        let manager = manager_with("a1").await;
        manager.create_version("a1", "one", "", CreatedBy::User).await.unwrap();

        let artifact = manager.storage().get("a1").await.unwrap().unwrap();
        let mut orphan = manager.get_version("a1", 1).await.unwrap();
        orphan.version = 2;
        manager.storage().commit_version(&artifact, &orphan).await.unwrap();

        let next = manager.create_version("a1", "three", "", CreatedBy::User).await.unwrap();
        assert_eq!(next.version, 3);
        assert_eq!(next.parent_version, Some(1));
    }
}
