// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;
use std::sync::Arc;

use artifact_trust::config::DEFAULT_CDN_BASE;
use artifact_trust::dependencies::DependencyManager;
use artifact_trust::error::AppError;
use artifact_trust::metrics::Metrics;
use artifact_trust::model::{CreateArtifactRequest, CreatedBy, PartialMetadata, UpdateArtifactRequest};
use artifact_trust::pipeline::{ArtifactPipeline, RenderOutcome};
use artifact_trust::sandbox::{SandboxConfig, SandboxEvent, SandboxMessage};
use artifact_trust::storage::{ArtifactStorage, JsonFileStore, ARTIFACTS_FILE, VERSIONS_FILE};

const CHART: &str = "import React from 'react';\nexport default function Chart({ points }) {\n  return <svg>{points}</svg>;\n}\n";

async fn open(dir: &Path) -> ArtifactPipeline {
    let store = JsonFileStore::open(dir).await.unwrap();
    ArtifactPipeline::new(
        Arc::new(DependencyManager::new(DEFAULT_CDN_BASE)),
        ArtifactStorage::new(store),
        SandboxConfig::default(),
        Metrics::new().unwrap(),
    )
}

fn request(code: &str) -> CreateArtifactRequest {
    CreateArtifactRequest {
        id: Some("chart".into()),
        code: code.into(),
        metadata: PartialMetadata::default(),
        created_by: CreatedBy::Llm,
    }
}

fn update(code: &str) -> UpdateArtifactRequest {
    UpdateArtifactRequest {
        code: code.into(),
        metadata: None,
        change_description: Some("edit".into()),
        created_by: CreatedBy::User,
    }
}

#[tokio::test]
async fn history_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let pipeline = open(dir.path()).await;
        pipeline.create_artifact(request(CHART)).await.unwrap();
        pipeline
            .update_artifact("chart", update(&CHART.replace("svg", "g")))
            .await
            .unwrap();
    }
    assert!(dir.path().join(ARTIFACTS_FILE).exists());
    assert!(dir.path().join(VERSIONS_FILE).exists());

    let reopened = open(dir.path()).await;
    let artifact = reopened.get_artifact("chart").await.unwrap();
    assert_eq!(artifact.version, 2);
    assert_eq!(artifact.history, vec![1, 2]);
    assert_eq!(artifact.metadata.title, "Chart");
    assert!(artifact.metadata.props.contains_key("points"));

    let versions = reopened.versions.get_versions("chart").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].code, CHART);
    assert_eq!(versions[1].parent_version, Some(1));
    assert_ne!(versions[0].code_hash, versions[1].code_hash);
}

#[tokio::test]
async fn rollback_then_delete_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = open(dir.path()).await;
    pipeline.create_artifact(request(CHART)).await.unwrap();
    pipeline
        .update_artifact("chart", update("export default function Chart() { return null; }"))
        .await
        .unwrap();

    let rolled = pipeline.rollback("chart", 1, CreatedBy::User).await.unwrap();
    assert_eq!(rolled.version, 3);
    assert_eq!(rolled.code, CHART);

    let history = pipeline.versions.version_history("chart").await.unwrap();
    assert_eq!(history.current_version, 3);
    assert_eq!(history.versions.len(), 3);

    pipeline.delete_artifact("chart").await.unwrap();
    let reopened = open(dir.path()).await;
    assert!(matches!(reopened.get_artifact("chart").await, Err(AppError::NotFound(_))));
    assert!(reopened.list_artifacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn messages_from_a_replaced_session_are_stale() {
    let pipeline = ArtifactPipeline::in_memory().unwrap();
    pipeline.create_artifact(request(CHART)).await.unwrap();

    let first = match pipeline.render("chart").await.unwrap() {
        RenderOutcome::Rendering(handle) => handle,
        RenderOutcome::Blocked(report) => panic!("blocked: {:?}", report.errors),
    };
    let second = match pipeline.render("chart").await.unwrap() {
        RenderOutcome::Rendering(handle) => handle,
        RenderOutcome::Blocked(report) => panic!("blocked: {:?}", report.errors),
    };
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(pipeline.sandbox.live_sessions().await, 1);

    let mut events = pipeline.sandbox.subscribe();
    let stale = SandboxMessage {
        artifact_id: "chart".into(),
        session_id: first.session_id.clone(),
        event: SandboxEvent::Ready { metrics: Default::default() },
    };
    pipeline.sandbox.receive(stale).await;
    assert!(!pipeline.sandbox.is_ready("chart").await);

    let ready = SandboxMessage {
        artifact_id: "chart".into(),
        session_id: second.session_id.clone(),
        event: SandboxEvent::Ready { metrics: Default::default() },
    };
    pipeline.sandbox.receive(ready.clone()).await;
    assert!(pipeline.sandbox.is_ready("chart").await);
    assert_eq!(events.recv().await.unwrap(), ready);

    assert_eq!(pipeline.shutdown().await, 1);
    assert_eq!(pipeline.sandbox.live_sessions().await, 0);
}
