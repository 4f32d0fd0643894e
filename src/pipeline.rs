// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Wires the pipeline stages together.
//!
//! resolve -> validate -> compile -> sandbox -> monitor, with storage and
//! versioning beside it on every create and update.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::auditor::{ArtifactSecurityAuditor, SecurityAuditResult};
use crate::compiler::ComponentCompiler;
use crate::dependencies::DependencyManager;
use crate::error::AppError;
use crate::export::{export_standalone, StandaloneExport};
use crate::metrics::Metrics;
use crate::model::{
    Artifact, ArtifactVersion, CreateArtifactRequest, CreatedBy, UpdateArtifactRequest,
};
use crate::monitor::{ArtifactPerformanceMonitor, PerformanceReport};
use crate::sandbox::{ComponentSandbox, SandboxConfig, SandboxHandle};
use crate::storage::ArtifactStorage;
use crate::validator::{ArtifactSecurityValidator, SecurityValidationResult};
use crate::versions::ArtifactVersionManager;

/// Why an artifact may not run, for presentation as-is.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedReport {
    pub artifact_id: String,
    pub errors: Vec<String>,
    pub failed_dependencies: Vec<String>,
    pub validation: SecurityValidationResult,
}

#[derive(Debug)]
pub enum RenderOutcome {
    Blocked(BlockedReport),
    Rendering(SandboxHandle),
}

pub struct ArtifactPipeline {
    pub dependencies: Arc<DependencyManager>,
    pub validator: Arc<ArtifactSecurityValidator>,
    pub auditor: Arc<ArtifactSecurityAuditor>,
    pub compiler: Arc<ComponentCompiler>,
    pub sandbox: Arc<ComponentSandbox>,
    pub monitor: Arc<ArtifactPerformanceMonitor>,
    pub versions: Arc<ArtifactVersionManager>,
    pub metrics: Metrics,
}

impl ArtifactPipeline {
    pub fn new(
        dependencies: Arc<DependencyManager>,
        storage: ArtifactStorage,
        sandbox_config: SandboxConfig,
        metrics: Metrics,
    ) -> Self {
        let validator = Arc::new(ArtifactSecurityValidator::new(dependencies.clone()));
        let auditor = Arc::new(ArtifactSecurityAuditor::new(validator.clone(), dependencies.clone()));
        let compiler = Arc::new(ComponentCompiler::new(dependencies.clone()));
        let monitor = Arc::new(ArtifactPerformanceMonitor::default());
        let sandbox = Arc::new(ComponentSandbox::new(
            sandbox_config,
            compiler.clone(),
            monitor.clone(),
            metrics.clone(),
        ));
        let versions = Arc::new(ArtifactVersionManager::new(storage).with_metrics(metrics.clone()));

        Self {
            dependencies,
            validator,
            auditor,
            compiler,
            sandbox,
            monitor,
            versions,
            metrics,
        }
    }

    /// Everything in memory, default CDN and limits.
    pub fn in_memory() -> Result<Self, AppError> {
        let sandbox = SandboxConfig::default();
        let dependencies = Arc::new(DependencyManager::new(sandbox.cdn_base.clone()));
        Ok(Self::new(
            dependencies,
            ArtifactStorage::in_memory(),
            sandbox,
            Metrics::new()?,
        ))
    }

    pub fn storage(&self) -> &ArtifactStorage {
        self.versions.storage()
    }

    /// Normalise metadata, store the artifact and write version 1.
    pub async fn create_artifact(&self, request: CreateArtifactRequest) -> Result<Artifact, AppError> {
        let id = match request.id {
            Some(id) if id.trim().is_empty() => return Err(AppError::bad_request("id cannot be blank")),
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        let draft = Artifact::draft(id, request.code, request.metadata);
        let artifact = self
            .versions
            .create_initial_version(draft, request.created_by)
            .await?;

        tracing::info!(artifact_id = %artifact.id, title = %artifact.metadata.title, "artifact created");
        Ok(artifact)
    }

    /// New version; any live session for the artifact is torn down.
    pub async fn update_artifact(
        &self,
        id: &str,
        request: UpdateArtifactRequest,
    ) -> Result<ArtifactVersion, AppError> {
        let description = request
            .change_description
            .unwrap_or_else(|| "Updated artifact".to_string());
        let version = self
            .versions
            .create_version_with_metadata(id, &request.code, request.metadata, &description, request.created_by)
            .await?;
        self.sandbox.destroy_sandbox(id).await;
        Ok(version)
    }

    pub async fn rollback(
        &self,
        id: &str,
        target: u32,
        created_by: CreatedBy,
    ) -> Result<ArtifactVersion, AppError> {
        let version = self.versions.rollback_to_version(id, target, created_by).await?;
        self.sandbox.destroy_sandbox(id).await;
        Ok(version)
    }

    pub async fn get_artifact(&self, id: &str) -> Result<Artifact, AppError> {
        self.storage()
            .get(id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("artifact {id} not found")))
    }

    pub async fn list_artifacts(&self) -> Result<Vec<Artifact>, AppError> {
        Ok(self.storage().list().await?)
    }

    pub async fn delete_artifact(&self, id: &str) -> Result<(), AppError> {
        self.sandbox.destroy_sandbox(id).await;
        self.monitor.remove(id).await;
        if !self.storage().delete(id).await? {
            return Err(AppError::not_found(format!("artifact {id} not found")));
        }
        self.versions.forget(id).await;
        tracing::info!(artifact_id = %id, "artifact deleted");
        Ok(())
    }

    pub async fn validate(&self, artifact: &Artifact) -> SecurityValidationResult {
        let result = self.validator.validate_artifact(artifact).await;
        self.metrics.record_validation(&result);
        tracing::debug!(
            artifact_id = %artifact.id,
            secure = result.is_secure,
            score = result.score,
            violations = result.violations.len(),
            "artifact validated"
        );
        result
    }

    /// Resolve, gate and mount. A blocked artifact never reaches the sandbox.
    pub async fn render(&self, id: &str) -> Result<RenderOutcome, AppError> {
        let artifact = self.get_artifact(id).await?;
        self.render_artifact(&artifact).await
    }

    pub async fn render_artifact(&self, artifact: &Artifact) -> Result<RenderOutcome, AppError> {
        let resolution = self
            .dependencies
            .resolve_dependencies(&artifact.metadata.dependencies)
            .await;
        let validation = self.validate(artifact).await;

        if !validation.is_secure || !resolution.failed.is_empty() {
            let mut errors = validation.blocking_messages();
            errors.extend(
                resolution
                    .failed
                    .iter()
                    .map(|name| format!("dependency '{name}' is not whitelisted")),
            );
            tracing::warn!(artifact_id = %artifact.id, blocking = errors.len(), "render blocked");
            return Ok(RenderOutcome::Blocked(BlockedReport {
                artifact_id: artifact.id.clone(),
                errors,
                failed_dependencies: resolution.failed,
                validation,
            }));
        }

        let handle = self.sandbox.create_sandbox(artifact).await?;
        Ok(RenderOutcome::Rendering(handle))
    }

    pub async fn close(&self, id: &str) -> bool {
        self.sandbox.destroy_sandbox(id).await
    }

    pub async fn audit(&self, id: &str) -> Result<SecurityAuditResult, AppError> {
        let artifact = self.get_artifact(id).await?;
        let audit = self.auditor.perform_security_audit(&artifact).await;
        self.metrics.record_audit();
        Ok(audit)
    }

    /// Export refuses artifacts the gate would block.
    pub async fn export(&self, id: &str) -> Result<StandaloneExport, AppError> {
        let artifact = self.get_artifact(id).await?;
        let validation = self.validate(&artifact).await;
        if !validation.is_secure {
            return Err(AppError::SecurityBlocked(validation.blocking_messages()));
        }
        export_standalone(&self.compiler, &artifact).await
    }

    pub async fn performance(&self, id: &str) -> Result<PerformanceReport, AppError> {
        self.monitor
            .generate_report(id)
            .await
            .ok_or_else(|| AppError::not_found(format!("no performance data for artifact {id}")))
    }

    pub async fn shutdown(&self) -> usize {
        self.sandbox.destroy_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartialMetadata;

    const CLEAN: &str = "import React from 'react';\nexport default function Badge() { return <span>ok</span>; }\n";

    fn create(code: &str) -> CreateArtifactRequest {
        CreateArtifactRequest {
            id: Some("p1".into()),
            code: code.into(),
            metadata: PartialMetadata::default(),
            created_by: CreatedBy::Llm,
        }
    }

    #[tokio::test]
    async fn create_writes_the_first_version() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        let artifact = pipeline.create_artifact(create(CLEAN)).await.unwrap();
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.history, vec![1]);
        assert_eq!(artifact.metadata.title, "Badge");

        let err = pipeline.create_artifact(create(CLEAN)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_create_leaves_nothing_behind() {
        let sandbox = SandboxConfig::default();
        let pipeline = ArtifactPipeline::new(
            Arc::new(DependencyManager::new(sandbox.cdn_base.clone())),
            ArtifactStorage::new(crate::storage::flaky_store(1)),
            sandbox,
            Metrics::new().unwrap(),
        );

        let err = pipeline.create_artifact(create(CLEAN)).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(matches!(pipeline.get_artifact("p1").await, Err(AppError::NotFound(_))));
        assert!(pipeline.storage().versions("p1").await.unwrap().is_empty());

        let artifact = pipeline.create_artifact(create(CLEAN)).await.unwrap();
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.history, vec![1]);
    }

    #[tokio::test]
    async fn clean_artifact_renders() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        pipeline.create_artifact(create(CLEAN)).await.unwrap();
        match pipeline.render("p1").await.unwrap() {
            RenderOutcome::Rendering(handle) => assert_eq!(handle.artifact_id, "p1"),
            RenderOutcome::Blocked(report) => panic!("unexpected block: {:?}", report.errors),
        }
        assert!(pipeline.monitor.is_monitoring("p1").await);
    }

    #[tokio::test]
    async fn dangerous_artifact_is_blocked_before_the_sandbox() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        let code = "import React from 'react';\nexport default function X() { eval('1+1'); return <p/>; }";
        pipeline.create_artifact(create(code)).await.unwrap();
        match pipeline.render("p1").await.unwrap() {
            RenderOutcome::Blocked(report) => {
                assert!(!report.validation.is_secure);
                assert!(!report.errors.is_empty());
            }
            RenderOutcome::Rendering(_) => panic!("eval must not render"),
        }
        assert_eq!(pipeline.sandbox.live_sessions().await, 0);
    }

    #[tokio::test]
    async fn unlisted_dependency_blocks() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        let mut request = create(CLEAN);
        request.metadata.dependencies = Some(vec!["react".into(), "left-pad".into()]);
        pipeline.create_artifact(request).await.unwrap();
        match pipeline.render("p1").await.unwrap() {
            RenderOutcome::Blocked(report) => assert_eq!(report.failed_dependencies, vec!["left-pad"]),
            RenderOutcome::Rendering(_) => panic!("left-pad must not render"),
        }
    }

    #[tokio::test]
    async fn update_replaces_live_session() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        pipeline.create_artifact(create(CLEAN)).await.unwrap();
        pipeline.render("p1").await.unwrap();
        assert_eq!(pipeline.sandbox.live_sessions().await, 1);

        let update = UpdateArtifactRequest {
            code: CLEAN.replace("ok", "fine"),
            metadata: None,
            change_description: None,
            created_by: CreatedBy::User,
        };
        let version = pipeline.update_artifact("p1", update).await.unwrap();
        assert_eq!(version.version, 2);
        assert_eq!(version.diff_summary.lines_modified, 1);
        assert_eq!(pipeline.sandbox.live_sessions().await, 0);
    }

    #[tokio::test]
    async fn delete_tears_everything_down() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        pipeline.create_artifact(create(CLEAN)).await.unwrap();
        pipeline.render("p1").await.unwrap();
        pipeline.delete_artifact("p1").await.unwrap();

        assert_eq!(pipeline.sandbox.live_sessions().await, 0);
        assert!(matches!(pipeline.get_artifact("p1").await, Err(AppError::NotFound(_))));
        assert!(matches!(pipeline.delete_artifact("p1").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn export_refuses_blocked_code() {
        let pipeline = ArtifactPipeline::in_memory().unwrap();
        let code = "export default function X() { return <div dangerouslySetInnerHTML={{ __html: 'x' }} />; }";
        pipeline.create_artifact(create(code)).await.unwrap();
        assert!(matches!(pipeline.export("p1").await, Err(AppError::SecurityBlocked(_))));
    }
}
