// Copyright 2025 Memophor Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP API handlers for the artifact pipeline.
//!
//! The presentation layer drives everything through these endpoints:
//!
//! - `GET /healthz` - Service health check
//! - `GET /metrics` - Prometheus metrics export
//! - `/artifacts` - Create, list, read, update and delete artifacts
//! - `/artifacts/:id/versions` - Version history, compare and rollback
//! - `/artifacts/:id/render` - Gate and mount (or close) a sandbox session
//! - `POST /sandbox/messages` - Relay of frame messages back to the host
//! - `/validate`, `/dependencies` - Gate stages on raw source
//! - `/diagnostics` - Fixture suite and staged debugging
//!
//! A render that the gate blocks answers 422 with the full blocking report.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::auditor::SecurityAuditResult;
use crate::dependencies::{DependencyInfo, ImportMap, PreloadOutcome, ResolutionResult};
use crate::diagnostics::{ArtifactDebugger, ArtifactTestRunner, ArtifactTestSuite, DebugReport, SuiteReport};
use crate::error::AppError;
use crate::export::StandaloneExport;
use crate::model::{
    Artifact, ArtifactVersion, CompareQuery, CreateArtifactRequest, DebugRequest, QuickCheckRequest,
    ResolveRequest, RollbackRequest, UpdateArtifactRequest, ValidateRequest,
};
use crate::monitor::PerformanceReport;
use crate::pipeline::{ArtifactPipeline, RenderOutcome};
use crate::sandbox::{MessageDisposition, SandboxMessage};
use crate::validator::{QuickCheckResult, SecurityValidationResult};
use crate::versions::VersionComparison;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ArtifactPipeline>,
    pub runner: Arc<ArtifactTestRunner>,
    pub debugger: Arc<ArtifactDebugger>,
}

impl AppState {
    pub fn new(pipeline: Arc<ArtifactPipeline>) -> Self {
        let runner = ArtifactTestRunner::new(
            pipeline.dependencies.clone(),
            pipeline.validator.clone(),
            pipeline.compiler.clone(),
        );
        let debugger = ArtifactDebugger::new(
            pipeline.dependencies.clone(),
            pipeline.validator.clone(),
            pipeline.compiler.clone(),
        );
        Self {
            pipeline,
            runner: Arc::new(runner),
            debugger: Arc::new(debugger),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/artifacts", post(create_artifact).get(list_artifacts))
        .route(
            "/artifacts/:id",
            get(get_artifact).put(update_artifact).delete(delete_artifact),
        )
        .route("/artifacts/:id/versions", get(list_versions))
        .route(
            "/artifacts/:id/versions/:version",
            get(get_version).delete(delete_version),
        )
        .route("/artifacts/:id/rollback", post(rollback))
        .route("/artifacts/:id/compare", get(compare))
        .route("/artifacts/:id/render", post(render).delete(close))
        .route("/artifacts/:id/performance", get(performance))
        .route("/artifacts/:id/audit", post(audit))
        .route("/artifacts/:id/export", get(export))
        .route("/sandbox/messages", post(sandbox_message))
        .route("/validate", post(validate))
        .route("/validate/quick", post(quick_check))
        .route("/dependencies", get(list_dependencies))
        .route("/dependencies/resolve", post(resolve))
        .route("/dependencies/preload", post(preload))
        .route("/diagnostics/run", post(run_diagnostics))
        .route("/diagnostics/debug", post(debug))
        .with_state(state)
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": "artifact-trust",
        "version": env!("CARGO_PKG_VERSION"),
        "liveSessions": state.pipeline.sandbox.live_sessions().await,
    })))
}

/// Metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state.pipeline.metrics.export()
}

pub async fn create_artifact(
    State(state): State<AppState>,
    Json(request): Json<CreateArtifactRequest>,
) -> Result<(StatusCode, Json<Artifact>), AppError> {
    let artifact = state.pipeline.create_artifact(request).await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

pub async fn list_artifacts(State(state): State<AppState>) -> Result<Json<Vec<Artifact>>, AppError> {
    Ok(Json(state.pipeline.list_artifacts().await?))
}

pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Artifact>, AppError> {
    Ok(Json(state.pipeline.get_artifact(&id).await?))
}

/// Write a new version; a live session is torn down
pub async fn update_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateArtifactRequest>,
) -> Result<Json<ArtifactVersion>, AppError> {
    Ok(Json(state.pipeline.update_artifact(&id, request).await?))
}

pub async fn delete_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.pipeline.delete_artifact(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ArtifactVersion>>, AppError> {
    Ok(Json(state.pipeline.versions.get_versions(&id).await?))
}

pub async fn get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> Result<Json<ArtifactVersion>, AppError> {
    Ok(Json(state.pipeline.versions.get_version(&id, version).await?))
}

pub async fn delete_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> Result<StatusCode, AppError> {
    state.pipeline.versions.delete_version(&id, version).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rollback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<ArtifactVersion>, AppError> {
    let version = state
        .pipeline
        .rollback(&id, request.version, request.created_by)
        .await?;
    Ok(Json(version))
}

pub async fn compare(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<VersionComparison>, AppError> {
    let comparison = state
        .pipeline
        .versions
        .compare_versions(&id, query.from, query.to)
        .await?;
    Ok(Json(comparison))
}

/// Gate and mount. Blocked artifacts answer 422 with the blocking report
pub async fn render(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let response = match state.pipeline.render(&id).await? {
        RenderOutcome::Rendering(handle) => (StatusCode::CREATED, Json(handle)).into_response(),
        RenderOutcome::Blocked(report) => {
            (StatusCode::UNPROCESSABLE_ENTITY, Json(report)).into_response()
        }
    };
    Ok(response)
}

#[derive(Serialize)]
pub struct CloseResponse {
    pub closed: bool,
}

pub async fn close(State(state): State<AppState>, Path(id): Path<String>) -> Json<CloseResponse> {
    Json(CloseResponse {
        closed: state.pipeline.close(&id).await,
    })
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub disposition: MessageDisposition,
}

pub async fn sandbox_message(
    State(state): State<AppState>,
    Json(message): Json<SandboxMessage>,
) -> Json<MessageResponse> {
    let disposition = state.pipeline.sandbox.receive(message).await;
    Json(MessageResponse { disposition })
}

pub async fn performance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PerformanceReport>, AppError> {
    Ok(Json(state.pipeline.performance(&id).await?))
}

pub async fn audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SecurityAuditResult>, AppError> {
    Ok(Json(state.pipeline.audit(&id).await?))
}

pub async fn export(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StandaloneExport>, AppError> {
    Ok(Json(state.pipeline.export(&id).await?))
}

/// Full validation of unsaved source
pub async fn validate(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<SecurityValidationResult>, AppError> {
    let ValidateRequest {
        code,
        dependencies,
        mut metadata,
    } = request;
    if !dependencies.is_empty() {
        metadata.dependencies = Some(dependencies);
    }
    let artifact = Artifact::draft("validation", code, metadata);
    Ok(Json(state.pipeline.validate(&artifact).await))
}

pub async fn quick_check(
    State(state): State<AppState>,
    Json(request): Json<QuickCheckRequest>,
) -> Json<QuickCheckResult> {
    Json(state.pipeline.validator.quick_security_check(&request.code))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    #[serde(flatten)]
    pub resolution: ResolutionResult,
    pub import_map: ImportMap,
}

pub async fn resolve(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, AppError> {
    if request.names.is_empty() {
        return Err(AppError::bad_request("names cannot be empty"));
    }
    let dependencies = &state.pipeline.dependencies;
    let resolution = dependencies.resolve_dependencies(&request.names).await;
    let import_map = dependencies.generate_import_map(&resolution.resolved);
    Ok(Json(ResolveResponse {
        resolution,
        import_map,
    }))
}

pub async fn list_dependencies(State(state): State<AppState>) -> Json<Vec<DependencyInfo>> {
    Json(state.pipeline.dependencies.whitelist().await)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadResponse {
    pub failed: Vec<String>,
    pub modules: Vec<PreloadOutcome>,
}

/// Resolve then fetch every module so the CDN cache is warm before render
pub async fn preload(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<PreloadResponse>, AppError> {
    if request.names.is_empty() {
        return Err(AppError::bad_request("names cannot be empty"));
    }
    let dependencies = &state.pipeline.dependencies;
    let resolution = dependencies.resolve_dependencies(&request.names).await;
    let modules = dependencies.preload(&resolution.resolved).await?;
    Ok(Json(PreloadResponse {
        failed: resolution.failed,
        modules,
    }))
}

pub async fn run_diagnostics(State(state): State<AppState>) -> Json<SuiteReport> {
    Json(state.runner.run(&ArtifactTestSuite::builtin()).await)
}

pub async fn debug(
    State(state): State<AppState>,
    Json(request): Json<DebugRequest>,
) -> Json<DebugReport> {
    Json(state.debugger.debug(&request.code, request.metadata).await)
}
