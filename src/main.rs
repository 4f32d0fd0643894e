// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use artifact_trust::api::{build_router, AppState};
use artifact_trust::config::{AppConfig, LogFormat};
use artifact_trust::dependencies::{DependencyManager, HttpModuleFetcher};
use artifact_trust::metrics::Metrics;
use artifact_trust::pipeline::ArtifactPipeline;
use artifact_trust::sandbox::spawn_event_log;
use artifact_trust::storage::{ArtifactStorage, JsonFileStore};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cfg = AppConfig::from_env()?;
    init_tracing(cfg.log_format);

    let store = JsonFileStore::open(&cfg.data_dir).await?;
    let storage = ArtifactStorage::new(store);

    let fetcher = HttpModuleFetcher::try_new(cfg.fetch_timeout)?;
    let dependencies =
        Arc::new(DependencyManager::new(cfg.cdn_base.clone()).with_fetcher(Arc::new(fetcher)));

    let metrics = Metrics::new()?;
    let pipeline = Arc::new(ArtifactPipeline::new(
        dependencies,
        storage,
        cfg.sandbox(),
        metrics,
    ));

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let event_log = spawn_event_log(pipeline.sandbox.subscribe(), shutdown_rx);

    let app = build_router(AppState::new(pipeline.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listen_addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    tracing::info!(
        %listen_addr,
        data_dir = %cfg.data_dir.display(),
        cdn = %cfg.cdn_base,
        "starting artifact trust service"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let closed = pipeline.shutdown().await;
    if shutdown_tx.send(()).await.is_err() {
        tracing::debug!("sandbox event log already stopped");
    }
    if let Err(error) = event_log.await {
        tracing::warn!(%error, "sandbox event log task failed");
    }

    tracing::info!(closed, "artifact trust service exited cleanly");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term_signal) => term_signal.recv().await,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                None
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
