// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Passive per-artifact performance collection.
//!
//! Samples arrive from the sandbox message path. Nothing here enforces a
//! limit; crossing a threshold raises one alert per kind per monitoring run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Largest re-render count a single sample can contribute.
pub const MAX_RERENDER_BATCH: u32 = 10_000;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceThresholds {
    pub max_render_time_ms: f64,
    pub max_memory_mb: f64,
    pub max_rerenders: u32,
    pub max_errors: u32,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_render_time_ms: 100.0,
            max_memory_mb: 50.0,
            max_rerenders: 50,
            max_errors: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub render_count: u32,
    pub last_render_time_ms: f64,
    pub average_render_time_ms: f64,
    pub max_render_time_ms: f64,
    pub memory_mb: f64,
    pub peak_memory_mb: f64,
    pub rerender_count: u32,
    pub error_count: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PerformanceMetrics {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            render_count: 0,
            last_render_time_ms: 0.0,
            average_render_time_ms: 0.0,
            max_render_time_ms: 0.0,
            memory_mb: 0.0,
            peak_memory_mb: 0.0,
            rerender_count: 0,
            error_count: 0,
            started_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    RenderTime,
    Memory,
    Rerenders,
    Errors,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub artifact_id: String,
    pub monitoring: bool,
    pub metrics: PerformanceMetrics,
    pub alerts: Vec<PerformanceAlert>,
    pub score: u8,
    pub recommendations: Vec<String>,
}

struct MonitorEntry {
    metrics: PerformanceMetrics,
    alerts: Vec<PerformanceAlert>,
    active: bool,
}

impl MonitorEntry {
    fn new() -> Self {
        Self {
            metrics: PerformanceMetrics::new(Utc::now()),
            alerts: Vec::new(),
            active: true,
        }
    }

    fn has_alert(&self, kind: AlertKind) -> bool {
        self.alerts.iter().any(|alert| alert.kind == kind)
    }
}

pub struct ArtifactPerformanceMonitor {
    thresholds: PerformanceThresholds,
    entries: RwLock<HashMap<String, MonitorEntry>>,
}

impl Default for ArtifactPerformanceMonitor {
    fn default() -> Self {
        Self::new(PerformanceThresholds::default())
    }
}

impl ArtifactPerformanceMonitor {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self {
            thresholds,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> PerformanceThresholds {
        self.thresholds
    }

    /// Begin (or restart) monitoring; previous samples are discarded.
    pub async fn start(&self, artifact_id: &str) {
        self.entries
            .write()
            .await
            .insert(artifact_id.to_string(), MonitorEntry::new());
        tracing::debug!(artifact_id, "performance monitoring started");
    }

    /// Stop collecting; accumulated metrics stay readable.
    pub async fn stop(&self, artifact_id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(artifact_id) {
            entry.active = false;
        }
    }

    pub async fn reset(&self, artifact_id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(artifact_id) {
            let active = entry.active;
            *entry = MonitorEntry::new();
            entry.active = active;
        }
    }

    pub async fn remove(&self, artifact_id: &str) {
        self.entries.write().await.remove(artifact_id);
    }

    pub async fn is_monitoring(&self, artifact_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(artifact_id)
            .is_some_and(|entry| entry.active)
    }

    pub async fn record_render(&self, artifact_id: &str, render_time_ms: f64) -> Option<PerformanceAlert> {
        let threshold = self.thresholds.max_render_time_ms;
        self.update(artifact_id, |metrics| {
            metrics.render_count = metrics.render_count.saturating_add(1);
            metrics.last_render_time_ms = render_time_ms;
            metrics.max_render_time_ms = metrics.max_render_time_ms.max(render_time_ms);
            let n = f64::from(metrics.render_count);
            metrics.average_render_time_ms += (render_time_ms - metrics.average_render_time_ms) / n;
            (render_time_ms > threshold).then(|| {
                (
                    AlertKind::RenderTime,
                    render_time_ms,
                    threshold,
                    format!("render took {render_time_ms:.1}ms (limit {threshold:.0}ms)"),
                )
            })
        })
        .await
    }

    pub async fn record_memory(&self, artifact_id: &str, memory_mb: f64) -> Option<PerformanceAlert> {
        let threshold = self.thresholds.max_memory_mb;
        self.update(artifact_id, |metrics| {
            metrics.memory_mb = memory_mb;
            metrics.peak_memory_mb = metrics.peak_memory_mb.max(memory_mb);
            (memory_mb > threshold).then(|| {
                (
                    AlertKind::Memory,
                    memory_mb,
                    threshold,
                    format!("heap usage {memory_mb:.1}MB exceeds {threshold:.0}MB"),
                )
            })
        })
        .await
    }

    pub async fn record_rerender(&self, artifact_id: &str) -> Option<PerformanceAlert> {
        self.record_rerenders(artifact_id, 1).await
    }

    /// Add a batch of re-renders from one sample. A batch counts for at most
    /// `MAX_RERENDER_BATCH` and the total saturates.
    pub async fn record_rerenders(&self, artifact_id: &str, count: u32) -> Option<PerformanceAlert> {
        if count == 0 {
            return None;
        }
        let threshold = self.thresholds.max_rerenders;
        let count = count.min(MAX_RERENDER_BATCH);
        self.update(artifact_id, |metrics| {
            metrics.rerender_count = metrics.rerender_count.saturating_add(count);
            (metrics.rerender_count > threshold).then(|| {
                (
                    AlertKind::Rerenders,
                    f64::from(metrics.rerender_count),
                    f64::from(threshold),
                    format!("{} re-renders exceed {threshold}", metrics.rerender_count),
                )
            })
        })
        .await
    }

    pub async fn record_error(&self, artifact_id: &str) -> Option<PerformanceAlert> {
        let threshold = self.thresholds.max_errors;
        self.update(artifact_id, |metrics| {
            metrics.error_count = metrics.error_count.saturating_add(1);
            (metrics.error_count > threshold).then(|| {
                (
                    AlertKind::Errors,
                    f64::from(metrics.error_count),
                    f64::from(threshold),
                    format!("{} runtime errors exceed {threshold}", metrics.error_count),
                )
            })
        })
        .await
    }

    async fn update<F>(&self, artifact_id: &str, apply: F) -> Option<PerformanceAlert>
    where
        F: FnOnce(&mut PerformanceMetrics) -> Option<(AlertKind, f64, f64, String)>,
    {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(artifact_id).filter(|entry| entry.active)?;

        let now = Utc::now();
        let crossed = apply(&mut entry.metrics);
        entry.metrics.updated_at = now;

        let (kind, value, threshold, message) = crossed?;
        if entry.has_alert(kind) {
            return None;
        }

        tracing::warn!(artifact_id, ?kind, value, threshold, "performance threshold crossed");
        let alert = PerformanceAlert {
            kind,
            value,
            threshold,
            message,
            raised_at: now,
        };
        entry.alerts.push(alert.clone());
        Some(alert)
    }

    pub async fn metrics(&self, artifact_id: &str) -> Option<PerformanceMetrics> {
        self.entries
            .read()
            .await
            .get(artifact_id)
            .map(|entry| entry.metrics.clone())
    }

    pub async fn alerts(&self, artifact_id: &str) -> Vec<PerformanceAlert> {
        self.entries
            .read()
            .await
            .get(artifact_id)
            .map(|entry| entry.alerts.clone())
            .unwrap_or_default()
    }

    pub async fn generate_report(&self, artifact_id: &str) -> Option<PerformanceReport> {
        let entries = self.entries.read().await;
        let entry = entries.get(artifact_id)?;
        let (score, recommendations) = score_metrics(&entry.metrics, &self.thresholds);

        Some(PerformanceReport {
            artifact_id: artifact_id.to_string(),
            monitoring: entry.active,
            metrics: entry.metrics.clone(),
            alerts: entry.alerts.clone(),
            score,
            recommendations,
        })
    }
}

fn score_metrics(metrics: &PerformanceMetrics, limits: &PerformanceThresholds) -> (u8, Vec<String>) {
    let mut score: i32 = 100;
    let mut recommendations = Vec::new();

    if metrics.average_render_time_ms > limits.max_render_time_ms {
        score -= 25;
        recommendations.push(
            "Average render time is high; memoize expensive computations with useMemo".to_string(),
        );
    } else if metrics.average_render_time_ms > limits.max_render_time_ms / 2.0 {
        score -= 10;
        recommendations.push("Render time is approaching the limit".to_string());
    }

    if metrics.peak_memory_mb > limits.max_memory_mb {
        score -= 25;
        recommendations.push(
            "Peak memory exceeded the ceiling; avoid holding large arrays in state".to_string(),
        );
    }

    if metrics.rerender_count > limits.max_rerenders {
        score -= 20;
        recommendations.push(
            "Frequent re-renders; check effect dependencies and stabilise callbacks".to_string(),
        );
    }

    if metrics.error_count > 0 {
        score -= metrics.error_count.saturating_mul(10).min(30) as i32;
        recommendations.push("Runtime errors were reported; inspect the error events".to_string());
    }

    (score.clamp(0, 100) as u8, recommendations)
}
