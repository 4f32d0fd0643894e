// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for the artifact pipeline.
//!
//! Tracks gate outcomes, compilation cost, sandbox lifecycle and version writes.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

use crate::error::AppError;
use crate::validator::{SecurityValidationResult, Severity};

fn metric_error(e: prometheus::Error) -> AppError {
    AppError::Internal(anyhow::anyhow!("Failed to create metric: {}", e))
}

/// Metrics collector for the pipeline
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,

    // Security gate
    pub validations: IntCounter,
    pub violations: IntCounterVec,
    pub audits: IntCounter,

    // Compiler
    pub compilations: IntCounter,
    pub compilation_failures: IntCounter,
    pub compile_duration: Histogram,

    // Sandbox lifecycle
    pub sandboxes_created: IntCounter,
    pub sandboxes_destroyed: IntCounter,
    pub live_sessions: IntGauge,
    pub messages_accepted: IntCounter,
    pub messages_stale: IntCounter,

    // Versioning
    pub versions_created: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, AppError> {
        let registry = Registry::new();

        let validations = IntCounter::with_opts(Opts::new(
            "artifact_validations_total",
            "Total number of full security validations",
        ))
        .map_err(metric_error)?;

        let violations = IntCounterVec::new(
            Opts::new(
                "artifact_violations_total",
                "Security violations reported, by severity",
            ),
            &["severity"],
        )
        .map_err(metric_error)?;

        let audits = IntCounter::with_opts(Opts::new(
            "artifact_audits_total",
            "Total number of deep security audits",
        ))
        .map_err(metric_error)?;

        let compilations = IntCounter::with_opts(Opts::new(
            "artifact_compilations_total",
            "Total number of compilation attempts",
        ))
        .map_err(metric_error)?;

        let compilation_failures = IntCounter::with_opts(Opts::new(
            "artifact_compilation_failures_total",
            "Compilations that produced errors instead of a bundle",
        ))
        .map_err(metric_error)?;

        let compile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "artifact_compile_duration_seconds",
                "Time spent compiling an artifact in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ]),
        )
        .map_err(metric_error)?;

        let sandboxes_created = IntCounter::with_opts(Opts::new(
            "artifact_sandboxes_created_total",
            "Total number of sandbox sessions created",
        ))
        .map_err(metric_error)?;

        let sandboxes_destroyed = IntCounter::with_opts(Opts::new(
            "artifact_sandboxes_destroyed_total",
            "Total number of sandbox sessions torn down",
        ))
        .map_err(metric_error)?;

        let live_sessions = IntGauge::with_opts(Opts::new(
            "artifact_live_sessions",
            "Current number of live sandbox sessions",
        ))
        .map_err(metric_error)?;

        let messages_accepted = IntCounter::with_opts(Opts::new(
            "artifact_sandbox_messages_accepted_total",
            "Sandbox messages matched to the live session",
        ))
        .map_err(metric_error)?;

        let messages_stale = IntCounter::with_opts(Opts::new(
            "artifact_sandbox_messages_stale_total",
            "Sandbox messages dropped because their session is gone",
        ))
        .map_err(metric_error)?;

        let versions_created = IntCounter::with_opts(Opts::new(
            "artifact_versions_created_total",
            "Total number of artifact versions written",
        ))
        .map_err(metric_error)?;

        registry.register(Box::new(validations.clone())).map_err(metric_error)?;
        registry.register(Box::new(violations.clone())).map_err(metric_error)?;
        registry.register(Box::new(audits.clone())).map_err(metric_error)?;
        registry.register(Box::new(compilations.clone())).map_err(metric_error)?;
        registry
            .register(Box::new(compilation_failures.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(compile_duration.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(sandboxes_created.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(sandboxes_destroyed.clone()))
            .map_err(metric_error)?;
        registry.register(Box::new(live_sessions.clone())).map_err(metric_error)?;
        registry
            .register(Box::new(messages_accepted.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(messages_stale.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(versions_created.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry: Arc::new(registry),
            validations,
            violations,
            audits,
            compilations,
            compilation_failures,
            compile_duration,
            sandboxes_created,
            sandboxes_destroyed,
            live_sessions,
            messages_accepted,
            messages_stale,
            versions_created,
        })
    }

    /// Record a full validation and its violations
    pub fn record_validation(&self, result: &SecurityValidationResult) {
        self.validations.inc();
        for severity in [Severity::Critical, Severity::High, Severity::Medium, Severity::Low] {
            let count = result.count(severity);
            if count > 0 {
                self.violations
                    .with_label_values(&[severity.as_str()])
                    .inc_by(count as u64);
            }
        }
    }

    pub fn record_audit(&self) {
        self.audits.inc();
    }

    /// Record a compilation attempt and its duration in milliseconds
    pub fn record_compilation(&self, success: bool, elapsed_ms: f64) {
        self.compilations.inc();
        if !success {
            self.compilation_failures.inc();
        }
        self.compile_duration.observe(elapsed_ms / 1000.0);
    }

    pub fn record_sandbox_created(&self, live: usize) {
        self.sandboxes_created.inc();
        self.live_sessions.set(live as i64);
    }

    pub fn record_sandbox_destroyed(&self, count: usize, live: usize) {
        self.sandboxes_destroyed.inc_by(count as u64);
        self.live_sessions.set(live as i64);
    }

    pub fn record_message(&self, accepted: bool) {
        if accepted {
            self.messages_accepted.inc();
        } else {
            self.messages_stale.inc();
        }
    }

    pub fn record_version_created(&self) {
        self.versions_created.inc();
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, AppError> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to convert metrics to string: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_registered_families() {
        let metrics = Metrics::new().unwrap();
        metrics.record_compilation(false, 12.0);
        metrics.record_sandbox_created(1);
        metrics.record_message(false);

        let text = metrics.export().unwrap();
        assert!(text.contains("artifact_compilation_failures_total 1"));
        assert!(text.contains("artifact_live_sessions 1"));
        assert!(text.contains("artifact_sandbox_messages_stale_total 1"));
    }
}
