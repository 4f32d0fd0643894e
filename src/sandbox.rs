// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Isolated rendering sessions.
//!
//! Each artifact has at most one live session. A session is a generated
//! document meant for a frame with `sandbox="allow-scripts"`: a strict CSP,
//! guard scripts that report errors, timeouts and heap usage to the parent,
//! and the compiled module. Frame messages come back tagged with the artifact
//! and session ids; anything not addressed to the live session is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::compiler::{
    origin_of, render_document, CompilationOptions, ComponentCompiler, ContentSecurityPolicy,
    DocumentParts,
};
use crate::config::DEFAULT_CDN_BASE;
use crate::error::AppError;
use crate::metrics::Metrics;
use crate::model::Artifact;
use crate::monitor::ArtifactPerformanceMonitor;

/// Value for the frame's `sandbox` attribute. No same-origin, forms, popups
/// or top navigation.
pub const FRAME_SANDBOX: &str = "allow-scripts";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub execution_timeout: Duration,
    pub memory_limit_mb: u64,
    pub memory_poll_interval: Duration,
    pub cdn_base: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_millis(5_000),
            memory_limit_mb: 50,
            memory_poll_interval: Duration::from_millis(1_000),
            cdn_base: DEFAULT_CDN_BASE.to_string(),
        }
    }
}

/// Live handle given to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHandle {
    pub artifact_id: String,
    pub session_id: String,
    pub document: String,
    pub frame_sandbox: String,
    pub content_security_policy: String,
    pub dependencies: Vec<String>,
    pub rejected_dependencies: Vec<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_time: Option<f64>,
    /// Heap in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re_renders: Option<u32>,
}

fn runtime_error_type() -> String {
    "runtime".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SandboxEvent {
    Ready {
        #[serde(default)]
        metrics: RuntimeMetrics,
    },
    Error {
        #[serde(rename = "type", default = "runtime_error_type")]
        error_type: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<u32>,
    },
    Timeout {
        message: String,
    },
    MemoryLimit {
        message: String,
        #[serde(default, rename = "usedMb", skip_serializing_if = "Option::is_none")]
        used_mb: Option<f64>,
    },
    Performance {
        #[serde(default)]
        metrics: RuntimeMetrics,
    },
}

/// A message between a session and the host, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMessage {
    pub artifact_id: String,
    pub session_id: String,
    pub event: SandboxEvent,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageDisposition {
    Accepted,
    Stale,
}

struct LiveSession {
    handle: SandboxHandle,
    ready: bool,
    watchdog: Option<JoinHandle<()>>,
}

impl LiveSession {
    fn release(mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

type Sessions = Arc<RwLock<HashMap<String, LiveSession>>>;

pub struct ComponentSandbox {
    config: SandboxConfig,
    compiler: Arc<ComponentCompiler>,
    monitor: Arc<ArtifactPerformanceMonitor>,
    metrics: Metrics,
    sessions: Sessions,
    events: broadcast::Sender<SandboxMessage>,
}

impl ComponentSandbox {
    pub fn new(
        config: SandboxConfig,
        compiler: Arc<ComponentCompiler>,
        monitor: Arc<ArtifactPerformanceMonitor>,
        metrics: Metrics,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            compiler,
            monitor,
            metrics,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Events accepted from live sessions plus host watchdog timeouts.
    pub fn subscribe(&self) -> broadcast::Receiver<SandboxMessage> {
        self.events.subscribe()
    }

    /// Tear down any prior session, compile, and register a new one.
    /// Nothing is registered when compilation fails.
    pub async fn create_sandbox(&self, artifact: &Artifact) -> Result<SandboxHandle, AppError> {
        let artifact_id = artifact.id.as_str();
        self.destroy_sandbox(artifact_id).await;

        let dependencies = self.compiler.dependencies();
        let mut allowed = Vec::new();
        let mut rejected = Vec::new();
        for dep in &artifact.metadata.dependencies {
            if dependencies.is_whitelisted(dep).await {
                allowed.push(dep.clone());
            } else {
                rejected.push(dep.clone());
            }
        }
        if !rejected.is_empty() {
            tracing::warn!(artifact_id, rejected = ?rejected, "dropping non-whitelisted dependencies");
        }

        let mut filtered = artifact.clone();
        filtered.metadata.dependencies = allowed.clone();

        let compiled = self
            .compiler
            .compile_artifact(&filtered, &CompilationOptions::default())
            .await?;
        self.metrics
            .record_compilation(compiled.success, compiled.compilation_time_ms);
        if !compiled.success {
            return Err(AppError::Compilation(compiled.errors));
        }

        let session_id = Uuid::new_v4().to_string();
        let origins: Vec<String> = origin_of(&self.config.cdn_base).into_iter().collect();
        let csp = ContentSecurityPolicy::sandboxed(&origins);
        let guards = [guard_script(artifact_id, &session_id, &self.config)];
        let import_map = compiled.import_map.unwrap_or_default();
        let module = compiled.module.unwrap_or_default();

        let document = render_document(&DocumentParts {
            title: &artifact.metadata.title,
            csp: &csp,
            import_map: &import_map,
            head_scripts: &guards,
            module: &module,
        });

        let handle = SandboxHandle {
            artifact_id: artifact_id.to_string(),
            session_id: session_id.clone(),
            document,
            frame_sandbox: FRAME_SANDBOX.to_string(),
            content_security_policy: csp.render(),
            dependencies: allowed,
            rejected_dependencies: rejected,
            warnings: compiled.warnings,
            created_at: Utc::now(),
        };

        let watchdog = self.spawn_watchdog(artifact_id.to_string(), session_id.clone());
        let live = {
            let mut sessions = self.sessions.write().await;
            let replaced = sessions.insert(
                artifact_id.to_string(),
                LiveSession {
                    handle: handle.clone(),
                    ready: false,
                    watchdog: Some(watchdog),
                },
            );
            // A concurrent create may have landed while we were compiling.
            if let Some(previous) = replaced {
                previous.release();
            }
            sessions.len()
        };

        self.monitor.start(artifact_id).await;
        self.metrics.record_sandbox_created(live);
        tracing::info!(artifact_id, session_id = %session_id, "sandbox session created");

        Ok(handle)
    }

    fn spawn_watchdog(&self, artifact_id: String, session_id: String) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        let timeout = self.config.execution_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let stalled = sessions
                .read()
                .await
                .get(&artifact_id)
                .is_some_and(|live| live.handle.session_id == session_id && !live.ready);
            if stalled {
                tracing::warn!(artifact_id = %artifact_id, session_id = %session_id, "session did not become ready in time");
                let _ = events.send(SandboxMessage {
                    artifact_id,
                    session_id,
                    event: SandboxEvent::Timeout {
                        message: format!("no ready signal within {}ms", timeout.as_millis()),
                    },
                });
            }
        })
    }

    /// Correlate a frame message with the live session and forward it.
    pub async fn receive(&self, message: SandboxMessage) -> MessageDisposition {
        let artifact_id_owned = message.artifact_id.clone();
        let artifact_id = artifact_id_owned.as_str();
        let current = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(artifact_id) {
                Some(live) if live.handle.session_id == message.session_id => {
                    if matches!(message.event, SandboxEvent::Ready { .. }) {
                        live.ready = true;
                        if let Some(watchdog) = live.watchdog.take() {
                            watchdog.abort();
                        }
                    }
                    true
                }
                _ => false,
            }
        };

        self.metrics.record_message(current);
        if !current {
            tracing::debug!(
                artifact_id,
                session_id = %message.session_id,
                "ignoring message from stale session"
            );
            return MessageDisposition::Stale;
        }

        let mut follow_up = None;
        match &message.event {
            SandboxEvent::Ready { metrics } => {
                if let Some(render_time) = metrics.render_time {
                    self.monitor.record_render(artifact_id, render_time).await;
                }
            }
            SandboxEvent::Error { error_type, message: text, .. } => {
                tracing::warn!(artifact_id, error_type = %error_type, detail = %text, "runtime error in sandbox");
                self.monitor.record_error(artifact_id).await;
            }
            SandboxEvent::Performance { metrics } => {
                if let Some(render_time) = metrics.render_time {
                    self.monitor.record_render(artifact_id, render_time).await;
                }
                if let Some(re_renders) = metrics.re_renders {
                    self.monitor.record_rerenders(artifact_id, re_renders).await;
                }
                if let Some(used) = metrics.memory_used {
                    self.monitor.record_memory(artifact_id, used).await;
                    let limit = self.config.memory_limit_mb as f64;
                    if used > limit {
                        follow_up = Some(SandboxEvent::MemoryLimit {
                            message: format!("heap usage {used:.1}MB exceeds {limit:.0}MB"),
                            used_mb: Some(used),
                        });
                    }
                }
            }
            SandboxEvent::MemoryLimit { used_mb, .. } => {
                if let Some(used) = used_mb {
                    self.monitor.record_memory(artifact_id, *used).await;
                }
                tracing::warn!(artifact_id, "sandbox reported memory limit");
            }
            SandboxEvent::Timeout { .. } => {
                tracing::warn!(artifact_id, "sandbox reported execution timeout");
            }
        }

        let session_id = message.session_id.clone();
        let _ = self.events.send(message);
        if let Some(event) = follow_up {
            let _ = self.events.send(SandboxMessage {
                artifact_id: artifact_id.to_string(),
                session_id,
                event,
            });
        }

        MessageDisposition::Accepted
    }

    pub async fn session(&self, artifact_id: &str) -> Option<SandboxHandle> {
        self.sessions
            .read()
            .await
            .get(artifact_id)
            .map(|live| live.handle.clone())
    }

    pub async fn is_ready(&self, artifact_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(artifact_id)
            .is_some_and(|live| live.ready)
    }

    pub async fn live_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Release the session for `artifact_id`. Returns false if none was live.
    pub async fn destroy_sandbox(&self, artifact_id: &str) -> bool {
        let (removed, live) = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(artifact_id);
            (removed, sessions.len())
        };

        let Some(session) = removed else {
            return false;
        };
        tracing::info!(artifact_id, session_id = %session.handle.session_id, "sandbox session destroyed");
        session.release();
        self.monitor.stop(artifact_id).await;
        self.metrics.record_sandbox_destroyed(1, live);
        true
    }

    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<(String, LiveSession)> = self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (artifact_id, session) in drained {
            session.release();
            self.monitor.stop(&artifact_id).await;
        }
        if count > 0 {
            self.metrics.record_sandbox_destroyed(count, 0);
            tracing::info!(count, "all sandbox sessions destroyed");
        }
        count
    }
}

/// In-frame guards: error capture, execution timer and heap polling. Runs
/// before the module so it also sees import failures.
fn guard_script(artifact_id: &str, session_id: &str, config: &SandboxConfig) -> String {
    let context = serde_json::json!({ "artifactId": artifact_id, "sessionId": session_id });
    format!(
        r#"(function () {{
  var context = {context};
  var timeoutMs = {timeout};
  var memoryLimitMb = {memory};
  var pollMs = {poll};
  var finished = false;
  var timer = null;
  function post(kind, data) {{
    var event = Object.assign({{ kind: kind }}, data || {{}});
    window.parent.postMessage({{ source: 'artifact-sandbox', artifactId: context.artifactId, sessionId: context.sessionId, event: event }}, '*');
  }}
  window.__artifactReport = function (kind, data) {{
    if (kind === 'ready') {{
      finished = true;
      if (timer) clearTimeout(timer);
    }}
    post(kind, data);
  }};
  window.addEventListener('error', function (e) {{
    post('error', {{
      type: 'runtime',
      message: String(e.message || 'Unknown error'),
      stack: e.error && e.error.stack ? String(e.error.stack) : undefined,
      line: e.lineno || undefined,
      column: e.colno || undefined
    }});
  }});
  window.addEventListener('unhandledrejection', function (e) {{
    var reason = e.reason;
    post('error', {{
      type: 'unhandledrejection',
      message: String((reason && reason.message) || reason),
      stack: reason && reason.stack ? String(reason.stack) : undefined
    }});
  }});
  timer = setTimeout(function () {{
    if (!finished) post('timeout', {{ message: 'Execution exceeded ' + timeoutMs + 'ms' }});
  }}, timeoutMs);
  setInterval(function () {{
    var memory = window.performance && window.performance.memory;
    if (!memory) return;
    var used = memory.usedJSHeapSize / 1048576;
    if (used > memoryLimitMb) {{
      post('memory-limit', {{ message: 'Memory usage ' + used.toFixed(1) + 'MB exceeds ' + memoryLimitMb + 'MB', usedMb: used }});
    }} else {{
      post('performance', {{ metrics: {{ memoryUsed: used }} }});
    }}
  }}, pollMs);
}})();"#,
        context = context,
        timeout = config.execution_timeout.as_millis(),
        memory = config.memory_limit_mb,
        poll = config.memory_poll_interval.as_millis(),
    )
}

/// Logs sandbox events until a shutdown signal arrives.
pub fn spawn_event_log(
    mut events: broadcast::Receiver<SandboxMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Ok(message) => log_event(&message),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "sandbox event log lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("sandbox event log shutting down");
                    break;
                }
            }
        }
    })
}

fn log_event(message: &SandboxMessage) {
    let artifact_id = message.artifact_id.as_str();
    let session_id = message.session_id.as_str();
    match &message.event {
        SandboxEvent::Ready { metrics } => {
            tracing::info!(artifact_id, session_id, render_time = ?metrics.render_time, "artifact ready");
        }
        SandboxEvent::Error { error_type, message, line, .. } => {
            tracing::warn!(artifact_id, session_id, error_type = %error_type, line = ?line, "artifact error: {message}");
        }
        SandboxEvent::Timeout { message } => {
            tracing::warn!(artifact_id, session_id, "artifact timeout: {message}");
        }
        SandboxEvent::MemoryLimit { message, .. } => {
            tracing::warn!(artifact_id, session_id, "artifact memory limit: {message}");
        }
        SandboxEvent::Performance { metrics } => {
            tracing::trace!(artifact_id, session_id, memory = ?metrics.memory_used, "artifact performance sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::DependencyManager;
    use crate::model::PartialMetadata;

    const COMPONENT: &str = "import React from 'react';\nexport default function Hello() { return <h1>Hello</h1>; }\n";

    fn sandbox_with(config: SandboxConfig) -> (ComponentSandbox, Arc<ArtifactPerformanceMonitor>) {
        let deps = Arc::new(DependencyManager::new("https://esm.sh"));
        let compiler = Arc::new(ComponentCompiler::new(deps));
        let monitor = Arc::new(ArtifactPerformanceMonitor::default());
        let sandbox = ComponentSandbox::new(config, compiler, monitor.clone(), Metrics::new().unwrap());
        (sandbox, monitor)
    }

    fn sandbox() -> ComponentSandbox {
        sandbox_with(SandboxConfig::default()).0
    }

    fn artifact(id: &str) -> Artifact {
        Artifact::draft(id, COMPONENT, PartialMetadata::default())
    }

    fn message(handle: &SandboxHandle, event: SandboxEvent) -> SandboxMessage {
        SandboxMessage {
            artifact_id: handle.artifact_id.clone(),
            session_id: handle.session_id.clone(),
            event,
        }
    }

    #[tokio::test]
    async fn document_is_locked_down() {
        let sandbox = sandbox();
        let handle = sandbox.create_sandbox(&artifact("a1")).await.unwrap();

        assert_eq!(handle.frame_sandbox, "allow-scripts");
        assert!(handle.content_security_policy.contains("connect-src 'none'"));
        assert!(handle.content_security_policy.contains("frame-src 'none'"));
        assert!(handle.document.contains("window.__artifactReport"));
        assert!(handle.document.contains(&handle.session_id));
        assert!(handle.document.contains("var timeoutMs = 5000;"));
        assert!(handle.document.contains("React.createElement(\"h1\", null, \"Hello\")"));
        assert_eq!(sandbox.live_sessions().await, 1);
    }

    #[tokio::test]
    async fn recreate_replaces_and_stales_old_session() {
        let sandbox = sandbox();
        let first = sandbox.create_sandbox(&artifact("a1")).await.unwrap();
        let second = sandbox.create_sandbox(&artifact("a1")).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(sandbox.live_sessions().await, 1);

        let ready = SandboxEvent::Ready { metrics: RuntimeMetrics::default() };
        assert_eq!(sandbox.receive(message(&first, ready.clone())).await, MessageDisposition::Stale);
        assert!(!sandbox.is_ready("a1").await);
        assert_eq!(sandbox.receive(message(&second, ready)).await, MessageDisposition::Accepted);
        assert!(sandbox.is_ready("a1").await);
    }

    #[tokio::test]
    async fn compile_failure_registers_nothing() {
        let sandbox = sandbox();
        let broken = Artifact::draft("bad", "", PartialMetadata::default());
        let err = sandbox.create_sandbox(&broken).await.unwrap_err();
        assert!(matches!(err, AppError::Compilation(_)));
        assert!(sandbox.session("bad").await.is_none());
    }

    #[tokio::test]
    async fn filters_unlisted_dependencies() {
        let sandbox = sandbox();
        let mut artifact = artifact("a1");
        artifact.metadata.dependencies.push("left-pad".into());
        let handle = sandbox.create_sandbox(&artifact).await.unwrap();
        assert_eq!(handle.rejected_dependencies, vec!["left-pad".to_string()]);
        assert!(!handle.dependencies.contains(&"left-pad".to_string()));
    }

    #[tokio::test]
    async fn forwards_events_and_feeds_the_monitor() {
        let (sandbox, monitor) = sandbox_with(SandboxConfig::default());
        let handle = sandbox.create_sandbox(&artifact("a1")).await.unwrap();
        let mut events = sandbox.subscribe();

        let sample = SandboxEvent::Performance {
            metrics: RuntimeMetrics {
                render_time: Some(12.0),
                memory_used: Some(64.0),
                re_renders: None,
            },
        };
        sandbox.receive(message(&handle, sample.clone())).await;

        assert_eq!(events.recv().await.unwrap().event, sample);
        let follow_up = events.recv().await.unwrap();
        assert!(matches!(follow_up.event, SandboxEvent::MemoryLimit { used_mb: Some(used), .. } if used == 64.0));

        let metrics = monitor.metrics("a1").await.unwrap();
        assert_eq!(metrics.render_count, 1);
        assert_eq!(metrics.peak_memory_mb, 64.0);
    }

    #[tokio::test]
    async fn huge_rerender_sample_is_one_bounded_update() {
        let (sandbox, monitor) = sandbox_with(SandboxConfig::default());
        let handle = sandbox.create_sandbox(&artifact("a1")).await.unwrap();

        let sample = SandboxEvent::Performance {
            metrics: RuntimeMetrics {
                re_renders: Some(u32::MAX),
                ..RuntimeMetrics::default()
            },
        };
        let disposition = tokio::time::timeout(Duration::from_secs(2), sandbox.receive(message(&handle, sample)))
            .await
            .unwrap();
        assert_eq!(disposition, MessageDisposition::Accepted);

        let metrics = monitor.metrics("a1").await.unwrap();
        assert_eq!(metrics.rerender_count, crate::monitor::MAX_RERENDER_BATCH);
        assert_eq!(monitor.alerts("a1").await.len(), 1);
    }

    #[tokio::test]
    async fn watchdog_reports_missing_ready() {
        let config = SandboxConfig {
            execution_timeout: Duration::from_millis(20),
            ..SandboxConfig::default()
        };
        let (sandbox, _) = sandbox_with(config);
        let mut events = sandbox.subscribe();
        let handle = sandbox.create_sandbox(&artifact("a1")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.session_id, handle.session_id);
        assert!(matches!(received.event, SandboxEvent::Timeout { .. }));
    }

    #[tokio::test]
    async fn destroy_all_clears_sessions() {
        let sandbox = sandbox();
        sandbox.create_sandbox(&artifact("a1")).await.unwrap();
        sandbox.create_sandbox(&artifact("a2")).await.unwrap();
        assert_eq!(sandbox.destroy_all().await, 2);
        assert_eq!(sandbox.live_sessions().await, 0);
        assert!(!sandbox.destroy_sandbox("a1").await);
    }

    #[test]
    fn frame_messages_deserialize() {
        let raw = r#"{
            "source": "artifact-sandbox",
            "artifactId": "a1",
            "sessionId": "s1",
            "event": {"kind": "error", "type": "unhandledrejection", "message": "boom", "line": 3}
        }"#;
        let message: SandboxMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            message.event,
            SandboxEvent::Error {
                error_type: "unhandledrejection".into(),
                message: "boom".into(),
                stack: None,
                line: Some(3),
                column: None,
            }
        );

        let ready: SandboxEvent = serde_json::from_str(r#"{"kind":"ready","metrics":{"renderTime":4.5}}"#).unwrap();
        assert_eq!(
            ready,
            SandboxEvent::Ready {
                metrics: RuntimeMetrics { render_time: Some(4.5), ..RuntimeMetrics::default() }
            }
        );
    }

    #[tokio::test]
    async fn event_log_stops_on_shutdown() {
        let sandbox = sandbox();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = spawn_event_log(sandbox.subscribe(), shutdown_rx);
        shutdown_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
