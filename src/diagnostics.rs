// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Fixture-driven checks of the trust pipeline.
//!
//! `ArtifactTestRunner` runs each case of a suite through resolution,
//! validation and compilation and compares the outcome with the case's
//! expectations. `ArtifactDebugger` runs the same stages for one source and
//! reports per-stage timings and suggestions.

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde::Serialize;

use crate::compiler::{CompilationOptions, CompilationResult, ComponentCompiler};
use crate::dependencies::{DependencyManager, ResolutionResult};
use crate::model::{Artifact, PartialMetadata};
use crate::validator::{ArtifactSecurityValidator, SecurityValidationResult, ViolationType};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "expect", rename_all = "kebab-case")]
pub enum Expectation {
    Secure,
    Insecure { violation: ViolationType },
    CompileSucceeds,
    CompileFails,
    CompileWarns,
    DependencyFails { name: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    pub description: String,
    pub code: String,
    pub dependencies: Vec<String>,
    pub expectations: Vec<Expectation>,
}

impl TestCase {
    pub fn new(name: &str, description: &str, code: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            code: code.to_string(),
            dependencies: Vec::new(),
            expectations: Vec::new(),
        }
    }

    pub fn dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    fn artifact(&self) -> Artifact {
        let metadata = PartialMetadata {
            dependencies: (!self.dependencies.is_empty()).then(|| self.dependencies.clone()),
            ..PartialMetadata::default()
        };
        Artifact::draft(format!("fixture-{}", self.name), self.code.clone(), metadata)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactTestSuite {
    pub name: String,
    pub cases: Vec<TestCase>,
}

const CLEAN_COMPONENT: &str = r#"import React, { useState } from 'react';

export default function Counter({ start = 0 }) {
  const [count, setCount] = useState(start);
  return (
    <div className="p-4">
      <p>Count: {count}</p>
      <button onClick={() => setCount(count + 1)}>Increment</button>
    </div>
  );
}
"#;

const TYPED_COMPONENT: &str = r#"import React, { useState } from 'react';

interface TodoProps {
  title: string;
  initial?: string[];
}

export default function TodoList({ title, initial = [] }: TodoProps) {
  const [items, setItems] = useState<string[]>(initial);
  const add = (text: string): void => setItems([...items, text]);
  return (
    <section>
      <h2>{title}</h2>
      <ul>{items.map((item) => <li key={item}>{item}</li>)}</ul>
      <button onClick={() => add('new')}>Add</button>
    </section>
  );
}
"#;

const EVAL_COMPONENT: &str = r#"import React from 'react';

export default function Calculator() {
  const result = eval('1 + 1');
  return <p>{result}</p>;
}
"#;

const NETWORK_COMPONENT: &str = r#"import React, { useEffect, useState } from 'react';

export default function Weather() {
  const [data, setData] = useState(null);
  useEffect(() => {
    fetch('https://api.example.com/weather').then((r) => r.json()).then(setData);
  }, []);
  return <pre>{JSON.stringify(data)}</pre>;
}
"#;

const STORAGE_COMPONENT: &str = r#"import React from 'react';

export default function Notes() {
  const saved = localStorage.getItem('notes');
  return <textarea defaultValue={saved} />;
}
"#;

const POLLUTION_COMPONENT: &str = r#"import React from 'react';

export default function Merge() {
  const target = {};
  target.__proto__.isAdmin = true;
  return <span>merged</span>;
}
"#;

const UNLISTED_DEPENDENCY_COMPONENT: &str = r#"import React from 'react';
import leftPad from 'left-pad';

export default function Padded() {
  return <code>{leftPad('7', 3, '0')}</code>;
}
"#;

impl ArtifactTestSuite {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cases: Vec::new(),
        }
    }

    pub fn with_case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    /// Fixtures covering each gate outcome.
    pub fn builtin() -> Self {
        Self::new("builtin")
            .with_case(
                TestCase::new("clean-component", "plain stateful component", CLEAN_COMPONENT)
                    .expect(Expectation::Secure)
                    .expect(Expectation::CompileSucceeds),
            )
            .with_case(
                TestCase::new("typed-component", "type annotations are stripped", TYPED_COMPONENT)
                    .expect(Expectation::Secure)
                    .expect(Expectation::CompileSucceeds),
            )
            .with_case(
                TestCase::new("dynamic-evaluation", "eval is a critical finding", EVAL_COMPONENT)
                    .expect(Expectation::Insecure {
                        violation: ViolationType::DangerousFunction,
                    }),
            )
            .with_case(
                TestCase::new(
                    "network-call",
                    "network calls are advisory and warned about at compile time",
                    NETWORK_COMPONENT,
                )
                .expect(Expectation::Secure)
                .expect(Expectation::CompileWarns),
            )
            .with_case(
                TestCase::new("storage-access", "browser storage is blocked", STORAGE_COMPONENT)
                    .expect(Expectation::Insecure {
                        violation: ViolationType::FileAccess,
                    }),
            )
            .with_case(
                TestCase::new("prototype-pollution", "__proto__ writes are blocked", POLLUTION_COMPONENT)
                    .expect(Expectation::Insecure {
                        violation: ViolationType::PrototypePollution,
                    }),
            )
            .with_case(
                TestCase::new(
                    "unlisted-dependency",
                    "packages outside the whitelist never resolve",
                    UNLISTED_DEPENDENCY_COMPONENT,
                )
                .dependencies(&["react", "react-dom", "left-pad"])
                .expect(Expectation::Insecure {
                    violation: ViolationType::UnauthorizedDependency,
                })
                .expect(Expectation::DependencyFails {
                    name: "left-pad".to_string(),
                })
                .expect(Expectation::CompileFails),
            )
            .with_case(
                TestCase::new("empty-source", "nothing to render", "").expect(Expectation::CompileFails),
            )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub failures: Vec<String>,
    pub score: u8,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteReport {
    pub suite: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: f64,
    pub results: Vec<CaseResult>,
}

/// Outcome of running one source through the pipeline stages.
struct StageOutcomes {
    resolution: ResolutionResult,
    validation: SecurityValidationResult,
    compilation: Result<CompilationResult, String>,
}

async fn run_stages(
    dependencies: &DependencyManager,
    validator: &ArtifactSecurityValidator,
    compiler: &ComponentCompiler,
    artifact: &Artifact,
) -> StageOutcomes {
    let resolution = dependencies
        .resolve_dependencies(&artifact.metadata.dependencies)
        .await;
    let validation = validator.validate_artifact(artifact).await;
    let compilation = compiler
        .compile_artifact(artifact, &CompilationOptions::default())
        .await
        .map_err(|e| e.to_string());
    StageOutcomes {
        resolution,
        validation,
        compilation,
    }
}

fn check(expectation: &Expectation, outcome: &StageOutcomes) -> Option<String> {
    let compiled_ok = matches!(&outcome.compilation, Ok(result) if result.success);
    match expectation {
        Expectation::Secure if !outcome.validation.is_secure => Some(format!(
            "expected secure, got violations: {}",
            outcome.validation.blocking_messages().join("; ")
        )),
        Expectation::Insecure { violation } => {
            if outcome.validation.is_secure {
                Some("expected the validator to block".to_string())
            } else if !outcome.validation.violations.iter().any(|v| v.kind == *violation) {
                Some(format!("expected a {violation:?} violation"))
            } else {
                None
            }
        }
        Expectation::CompileSucceeds if !compiled_ok => Some(match &outcome.compilation {
            Ok(result) => format!("compilation failed: {}", result.errors.join("; ")),
            Err(error) => format!("compilation errored: {error}"),
        }),
        Expectation::CompileFails if compiled_ok => Some("expected compilation to fail".to_string()),
        Expectation::CompileWarns => match &outcome.compilation {
            Ok(result) if result.success && !result.warnings.is_empty() => None,
            _ => Some("expected a successful compilation with warnings".to_string()),
        },
        Expectation::DependencyFails { name } if !outcome.resolution.failed.contains(name) => {
            Some(format!("expected '{name}' to fail resolution"))
        }
        _ => None,
    }
}

pub struct ArtifactTestRunner {
    dependencies: Arc<DependencyManager>,
    validator: Arc<ArtifactSecurityValidator>,
    compiler: Arc<ComponentCompiler>,
}

impl ArtifactTestRunner {
    pub fn new(
        dependencies: Arc<DependencyManager>,
        validator: Arc<ArtifactSecurityValidator>,
        compiler: Arc<ComponentCompiler>,
    ) -> Self {
        Self {
            dependencies,
            validator,
            compiler,
        }
    }

    pub async fn run(&self, suite: &ArtifactTestSuite) -> SuiteReport {
        let started = Instant::now();
        let results = join_all(suite.cases.iter().map(|case| self.run_case(case))).await;
        let passed = results.iter().filter(|r| r.passed).count();

        let report = SuiteReport {
            suite: suite.name.clone(),
            total: results.len(),
            passed,
            failed: results.len() - passed,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            results,
        };
        tracing::info!(suite = %report.suite, passed = report.passed, failed = report.failed, "diagnostic suite finished");
        report
    }

    async fn run_case(&self, case: &TestCase) -> CaseResult {
        let started = Instant::now();
        let artifact = case.artifact();
        let outcome = run_stages(&self.dependencies, &self.validator, &self.compiler, &artifact).await;
        let failures: Vec<String> = case
            .expectations
            .iter()
            .filter_map(|expectation| check(expectation, &outcome))
            .collect();

        CaseResult {
            name: case.name.clone(),
            passed: failures.is_empty(),
            failures,
            score: outcome.validation.score,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Resolve,
    Validate,
    Compile,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: Stage,
    pub success: bool,
    pub duration_ms: f64,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugReport {
    pub ready_to_render: bool,
    pub stages: Vec<StageReport>,
    pub validation: SecurityValidationResult,
    pub suggestions: Vec<String>,
}

pub struct ArtifactDebugger {
    dependencies: Arc<DependencyManager>,
    validator: Arc<ArtifactSecurityValidator>,
    compiler: Arc<ComponentCompiler>,
}

impl ArtifactDebugger {
    pub fn new(
        dependencies: Arc<DependencyManager>,
        validator: Arc<ArtifactSecurityValidator>,
        compiler: Arc<ComponentCompiler>,
    ) -> Self {
        Self {
            dependencies,
            validator,
            compiler,
        }
    }

    pub async fn debug(&self, code: &str, metadata: PartialMetadata) -> DebugReport {
        let artifact = Artifact::draft("debug", code, metadata);
        let mut stages = Vec::with_capacity(3);
        let mut suggestions = Vec::new();

        let started = Instant::now();
        let resolution = self
            .dependencies
            .resolve_dependencies(&artifact.metadata.dependencies)
            .await;
        let mut details: Vec<String> = resolution.resolved.iter().map(|d| d.key()).collect();
        details.extend(resolution.warnings.iter().cloned());
        for failed in &resolution.failed {
            details.push(format!("unresolved: {failed}"));
            suggestions.push(format!(
                "Remove '{failed}' or replace it with a whitelisted package"
            ));
        }
        stages.push(StageReport {
            stage: Stage::Resolve,
            success: resolution.failed.is_empty(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            details,
        });

        let started = Instant::now();
        let validation = self.validator.validate_artifact(&artifact).await;
        suggestions.extend(validation.recommendations.iter().cloned());
        stages.push(StageReport {
            stage: Stage::Validate,
            success: validation.is_secure,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            details: validation
                .violations
                .iter()
                .map(|v| format!("{}: {}", v.severity.as_str(), v.message))
                .collect(),
        });

        let started = Instant::now();
        let (compiled, details) = match self
            .compiler
            .compile_artifact(&artifact, &CompilationOptions::default())
            .await
        {
            Ok(result) => {
                if !result.success {
                    suggestions.push(
                        "Make sure the source imports React and exports a component, e.g. `export default function App()`"
                            .to_string(),
                    );
                }
                let mut details = result.errors.clone();
                details.extend(result.warnings.iter().map(|w| format!("warning: {w}")));
                (result.success, details)
            }
            Err(error) => {
                suggestions.push("Declare only whitelisted dependencies".to_string());
                (false, vec![error.to_string()])
            }
        };
        stages.push(StageReport {
            stage: Stage::Compile,
            success: compiled,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            details,
        });

        suggestions.dedup();
        DebugReport {
            ready_to_render: stages.iter().all(|s| s.success),
            stages,
            validation,
            suggestions,
        }
    }
}
