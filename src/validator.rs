// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Pattern-based security gate for artifact source.
//!
//! Source is scanned line by line against five pattern families. Every hit is a
//! violation whose severity is fixed by its family. Declared and imported
//! dependencies are checked against the whitelist, and metadata text is checked
//! for embedded markup. Validation never fails: internal errors are reported as
//! a critical violation so the gate stays closed.

use std::sync::{Arc, OnceLock};

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::dependencies::DependencyManager;
use crate::model::Artifact;
use crate::source;

pub const MAX_CODE_BYTES: usize = 100_000;
const MAX_DEPENDENCIES: usize = 10;
const SNIPPET_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn penalty(self) -> u32 {
        match self {
            Severity::Critical => 25,
            Severity::High => 15,
            Severity::Medium => 8,
            Severity::Low => 3,
        }
    }

    /// Critical and high findings make an artifact unexecutable.
    pub fn is_blocking(self) -> bool {
        self >= Severity::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    DangerousFunction,
    NetworkAccess,
    FileAccess,
    XssVector,
    PrototypePollution,
    UnauthorizedDependency,
    MetadataInjection,
    ValidationError,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    PotentialInfiniteLoop,
    ConsoleUsage,
    DirectDomAccess,
    CodeSize,
    DependencyCount,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    #[serde(rename = "type")]
    pub kind: ViolationType,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityWarning {
    #[serde(rename = "type")]
    pub kind: WarningType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityValidationResult {
    pub is_secure: bool,
    pub violations: Vec<SecurityViolation>,
    pub warnings: Vec<SecurityWarning>,
    pub score: u8,
    pub recommendations: Vec<String>,
}

impl SecurityValidationResult {
    fn from_findings(violations: Vec<SecurityViolation>, warnings: Vec<SecurityWarning>) -> Self {
        let is_secure = !violations.iter().any(|v| v.severity.is_blocking());
        let score = score(&violations, warnings.len());
        let recommendations = recommendations(&violations, &warnings);
        Self {
            is_secure,
            violations,
            warnings,
            score,
            recommendations,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.violations.iter().filter(|v| v.severity == severity).count()
    }

    /// Human-readable list of the findings that block execution.
    pub fn blocking_messages(&self) -> Vec<String> {
        self.violations
            .iter()
            .filter(|v| v.severity.is_blocking())
            .map(|v| match v.line {
                Some(line) => format!("[{}] line {}: {}", v.severity.as_str(), line, v.message),
                None => format!("[{}] {}", v.severity.as_str(), v.message),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuickCheckResult {
    pub is_safe: bool,
    pub issues: Vec<String>,
}

struct PatternFamily {
    kind: ViolationType,
    severity: Severity,
    patterns: &'static [(&'static str, &'static str)],
}

const FAMILIES: &[PatternFamily] = &[
    PatternFamily {
        kind: ViolationType::DangerousFunction,
        severity: Severity::Critical,
        patterns: &[
            (r"\beval\s*\(", "dynamic code evaluation via eval()"),
            (r"\bnew\s+Function\s*\(", "dynamic code construction via new Function()"),
            (r"(?:^|[^\w.\s])\s*Function\s*\(", "Function constructor call"),
            (r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#, "string passed to a timer is evaluated as code"),
            (r"dangerouslySetInnerHTML", "raw HTML injection through dangerouslySetInnerHTML"),
            (r"\.(?:inner|outer)HTML\s*=", "direct HTML injection through innerHTML/outerHTML"),
            (r"\bdocument\.write(?:ln)?\s*\(", "markup injection through document.write()"),
            (r"\.insertAdjacentHTML\s*\(", "markup injection through insertAdjacentHTML()"),
            (r#"\bimport\s*\(\s*[^'"`\s)]"#, "dynamic import with a computed specifier"),
        ],
    },
    PatternFamily {
        kind: ViolationType::NetworkAccess,
        severity: Severity::Medium,
        patterns: &[
            (r"\bfetch\s*\(", "outbound fetch() request"),
            (r"\bXMLHttpRequest\b", "outbound XMLHttpRequest"),
            (r"\bnew\s+WebSocket\s*\(", "WebSocket connection"),
            (r"\bnew\s+EventSource\s*\(", "EventSource connection"),
            (r"\bnavigator\.sendBeacon\s*\(", "beacon request"),
            (r"\baxios\b", "HTTP client usage"),
            (r#"\bimport\s*\(\s*['"`]https?:"#, "remote module import"),
        ],
    },
    PatternFamily {
        kind: ViolationType::FileAccess,
        severity: Severity::High,
        patterns: &[
            (r"\blocalStorage\b", "localStorage access"),
            (r"\bsessionStorage\b", "sessionStorage access"),
            (r"\bindexedDB\b", "IndexedDB access"),
            (r"\bdocument\.cookie\b", "cookie access"),
            (r"\bcaches\.open\s*\(", "Cache Storage access"),
            (r"\bnavigator\.storage\b", "storage manager access"),
            (r"\b(?:window|document)\.location\s*=", "navigation through location assignment"),
            (r"\blocation\.(?:assign|replace)\s*\(", "navigation through location"),
            (r"\blocation\.href\s*=", "navigation through location.href"),
            (r"\b(?:top|parent|opener)\.(?:location|document)\b", "access to the embedding document"),
            (r#"\brequire\s*\(\s*['"](?:node:)?(?:fs|child_process|os|path|net|http|https)['"]"#, "host module access"),
        ],
    },
    PatternFamily {
        kind: ViolationType::XssVector,
        severity: Severity::High,
        patterns: &[
            (r"(?i)<\s*script\b", "inline script markup"),
            (r"(?i)javascript\s*:", "javascript: URL"),
            (r"(?i)\bsrcdoc\s*=", "srcdoc document injection"),
            (r"(?i)<\s*(?:iframe|object|embed)\b", "embedded browsing context"),
            (r#"(?i)\son[a-z]+\s*=\s*['"]"#, "inline event handler string"),
            (r"(?i)data\s*:\s*text/html", "HTML data URL"),
        ],
    },
    PatternFamily {
        kind: ViolationType::PrototypePollution,
        severity: Severity::High,
        patterns: &[
            (r"__proto__", "__proto__ access"),
            (r"\bconstructor\s*\.\s*prototype\b", "constructor.prototype access"),
            (r#"\[\s*['"](?:constructor|prototype)['"]\s*\]"#, "computed prototype access"),
            (r"\bObject\.setPrototypeOf\s*\(", "prototype replacement"),
            (r"\b(?:Object|Array|String|Function|Number)\.prototype\.\w+\s*=[^=]", "built-in prototype mutation"),
        ],
    },
];

/// Families used by the keystroke-level check.
const QUICK_FAMILIES: [ViolationType; 3] = [
    ViolationType::DangerousFunction,
    ViolationType::FileAccess,
    ViolationType::XssVector,
];

const WARNING_PATTERNS: &[(WarningType, &str, &str, &str)] = &[
    (
        WarningType::PotentialInfiniteLoop,
        r"\bwhile\s*\(\s*(?:true|1)\s*\)|\bfor\s*\(\s*;\s*;\s*\)",
        "potential infinite loop",
        "bound the loop or move the work into an effect with a cleanup",
    ),
    (
        WarningType::ConsoleUsage,
        r"\bconsole\.(?:log|debug|info|trace)\s*\(",
        "console output left in component",
        "remove debug logging before sharing",
    ),
    (
        WarningType::DirectDomAccess,
        r"\bdocument\.(?:getElementById|getElementsBy\w+|querySelector(?:All)?|createElement|body)\b",
        "direct DOM manipulation bypasses the renderer",
        "use refs and state instead of touching the document",
    ),
];

struct CompiledFamily {
    kind: ViolationType,
    severity: Severity,
    patterns: Vec<(Regex, &'static str)>,
}

struct CompiledPatterns {
    families: Vec<CompiledFamily>,
    warnings: Vec<(WarningType, Regex, &'static str, &'static str)>,
    metadata_script: Regex,
    metadata_markup: Regex,
}

fn compile_patterns() -> Result<CompiledPatterns, regex::Error> {
    let mut families = Vec::with_capacity(FAMILIES.len());
    for family in FAMILIES {
        let mut patterns = Vec::with_capacity(family.patterns.len());
        for (pattern, description) in family.patterns {
            patterns.push((Regex::new(pattern)?, *description));
        }
        families.push(CompiledFamily {
            kind: family.kind,
            severity: family.severity,
            patterns,
        });
    }

    let mut warnings = Vec::with_capacity(WARNING_PATTERNS.len());
    for (kind, pattern, message, suggestion) in WARNING_PATTERNS {
        warnings.push((*kind, Regex::new(pattern)?, *message, *suggestion));
    }

    Ok(CompiledPatterns {
        families,
        warnings,
        metadata_script: RegexBuilder::new(r"<\s*script\b|javascript\s*:|\bon[a-z]+\s*=")
            .case_insensitive(true)
            .build()?,
        metadata_markup: RegexBuilder::new(r"<\s*/?\s*[a-z][a-z0-9-]*(?:\s|>|/)")
            .case_insensitive(true)
            .build()?,
    })
}

fn patterns() -> Result<&'static CompiledPatterns, String> {
    static PATTERNS: OnceLock<Result<CompiledPatterns, String>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| compile_patterns().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(Clone::clone)
}

fn snippet(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(SNIPPET_CHARS).collect();
        format!("{cut}...")
    }
}

fn score(violations: &[SecurityViolation], warning_count: usize) -> u8 {
    let penalty: u32 = violations.iter().map(|v| v.severity.penalty()).sum::<u32>()
        + warning_count as u32;
    100u32.saturating_sub(penalty) as u8
}

fn recommendations(violations: &[SecurityViolation], warnings: &[SecurityWarning]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |text: &str| {
        if !out.iter().any(|existing| existing == text) {
            out.push(text.to_string());
        }
    };

    for violation in violations {
        match violation.kind {
            ViolationType::DangerousFunction => {
                push("Replace dynamic evaluation and raw HTML injection with declarative rendering")
            }
            ViolationType::NetworkAccess => {
                push("Remove network calls; sandboxed artifacts cannot reach the network")
            }
            ViolationType::FileAccess => {
                push("Keep state in component memory instead of browser storage or navigation")
            }
            ViolationType::XssVector => push("Render text through JSX instead of embedding markup or scripts"),
            ViolationType::PrototypePollution => push("Do not modify object prototypes"),
            ViolationType::UnauthorizedDependency => {
                push("Use only whitelisted dependencies")
            }
            ViolationType::MetadataInjection => push("Strip markup from titles, descriptions and tags"),
            ViolationType::ValidationError => push("Retry validation; the artifact was rejected because the scan could not complete"),
        }
    }

    if !warnings.is_empty() {
        push("Review the advisory warnings before sharing the artifact");
    }

    out
}

/// Runs every pattern family over `code`, one violation per pattern hit.
fn scan_source(
    compiled: &CompiledPatterns,
    code: &str,
    families: Option<&[ViolationType]>,
) -> Vec<SecurityViolation> {
    let mut violations = Vec::new();

    for (index, line) in code.lines().enumerate() {
        for family in &compiled.families {
            if let Some(selected) = families {
                if !selected.contains(&family.kind) {
                    continue;
                }
            }
            for (regex, description) in &family.patterns {
                if let Some(hit) = regex.find(line) {
                    violations.push(SecurityViolation {
                        kind: family.kind,
                        severity: family.severity,
                        message: (*description).to_string(),
                        line: Some(index + 1),
                        column: Some(hit.start() + 1),
                        snippet: Some(snippet(line)),
                    });
                }
            }
        }
    }

    violations
}

pub struct ArtifactSecurityValidator {
    dependencies: Arc<DependencyManager>,
}

impl ArtifactSecurityValidator {
    pub fn new(dependencies: Arc<DependencyManager>) -> Self {
        Self { dependencies }
    }

    pub async fn validate_artifact(&self, artifact: &Artifact) -> SecurityValidationResult {
        let compiled = match patterns() {
            Ok(compiled) => compiled,
            Err(error) => {
                tracing::error!(artifact_id = %artifact.id, %error, "security patterns unavailable");
                return Self::failed_closed(format!("security scan could not run: {error}"));
            }
        };

        let mut violations = scan_source(compiled, &artifact.code, None);
        let mut warnings = scan_warnings(compiled, &artifact.code);

        violations.extend(self.check_dependencies(artifact).await);
        violations.extend(check_metadata(compiled, artifact));

        if artifact.code.len() > MAX_CODE_BYTES {
            warnings.push(SecurityWarning {
                kind: WarningType::CodeSize,
                message: format!(
                    "source is {} bytes, above the {} byte guideline",
                    artifact.code.len(),
                    MAX_CODE_BYTES
                ),
                line: None,
                suggestion: Some("split the component into smaller pieces".to_string()),
            });
        }

        if artifact.metadata.dependencies.len() > MAX_DEPENDENCIES {
            warnings.push(SecurityWarning {
                kind: WarningType::DependencyCount,
                message: format!(
                    "{} dependencies declared, above the {} guideline",
                    artifact.metadata.dependencies.len(),
                    MAX_DEPENDENCIES
                ),
                line: None,
                suggestion: Some("drop unused dependencies".to_string()),
            });
        }

        let result = SecurityValidationResult::from_findings(violations, warnings);
        tracing::debug!(
            artifact_id = %artifact.id,
            score = result.score,
            violations = result.violations.len(),
            secure = result.is_secure,
            "artifact validated"
        );
        result
    }

    /// Cheap synchronous subset for keystroke-level feedback.
    pub fn quick_security_check(&self, code: &str) -> QuickCheckResult {
        let compiled = match patterns() {
            Ok(compiled) => compiled,
            Err(error) => {
                return QuickCheckResult {
                    is_safe: false,
                    issues: vec![format!("security scan could not run: {error}")],
                }
            }
        };

        let issues: Vec<String> = scan_source(compiled, code, Some(&QUICK_FAMILIES[..]))
            .into_iter()
            .map(|v| match v.line {
                Some(line) => format!("line {line}: {}", v.message),
                None => v.message,
            })
            .collect();

        QuickCheckResult {
            is_safe: issues.is_empty(),
            issues,
        }
    }

    fn failed_closed(message: String) -> SecurityValidationResult {
        SecurityValidationResult::from_findings(
            vec![SecurityViolation {
                kind: ViolationType::ValidationError,
                severity: Severity::Critical,
                message,
                line: None,
                column: None,
                snippet: None,
            }],
            Vec::new(),
        )
    }

    async fn check_dependencies(&self, artifact: &Artifact) -> Vec<SecurityViolation> {
        let mut requested: Vec<String> = artifact.metadata.dependencies.clone();
        for imported in source::imported_packages(&artifact.code) {
            if !requested.iter().any(|dep| crate::dependencies::parse_dependency_spec(dep).0 == imported) {
                requested.push(imported);
            }
        }

        let report = self.dependencies.validate_dependency_security(&requested).await;
        report
            .issues
            .into_iter()
            .map(|issue| SecurityViolation {
                kind: ViolationType::UnauthorizedDependency,
                severity: Severity::Critical,
                message: format!("dependency '{}' rejected: {}", issue.name, issue.reason),
                line: None,
                column: None,
                snippet: None,
            })
            .collect()
    }
}

fn scan_warnings(compiled: &CompiledPatterns, code: &str) -> Vec<SecurityWarning> {
    let mut warnings = Vec::new();
    for (index, line) in code.lines().enumerate() {
        for (kind, regex, message, suggestion) in &compiled.warnings {
            if regex.is_match(line) {
                warnings.push(SecurityWarning {
                    kind: *kind,
                    message: (*message).to_string(),
                    line: Some(index + 1),
                    suggestion: Some((*suggestion).to_string()),
                });
            }
        }
    }
    warnings
}

fn check_metadata(compiled: &CompiledPatterns, artifact: &Artifact) -> Vec<SecurityViolation> {
    let mut violations = Vec::new();
    for (field, text) in artifact.metadata.text_fields() {
        if compiled.metadata_script.is_match(text) {
            violations.push(SecurityViolation {
                kind: ViolationType::MetadataInjection,
                severity: Severity::High,
                message: format!("metadata field '{field}' contains script content"),
                line: None,
                column: None,
                snippet: Some(snippet(text)),
            });
        } else if compiled.metadata_markup.is_match(text) {
            violations.push(SecurityViolation {
                kind: ViolationType::MetadataInjection,
                severity: Severity::Low,
                message: format!("metadata field '{field}' contains markup"),
                line: None,
                column: None,
                snippet: Some(snippet(text)),
            });
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartialMetadata;

    fn validator() -> ArtifactSecurityValidator {
        ArtifactSecurityValidator::new(Arc::new(DependencyManager::new("https://esm.sh")))
    }

    fn artifact(code: &str) -> Artifact {
        Artifact::draft("test", code, PartialMetadata::default())
    }

    #[test]
    fn all_patterns_compile() {
        assert!(patterns().is_ok());
    }

    #[tokio::test]
    async fn eval_is_a_critical_violation() {
        let result = validator().validate_artifact(&artifact("eval('1+1')")).await;
        assert!(!result.is_secure);
        assert!(result.score <= 75);
        let violation = &result.violations[0];
        assert_eq!(violation.kind, ViolationType::DangerousFunction);
        assert_eq!(violation.severity, Severity::Critical);
        assert_eq!(violation.line, Some(1));
        assert_eq!(violation.column, Some(1));
    }

    #[tokio::test]
    async fn markup_injection_blocks() {
        let code = "export default function A() { return <div dangerouslySetInnerHTML={{ __html: x }} />; }";
        let result = validator().validate_artifact(&artifact(code)).await;
        assert!(!result.is_secure);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == ViolationType::DangerousFunction));
    }

    #[tokio::test]
    async fn new_function_is_reported_once() {
        let result = validator()
            .validate_artifact(&artifact("const f = new Function('return 1');"))
            .await;
        let dangerous: Vec<_> = result
            .violations
            .iter()
            .filter(|v| v.kind == ViolationType::DangerousFunction)
            .collect();
        assert_eq!(dangerous.len(), 1);
    }

    #[tokio::test]
    async fn network_calls_are_advisory_severity() {
        let code = "import React from 'react';\nexport default function A() { fetch('/api'); return null; }";
        let result = validator().validate_artifact(&artifact(code)).await;
        assert!(result.is_secure);
        assert_eq!(result.count(Severity::Medium), 1);
        assert_eq!(result.score, 92);
    }

    #[tokio::test]
    async fn storage_access_blocks() {
        let result = validator()
            .validate_artifact(&artifact("const token = localStorage.getItem('t');"))
            .await;
        assert!(!result.is_secure);
        assert_eq!(result.violations[0].kind, ViolationType::FileAccess);
    }

    #[tokio::test]
    async fn prototype_pollution_blocks() {
        let result = validator()
            .validate_artifact(&artifact("obj['__proto__'].polluted = true;"))
            .await;
        assert!(!result.is_secure);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == ViolationType::PrototypePollution));
    }

    #[tokio::test]
    async fn unlisted_dependency_is_critical_regardless_of_code() {
        let mut artifact = artifact("import React from 'react';\nexport default function A() { return null; }");
        artifact.metadata.dependencies.push("left-pad".into());
        let result = validator().validate_artifact(&artifact).await;
        assert!(!result.is_secure);
        let violation = result
            .violations
            .iter()
            .find(|v| v.kind == ViolationType::UnauthorizedDependency)
            .unwrap();
        assert_eq!(violation.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn undeclared_import_is_checked_too() {
        let code = "import pad from 'left-pad';\nexport default function A() { return null; }";
        let mut artifact = artifact(code);
        artifact.metadata.dependencies = vec!["react".into()];
        let result = validator().validate_artifact(&artifact).await;
        assert!(!result.is_secure);
    }

    #[tokio::test]
    async fn metadata_markup_is_scanned() {
        let mut artifact = artifact("export default function A() { return null; }");
        artifact.metadata.title = "<script>alert(1)</script>".into();
        artifact.metadata.description = "a <b>bold</b> chart".into();
        let result = validator().validate_artifact(&artifact).await;
        let kinds: Vec<Severity> = result
            .violations
            .iter()
            .filter(|v| v.kind == ViolationType::MetadataInjection)
            .map(|v| v.severity)
            .collect();
        assert_eq!(kinds, vec![Severity::High, Severity::Low]);
        assert!(!result.is_secure);
    }

    #[tokio::test]
    async fn clean_component_scores_full_marks() {
        let code = r#"import React, { useState } from 'react';

export default function Counter() {
  const [count, setCount] = useState(0);
  return <button onClick={() => setCount(count + 1)}>{count}</button>;
}
"#;
        let result = validator().validate_artifact(&artifact(code)).await;
        assert!(result.is_secure);
        assert!(result.violations.is_empty());
        assert_eq!(result.score, 100);
        assert!(result.recommendations.is_empty());
    }

    #[tokio::test]
    async fn warnings_cost_one_point_each() {
        let code = "console.log('x');\nwhile (true) { break; }";
        let result = validator().validate_artifact(&artifact(code)).await;
        assert!(result.is_secure);
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(result.score, 98);
    }

    #[test]
    fn score_floors_at_zero() {
        let violations: Vec<SecurityViolation> = (0..10)
            .map(|_| SecurityViolation {
                kind: ViolationType::DangerousFunction,
                severity: Severity::Critical,
                message: String::new(),
                line: None,
                column: None,
                snippet: None,
            })
            .collect();
        assert_eq!(score(&violations, 3), 0);
    }

    #[test]
    fn quick_check_skips_network_family() {
        let validator = validator();
        assert!(validator.quick_security_check("fetch('/x')").is_safe);
        let result = validator.quick_security_check("eval(x)\nsessionStorage.clear()");
        assert!(!result.is_safe);
        assert_eq!(result.issues.len(), 2);
    }
}
