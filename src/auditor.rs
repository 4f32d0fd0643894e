// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! On-demand deep security audit.
//!
//! Runs the validator, then re-scans for broader threat categories, checks two
//! compliance idioms and a small known-vulnerable dependency list, and rolls
//! everything into a risk level, a compliance score and a posture label. This
//! is for audits before sharing or export, never the render path.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::dependencies::{parse_dependency_spec, DependencyManager};
use crate::model::Artifact;
use crate::validator::{ArtifactSecurityValidator, SecurityValidationResult, Severity};

const COMPLIANCE_PENALTY: i32 = 10;
const VULNERABLE_PENALTY: i32 = 15;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    CodeInjection,
    XssVector,
    PrivilegeEscalation,
    SensitiveDataAccess,
    ResourceExhaustion,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatFinding {
    pub category: ThreatCategory,
    pub severity: Severity,
    pub description: String,
    pub line: usize,
    pub evidence: String,
    pub mitigation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceCheck {
    pub id: String,
    pub name: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerableDependency {
    pub name: String,
    pub version: Option<String>,
    pub advisory: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAuditResult {
    pub artifact_id: String,
    pub audited_at: DateTime<Utc>,
    pub validation: SecurityValidationResult,
    pub threats: Vec<ThreatFinding>,
    pub compliance: Vec<ComplianceCheck>,
    pub vulnerable_dependencies: Vec<VulnerableDependency>,
    pub risk_level: RiskLevel,
    pub compliance_score: u8,
    pub security_posture: String,
    pub recommendations: Vec<String>,
}

struct ThreatRule {
    category: ThreatCategory,
    severity: Severity,
    pattern: &'static str,
    description: &'static str,
    mitigation: &'static str,
}

const THREAT_RULES: &[ThreatRule] = &[
    ThreatRule {
        category: ThreatCategory::CodeInjection,
        severity: Severity::Critical,
        pattern: r"\beval\s*\(|\bnew\s+Function\s*\(|\bset(?:Timeout|Interval)\s*\(\s*['`]",
        description: "source text evaluated at runtime",
        mitigation: "express the behaviour directly in code",
    },
    ThreatRule {
        category: ThreatCategory::CodeInjection,
        severity: Severity::High,
        pattern: r"\bimport\s*\(|\bimportScripts\s*\(|\bnew\s+Worker\s*\(",
        description: "runtime loading of additional code",
        mitigation: "declare imports statically from whitelisted packages",
    },
    ThreatRule {
        category: ThreatCategory::XssVector,
        severity: Severity::High,
        pattern: r"dangerouslySetInnerHTML|\.(?:inner|outer)HTML\s*=|\bdocument\.write|insertAdjacentHTML|(?i:javascript\s*:)",
        description: "markup injection sink",
        mitigation: "render text through JSX so it is escaped",
    },
    ThreatRule {
        category: ThreatCategory::XssVector,
        severity: Severity::Medium,
        pattern: r"\bcreateContextualFragment\s*\(|\bDOMParser\b|\bsrcdoc\b",
        description: "markup parsing from strings",
        mitigation: "build elements declaratively",
    },
    ThreatRule {
        category: ThreatCategory::PrivilegeEscalation,
        severity: Severity::High,
        pattern: r"\bwindow\.(?:parent|top|opener)\b|\bparent\.postMessage\b|\bdocument\.domain\b",
        description: "reaches outside the isolated frame",
        mitigation: "keep all interaction inside the component",
    },
    ThreatRule {
        category: ThreatCategory::PrivilegeEscalation,
        severity: Severity::Medium,
        pattern: r"\bnavigator\.(?:permissions|serviceWorker|clipboard)\b|\bNotification\.requestPermission\b",
        description: "requests browser capabilities",
        mitigation: "avoid permission-gated browser APIs",
    },
    ThreatRule {
        category: ThreatCategory::SensitiveDataAccess,
        severity: Severity::High,
        pattern: r"\bdocument\.cookie\b|\b(?:local|session)Storage\b|\bindexedDB\b|\bnavigator\.credentials\b",
        description: "reads persisted browser data",
        mitigation: "keep data in component state",
    },
    ThreatRule {
        category: ThreatCategory::SensitiveDataAccess,
        severity: Severity::Medium,
        pattern: r"\bnavigator\.(?:geolocation|mediaDevices|userAgentData)\b|\bgetUserMedia\b",
        description: "accesses device or user information",
        mitigation: "ask the user to enter data explicitly",
    },
    ThreatRule {
        category: ThreatCategory::ResourceExhaustion,
        severity: Severity::Medium,
        pattern: r"\bwhile\s*\(\s*(?:true|1)\s*\)|\bfor\s*\(\s*;\s*;\s*\)",
        description: "unbounded loop",
        mitigation: "bound iterations or yield to the event loop",
    },
    ThreatRule {
        category: ThreatCategory::ResourceExhaustion,
        severity: Severity::Medium,
        pattern: r"\bsetInterval\s*\([^,]*,\s*0\s*\)|\bnew\s+Array\s*\(\s*\d{7,}\s*\)|\.repeat\s*\(\s*\d{7,}\s*\)",
        description: "excessive allocation or busy timer",
        mitigation: "limit allocation sizes and timer frequency",
    },
];

struct KnownVulnerability {
    name: &'static str,
    /// Versions strictly below this are affected; `None` means every version.
    fixed_in: Option<&'static str>,
    advisory: &'static str,
    severity: Severity,
}

const KNOWN_VULNERABLE: &[KnownVulnerability] = &[
    KnownVulnerability { name: "lodash", fixed_in: Some("4.17.21"), advisory: "prototype pollution and command injection in template/zipObjectDeep", severity: Severity::High },
    KnownVulnerability { name: "moment", fixed_in: None, advisory: "unmaintained; ReDoS in date parsing", severity: Severity::Medium },
    KnownVulnerability { name: "jquery", fixed_in: Some("3.5.0"), advisory: "XSS through htmlPrefilter", severity: Severity::Medium },
    KnownVulnerability { name: "handlebars", fixed_in: Some("4.7.7"), advisory: "remote code execution via crafted templates", severity: Severity::Critical },
    KnownVulnerability { name: "minimist", fixed_in: Some("1.2.6"), advisory: "prototype pollution", severity: Severity::High },
    KnownVulnerability { name: "axios", fixed_in: Some("0.21.1"), advisory: "server-side request forgery", severity: Severity::High },
    KnownVulnerability { name: "marked", fixed_in: Some("4.0.10"), advisory: "ReDoS in inline parsing", severity: Severity::Medium },
];

struct ComplianceRule {
    id: &'static str,
    name: &'static str,
    pattern: &'static str,
    passed: &'static str,
    failed: &'static str,
}

const COMPLIANCE_RULES: &[ComplianceRule] = &[
    ComplianceRule {
        id: "input-validation",
        name: "Input validation",
        pattern: r"\btypeof\b|\bNumber\.is(?:NaN|Finite|Integer)\b|\bisNaN\s*\(|\.trim\s*\(|\bvalidate\w*\s*\(|\.test\s*\(|\brequired\b|\bmaxLength\b|\bmin=|\bmax=",
        passed: "user input is checked before use",
        failed: "no input validation idioms found",
    },
    ComplianceRule {
        id: "error-handling",
        name: "Error handling",
        pattern: r"\btry\s*\{|\.catch\s*\(|\bcomponentDidCatch\b|\bErrorBoundary\b|\bonError\b",
        passed: "errors are caught and handled",
        failed: "no error handling idioms found",
    },
];

struct CompiledRules {
    threats: Vec<(Regex, &'static ThreatRule)>,
    compliance: Vec<(Regex, &'static ComplianceRule)>,
}

fn compiled_rules() -> Result<&'static CompiledRules, String> {
    static RULES: OnceLock<Result<CompiledRules, String>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            let threats = THREAT_RULES
                .iter()
                .map(|rule| Regex::new(rule.pattern).map(|re| (re, rule)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            let compliance = COMPLIANCE_RULES
                .iter()
                .map(|rule| Regex::new(rule.pattern).map(|re| (re, rule)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(CompiledRules {
                threats,
                compliance,
            })
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Dotted numeric version comparison; non-numeric parts compare as zero.
fn version_lt(version: &str, bound: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches(['^', '~', 'v', '='])
            .split(['.', '-', '+'])
            .take(3)
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (mut a, mut b) = (parse(version), parse(bound));
    a.resize(3, 0);
    b.resize(3, 0);
    a < b
}

fn risk_level(counts: &SeverityCounts) -> RiskLevel {
    if counts.critical > 0 {
        RiskLevel::Critical
    } else if counts.high >= 2 {
        RiskLevel::High
    } else if counts.high == 1 || counts.medium >= 3 {
        RiskLevel::Medium
    } else if counts.medium > 0 || counts.low > 0 {
        RiskLevel::Low
    } else {
        RiskLevel::Minimal
    }
}

fn posture(score: u8, risk: RiskLevel) -> &'static str {
    match (score, risk) {
        (_, RiskLevel::Critical) => "critical",
        (90..=100, RiskLevel::Minimal | RiskLevel::Low) => "excellent",
        (75..=100, _) if risk <= RiskLevel::Medium => "good",
        (50..=100, _) => "fair",
        _ => "poor",
    }
}

#[derive(Default)]
struct SeverityCounts {
    critical: usize,
    high: usize,
    medium: usize,
    low: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }
}

pub struct ArtifactSecurityAuditor {
    validator: Arc<ArtifactSecurityValidator>,
    dependencies: Arc<DependencyManager>,
}

impl ArtifactSecurityAuditor {
    pub fn new(validator: Arc<ArtifactSecurityValidator>, dependencies: Arc<DependencyManager>) -> Self {
        Self {
            validator,
            dependencies,
        }
    }

    pub async fn perform_security_audit(&self, artifact: &Artifact) -> SecurityAuditResult {
        let validation = self.validator.validate_artifact(artifact).await;

        let (threats, compliance) = match compiled_rules() {
            Ok(rules) => (scan_threats(rules, &artifact.code), check_compliance(rules, &artifact.code)),
            Err(error) => {
                tracing::error!(artifact_id = %artifact.id, %error, "audit rules unavailable");
                (
                    vec![ThreatFinding {
                        category: ThreatCategory::CodeInjection,
                        severity: Severity::Critical,
                        description: format!("audit could not run: {error}"),
                        line: 0,
                        evidence: String::new(),
                        mitigation: "retry the audit".to_string(),
                    }],
                    Vec::new(),
                )
            }
        };

        let vulnerable_dependencies = self.check_vulnerable(&artifact.metadata.dependencies).await;

        let mut counts = SeverityCounts::default();
        for violation in &validation.violations {
            counts.add(violation.severity);
        }
        for threat in &threats {
            counts.add(threat.severity);
        }
        for vulnerable in &vulnerable_dependencies {
            counts.add(vulnerable.severity);
        }
        for check in compliance.iter().filter(|c| !c.passed) {
            counts.add(Severity::Low);
            tracing::debug!(artifact_id = %artifact.id, check = %check.id, "compliance check failed");
        }

        let failed_checks = compliance.iter().filter(|c| !c.passed).count() as i32;
        let compliance_score = (validation.score as i32
            - failed_checks * COMPLIANCE_PENALTY
            - vulnerable_dependencies.len() as i32 * VULNERABLE_PENALTY)
            .clamp(0, 100) as u8;

        let risk_level = risk_level(&counts);
        let security_posture = posture(compliance_score, risk_level).to_string();
        let recommendations = audit_recommendations(&validation, &threats, &compliance, &vulnerable_dependencies);

        tracing::info!(
            artifact_id = %artifact.id,
            risk = ?risk_level,
            compliance_score,
            threats = threats.len(),
            "security audit complete"
        );

        SecurityAuditResult {
            artifact_id: artifact.id.clone(),
            audited_at: Utc::now(),
            validation,
            threats,
            compliance,
            vulnerable_dependencies,
            risk_level,
            compliance_score,
            security_posture,
            recommendations,
        }
    }

    async fn check_vulnerable(&self, dependencies: &[String]) -> Vec<VulnerableDependency> {
        let mut found = Vec::new();
        for spec in dependencies {
            let (name, requested) = parse_dependency_spec(spec);
            let Some(known) = KNOWN_VULNERABLE.iter().find(|k| k.name == name) else {
                continue;
            };

            let version = match requested {
                Some(version) => Some(version.to_string()),
                None => self.dependencies.whitelisted_version(name).await,
            };

            let affected = match (known.fixed_in, version.as_deref()) {
                (None, _) => true,
                (Some(fixed), Some(version)) => version_lt(version, fixed),
                (Some(_), None) => true,
            };

            if affected {
                found.push(VulnerableDependency {
                    name: name.to_string(),
                    version,
                    advisory: known.advisory.to_string(),
                    severity: known.severity,
                });
            }
        }
        found
    }
}

fn scan_threats(rules: &CompiledRules, code: &str) -> Vec<ThreatFinding> {
    let mut threats = Vec::new();
    for (index, line) in code.lines().enumerate() {
        for (regex, rule) in &rules.threats {
            if let Some(hit) = regex.find(line) {
                threats.push(ThreatFinding {
                    category: rule.category,
                    severity: rule.severity,
                    description: rule.description.to_string(),
                    line: index + 1,
                    evidence: hit.as_str().to_string(),
                    mitigation: rule.mitigation.to_string(),
                });
            }
        }
    }
    threats
}

fn check_compliance(rules: &CompiledRules, code: &str) -> Vec<ComplianceCheck> {
    rules
        .compliance
        .iter()
        .map(|(regex, rule)| {
            let passed = regex.is_match(code);
            ComplianceCheck {
                id: rule.id.to_string(),
                name: rule.name.to_string(),
                passed,
                details: if passed { rule.passed } else { rule.failed }.to_string(),
            }
        })
        .collect()
}

fn audit_recommendations(
    validation: &SecurityValidationResult,
    threats: &[ThreatFinding],
    compliance: &[ComplianceCheck],
    vulnerable: &[VulnerableDependency],
) -> Vec<String> {
    let mut out = validation.recommendations.clone();
    for threat in threats {
        let text = format!("{:?}: {}", threat.category, threat.mitigation);
        if !out.contains(&text) {
            out.push(text);
        }
    }
    for check in compliance.iter().filter(|c| !c.passed) {
        out.push(format!("Add {} to the component", check.name.to_lowercase()));
    }
    for dep in vulnerable {
        out.push(format!("Replace or upgrade {} ({})", dep.name, dep.advisory));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartialMetadata;

    fn auditor() -> ArtifactSecurityAuditor {
        let deps = Arc::new(DependencyManager::new("https://esm.sh"));
        let validator = Arc::new(ArtifactSecurityValidator::new(deps.clone()));
        ArtifactSecurityAuditor::new(validator, deps)
    }

    const ROBUST: &str = r#"import React, { useState } from 'react';

export default function Form() {
  const [value, setValue] = useState('');
  const submit = () => {
    try {
      if (value.trim().length === 0) return;
    } catch (err) {
      setValue('');
    }
  };
  return <input value={value} onChange={(e) => setValue(e.target.value)} onBlur={submit} />;
}
"#;

    #[test]
    fn compares_versions_numerically() {
        assert!(version_lt("4.17.20", "4.17.21"));
        assert!(version_lt("^1.2.5", "1.2.6"));
        assert!(!version_lt("4.17.21", "4.17.21"));
        assert!(!version_lt("10.0.0", "9.9.9"));
    }

    #[test]
    fn risk_thresholds() {
        let counts = |critical, high, medium, low| SeverityCounts { critical, high, medium, low };
        assert_eq!(risk_level(&counts(1, 0, 0, 0)), RiskLevel::Critical);
        assert_eq!(risk_level(&counts(0, 2, 0, 0)), RiskLevel::High);
        assert_eq!(risk_level(&counts(0, 1, 0, 0)), RiskLevel::Medium);
        assert_eq!(risk_level(&counts(0, 0, 3, 0)), RiskLevel::Medium);
        assert_eq!(risk_level(&counts(0, 0, 0, 1)), RiskLevel::Low);
        assert_eq!(risk_level(&counts(0, 0, 0, 0)), RiskLevel::Minimal);
    }

    #[tokio::test]
    async fn clean_component_is_minimal_risk() {
        let artifact = Artifact::draft("a", ROBUST, PartialMetadata::default());
        let audit = auditor().perform_security_audit(&artifact).await;
        assert!(audit.threats.is_empty());
        assert!(audit.compliance.iter().all(|c| c.passed));
        assert_eq!(audit.risk_level, RiskLevel::Minimal);
        assert_eq!(audit.compliance_score, 100);
        assert_eq!(audit.security_posture, "excellent");
    }

    #[tokio::test]
    async fn eval_is_critical_risk() {
        let artifact = Artifact::draft("a", "eval(userInput)", PartialMetadata::default());
        let audit = auditor().perform_security_audit(&artifact).await;
        assert_eq!(audit.risk_level, RiskLevel::Critical);
        assert_eq!(audit.security_posture, "critical");
        assert!(audit
            .threats
            .iter()
            .any(|t| t.category == ThreatCategory::CodeInjection));
        // 75 from the validator, minus both failed compliance checks.
        assert_eq!(audit.compliance_score, 55);
    }

    #[tokio::test]
    async fn detects_escalation_and_exhaustion() {
        let code = "window.parent.postMessage('x', '*');\nwhile (true) {}";
        let artifact = Artifact::draft("a", code, PartialMetadata::default());
        let audit = auditor().perform_security_audit(&artifact).await;
        let categories: Vec<ThreatCategory> = audit.threats.iter().map(|t| t.category).collect();
        assert!(categories.contains(&ThreatCategory::PrivilegeEscalation));
        assert!(categories.contains(&ThreatCategory::ResourceExhaustion));
    }

    #[tokio::test]
    async fn flags_known_vulnerable_versions() {
        let mut artifact = Artifact::draft("a", ROBUST, PartialMetadata::default());
        artifact.metadata.dependencies = vec!["react".into(), "lodash@4.17.15".into(), "moment".into()];
        let audit = auditor().perform_security_audit(&artifact).await;
        let names: Vec<&str> = audit.vulnerable_dependencies.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["lodash", "moment"]);

        artifact.metadata.dependencies = vec!["lodash".into()];
        let audit = auditor().perform_security_audit(&artifact).await;
        assert!(audit.vulnerable_dependencies.is_empty());
    }
}
