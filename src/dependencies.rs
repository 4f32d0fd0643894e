// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Whitelist-based dependency resolution.
//!
//! Artifacts may only import packages from a fixed whitelist. Requests are
//! resolved best-effort over the whole list: misses land in `failed`, hits are
//! expanded with their transitive dependencies and de-duplicated by
//! `name@version`. Resolved entries are cached process-wide.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::join_all;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Library,
    Component,
    Icons,
    Utility,
}

/// Trusted description of one whitelist entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyInfo {
    pub name: String,
    pub version: String,
    pub url: String,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl DependencyInfo {
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Module URL without query parameters, usable as an import-map prefix.
    pub fn base_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ResolutionResult {
    pub resolved: Vec<DependencyInfo>,
    pub failed: Vec<String>,
    pub warnings: Vec<String>,
}

/// Mapping consumed by `<script type="importmap">`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportMap {
    pub imports: BTreeMap<String, String>,
}

impl ImportMap {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{\"imports\":{}}".to_string())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencyIssue {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencySecurityReport {
    pub is_secure: bool,
    pub issues: Vec<DependencyIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloadOutcome {
    pub key: String,
    pub url: String,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runtime-capability modules that never belong in a presentation artifact.
const SENSITIVE_MODULES: &[&str] = &[
    "fs",
    "fs/promises",
    "child_process",
    "process",
    "os",
    "vm",
    "v8",
    "cluster",
    "worker_threads",
    "net",
    "http",
    "https",
    "http2",
    "dgram",
    "dns",
    "tls",
    "electron",
    "node-fetch",
    "axios",
    "ws",
    "socket.io-client",
];

struct WhitelistEntry {
    name: &'static str,
    version: &'static str,
    dep_type: DependencyType,
    dependencies: &'static [&'static str],
}

const WHITELIST: &[WhitelistEntry] = &[
    WhitelistEntry { name: "react", version: "18.2.0", dep_type: DependencyType::Library, dependencies: &[] },
    WhitelistEntry { name: "react-dom", version: "18.2.0", dep_type: DependencyType::Library, dependencies: &["react"] },
    WhitelistEntry { name: "lucide-react", version: "0.263.1", dep_type: DependencyType::Icons, dependencies: &["react"] },
    WhitelistEntry { name: "recharts", version: "2.8.0", dep_type: DependencyType::Component, dependencies: &["react", "react-dom"] },
    WhitelistEntry { name: "framer-motion", version: "10.16.4", dep_type: DependencyType::Component, dependencies: &["react", "react-dom"] },
    WhitelistEntry { name: "@headlessui/react", version: "1.7.17", dep_type: DependencyType::Component, dependencies: &["react", "react-dom"] },
    WhitelistEntry { name: "d3", version: "7.8.5", dep_type: DependencyType::Library, dependencies: &[] },
    WhitelistEntry { name: "three", version: "0.157.0", dep_type: DependencyType::Library, dependencies: &[] },
    WhitelistEntry { name: "chart.js", version: "4.4.0", dep_type: DependencyType::Library, dependencies: &[] },
    WhitelistEntry { name: "lodash", version: "4.17.21", dep_type: DependencyType::Utility, dependencies: &[] },
    WhitelistEntry { name: "date-fns", version: "2.30.0", dep_type: DependencyType::Utility, dependencies: &[] },
    WhitelistEntry { name: "clsx", version: "2.0.0", dep_type: DependencyType::Utility, dependencies: &[] },
    WhitelistEntry { name: "mathjs", version: "11.11.0", dep_type: DependencyType::Utility, dependencies: &[] },
    WhitelistEntry { name: "papaparse", version: "5.4.1", dep_type: DependencyType::Utility, dependencies: &[] },
    WhitelistEntry { name: "uuid", version: "9.0.1", dep_type: DependencyType::Utility, dependencies: &[] },
];

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Za-z.+\-]{1,32}$").expect("version pattern is valid"))
}

/// Split `name@version` (scoped names keep their leading `@`).
pub fn parse_dependency_spec(spec: &str) -> (&str, Option<&str>) {
    let spec = spec.trim();
    match spec.rfind('@') {
        Some(idx) if idx > 0 => {
            let version = &spec[idx + 1..];
            (&spec[..idx], (!version.is_empty()).then_some(version))
        }
        _ => (spec, None),
    }
}

fn module_url(cdn_base: &str, name: &str, version: &str, dependencies: &[String]) -> String {
    let base = format!("{}/{}@{}", cdn_base.trim_end_matches('/'), name, version);
    if dependencies.is_empty() {
        base
    } else {
        format!("{base}?external={}", dependencies.join(","))
    }
}

/// Fetches module source for preloading.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AppError>;
}

/// HTTP fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpModuleFetcher {
    client: Client,
}

impl HttpModuleFetcher {
    pub fn try_new(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(anyhow!("Failed to build module fetcher: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ModuleFetcher for HttpModuleFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, AppError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Dependency(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Dependency(format!("{url} returned status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Dependency(format!("failed to read {url}: {e}")))?;

        Ok(body.to_vec())
    }
}

pub struct DependencyManager {
    cdn_base: String,
    whitelist: RwLock<HashMap<String, DependencyInfo>>,
    cache: RwLock<HashMap<String, DependencyInfo>>,
    fetcher: Option<Arc<dyn ModuleFetcher>>,
}

impl DependencyManager {
    pub fn new(cdn_base: impl Into<String>) -> Self {
        let cdn_base = cdn_base.into().trim_end_matches('/').to_string();
        let whitelist = WHITELIST
            .iter()
            .map(|entry| {
                let dependencies: Vec<String> =
                    entry.dependencies.iter().map(|dep| dep.to_string()).collect();
                let info = DependencyInfo {
                    name: entry.name.to_string(),
                    version: entry.version.to_string(),
                    url: module_url(&cdn_base, entry.name, entry.version, &dependencies),
                    dep_type: entry.dep_type,
                    dependencies,
                };
                (info.name.clone(), info)
            })
            .collect();

        Self {
            cdn_base,
            whitelist: RwLock::new(whitelist),
            cache: RwLock::new(HashMap::new()),
            fetcher: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ModuleFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn cdn_base(&self) -> &str {
        &self.cdn_base
    }

    pub async fn is_whitelisted(&self, name: &str) -> bool {
        let (name, _) = parse_dependency_spec(name);
        self.whitelist.read().await.contains_key(name)
    }

    pub async fn whitelist(&self) -> Vec<DependencyInfo> {
        let mut entries: Vec<DependencyInfo> =
            self.whitelist.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn whitelisted_version(&self, name: &str) -> Option<String> {
        self.whitelist
            .read()
            .await
            .get(name)
            .map(|info| info.version.clone())
    }

    /// Resolve every requested name; misses are collected, never fatal.
    pub async fn resolve_dependencies(&self, names: &[String]) -> ResolutionResult {
        let whitelist = self.whitelist.read().await;
        let mut result = ResolutionResult::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut fresh: Vec<DependencyInfo> = Vec::new();

        {
            let cache = self.cache.read().await;
            for spec in names {
                let (name, version) = parse_dependency_spec(spec);
                if name.is_empty() {
                    continue;
                }

                let Some(entry) = whitelist.get(name) else {
                    tracing::debug!(dependency = %spec, "dependency not whitelisted");
                    if !result.failed.iter().any(|failed| failed == spec) {
                        result.failed.push(spec.clone());
                    }
                    continue;
                };

                if let Some(version) = version {
                    if !version_regex().is_match(version) {
                        result.failed.push(spec.clone());
                        result
                            .warnings
                            .push(format!("{name}: invalid version string '{version}'"));
                        continue;
                    }
                    if version != entry.version {
                        result.warnings.push(format!(
                            "{name}: using requested version {version} instead of whitelisted {}",
                            entry.version
                        ));
                    }
                }

                self.expand(
                    &whitelist,
                    &cache,
                    entry,
                    version,
                    &mut seen,
                    &mut result,
                    &mut fresh,
                );
            }
        }

        if !fresh.is_empty() {
            let mut cache = self.cache.write().await;
            for info in fresh {
                cache.insert(info.key(), info);
            }
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn expand(
        &self,
        whitelist: &HashMap<String, DependencyInfo>,
        cache: &HashMap<String, DependencyInfo>,
        entry: &DependencyInfo,
        version: Option<&str>,
        seen: &mut HashSet<String>,
        result: &mut ResolutionResult,
        fresh: &mut Vec<DependencyInfo>,
    ) {
        let version = version.unwrap_or(&entry.version);
        let key = format!("{}@{}", entry.name, version);
        if !seen.insert(key.clone()) {
            return;
        }

        let info = match cache.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                let mut info = entry.clone();
                if version != entry.version {
                    info.version = version.to_string();
                    info.url = module_url(&self.cdn_base, &info.name, version, &info.dependencies);
                }
                fresh.push(info.clone());
                info
            }
        };

        let transitive = info.dependencies.clone();
        result.resolved.push(info);

        for dep in transitive {
            match whitelist.get(&dep) {
                Some(dep_entry) => {
                    // A package already pulled in at any version satisfies it.
                    let already = result.resolved.iter().any(|r| r.name == dep);
                    if !already {
                        self.expand(whitelist, cache, dep_entry, None, seen, result, fresh);
                    }
                }
                None => result
                    .warnings
                    .push(format!("{}: transitive dependency {dep} is not whitelisted", entry.name)),
            }
        }
    }

    /// `name -> url` plus a `name/` prefix entry for subpath imports.
    pub fn generate_import_map(&self, resolved: &[DependencyInfo]) -> ImportMap {
        let mut imports = BTreeMap::new();
        for info in resolved {
            imports.insert(info.name.clone(), info.url.clone());
            imports.insert(format!("{}/", info.name), format!("{}/", info.base_url()));
        }
        ImportMap { imports }
    }

    /// Flags sensitive runtime capabilities even when nominally whitelisted.
    pub async fn validate_dependency_security(&self, names: &[String]) -> DependencySecurityReport {
        let whitelist = self.whitelist.read().await;
        let mut issues = Vec::new();

        for spec in names {
            let (name, _) = parse_dependency_spec(spec);
            let bare = name.strip_prefix("node:").unwrap_or(name);

            if SENSITIVE_MODULES.contains(&bare) {
                issues.push(DependencyIssue {
                    name: spec.clone(),
                    reason: format!("{bare} exposes filesystem, process or network capabilities"),
                });
            } else if !whitelist.contains_key(name) {
                issues.push(DependencyIssue {
                    name: spec.clone(),
                    reason: "not in the dependency whitelist".to_string(),
                });
            }
        }

        DependencySecurityReport {
            is_secure: issues.is_empty(),
            issues,
        }
    }

    /// Administrative whitelist extension for tests and development.
    pub async fn add_custom_dependency(&self, mut info: DependencyInfo) {
        if info.url.is_empty() {
            info.url = module_url(&self.cdn_base, &info.name, &info.version, &info.dependencies);
        }
        tracing::warn!(dependency = %info.key(), "adding custom dependency to whitelist");
        self.whitelist.write().await.insert(info.name.clone(), info);
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Fetch each resolved module and fingerprint it. Failures are reported per
    /// module and never abort the batch.
    pub async fn preload(&self, resolved: &[DependencyInfo]) -> Result<Vec<PreloadOutcome>, AppError> {
        let fetcher = self
            .fetcher
            .clone()
            .ok_or_else(|| AppError::Internal(anyhow!("no module fetcher configured")))?;

        let fetches = resolved.iter().map(|info| {
            let fetcher = fetcher.clone();
            async move {
                match fetcher.fetch(&info.url).await {
                    Ok(body) => PreloadOutcome {
                        key: info.key(),
                        url: info.url.clone(),
                        bytes: body.len(),
                        sha256: Some(hex::encode(Sha256::digest(&body))),
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!(dependency = %info.key(), error = %error, "preload failed");
                        PreloadOutcome {
                            key: info.key(),
                            url: info.url.clone(),
                            bytes: 0,
                            sha256: None,
                            error: Some(error.to_string()),
                        }
                    }
                }
            }
        });

        Ok(join_all(fetches).await)
    }
}
