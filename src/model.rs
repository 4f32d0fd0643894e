// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Data models for artifacts and their version history.
//!
//! Artifacts carry model-generated component source plus metadata. Versions are
//! immutable snapshots; the artifact record only points at the current one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source;

/// Packages every artifact may assume when it declares nothing else.
pub const BASELINE_DEPENDENCIES: [&str; 2] = ["react", "react-dom"];

pub const UNTITLED: &str = "Untitled Artifact";

/// A unit of generated component source plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub code: String,
    pub metadata: ArtifactMetadata,
    /// Current version number; `0` until the first version is written.
    pub version: u32,
    /// Version numbers present in the version-history collection.
    #[serde(default)]
    pub history: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata as it arrives from the message-parsing collaborator; any field may
/// be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub props: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub author: Option<String>,
}

impl ArtifactMetadata {
    /// Fill every missing field, inspecting the source where it can say more
    /// than a fixed default.
    pub fn normalize(partial: PartialMetadata, code: &str, now: DateTime<Utc>) -> Self {
        let title = partial
            .title
            .filter(|title| !title.trim().is_empty())
            .or_else(|| source::exported_component(code))
            .unwrap_or_else(|| UNTITLED.to_string());

        let dependencies = match partial.dependencies {
            Some(deps) if !deps.is_empty() => deps,
            _ => {
                let mut inferred = source::imported_packages(code);
                for baseline in BASELINE_DEPENDENCIES {
                    if !inferred.iter().any(|dep| dep == baseline) {
                        inferred.push(baseline.to_string());
                    }
                }
                inferred
            }
        };

        let props = match partial.props {
            Some(props) if !props.is_empty() => props,
            _ => source::infer_props(code),
        };

        Self {
            title,
            description: partial.description.unwrap_or_default(),
            props,
            dependencies,
            tags: partial.tags.unwrap_or_default(),
            author: partial.author,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overlay the provided fields of `patch`, bumping `updated_at`.
    pub fn apply(&mut self, patch: PartialMetadata, now: DateTime<Utc>) {
        if let Some(title) = patch.title.filter(|title| !title.trim().is_empty()) {
            self.title = title;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(props) = patch.props {
            self.props = props;
        }
        if let Some(dependencies) = patch.dependencies {
            self.dependencies = dependencies;
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if patch.author.is_some() {
            self.author = patch.author;
        }
        self.updated_at = now;
    }

    /// Free-text fields that may smuggle markup.
    pub fn text_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![
            ("title", self.title.as_str()),
            ("description", self.description.as_str()),
        ];
        if let Some(author) = &self.author {
            fields.push(("author", author.as_str()));
        }
        for tag in &self.tags {
            fields.push(("tags", tag.as_str()));
        }
        fields
    }
}

impl Artifact {
    /// A fresh artifact with no versions yet.
    pub fn draft(id: impl Into<String>, code: impl Into<String>, metadata: PartialMetadata) -> Self {
        let code = code.into();
        let metadata = ArtifactMetadata::normalize(metadata, &code, Utc::now());
        Self {
            id: id.into(),
            code,
            metadata,
            version: 0,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    #[default]
    User,
    Llm,
}

/// Immutable snapshot of an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactVersion {
    pub id: String,
    pub artifact_id: String,
    pub version: u32,
    pub code: String,
    pub metadata: ArtifactMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub created_by: CreatedBy,
    pub change_description: String,
    pub diff_summary: DiffSummary,
    /// SHA-256 of `code`, hex encoded.
    #[serde(default)]
    pub code_hash: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub lines_added: usize,
    pub lines_removed: usize,
    pub lines_modified: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.lines_added == 0 && self.lines_removed == 0 && self.lines_modified == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateArtifactRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub code: String,
    #[serde(default)]
    pub metadata: PartialMetadata,
    #[serde(default, rename = "createdBy")]
    pub created_by: CreatedBy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateArtifactRequest {
    pub code: String,
    #[serde(default)]
    pub metadata: Option<PartialMetadata>,
    #[serde(default)]
    pub change_description: Option<String>,
    #[serde(default)]
    pub created_by: CreatedBy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub version: u32,
    #[serde(default)]
    pub created_by: CreatedBy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompareQuery {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub code: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: PartialMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuickCheckRequest {
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebugRequest {
    pub code: String,
    #[serde(default)]
    pub metadata: PartialMetadata,
}
