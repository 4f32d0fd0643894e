// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Standalone document export.
//!
//! The exported document embeds the compiled bundle and its import map but
//! none of the sandbox guards. It carries a looser CSP than the live preview
//! and is always flagged `sandboxed: false`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compiler::{CompilationOptions, ComponentCompiler};
use crate::dependencies::ImportMap;
use crate::error::AppError;
use crate::model::Artifact;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneExport {
    pub artifact_id: String,
    pub version: u32,
    pub title: String,
    pub filename: String,
    pub document: String,
    pub import_map: ImportMap,
    pub sandboxed: bool,
    pub warnings: Vec<String>,
    pub exported_at: DateTime<Utc>,
}

pub async fn export_standalone(
    compiler: &ComponentCompiler,
    artifact: &Artifact,
) -> Result<StandaloneExport, AppError> {
    let options = CompilationOptions {
        minify: true,
        ..CompilationOptions::default()
    };
    let compiled = compiler.compile_artifact(artifact, &options).await?;
    if !compiled.success {
        return Err(AppError::Compilation(compiled.errors));
    }

    let document = compiled
        .bundle
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("compiler returned no bundle")))?;

    tracing::info!(artifact_id = %artifact.id, version = artifact.version, "artifact exported");

    Ok(StandaloneExport {
        artifact_id: artifact.id.clone(),
        version: artifact.version,
        title: artifact.metadata.title.clone(),
        filename: suggested_filename(&artifact.metadata.title),
        document,
        import_map: compiled.import_map.unwrap_or_default(),
        sandboxed: false,
        warnings: compiled.warnings,
        exported_at: Utc::now(),
    })
}

/// `"My Chart!"` -> `my-chart.html`
pub fn suggested_filename(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "artifact.html".to_string()
    } else {
        format!("{slug}.html")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::DependencyManager;
    use crate::model::PartialMetadata;
    use std::sync::Arc;

    #[test]
    fn filenames() {
        assert_eq!(suggested_filename("My Chart!"), "my-chart.html");
        assert_eq!(suggested_filename("  --  "), "artifact.html");
        assert_eq!(suggested_filename("Sales: Q3 / 2024"), "sales-q3-2024.html");
    }

    #[tokio::test]
    async fn export_is_unsandboxed_and_self_contained() {
        let compiler = ComponentCompiler::new(Arc::new(DependencyManager::new("https://esm.sh")));
        let artifact = Artifact::draft(
            "e1",
            "export default function Card() { return <div>card</div>; }",
            PartialMetadata::default(),
        );
        let export = export_standalone(&compiler, &artifact).await.unwrap();

        assert!(!export.sandboxed);
        assert_eq!(export.title, "Card");
        assert_eq!(export.filename, "card.html");
        assert!(export.document.contains("<script type=\"importmap\">"));
        assert!(!export.document.contains("__artifactReport = function"));
        assert!(export.import_map.imports.contains_key("react"));
    }
}
