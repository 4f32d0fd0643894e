// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Lightweight inspection of component source text.
//!
//! Used to derive metadata (title, props, dependencies) from generated code and
//! to find the import specifiers the compiler must resolve.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"import\s+(?:type\s+)?(?:[\w*\s{},$]*?\s+from\s+)?['"]([^'"]+)['"]"#)
            .expect("import pattern is valid")
    })
}

fn default_export_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"export\s+default\s+(?:(?:async\s+)?function\s*\*?\s*|class\s+)?([A-Z][A-Za-z0-9_$]*)",
        )
        .expect("default export pattern is valid")
    })
}

fn named_export_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"export\s+(?:(?:async\s+)?function|const|let|class)\s+([A-Z][A-Za-z0-9_$]*)")
            .expect("named export pattern is valid")
    })
}

/// Every module specifier imported by the source, in order of appearance.
pub fn import_specifiers(code: &str) -> Vec<String> {
    import_regex()
        .captures_iter(code)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Whether the specifier points at a local file rather than a package.
pub fn is_relative_specifier(specifier: &str) -> bool {
    specifier.starts_with('.') || specifier.starts_with('/')
}

/// Package name of a bare specifier: `react-dom/client` is `react-dom`,
/// `@headlessui/react/dist` is `@headlessui/react`.
pub fn package_name(specifier: &str) -> String {
    let mut parts = specifier.split('/');
    match (specifier.starts_with('@'), parts.next(), parts.next()) {
        (true, Some(scope), Some(name)) => format!("{scope}/{name}"),
        (_, Some(first), _) => first.to_string(),
        _ => specifier.to_string(),
    }
}

/// Distinct packages imported by the source, in order of first appearance.
pub fn imported_packages(code: &str) -> Vec<String> {
    let mut packages: Vec<String> = Vec::new();
    for specifier in import_specifiers(code) {
        if is_relative_specifier(&specifier) {
            continue;
        }
        let name = package_name(&specifier);
        if !packages.contains(&name) {
            packages.push(name);
        }
    }
    packages
}

/// Name of the component the source exports, preferring the default export.
pub fn exported_component(code: &str) -> Option<String> {
    if let Some(caps) = default_export_regex().captures(code) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }

    named_export_regex()
        .captures_iter(code)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .last()
}

pub fn has_default_export(code: &str) -> bool {
    code.contains("export default")
}

/// Props destructured in the exported component's parameter list, with a
/// type guessed from the default value when one is present.
pub fn infer_props(code: &str) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    let Some(component) = exported_component(code) else {
        return props;
    };

    let pattern = format!(
        r"(?:function\s+{name}\s*|(?:const|let)\s+{name}\s*(?::[^=]+)?=\s*(?:React\.memo\()?)\(\s*\{{([^}}]*)\}}",
        name = regex::escape(&component)
    );
    let Ok(re) = Regex::new(&pattern) else {
        return props;
    };
    let Some(params) = re.captures(code).and_then(|caps| caps.get(1)) else {
        return props;
    };

    for entry in params.as_str().split(',') {
        let entry = entry.trim();
        if entry.is_empty() || entry.starts_with("...") {
            continue;
        }
        let (name, default) = match entry.split_once('=') {
            Some((name, default)) => (name.trim(), Some(default.trim())),
            None => (entry, None),
        };
        let name = name.split(':').next().unwrap_or(name).trim();
        if name.is_empty() {
            continue;
        }
        props.insert(name.to_string(), guess_type(default).to_string());
    }

    props
}

fn guess_type(default: Option<&str>) -> &'static str {
    let Some(value) = default else {
        return "any";
    };

    match value.chars().next() {
        Some('\'') | Some('"') | Some('`') => "string",
        Some('[') => "array",
        Some('{') => "object",
        Some(c) if c.is_ascii_digit() || c == '-' => "number",
        _ if value == "true" || value == "false" => "boolean",
        _ if value.starts_with("()") || value.contains("=>") => "function",
        _ => "any",
    }
}
