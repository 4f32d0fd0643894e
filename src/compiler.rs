// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Turns validated component source into a runnable document.
//!
//! The compiler is a correctness gate, not a security gate: it checks that the
//! source declares something renderable and exports a component, strips type
//! annotations, rewrites JSX into `React.createElement` calls, and wraps the
//! result in a document with an import map, a content-security policy and an
//! error boundary that reports to the parent context.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dependencies::{DependencyManager, ImportMap};
use crate::error::AppError;
use crate::jsx;
use crate::model::{Artifact, BASELINE_DEPENDENCIES};
use crate::source;
use crate::validator::MAX_CODE_BYTES;

/// Identifier bound to the default export when it has no name of its own.
const DEFAULT_COMPONENT: &str = "__ArtifactComponent";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompilationOptions {
    pub minify: bool,
    pub source_maps: bool,
    pub error_boundary: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            minify: false,
            source_maps: false,
            error_boundary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Standalone document: import map, policy, error boundary and module.
    pub bundle: Option<String>,
    /// Transformed module code, before it is placed in a document.
    pub module: Option<String>,
    pub import_map: Option<ImportMap>,
    pub source_map: Option<String>,
    pub component_name: Option<String>,
    pub compilation_time_ms: f64,
}

impl CompilationResult {
    fn failed(errors: Vec<String>, warnings: Vec<String>, started: Instant) -> Self {
        Self {
            success: false,
            errors,
            warnings,
            bundle: None,
            module: None,
            import_map: None,
            source_map: None,
            component_name: None,
            compilation_time_ms: elapsed_ms(started),
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Ordered CSP directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSecurityPolicy {
    directives: Vec<(&'static str, Vec<String>)>,
}

impl ContentSecurityPolicy {
    /// Policy embedded in the standalone bundle.
    pub fn for_bundle(origins: &[String]) -> Self {
        let with = |base: &[&str]| -> Vec<String> {
            base.iter()
                .map(|s| s.to_string())
                .chain(origins.iter().cloned())
                .collect()
        };
        Self {
            directives: vec![
                ("default-src", vec!["'self'".into()]),
                ("script-src", with(&["'self'", "'unsafe-inline'"])),
                ("style-src", with(&["'self'", "'unsafe-inline'"])),
                ("img-src", vec!["'self'".into(), "data:".into(), "blob:".into(), "https:".into()]),
                ("font-src", with(&["'self'", "data:"])),
                ("connect-src", with(&["'self'"])),
                ("object-src", vec!["'none'".into()]),
                ("base-uri", vec!["'none'".into()]),
            ],
        }
    }

    /// Policy for the isolated preview: no network, no nested framing.
    pub fn sandboxed(origins: &[String]) -> Self {
        let with = |base: &[&str]| -> Vec<String> {
            base.iter()
                .map(|s| s.to_string())
                .chain(origins.iter().cloned())
                .collect()
        };
        let none = || vec!["'none'".to_string()];
        Self {
            directives: vec![
                ("default-src", none()),
                ("script-src", with(&["'self'", "'unsafe-inline'"])),
                ("style-src", with(&["'self'", "'unsafe-inline'"])),
                ("img-src", vec!["data:".into(), "blob:".into()]),
                ("font-src", with(&["data:"])),
                ("connect-src", none()),
                ("frame-src", none()),
                ("child-src", none()),
                ("worker-src", none()),
                ("object-src", none()),
                ("base-uri", none()),
                ("form-action", none()),
            ],
        }
    }

    pub fn directive(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(directive, _)| *directive == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn render(&self) -> String {
        self.directives
            .iter()
            .map(|(name, values)| format!("{} {}", name, values.join(" ")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// `https://esm.sh/react@18` -> `https://esm.sh`
pub fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    (!host.is_empty()).then(|| format!("{scheme}://{host}"))
}

/// Pieces assembled into an HTML document.
pub struct DocumentParts<'a> {
    pub title: &'a str,
    pub csp: &'a ContentSecurityPolicy,
    pub import_map: &'a ImportMap,
    /// Classic scripts run before the module, e.g. sandbox guards.
    pub head_scripts: &'a [String],
    pub module: &'a str,
}

pub fn render_document(parts: &DocumentParts<'_>) -> String {
    let mut head_scripts = String::new();
    for script in parts.head_scripts {
        head_scripts.push_str("    <script>\n");
        head_scripts.push_str(&escape_script(script));
        head_scripts.push_str("\n    </script>\n");
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta http-equiv="Content-Security-Policy" content="{csp}" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>{title}</title>
    <style>
      html, body {{ margin: 0; padding: 0; font-family: system-ui, sans-serif; }}
      #root {{ min-height: 100vh; }}
    </style>
{head_scripts}    <script type="importmap">
{import_map}
    </script>
  </head>
  <body>
    <div id="root"></div>
    <script type="module">
{module}
    </script>
  </body>
</html>
"#,
        csp = escape_html(&parts.csp.render()),
        title = escape_html(parts.title),
        head_scripts = head_scripts,
        import_map = escape_script(&parts.import_map.to_json()),
        module = escape_script(parts.module),
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Keep embedded code from closing its own `<script>` element.
fn escape_script(code: &str) -> String {
    code.replace("</script", "<\\/script")
        .replace("</SCRIPT", "<\\/SCRIPT")
        .replace("<!--", "<\\!--")
}

struct Rewrites {
    render_capability: Regex,
    export: Regex,
    import_type: Regex,
    interface_start: Regex,
    type_alias_start: Regex,
    hook_generic: Regex,
    function_generic: Regex,
    variable_annotation: Regex,
    return_annotation: Regex,
    as_cast: Regex,
    non_null: Regex,
    default_export_named: Regex,
    default_export: Regex,
    named_export: Regex,
    export_list: Regex,
    react_default_import: Regex,
    network: Regex,
    enum_decl: Regex,
}

fn rewrites() -> Result<&'static Rewrites, String> {
    static REWRITES: OnceLock<Result<Rewrites, String>> = OnceLock::new();
    REWRITES
        .get_or_init(|| build_rewrites().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(Clone::clone)
}

fn build_rewrites() -> Result<Rewrites, regex::Error> {
    Ok(Rewrites {
        render_capability: Regex::new(r#"\bfrom\s+['"]react['"]|\bReact\b|<[A-Za-z][\w.]*[\s/>]|<>"#)?,
        export: Regex::new(r"\bexport\s+(?:default\b|(?:async\s+)?function\b|const\s|let\s|class\s)")?,
        import_type: Regex::new(r"(?m)^[ \t]*import\s+type\s[^;\n]*;?[ \t]*$")?,
        interface_start: Regex::new(r"(?m)^[ \t]*(?:export\s+)?interface\s+[A-Za-z_$][\w$]*[^{\n]*\{")?,
        type_alias_start: Regex::new(r"(?m)^[ \t]*(?:export\s+)?type\s+[A-Za-z_$][\w$]*(?:<[^>\n]*>)?\s*=")?,
        hook_generic: Regex::new(
            r"\b(use[A-Z]\w*|createContext|forwardRef|memo)\s*<[^<>()]*(?:<[^<>()]*>[^<>()]*)?>\s*\(",
        )?,
        function_generic: Regex::new(r"(function\s+[A-Za-z_$][\w$]*)\s*<[^<>()]*>")?,
        variable_annotation: Regex::new(r"((?:const|let|var)\s+[A-Za-z_$][\w$]*)\s*:\s*[^=;\n]+=")?,
        return_annotation: Regex::new(r"\)\s*:\s*[A-Za-z_$][\w$.]*(?:<[^>{}\n]*>)?(?:\[\])*(?:\s*\|\s*[A-Za-z_$][\w$.]*(?:\[\])*)*\s*(\{|=>)")?,
        as_cast: Regex::new(
            r"([\w$)\]])\s+as\s+(?:const|string|number|boolean|any|unknown|[A-Z][\w$.]*(?:<[^>\n]*>)?(?:\[\])?)(\s*[,;)\]}])",
        )?,
        non_null: Regex::new(r"([\w$)\]])!\.")?,
        default_export_named: Regex::new(
            r"export\s+default\s+((?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)|class\s+([A-Za-z_$][\w$]*))",
        )?,
        default_export: Regex::new(r"export\s+default\s+")?,
        named_export: Regex::new(r"\bexport\s+((?:async\s+)?function|const|let|var|class)\b")?,
        export_list: Regex::new(r"(?m)^[ \t]*export\s*\{[^}]*\}\s*(?:from\s+['][^']*['])?;?[ \t]*$")?,
        react_default_import: Regex::new(r#"import\s+(?:React\b|\*\s+as\s+React\b)"#)?,
        network: Regex::new(r"\bfetch\s*\(|\bXMLHttpRequest\b|\bnew\s+WebSocket\s*\(|\bnew\s+EventSource\s*\(|\baxios\b")?,
        enum_decl: Regex::new(r"(?m)^[ \t]*(?:export\s+)?(?:const\s+)?enum\s+[A-Za-z_$]")?,
    })
}

/// Index just past the `}` closing the `{` at `open`.
fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, c) in chars[open..].iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn remove_interfaces(code: &str, re: &Regex) -> String {
    let mut out = code.to_string();
    while let Some(found) = re.find(&out) {
        let chars: Vec<char> = out.chars().collect();
        let start = out[..found.start()].chars().count();
        let open = out[..found.end()].chars().count() - 1;
        let end = matching_brace(&chars, open).unwrap_or(chars.len());
        let mut rebuilt: String = chars[..start].iter().collect();
        rebuilt.extend(&chars[end..]);
        out = rebuilt;
    }
    out
}

fn remove_type_aliases(code: &str, re: &Regex) -> String {
    let mut out = code.to_string();
    while let Some(found) = re.find(&out) {
        let start = found.start();
        let mut depth = 0i32;
        let mut end = out.len();
        let mut seen_body = false;
        let rest = &out[found.end()..];
        let mut iter = rest.char_indices().peekable();
        while let Some((idx, c)) = iter.next() {
            match c {
                '{' | '(' | '[' | '<' => depth += 1,
                '}' | ')' | ']' | '>' => depth -= 1,
                ';' if depth <= 0 => {
                    end = found.end() + idx + 1;
                    break;
                }
                '\n' if depth <= 0 && seen_body => {
                    let next = rest[idx + 1..].trim_start();
                    if !next.starts_with('|') && !next.starts_with('&') {
                        end = found.end() + idx;
                        break;
                    }
                }
                _ => {}
            }
            if !c.is_whitespace() {
                seen_body = true;
            }
        }
        out.replace_range(start..end, "");
    }
    out
}

/// Remove `: Type` from each parameter of a parameter list. Default values
/// are copied through untouched, so a ternary in a default keeps its `:`.
fn strip_param_types(params: &str) -> String {
    let mut out = String::with_capacity(params.len());
    let mut depth = 0i32;
    let mut skipping = false;
    let mut in_default = false;
    let chars: Vec<char> = params.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' if !skipping => {
                let quote = c;
                out.push(c);
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
                if i < chars.len() {
                    out.push(chars[i]);
                }
                i += 1;
                continue;
            }
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            // In a default value these are comparisons, not type brackets.
            '<' if !in_default => depth += 1,
            // `=>` inside a function type is not a closing bracket.
            '>' if !in_default && !(i > 0 && chars[i - 1] == '=') => depth -= 1,
            _ => {}
        }

        if skipping {
            if depth <= 0 && (c == ',' || c == '=') && !(c == '=' && chars.get(i + 1) == Some(&'>')) {
                skipping = false;
                in_default = c == '=';
                depth = 0;
                if in_default && chars[i - 1].is_whitespace() {
                    out.push(' ');
                }
                out.push(c);
            }
            i += 1;
            continue;
        }

        if depth == 0 {
            match c {
                ',' => in_default = false,
                '=' if !in_default && chars.get(i + 1) != Some(&'>') => in_default = true,
                ':' if !in_default => {
                    if out.ends_with('?') {
                        out.pop();
                    }
                    skipping = true;
                    i += 1;
                    continue;
                }
                '?' if !in_default && chars.get(i + 1) == Some(&':') => {
                    i += 1;
                    continue;
                }
                _ => {}
            }
        }

        out.push(c);
        i += 1;
    }
    out.trim_end().to_string() + if params.ends_with(char::is_whitespace) { " " } else { "" }
}

fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                let quote = chars[i];
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn is_param_list(chars: &[char], open: usize, close: usize) -> bool {
    let before: String = chars[..open].iter().collect();
    let before = before.trim_end();
    let declared = before
        .rsplit(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .nth(1)
        .is_some_and(|word| word == "function")
        || before.ends_with("function");
    if declared {
        return true;
    }

    let after: String = chars[close + 1..].iter().take(120).collect();
    let after = after.trim_start();
    if after.starts_with("=>") {
        return true;
    }
    // `(a: number): string =>`
    after.starts_with(':')
        && after
            .find("=>")
            .is_some_and(|arrow| !after[..arrow].contains(['{', ';', '\n']))
}

fn strip_parameter_annotations(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let quote = c;
                out.push(c);
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                    }
                    out.push(chars[i]);
                    i += 1;
                }
                if i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '(' => match matching_paren(&chars, i) {
                Some(close) if is_param_list(&chars, i, close) => {
                    let inner: String = chars[i + 1..close].iter().collect();
                    out.push('(');
                    out.push_str(&strip_param_types(&inner));
                    out.push(')');
                    i = close + 1;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

const MASK_OPEN: char = '\u{E000}';
const MASK_CLOSE: char = '\u{E001}';

/// Swap string literals, template literals and comments for numbered
/// placeholders. `None` when the source already uses the placeholder chars.
fn mask_literals(code: &str) -> Option<(String, Vec<String>)> {
    if code.contains([MASK_OPEN, MASK_CLOSE]) {
        return None;
    }
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut spans: Vec<String> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let end = match chars[i] {
            '\'' | '"' => jsx::skip_string(&chars, i),
            '`' => jsx::skip_template(&chars, i),
            '/' if chars.get(i + 1) == Some(&'/') => jsx::skip_line_comment(&chars, i),
            '/' if chars.get(i + 1) == Some(&'*') => jsx::skip_block_comment(&chars, i),
            c => {
                out.push(c);
                i += 1;
                continue;
            }
        };
        out.push(MASK_OPEN);
        out.push_str(&spans.len().to_string());
        out.push(MASK_CLOSE);
        spans.push(chars[i..end].iter().collect());
        i = end;
    }
    Some((out, spans))
}

fn unmask_literals(code: &str, spans: &[String]) -> String {
    let mut out = String::with_capacity(code.len());
    let mut rest = code;
    while let Some(open) = rest.find(MASK_OPEN) {
        out.push_str(&rest[..open]);
        let after = &rest[open + MASK_OPEN.len_utf8()..];
        let Some(close) = after.find(MASK_CLOSE) else {
            out.push_str(&rest[open..]);
            return out;
        };
        match after[..close].parse::<usize>().ok().and_then(|n| spans.get(n)) {
            Some(span) => out.push_str(span),
            None => out.push_str(&rest[open..open + MASK_OPEN.len_utf8() + close + MASK_CLOSE.len_utf8()]),
        }
        rest = &after[close + MASK_CLOSE.len_utf8()..];
    }
    out.push_str(rest);
    out
}

/// Run `rewrite` over code only; literals and comments come back verbatim.
fn outside_literals(code: &str, rewrite: impl FnOnce(&str) -> String) -> String {
    match mask_literals(code) {
        Some((masked, spans)) => unmask_literals(&rewrite(&masked), &spans),
        None => rewrite(code),
    }
}

/// Remove statement-level type syntax: type-only imports, interfaces and
/// type aliases.
pub fn strip_type_declarations(code: &str) -> String {
    let Ok(rw) = rewrites() else {
        return code.to_string();
    };
    outside_literals(code, |code| {
        let code = rw.import_type.replace_all(code, "");
        let code = remove_interfaces(&code, &rw.interface_start);
        remove_type_aliases(&code, &rw.type_alias_start)
    })
}

/// Remove annotations inside expressions: generics, parameter and return
/// types, `as` casts and non-null assertions.
pub fn strip_inline_annotations(code: &str) -> String {
    let Ok(rw) = rewrites() else {
        return code.to_string();
    };
    outside_literals(code, |code| {
        let code = rw.hook_generic.replace_all(code, "$1(");
        let code = rw.function_generic.replace_all(&code, "$1");
        let code = rw.variable_annotation.replace_all(&code, "$1 =");
        let code = strip_parameter_annotations(&code);
        let code = rw.return_annotation.replace_all(&code, ") $1");
        let code = rw.as_cast.replace_all(&code, "$1$2");
        let code = rw.non_null.replace_all(&code, "$1.");
        code.into_owned()
    })
}

/// Remove TypeScript-only syntax, leaving plain JavaScript with JSX.
pub fn strip_type_annotations(code: &str) -> String {
    strip_inline_annotations(&strip_type_declarations(code))
}

const ERROR_BOUNDARY: &str = r#"class __ArtifactErrorBoundary extends React.Component {
  constructor(props) {
    super(props);
    this.state = { error: null };
  }
  static getDerivedStateFromError(error) {
    return { error };
  }
  componentDidCatch(error, info) {
    const report = window.__artifactReport || ((kind, data) => window.parent.postMessage({ source: 'artifact-sandbox', event: { kind, ...data } }, '*'));
    report('error', {
      type: 'render',
      message: String((error && error.message) || error),
      stack: error && error.stack ? String(error.stack) + (info && info.componentStack ? info.componentStack : '') : undefined,
    });
  }
  render() {
    if (this.state.error) {
      return React.createElement('pre', { style: { color: '#b91c1c', padding: '12px', whiteSpace: 'pre-wrap' } },
        'Component error: ' + String(this.state.error.message || this.state.error));
    }
    return this.props.children;
  }
}"#;

fn mount_code(component: &str, error_boundary: bool) -> String {
    let boundary = if error_boundary {
        ERROR_BOUNDARY.to_string()
    } else {
        "const __ArtifactErrorBoundary = React.Fragment;".to_string()
    };
    format!(
        r#"
{boundary}

const __artifactStart = performance.now();
const __artifactRoot = __createRoot(document.getElementById('root'));
__artifactRoot.render(
  React.createElement(__ArtifactErrorBoundary, null,
    React.createElement({component}, window.__ARTIFACT_PROPS__ || {{}}))
);
requestAnimationFrame(() => {{
  if (window.__artifactReport) {{
    window.__artifactReport('ready', {{ metrics: {{ renderTime: performance.now() - __artifactStart }} }});
  }}
}});"#
    )
}

/// Whitespace-only reduction that leaves template literal bodies intact.
fn minify(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut in_template = false;
    for line in code.lines() {
        let line = if in_template { line } else { line.trim() };
        if !line.is_empty() || in_template {
            out.push_str(line.trim_end());
            out.push('\n');
        }
        let ticks = line.matches('`').count() - line.matches("\\`").count();
        if ticks % 2 == 1 {
            in_template = !in_template;
        }
    }
    out
}

/// Coarse v3 source map: each generated line maps to the same original line.
fn line_source_map(original: &str, generated: &str, file: &str) -> String {
    let lines = generated.lines().count().min(original.lines().count().max(1));
    let mut mappings = String::new();
    for line in 0..lines {
        if line > 0 {
            mappings.push(';');
            mappings.push_str("AACA");
        } else {
            mappings.push_str("AAAA");
        }
    }
    serde_json::json!({
        "version": 3,
        "file": file,
        "sources": ["artifact.tsx"],
        "sourcesContent": [original],
        "names": [],
        "mappings": mappings,
    })
    .to_string()
}

pub struct ComponentCompiler {
    dependencies: Arc<DependencyManager>,
}

impl ComponentCompiler {
    pub fn new(dependencies: Arc<DependencyManager>) -> Self {
        Self { dependencies }
    }

    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.dependencies
    }

    /// Structural requirements, independent of security.
    pub fn validate_structure(&self, code: &str) -> Vec<String> {
        let mut errors = Vec::new();
        let Ok(rw) = rewrites() else {
            errors.push("compiler rewrite rules failed to build".to_string());
            return errors;
        };

        if code.trim().is_empty() {
            errors.push("source is empty".to_string());
        }
        if !rw.render_capability.is_match(code) {
            errors.push("component must import React or render JSX".to_string());
        }
        if !rw.export.is_match(code) {
            errors.push("component must be exported (e.g. `export default function App()`)".to_string());
        }
        errors
    }

    /// Compile an artifact. Structural and transform failures come back as
    /// `success: false`; an unresolvable declared dependency is an error.
    pub async fn compile_artifact(
        &self,
        artifact: &Artifact,
        options: &CompilationOptions,
    ) -> Result<CompilationResult, AppError> {
        let started = Instant::now();
        let code = artifact.code.as_str();
        let rw = rewrites().map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let mut warnings: Vec<String> = Vec::new();
        if code.len() > MAX_CODE_BYTES {
            let error = format!("source is {} bytes; the limit is {MAX_CODE_BYTES}", code.len());
            return Ok(CompilationResult::failed(vec![error], warnings, started));
        }
        let mut errors = self.validate_structure(code);
        if !errors.is_empty() {
            tracing::debug!(artifact_id = %artifact.id, errors = errors.len(), "structural validation failed");
            return Ok(CompilationResult::failed(errors, warnings, started));
        }

        for specifier in source::import_specifiers(code) {
            if source::is_relative_specifier(&specifier) {
                errors.push(format!("relative import '{specifier}' cannot be bundled"));
            } else if !self.dependencies.is_whitelisted(&source::package_name(&specifier)).await {
                errors.push(format!("import of '{specifier}' is not allowed"));
            }
        }

        let mut requested: Vec<String> = artifact.metadata.dependencies.clone();
        for name in source::imported_packages(code)
            .into_iter()
            .chain(BASELINE_DEPENDENCIES.iter().map(|s| s.to_string()))
        {
            let present = requested
                .iter()
                .any(|dep| crate::dependencies::parse_dependency_spec(dep).0 == name);
            if !present {
                requested.push(name);
            }
        }

        let resolution = self.dependencies.resolve_dependencies(&requested).await;
        let unresolved_declared: Vec<&String> = resolution
            .failed
            .iter()
            .filter(|failed| artifact.metadata.dependencies.contains(failed))
            .collect();
        if !unresolved_declared.is_empty() {
            let names: Vec<&str> = unresolved_declared.iter().map(|s| s.as_str()).collect();
            return Err(AppError::Dependency(names.join(", ")));
        }
        warnings.extend(resolution.warnings.iter().cloned());

        if rw.network.is_match(code) {
            warnings.push(
                "network requests are blocked inside the sandbox and will fail silently".to_string(),
            );
        }
        if rw.enum_decl.is_match(code) {
            errors.push("enum declarations are not supported; use plain objects".to_string());
        }

        if !errors.is_empty() {
            return Ok(CompilationResult::failed(errors, warnings, started));
        }

        // JSX goes first so element text is a string literal by the time the
        // inline rewrites run.
        let declarations = strip_type_declarations(code);
        let transformed = match jsx::transform(&declarations) {
            Ok(lowered) => strip_inline_annotations(&lowered),
            Err(error) => {
                errors.push(format!("JSX transform failed: {error}"));
                return Ok(CompilationResult::failed(errors, warnings, started));
            }
        };

        let (body, component) = match self.rewrite_exports(rw, &transformed, code) {
            Some(rewritten) => rewritten,
            None => {
                errors.push("no exported component could be found to mount".to_string());
                return Ok(CompilationResult::failed(errors, warnings, started));
            }
        };
        if !source::has_default_export(code) {
            warnings.push(format!("no default export; mounting named export {component}"));
        }

        let mut module = String::new();
        if !rw.react_default_import.is_match(&body) {
            module.push_str("import React from 'react';\n");
        }
        module.push_str("import { createRoot as __createRoot } from 'react-dom/client';\n");
        module.push_str(&body);
        module.push_str(&mount_code(&component, options.error_boundary));
        module.push('\n');

        if options.minify {
            module = minify(&module);
        }

        let import_map = self.dependencies.generate_import_map(&resolution.resolved);
        let origins: Vec<String> = origin_of(self.dependencies.cdn_base()).into_iter().collect();
        let csp = ContentSecurityPolicy::for_bundle(&origins);
        let bundle = render_document(&DocumentParts {
            title: &artifact.metadata.title,
            csp: &csp,
            import_map: &import_map,
            head_scripts: &[],
            module: &module,
        });

        let source_map = options
            .source_maps
            .then(|| line_source_map(code, &module, "bundle.js"));

        let result = CompilationResult {
            success: true,
            errors,
            warnings,
            bundle: Some(bundle),
            module: Some(module),
            import_map: Some(import_map),
            source_map,
            component_name: Some(component),
            compilation_time_ms: elapsed_ms(started),
        };

        tracing::debug!(
            artifact_id = %artifact.id,
            elapsed_ms = result.compilation_time_ms,
            warnings = result.warnings.len(),
            "artifact compiled"
        );
        Ok(result)
    }

    fn rewrite_exports(&self, rw: &Rewrites, code: &str, original: &str) -> Option<(String, String)> {
        let mut component: Option<String> = None;

        let mut body = if let Some(caps) = rw.default_export_named.captures(code) {
            component = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string());
            rw.default_export_named.replace(code, "$1").into_owned()
        } else if rw.default_export.is_match(code) {
            component = Some(DEFAULT_COMPONENT.to_string());
            rw.default_export
                .replace(code, format!("const {DEFAULT_COMPONENT} = ").as_str())
                .into_owned()
        } else {
            code.to_string()
        };

        body = rw.export_list.replace_all(&body, "").into_owned();
        body = rw.named_export.replace_all(&body, "$1").into_owned();

        component.or_else(|| source::exported_component(original)).map(|c| (body, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartialMetadata;

    fn compiler() -> ComponentCompiler {
        ComponentCompiler::new(Arc::new(DependencyManager::new("https://esm.sh")))
    }

    fn artifact(code: &str) -> Artifact {
        Artifact::draft("c1", code, PartialMetadata::default())
    }

    const COUNTER: &str = r#"import React, { useState } from 'react';

export default function Counter() {
  const [count, setCount] = useState(0);
  return (
    <div className="counter">
      <button onClick={() => setCount(count + 1)}>Clicked {count} times</button>
    </div>
  );
}
"#;

    #[tokio::test]
    async fn compiles_a_plain_component() {
        let result = compiler()
            .compile_artifact(&artifact(COUNTER), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.errors);
        let module = result.module.unwrap();
        assert!(module.contains("React.createElement(\"div\", { className: \"counter\" }"));
        assert!(module.contains("function Counter()"));
        assert!(!module.contains("export default"));
        assert!(module.contains("React.createElement(Counter, window.__ARTIFACT_PROPS__ || {})"));
        let bundle = result.bundle.unwrap();
        assert!(bundle.contains("<script type=\"importmap\">"));
        assert!(bundle.contains("https://esm.sh/react@18.2.0"));
        assert!(bundle.contains("__ArtifactErrorBoundary extends React.Component"));
        assert_eq!(result.component_name.as_deref(), Some("Counter"));
    }

    #[tokio::test]
    async fn empty_source_fails_structurally() {
        let result = compiler()
            .compile_artifact(&artifact(""), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.bundle.is_none());
        assert!(result.errors.iter().any(|e| e.contains("exported")));
        assert!(result.errors.iter().any(|e| e.contains("React")));
    }

    #[tokio::test]
    async fn missing_export_fails() {
        let result = compiler()
            .compile_artifact(
                &artifact("import React from 'react';\nfunction A() { return <div/>; }"),
                &CompilationOptions::default(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn undeclared_unlisted_import_is_a_compile_error() {
        let mut artifact = artifact("import pad from 'left-pad';\nexport default function A() { return <p/>; }");
        artifact.metadata.dependencies = vec!["react".into(), "react-dom".into()];
        let result = compiler()
            .compile_artifact(&artifact, &CompilationOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("left-pad"));
    }

    #[tokio::test]
    async fn unresolvable_declared_dependency_is_fatal() {
        let mut artifact = artifact(COUNTER);
        artifact.metadata.dependencies.push("left-pad".into());
        let err = compiler()
            .compile_artifact(&artifact, &CompilationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Dependency(names) if names == "left-pad"));
    }

    #[tokio::test]
    async fn network_calls_are_warnings_only() {
        let code = "import React, { useEffect } from 'react';\nexport default function A() { useEffect(() => { fetch('/x'); }, []); return <p/>; }";
        let result = compiler()
            .compile_artifact(&artifact(code), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.warnings.iter().any(|w| w.contains("network")));
    }

    #[tokio::test]
    async fn injects_react_import_when_missing() {
        let code = "export default function Hello() { return <h1>Hi</h1>; }";
        let result = compiler()
            .compile_artifact(&artifact(code), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert!(result.module.unwrap().starts_with("import React from 'react';"));
    }

    #[tokio::test]
    async fn anonymous_default_export_is_bound() {
        let code = "import React from 'react';\nexport default () => <span>x</span>;";
        let result = compiler()
            .compile_artifact(&artifact(code), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.errors);
        let module = result.module.unwrap();
        assert!(module.contains("const __ArtifactComponent = () => React.createElement(\"span\", null, \"x\");"));
    }

    #[tokio::test]
    async fn source_maps_and_minify_options() {
        let options = CompilationOptions {
            minify: true,
            source_maps: true,
            error_boundary: false,
        };
        let result = compiler().compile_artifact(&artifact(COUNTER), &options).await.unwrap();
        let module = result.module.unwrap();
        assert!(!module.contains("\n\n"));
        assert!(module.contains("const __ArtifactErrorBoundary = React.Fragment;"));
        let map: serde_json::Value = serde_json::from_str(&result.source_map.unwrap()).unwrap();
        assert_eq!(map["version"], 3);
        assert!(map["mappings"].as_str().unwrap().starts_with("AAAA;AACA"));
    }

    #[test]
    fn strips_typescript_syntax() {
        let code = r#"import type { FC } from 'react';
interface Props {
  title: string;
  items?: string[];
}
type Mode = 'a' | 'b';
export default function List({ title, items = [] }: Props): JSX.Element {
  const [mode, setMode] = useState<Mode>('a');
  const count: number = items.length;
  const pick = (item: string, idx?: number): void => setMode(item as Mode);
  return <ul title={title}>{count}</ul>;
}
"#;
        let out = strip_type_annotations(code);
        assert!(!out.contains("interface"));
        assert!(!out.contains("type Mode"));
        assert!(!out.contains("import type"));
        assert!(out.contains("function List({ title, items = [] }) {"), "{out}");
        assert!(out.contains("useState('a')"));
        assert!(out.contains("const count = items.length"));
        assert!(out.contains("const pick = (item, idx) => setMode(item);"), "{out}");
    }

    #[test]
    fn default_values_keep_their_ternaries() {
        let plain = "const f = (a = b ? c : d) => a;";
        assert_eq!(strip_type_annotations(plain), plain);
        assert_eq!(
            strip_type_annotations("const g = (a: number = b ? c : d, e?: string) => a;"),
            "const g = (a = b ? c : d, e) => a;"
        );
        assert_eq!(
            strip_type_annotations("const h = (a = x < y ? 1 : 2, b: number) => a;"),
            "const h = (a = x < y ? 1 : 2, b) => a;"
        );
    }

    #[test]
    fn literals_and_comments_are_not_rewritten() {
        let code = "const label = 'cast as Foo, done';\n// value as Bar;\nconst t = `x as Baz)`;\nconst n = v as Qux;";
        let out = strip_type_annotations(code);
        assert!(out.contains("'cast as Foo, done'"), "{out}");
        assert!(out.contains("// value as Bar;"), "{out}");
        assert!(out.contains("`x as Baz)`"), "{out}");
        assert!(out.contains("const n = v;"), "{out}");
    }

    #[tokio::test]
    async fn element_text_survives_type_stripping() {
        let code = "import React from 'react';\nexport default function Exporter() {\n  return <p>Export data as CSV, or JSON</p>;\n}\n";
        let result = compiler()
            .compile_artifact(&artifact(code), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert!(result.module.unwrap().contains("\"Export data as CSV, or JSON\""));
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let code = format!("{COUNTER}// {}\n", "x".repeat(MAX_CODE_BYTES));
        let result = compiler()
            .compile_artifact(&artifact(&code), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.errors[0].contains("limit"), "{:?}", result.errors);
    }

    #[tokio::test]
    async fn deeply_nested_markup_fails_cleanly() {
        let code = format!(
            "import React from 'react';\nexport default function Deep() {{ return {}; }}\n",
            "<a>".repeat(30_000)
        );
        let result = compiler()
            .compile_artifact(&artifact(&code), &CompilationOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("nested deeper")), "{:?}", result.errors);
    }

    #[test]
    fn policies_differ_on_network() {
        let origins = vec!["https://esm.sh".to_string()];
        let sandboxed = ContentSecurityPolicy::sandboxed(&origins);
        assert_eq!(sandboxed.directive("connect-src"), Some(&["'none'".to_string()][..]));
        assert_eq!(sandboxed.directive("frame-src"), Some(&["'none'".to_string()][..]));
        assert!(sandboxed.render().contains("script-src 'self' 'unsafe-inline' https://esm.sh"));
        let bundle = ContentSecurityPolicy::for_bundle(&origins);
        assert!(bundle.render().contains("connect-src 'self' https://esm.sh"));
    }

    #[test]
    fn origin_extraction() {
        assert_eq!(origin_of("https://esm.sh/react@18").as_deref(), Some("https://esm.sh"));
        assert_eq!(origin_of("https://cdn.example.com").as_deref(), Some("https://cdn.example.com"));
        assert_eq!(origin_of("not a url"), None);
    }

    #[test]
    fn document_escapes_script_terminators() {
        let csp = ContentSecurityPolicy::sandboxed(&[]);
        let doc = render_document(&DocumentParts {
            title: "<b>t</b>",
            csp: &csp,
            import_map: &ImportMap::default(),
            head_scripts: &[],
            module: "const s = '</script>';",
        });
        assert!(doc.contains("&lt;b&gt;t&lt;/b&gt;"));
        assert!(doc.contains("'<\\/script>'"));
    }
}
