// Copyright 2025 Memophor Labs
// SPDX-License-Identifier: Apache-2.0

//! Minimal JSX to `React.createElement` rewriting.
//!
//! This is not a JavaScript parser. It walks the source once, skipping strings,
//! template literals and comments, and rewrites any `<Tag ...>` that appears in
//! expression position. Expression containers inside elements are rewritten
//! recursively.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsxError {
    #[error("unterminated JSX element <{tag}> starting at byte {offset}")]
    Unterminated { tag: String, offset: usize },
    #[error("mismatched closing tag: expected </{expected}>, found </{found}>")]
    Mismatched { expected: String, found: String },
    #[error("malformed JSX attribute near byte {0}")]
    Attribute(usize),
    #[error("unbalanced expression container near byte {0}")]
    Expression(usize),
    #[error("JSX nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Elements, attribute values and expression containers each count as a level.
pub const MAX_DEPTH: usize = 256;

/// Rewrite every JSX element in `code`.
pub fn transform(code: &str) -> Result<String, JsxError> {
    lower(code, 0)
}

fn lower(code: &str, depth: usize) -> Result<String, JsxError> {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = skip_string(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '`' => {
                let end = skip_template(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                let end = skip_line_comment(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let end = skip_block_comment(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '<' if starts_element(&chars, i) && in_expression_position(&out) => {
                let (element, end) = parse_element(&chars, i, depth)?;
                out.push_str(&element);
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

pub(crate) fn skip_string(chars: &[char], start: usize) -> usize {
    scan_string(chars, start).unwrap_or_else(|stop| stop)
}

/// Index after the closing quote, or where the scan stopped without one
/// (a newline or the end of input).
fn scan_string(chars: &[char], start: usize) -> Result<usize, usize> {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return Ok(i + 1),
            '\n' => return Err(i),
            _ => i += 1,
        }
    }
    Err(chars.len())
}

pub(crate) fn skip_template(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    let mut depth = 0usize;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '$' if depth == 0 && chars.get(i + 1) == Some(&'{') => {
                depth += 1;
                i += 2;
            }
            '{' if depth > 0 => {
                depth += 1;
                i += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                i += 1;
            }
            '`' if depth == 0 => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

pub(crate) fn skip_line_comment(chars: &[char], start: usize) -> usize {
    chars[start..]
        .iter()
        .position(|&c| c == '\n')
        .map(|p| start + p)
        .unwrap_or(chars.len())
}

pub(crate) fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

fn starts_element(chars: &[char], i: usize) -> bool {
    match chars.get(i + 1) {
        Some('>') => true,
        Some(c) => c.is_ascii_alphabetic() || *c == '_' || *c == '$',
        None => false,
    }
}

/// A `<` begins JSX only where an expression may start, which separates it from
/// comparisons and generic parameters.
fn in_expression_position(preceding: &str) -> bool {
    let trimmed = preceding.trim_end();
    let Some(last) = trimmed.chars().last() else {
        return true;
    };

    if matches!(last, '(' | ',' | '=' | ':' | '?' | '&' | '|' | '{' | '[' | '!' | ';' | '}' | '>') {
        // `a => <div/>` ends in '>', `a >= <` is nonsense either way.
        return last != '>' || trimmed.ends_with("=>");
    }

    let word: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    matches!(word.as_str(), "return" | "yield" | "default" | "case" | "else" | "do")
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-' | '.' | ':')
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn read_name(chars: &[char], mut i: usize) -> (String, usize) {
    let start = i;
    while i < chars.len() && is_name_char(chars[i]) {
        i += 1;
    }
    (chars[start..i].iter().collect(), i)
}

fn tag_expression(tag: &str) -> String {
    if tag.is_empty() {
        return "React.Fragment".to_string();
    }
    let first = tag.chars().next().unwrap_or('a');
    if first.is_ascii_uppercase() || tag.contains('.') {
        tag.to_string()
    } else {
        format!("\"{tag}\"")
    }
}

fn prop_key(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        name.to_string()
    } else {
        format!("\"{name}\"")
    }
}

/// Read a balanced `{ ... }` container starting at `start` and return its
/// inner text and the index after the closing brace.
fn read_container(chars: &[char], start: usize) -> Result<(String, usize), JsxError> {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' => {
                i = skip_string(chars, i);
                continue;
            }
            '`' => {
                i = skip_template(chars, i);
                continue;
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let inner: String = chars[start + 1..i].iter().collect();
                    return Ok((inner, i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(JsxError::Expression(start))
}

fn parse_element(chars: &[char], start: usize, depth: usize) -> Result<(String, usize), JsxError> {
    if depth >= MAX_DEPTH {
        return Err(JsxError::TooDeep(MAX_DEPTH));
    }
    let nested = depth + 1;
    let (tag, mut i) = read_name(chars, start + 1);
    let mut props: Vec<String> = Vec::new();
    let mut spreads: Vec<String> = Vec::new();

    loop {
        i = skip_ws(chars, i);
        match chars.get(i) {
            None => {
                return Err(JsxError::Unterminated { tag, offset: start });
            }
            Some('/') if chars.get(i + 1) == Some(&'>') => {
                let call = create_call(&tag, &props, &spreads, &[]);
                return Ok((call, i + 2));
            }
            Some('>') => {
                i += 1;
                break;
            }
            Some('{') => {
                let (inner, end) = read_container(chars, i)?;
                let inner = inner.trim();
                let Some(spread) = inner.strip_prefix("...") else {
                    return Err(JsxError::Attribute(i));
                };
                spreads.push(lower(spread.trim(), nested)?);
                i = end;
            }
            Some(c) if is_name_char(*c) => {
                let (name, end) = read_name(chars, i);
                i = skip_ws(chars, end);
                if chars.get(i) != Some(&'=') {
                    props.push(format!("{}: true", prop_key(&name)));
                    continue;
                }
                i = skip_ws(chars, i + 1);
                match chars.get(i) {
                    Some('"') | Some('\'') => {
                        let Ok(end) = scan_string(chars, i) else {
                            return Err(JsxError::Attribute(i));
                        };
                        let raw: String = chars[i + 1..end - 1].iter().collect();
                        props.push(format!("{}: {}", prop_key(&name), js_string(&raw)));
                        i = end;
                    }
                    Some('{') => {
                        let (inner, end) = read_container(chars, i)?;
                        props.push(format!("{}: {}", prop_key(&name), lower(inner.trim(), nested)?));
                        i = end;
                    }
                    Some('<') => {
                        let (element, end) = parse_element(chars, i, nested)?;
                        props.push(format!("{}: {}", prop_key(&name), element));
                        i = end;
                    }
                    _ => return Err(JsxError::Attribute(i)),
                }
            }
            Some(_) => return Err(JsxError::Attribute(i)),
        }
    }

    let mut children: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match chars.get(i) {
            None => return Err(JsxError::Unterminated { tag, offset: start }),
            Some('<') if chars.get(i + 1) == Some(&'/') => {
                flush_text(&mut text, &mut children);
                let (closing, end) = read_name(chars, skip_ws(chars, i + 2));
                let end = skip_ws(chars, end);
                if chars.get(end) != Some(&'>') {
                    return Err(JsxError::Unterminated { tag, offset: start });
                }
                if closing != tag {
                    return Err(JsxError::Mismatched {
                        expected: tag,
                        found: closing,
                    });
                }
                let call = create_call(&tag, &props, &spreads, &children);
                return Ok((call, end + 1));
            }
            Some('<') if starts_element(chars, i) => {
                flush_text(&mut text, &mut children);
                let (child, end) = parse_element(chars, i, nested)?;
                children.push(child);
                i = end;
            }
            Some('{') => {
                flush_text(&mut text, &mut children);
                let (inner, end) = read_container(chars, i)?;
                let inner = inner.trim();
                // `{/* comment */}` and `{}` render nothing.
                let is_comment = inner.starts_with("/*") && inner.ends_with("*/");
                if !inner.is_empty() && !is_comment {
                    children.push(lower(inner, nested)?);
                }
                i = end;
            }
            Some(c) => {
                text.push(*c);
                i += 1;
            }
        }
    }
}

/// JSX whitespace rules: lines are trimmed, blank lines dropped, the rest
/// joined by single spaces.
fn flush_text(text: &mut String, children: &mut Vec<String>) {
    if text.is_empty() {
        return;
    }
    let collapsed = if text.contains('\n') {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        text.clone()
    };
    if !collapsed.is_empty() {
        children.push(js_string(&collapsed));
    }
    text.clear();
}

fn js_string(raw: &str) -> String {
    serde_json::to_string(raw).unwrap_or_else(|_| "\"\"".to_string())
}

fn create_call(tag: &str, props: &[String], spreads: &[String], children: &[String]) -> String {
    let props_expr = match (props.is_empty(), spreads.is_empty()) {
        (true, true) => "null".to_string(),
        (false, true) => format!("{{ {} }}", props.join(", ")),
        _ => {
            let mut parts: Vec<String> = spreads.iter().map(|s| format!("...{s}")).collect();
            parts.extend(props.iter().cloned());
            format!("{{ {} }}", parts.join(", "))
        }
    };

    let mut call = format!("React.createElement({}, {}", tag_expression(tag), props_expr);
    for child in children {
        call.push_str(", ");
        call.push_str(child);
    }
    call.push(')');
    call
}
