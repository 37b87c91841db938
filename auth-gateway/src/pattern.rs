//! Whitelist path patterns
//!
//! A specification is a `/`-separated template matched segment by segment:
//!
//! - `literal`: the segment must equal the text exactly
//! - `*`: exactly one non-empty segment
//! - `?` and `*` inside a segment: one character / any run of characters
//!   within that segment, e.g. `/static/*.css`
//! - `{name}`: one non-empty segment (or a non-empty run inside one)
//! - `{name:regex}`: segment text matching `regex`
//! - `**` or `{*name}`: zero or more remaining segments; only allowed last
//!
//! `/api/image/thumbnail/*` matches `/api/image/thumbnail/123` but not
//! `/api/image/thumbnail/123/extra`; `/api/a/public/**` matches
//! `/api/a/public`, `/api/a/public/docs` and anything deeper.

use crate::error::CompileError;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;

/// Anything that can decide whether a request path is covered
pub trait Matcher {
    fn matches(&self, path: &str) -> bool;
}

/// A compiled whitelist specification
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    elements: Vec<Element>,
    /// Trailing multi-segment wildcard
    open_tail: bool,
}

#[derive(Debug, Clone)]
enum Element {
    Literal(String),
    AnySegment,
    Template(Regex),
}

impl Element {
    fn matches(&self, segment: &str) -> bool {
        match self {
            Element::Literal(text) => text == segment,
            Element::AnySegment => !segment.is_empty(),
            Element::Template(regex) => regex.is_match(segment),
        }
    }
}

/// Compile one whitelist specification.
///
/// # Errors
///
/// Returns [`CompileError`] if the specification is malformed. Compiling a
/// batch should call this once per specification so one bad entry never
/// affects the others.
pub fn compile(spec: &str) -> Result<PathPattern, CompileError> {
    let body = spec
        .strip_prefix('/')
        .ok_or_else(|| CompileError::new(spec, "must start with '/'"))?;

    let segments = split_segments(spec, body)?;
    let last = segments.len().saturating_sub(1);
    let mut variables = HashSet::new();
    let mut elements = Vec::with_capacity(segments.len());
    let mut open_tail = false;

    for (index, segment) in segments.iter().enumerate() {
        if let Some(tail_var) = multi_segment_wildcard(spec, segment)? {
            if index != last {
                return Err(CompileError::new(
                    spec,
                    "multi-segment wildcard must be the last segment",
                ));
            }
            if let Some(name) = tail_var {
                register_variable(spec, name, &mut variables)?;
            }
            open_tail = true;
            break;
        }
        elements.push(compile_segment(spec, segment, &mut variables)?);
    }

    Ok(PathPattern {
        source: spec.to_string(),
        elements,
        open_tail,
    })
}

impl PathPattern {
    /// The specification this pattern was compiled from
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Matcher for PathPattern {
    fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix('/') else {
            return false;
        };

        let mut segments = rest.split('/');
        for element in &self.elements {
            match segments.next() {
                Some(segment) if element.matches(segment) => {}
                _ => return false,
            }
        }

        self.open_tail || segments.next().is_none()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

// =============================================================================
// PARSING
// =============================================================================

/// Split on `/` outside of `{...}` so regex constraints may contain slashes
/// or nested braces.
fn split_segments<'a>(spec: &str, body: &'a str) -> Result<Vec<&'a str>, CompileError> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (pos, ch) in body.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| CompileError::new(spec, "unbalanced '}'"))?;
            }
            '/' if depth == 0 => {
                segments.push(body.get(start..pos).unwrap_or_default());
                start = pos + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CompileError::new(spec, "unclosed '{'"));
    }
    segments.push(body.get(start..).unwrap_or_default());
    Ok(segments)
}

/// `Some(None)` for `**`, `Some(Some(name))` for `{*name}`, `None` otherwise
fn multi_segment_wildcard<'a>(spec: &str, segment: &'a str) -> Result<Option<Option<&'a str>>, CompileError> {
    if segment == "**" {
        return Ok(Some(None));
    }
    if segment.contains("**") {
        return Err(CompileError::new(spec, "'**' must occupy a whole segment"));
    }
    if let Some(inner) = segment.strip_prefix("{*") {
        let name = inner
            .strip_suffix('}')
            .filter(|name| !name.contains(['{', '}']))
            .ok_or_else(|| CompileError::new(spec, "'{*name}' must occupy a whole segment"))?;
        return Ok(Some(Some(name)));
    }
    if segment.contains("{*") {
        return Err(CompileError::new(spec, "'{*name}' must occupy a whole segment"));
    }
    Ok(None)
}

fn compile_segment(spec: &str, segment: &str, variables: &mut HashSet<String>) -> Result<Element, CompileError> {
    if segment == "*" {
        return Ok(Element::AnySegment);
    }
    if !segment.contains(['*', '?', '{', '}']) {
        return Ok(Element::Literal(segment.to_string()));
    }

    let mut expr = String::from("^");
    let mut literal = String::new();
    let mut chars = segment.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            '*' | '?' | '{' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
            }
            _ => {}
        }
        match ch {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            '{' => {
                let end = closing_brace(segment, pos)
                    .ok_or_else(|| CompileError::new(spec, "unclosed '{'"))?;
                let inner = segment.get(pos + 1..end).unwrap_or_default();
                expr.push_str(&variable_expr(spec, inner, variables)?);
                while chars.peek().is_some_and(|(next, _)| *next <= end) {
                    chars.next();
                }
            }
            '}' => return Err(CompileError::new(spec, "unbalanced '}'")),
            other => literal.push(other),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');

    Regex::new(&expr)
        .map(Element::Template)
        .map_err(|e| CompileError::new(spec, format!("invalid segment '{segment}': {e}")))
}

/// Byte offset of the `}` closing the `{` at `open`
fn closing_brace(segment: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (pos, ch) in segment.char_indices().skip_while(|(pos, _)| *pos < open) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
    }
    None
}

fn variable_expr(spec: &str, inner: &str, variables: &mut HashSet<String>) -> Result<String, CompileError> {
    let (name, constraint) = match inner.split_once(':') {
        Some((name, constraint)) => (name, Some(constraint)),
        None => (inner, None),
    };
    register_variable(spec, name, variables)?;

    match constraint {
        None => Ok("[^/]+".to_string()),
        Some("") => Err(CompileError::new(spec, format!("empty constraint for '{{{name}}}'"))),
        Some(constraint) => {
            Regex::new(constraint)
                .map_err(|e| CompileError::new(spec, format!("invalid constraint for '{{{name}}}': {e}")))?;
            Ok(format!("(?:{constraint})"))
        }
    }
}

fn register_variable(spec: &str, name: &str, variables: &mut HashSet<String>) -> Result<(), CompileError> {
    if name.is_empty() {
        return Err(CompileError::new(spec, "empty variable name"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CompileError::new(spec, format!("invalid variable name '{name}'")));
    }
    if !variables.insert(name.to_string()) {
        return Err(CompileError::new(spec, format!("duplicate variable '{name}'")));
    }
    Ok(())
}
