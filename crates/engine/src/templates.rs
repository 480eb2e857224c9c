//! Binding template parsing helpers.
//!
//! Bindings are written as `${{ <expression> }}` inside string inputs. An expression is
//! either a dotted lookup path (`steps.fetch.rows[0].id`) or a script binding marked
//! explicitly as `script "<base64 source>"`.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value;

use crate::error::BindingResolutionError;

const TEMPLATE_OPEN: &str = "${{";
const TEMPLATE_CLOSE: &str = "}}";
/// Keyword that marks a script binding.
pub const SCRIPT_MARKER: &str = "script";

/// Parsed binding expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingExpression {
    /// Dotted lookup path rooted at `trigger`, `steps`, `loop` or `env`.
    Lookup(String),
    /// Decoded script source.
    Script(String),
}

/// Template expression found in a definition, with the input path it came from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TemplateReference {
    pub source_path: String,
    /// Raw expression without delimiters.
    pub expression: String,
}

/// Extracts template expressions from a string value.
///
/// Returned expressions do not include `${{` or `}}` delimiters. An unterminated
/// template ends the scan.
pub fn extract_template_expressions(value: &str) -> Vec<String> {
    let mut expressions = Vec::new();
    let mut remainder = value;

    while let Some(start) = remainder.find(TEMPLATE_OPEN) {
        let after_start = &remainder[start + TEMPLATE_OPEN.len()..];
        let Some(end) = after_start.find(TEMPLATE_CLOSE) else {
            break;
        };
        let expression = after_start[..end].trim();
        if !expression.is_empty() {
            expressions.push(expression.to_string());
        }
        remainder = &after_start[end + TEMPLATE_CLOSE.len()..];
    }

    expressions
}

/// Returns the inner expression when `value` consists of exactly one template.
///
/// Such values resolve to the raw JSON value instead of its string form, so arrays and
/// objects survive binding.
pub fn single_template_expression(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    let inner = trimmed.strip_prefix(TEMPLATE_OPEN)?.strip_suffix(TEMPLATE_CLOSE)?;
    if inner.contains(TEMPLATE_OPEN) || inner.contains(TEMPLATE_CLOSE) {
        return None;
    }
    let inner = inner.trim();
    if inner.is_empty() { None } else { Some(inner) }
}

/// Classifies an expression as a lookup or a script binding, decoding scripts.
pub fn parse_binding_expression(expression: &str) -> Result<BindingExpression, BindingResolutionError> {
    let trimmed = expression.trim();
    let Some(encoded_literal) = strip_script_marker(trimmed) else {
        return Ok(BindingExpression::Lookup(trimmed.to_string()));
    };

    let encoded = encoded_literal
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| BindingResolutionError::MalformedScriptBinding {
            reason: "script source must be a double-quoted base64 string".to_string(),
        })?;
    let decoded_bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|error| BindingResolutionError::InvalidScriptEncoding { reason: error.to_string() })?;
    let source = String::from_utf8(decoded_bytes)
        .map_err(|error| BindingResolutionError::InvalidScriptEncoding { reason: error.to_string() })?;
    Ok(BindingExpression::Script(source))
}

/// Whether an expression carries the script marker.
pub fn is_script_expression(expression: &str) -> bool {
    strip_script_marker(expression.trim()).is_some()
}

fn strip_script_marker(expression: &str) -> Option<&str> {
    let rest = expression.strip_prefix(SCRIPT_MARKER)?;
    if rest.starts_with(char::is_whitespace) { Some(rest.trim()) } else { None }
}

/// Builds a complete script binding for `source`.
pub fn encode_script_binding(source: &str) -> String {
    format!("{TEMPLATE_OPEN} {SCRIPT_MARKER} \"{}\" {TEMPLATE_CLOSE}", STANDARD.encode(source))
}

/// Splits a lookup path into segments, turning `rows[0]` into `rows`, `0`.
pub fn split_path_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(character) = chars.next() {
        match character {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut inner = String::new();
                while let Some(next_character) = chars.next() {
                    if next_character == ']' {
                        break;
                    }
                    inner.push(next_character);
                }
                let inner = inner.trim().trim_matches('"').trim_matches('\'');
                if !inner.is_empty() {
                    segments.push(inner.to_string());
                }
            }
            _ => current.push(character),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Parses a step output reference and returns `(step_reference, normalized_field_path)`.
///
/// Supports `steps.name.field`, `steps.name.output.field`, `steps.2.field` and
/// `steps.name[0].field`. The path is empty when the whole output is referenced.
pub fn parse_step_reference_expression(expression: &str) -> Option<(String, String)> {
    let remaining = expression.trim().strip_prefix("steps.")?;
    if remaining.contains(char::is_whitespace) {
        return None;
    }
    let mut segments = split_path_segments(remaining).into_iter();
    let step_reference = segments.next()?;
    let mut path: Vec<String> = segments.collect();
    if path.first().is_some_and(|segment| segment == "output") {
        path.remove(0);
    }
    Some((step_reference, path.join(".")))
}

/// Collects every template expression found in a JSON value tree.
pub fn collect_template_references(value: &Value, source_path: &str, references: &mut Vec<TemplateReference>) {
    match value {
        Value::String(raw_text) => {
            for expression in extract_template_expressions(raw_text) {
                references.push(TemplateReference {
                    source_path: source_path.to_string(),
                    expression,
                });
            }
        }
        Value::Array(values) => {
            for (index, nested_value) in values.iter().enumerate() {
                collect_template_references(nested_value, &format!("{source_path}[{index}]"), references);
            }
        }
        Value::Object(map) => {
            for (key, nested_value) in map {
                collect_template_references(nested_value, &format!("{source_path}.{key}"), references);
            }
        }
        _ => {}
    }
}
