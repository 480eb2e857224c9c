//! # Binding Resolution and Condition Evaluation
//!
//! This module resolves `${{ ... }}` bindings in step inputs against an
//! [`ExecutionContext`] and evaluates loop failure conditions.
//!
//! ## Binding Forms
//!
//! - `${{ trigger.row.name }}` - trigger payload lookup
//! - `${{ steps.fetch.rows[0].id }}` - step output lookup by step name
//! - `${{ steps.2.value }}` - step output lookup by 1-based step position
//! - `${{ loop.currentItem }}` - active loop iteration
//! - `${{ env.REGION }}` - tenant environment variable
//! - `${{ script "<base64>" }}` - sandboxed script evaluated against the context
//!
//! ## Missing Values
//!
//! Lookups never fail: a path that does not exist resolves to `null`, or to an empty
//! string when spliced into surrounding text. Script failures are reported back as
//! [`ResolutionFailure`]s and substituted with `null`; the step executor decides
//! whether the affected input was required.
//!
//! ## Usage
//!
//! ```rust
//! use stepwise_engine::{context::ExecutionContext, resolve::BindingResolver};
//! use stepwise_types::TenantId;
//! use serde_json::json;
//!
//! let context = ExecutionContext::new(TenantId::new("tenant_a"), json!({"name": "ada"}));
//! let resolver = BindingResolver::default();
//!
//! let greeting = resolver.resolve_value(&json!("hello ${{ trigger.name }}"), &context);
//! assert_eq!(greeting, json!("hello ada"));
//! ```

use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::{
    condition_syntax::{
        find_top_level_operator, looks_like_json_literal, normalize_condition_expression, split_expression, split_includes,
        strip_leading_negations,
    },
    context::ExecutionContext,
    error::BindingResolutionError,
    script::{RhaiScriptRunner, ScriptRunner, run_blocking},
    templates::{BindingExpression, is_script_expression, parse_binding_expression, single_template_expression, split_path_segments},
};

/// Binding that could not be resolved while resolving a step's inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionFailure {
    /// Top-level input field the binding belongs to.
    pub field: String,
    /// Full path of the string that contained the binding, e.g. `row.name`.
    pub source_path: String,
    pub error: BindingResolutionError,
}

/// Resolved input values plus any bindings that failed along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    pub values: Map<String, Value>,
    pub failures: Vec<ResolutionFailure>,
}

impl ResolvedInputs {
    pub fn failure_for(&self, field: &str) -> Option<&ResolutionFailure> {
        self.failures.iter().find(|failure| failure.field == field)
    }
}

/// Resolves bindings and conditions; script evaluation goes through the injected runner.
#[derive(Clone)]
pub struct BindingResolver {
    script_runner: Arc<dyn ScriptRunner>,
    script_timeout: Duration,
}

impl std::fmt::Debug for BindingResolver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BindingResolver")
            .field("script_timeout", &self.script_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for BindingResolver {
    fn default() -> Self {
        Self::new(Arc::new(RhaiScriptRunner::new()), Duration::from_secs(1))
    }
}

impl BindingResolver {
    pub fn new(script_runner: Arc<dyn ScriptRunner>, script_timeout: Duration) -> Self {
        Self {
            script_runner,
            script_timeout,
        }
    }

    /// Resolves a single binding expression (without `${{ }}` delimiters).
    ///
    /// Lookups always succeed, yielding `null` for missing paths. Script bindings fail on
    /// invalid encoding, evaluation errors and timeouts.
    pub fn resolve(&self, expression: &str, context: &ExecutionContext) -> Result<Value, BindingResolutionError> {
        match parse_binding_expression(expression)? {
            BindingExpression::Lookup(path) => Ok(lookup_path(&path, context).unwrap_or(Value::Null)),
            BindingExpression::Script(source) => {
                let context_json = context.to_json();
                Ok(run_blocking(|| self.script_runner.run(&source, &context_json, self.script_timeout))?)
            }
        }
    }

    /// Copy of this resolver whose scripts get at most `limit` of wall-clock time.
    pub fn with_script_timeout(&self, limit: Duration) -> Self {
        Self {
            script_runner: Arc::clone(&self.script_runner),
            script_timeout: self.script_timeout.min(limit),
        }
    }

    /// Recursively resolves every binding inside `value`, discarding failures.
    pub fn resolve_value(&self, value: &Value, context: &ExecutionContext) -> Value {
        let mut failures = Vec::new();
        self.resolve_value_at(value, context, "", "", &mut failures)
    }

    /// Resolves all step inputs, keeping track of which fields had failing bindings.
    pub fn resolve_inputs(&self, inputs: &IndexMap<String, Value>, context: &ExecutionContext) -> ResolvedInputs {
        let mut resolved = ResolvedInputs::default();
        for (field, raw_value) in inputs {
            let value = self.resolve_value_at(raw_value, context, field, field, &mut resolved.failures);
            resolved.values.insert(field.clone(), value);
        }
        resolved
    }

    fn resolve_value_at(
        &self,
        value: &Value,
        context: &ExecutionContext,
        field: &str,
        source_path: &str,
        failures: &mut Vec<ResolutionFailure>,
    ) -> Value {
        match value {
            Value::String(raw_text) => self.resolve_string(raw_text, context, field, source_path, failures),
            Value::Array(array_values) => Value::Array(
                array_values
                    .iter()
                    .enumerate()
                    .map(|(index, array_value)| {
                        self.resolve_value_at(array_value, context, field, &format!("{source_path}[{index}]"), failures)
                    })
                    .collect(),
            ),
            Value::Object(object_map) => {
                let mut resolved_map = Map::new();
                for (key, nested_value) in object_map {
                    let nested_path = if source_path.is_empty() {
                        key.clone()
                    } else {
                        format!("{source_path}.{key}")
                    };
                    resolved_map.insert(
                        key.clone(),
                        self.resolve_value_at(nested_value, context, field, &nested_path, failures),
                    );
                }
                Value::Object(resolved_map)
            }
            _ => value.clone(),
        }
    }

    fn resolve_string(
        &self,
        raw_text: &str,
        context: &ExecutionContext,
        field: &str,
        source_path: &str,
        failures: &mut Vec<ResolutionFailure>,
    ) -> Value {
        let mut record_failure = |error: BindingResolutionError| {
            failures.push(ResolutionFailure {
                field: field.to_string(),
                source_path: source_path.to_string(),
                error,
            })
        };

        if let Some(expression) = single_template_expression(raw_text) {
            return self.resolve(expression, context).unwrap_or_else(|error| {
                record_failure(error);
                Value::Null
            });
        }

        let mut output_string = String::new();
        let mut remaining_string = raw_text;
        while let Some(template_start) = remaining_string.find("${{") {
            let (string_before_template, string_after_template) = remaining_string.split_at(template_start);
            output_string.push_str(string_before_template);

            let Some(template_end_index) = string_after_template.find("}}") else {
                // Unterminated template: keep the remainder verbatim.
                output_string.push_str(string_after_template);
                return Value::String(output_string);
            };
            let template_expression = string_after_template[3..template_end_index].trim();
            match self.resolve(template_expression, context) {
                Ok(resolved_value) => output_string.push_str(&format_json_value(&resolved_value)),
                Err(error) => record_failure(error),
            }
            remaining_string = &string_after_template[template_end_index + 2..];
        }
        output_string.push_str(remaining_string);
        Value::String(output_string)
    }

    /// Evaluates a condition against the context.
    ///
    /// Supports `||`, `&&`, leading `!`, `==`, `!=`, `.includes(...)`, JSON literals and
    /// truthiness of lookups. A script binding evaluates the script and tests the
    /// truthiness of its result; script failures are returned as errors.
    pub fn eval_condition(&self, raw_expression: &str, context: &ExecutionContext) -> Result<bool, BindingResolutionError> {
        let expression = normalize_condition_expression(raw_expression);
        if expression.is_empty() {
            return Ok(false);
        }
        if is_script_expression(&expression) {
            let value = self.resolve(&expression, context)?;
            return Ok(is_truthy(&value));
        }
        Ok(evaluate_condition_node(&expression, context))
    }
}

fn evaluate_condition_node(expression: &str, context: &ExecutionContext) -> bool {
    if let Some(parts) = split_expression(expression, "||") {
        return parts.iter().any(|part| evaluate_condition_node(part, context));
    }
    if let Some(parts) = split_expression(expression, "&&") {
        return parts.iter().all(|part| evaluate_condition_node(part, context));
    }

    let (negations, inner) = strip_leading_negations(expression);
    let result = evaluate_comparison(inner.trim(), context);
    if negations % 2 == 1 { !result } else { result }
}

fn evaluate_comparison(expression: &str, context: &ExecutionContext) -> bool {
    if let Some((left_expression, right_expression)) = split_includes(expression) {
        let haystack = resolve_operand(left_expression, context);
        let needle = resolve_operand(right_expression, context);
        return value_includes(&haystack, &needle);
    }
    if let Some(position) = find_top_level_operator(expression, "!=") {
        let left_value = resolve_operand(&expression[..position], context);
        let right_value = resolve_operand(&expression[position + 2..], context);
        return !values_equal(&left_value, &right_value);
    }
    if let Some(position) = find_top_level_operator(expression, "==") {
        let left_value = resolve_operand(&expression[..position], context);
        let right_value = resolve_operand(&expression[position + 2..], context);
        return values_equal(&left_value, &right_value);
    }
    is_truthy(&resolve_operand(expression, context))
}

/// Resolves a condition operand: JSON literal, single-quoted string or lookup path.
fn resolve_operand(expression: &str, context: &ExecutionContext) -> Value {
    let trimmed = expression.trim();
    if looks_like_json_literal(trimmed)
        && let Ok(literal) = serde_json::from_str::<Value>(trimmed)
    {
        return literal;
    }
    if let Some(quoted) = trimmed.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Value::String(quoted.to_string());
    }
    lookup_path(trimmed, context).unwrap_or(Value::Null)
}

fn values_equal(left_value: &Value, right_value: &Value) -> bool {
    left_value == right_value || format_json_value(left_value) == format_json_value(right_value)
}

fn value_includes(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::String(text) if text.trim_start().starts_with('[') => serde_json::from_str::<Vec<Value>>(text)
            .map(|items| items.iter().any(|item| values_equal(item, needle)))
            .unwrap_or(false),
        Value::String(text) => text.contains(&format_json_value(needle)),
        _ => false,
    }
}

/// Looks up a dotted path in the execution context.
///
/// Returns `None` when the root is unknown or any segment is missing. A leading
/// `output` segment after a step reference is skipped unless the step's outputs
/// contain an `output` field themselves.
pub fn lookup_path(expression: &str, context: &ExecutionContext) -> Option<Value> {
    let segments = split_path_segments(expression.trim());
    let (root, rest) = segments.split_first()?;

    match root.as_str() {
        "trigger" => navigate_json_path(context.trigger(), rest),
        "env" => match rest {
            [variable_name] => context
                .environment_variable(variable_name)
                .map(|value| Value::String(value.to_string())),
            _ => None,
        },
        "steps" => {
            let (step_reference, path) = rest.split_first()?;
            let outputs = context.step_output(step_reference)?;
            let path = match path.split_first() {
                Some((first, remaining)) if first == "output" && outputs.get("output").is_none() => remaining,
                _ => path,
            };
            navigate_json_path(outputs, path)
        }
        "loop" => {
            let loop_frame = context.loop_frame()?;
            navigate_json_path(&loop_frame.to_json(), rest)
        }
        _ => None,
    }
}

/// Navigates through a JSON value using field names and array indices.
fn navigate_json_path(root_value: &Value, path_parts: &[String]) -> Option<Value> {
    let mut current_value = root_value;
    for path_part in path_parts {
        current_value = match current_value {
            Value::Object(object_map) => object_map.get(path_part)?,
            Value::Array(array_values) => array_values.get(path_part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current_value.clone())
}

/// Formats a JSON value for splicing into text.
///
/// Strings are returned as-is, `null` becomes an empty string, and arrays or objects
/// are rendered as compact JSON.
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}

/// Truthiness used by conditions and loop failure checks.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => !text.is_empty() && text != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}
