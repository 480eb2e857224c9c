//! Loop execution for steps carrying a `loop` block.
//!
//! The loop input is resolved once, split into a collection, and the wrapped step runs
//! for each item in collection order. Each iteration sees `loop.currentItem`,
//! `loop.index`, `loop.items` and, once it ran, `loop.output`. The loop stops early when
//! an iteration fails, the failure condition turns truthy, or the condition cannot be
//! evaluated. Items gathered before the stop are always part of the outputs.

use serde_json::{Value, json};
use stepwise_types::{LoopSpec, StepSpec};
use tracing::{info, warn};

use crate::{
    context::{ExecutionContext, LoopFrame},
    error::{StepExecutionError, StepInputError},
    steps::StepKind,
    templates::single_template_expression,
};

use super::{
    ExecutorEnvironment,
    step_once::{failure_outputs, reports_success, run_step_once},
};

/// Progress of a running loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub iterations: u32,
    pub max_iterations: u32,
    pub current_item: Value,
    pub failure_condition: Option<String>,
    pub items: Vec<Value>,
    /// Why the failure condition could not be evaluated, if it could not.
    pub condition_error: Option<String>,
}

impl LoopState {
    fn new(max_iterations: u32, failure_condition: Option<String>) -> Self {
        Self {
            iterations: 0,
            max_iterations,
            current_item: Value::Null,
            failure_condition,
            items: Vec::new(),
            condition_error: None,
        }
    }

    fn has_capacity(&self) -> bool {
        self.iterations < self.max_iterations
    }

    fn to_outputs(&self, success: bool) -> Value {
        let mut outputs = json!({
            "success": success,
            "items": self.items,
            "iterations": self.iterations,
        });
        if let Some(error) = &self.condition_error {
            outputs["error"] = Value::String(error.clone());
        }
        outputs
    }
}

/// Runs `step` once per item of its loop collection.
///
/// The loop frame is always cleared from `context` before returning.
pub(crate) async fn run_step_looping(
    step: &StepSpec,
    loop_spec: &LoopSpec,
    kind: &StepKind,
    context: &mut ExecutionContext,
    environment: &ExecutorEnvironment<'_>,
) -> Result<Value, StepExecutionError> {
    let collection = resolve_loop_input(loop_spec, context, environment)?;
    let separator = loop_spec
        .separator
        .as_deref()
        .unwrap_or(environment.config.loop_separator.as_str());
    let items = collection_items(collection, separator)?;

    let max_iterations = environment.config.effective_max_iterations(loop_spec.max_iterations);
    let failure_condition = crate::condition_syntax::normalize_optional_condition_expression(
        loop_spec.failure_condition.as_deref(),
    );
    let mut state = LoopState::new(max_iterations, failure_condition);

    info!(
        step = %step.id,
        collection_len = items.len(),
        max_iterations,
        has_failure_condition = state.failure_condition.is_some(),
        "loop started"
    );

    let success = iterate(step, kind, items, &mut state, context, environment).await;
    context.set_loop_frame(None);

    if success {
        info!(step = %step.id, iterations = state.iterations, "loop finished");
    } else {
        warn!(step = %step.id, iterations = state.iterations, "loop stopped early");
    }
    Ok(state.to_outputs(success))
}

async fn iterate(
    step: &StepSpec,
    kind: &StepKind,
    items: Vec<Value>,
    state: &mut LoopState,
    context: &mut ExecutionContext,
    environment: &ExecutorEnvironment<'_>,
) -> bool {
    let collection_len = items.len();
    for (index, item) in items.into_iter().enumerate() {
        if !state.has_capacity() {
            warn!(
                step = %step.id,
                iterations = state.iterations,
                remaining = collection_len - index,
                "loop guard tripped; stopping"
            );
            break;
        }
        state.iterations += 1;
        state.current_item = item;

        context.set_loop_frame(Some(LoopFrame {
            current_item: state.current_item.clone(),
            index,
            items: state.items.clone(),
            output: Value::Null,
        }));

        let output = match run_step_once(step, kind, context, environment).await {
            Ok(outputs) => outputs,
            Err(error) => {
                warn!(step = %step.id, index, error = %error, "loop iteration failed");
                failure_outputs(&error)
            }
        };
        let iteration_succeeded = reports_success(&output);
        state.items.push(output.clone());

        if !iteration_succeeded {
            return false;
        }

        if let Some(condition) = state.failure_condition.clone() {
            context.set_loop_frame(Some(LoopFrame {
                current_item: state.current_item.clone(),
                index,
                items: state.items.clone(),
                output,
            }));
            match environment.resolver.eval_condition(&condition, context) {
                Ok(true) => {
                    info!(step = %step.id, index, "loop failure condition met");
                    return false;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(step = %step.id, index, error = %error, "loop failure condition could not be evaluated");
                    state.condition_error = Some(format!("loop failure condition could not be evaluated: {error}"));
                    return false;
                }
            }
        }
    }
    true
}

fn resolve_loop_input(
    loop_spec: &LoopSpec,
    context: &ExecutionContext,
    environment: &ExecutorEnvironment<'_>,
) -> Result<Value, StepInputError> {
    if let Value::String(raw) = &loop_spec.input
        && let Some(expression) = single_template_expression(raw)
    {
        return environment
            .resolver
            .resolve(expression, context)
            .map_err(|source| StepInputError::Unresolved {
                field: "loop.input".to_string(),
                source,
            });
    }
    Ok(environment.resolver.resolve_value(&loop_spec.input, context))
}

/// Turns a resolved loop input into the iteration collection.
///
/// Arrays iterate as-is. Strings are split on `separator`, trimmed, and empty pieces
/// dropped; an empty string is an empty collection.
pub(crate) fn collection_items(collection: Value, separator: &str) -> Result<Vec<Value>, StepInputError> {
    match collection {
        Value::Array(items) => Ok(items),
        Value::String(text) => {
            if separator.is_empty() {
                return Ok(if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![Value::String(text.trim().to_string())]
                });
            }
            Ok(text
                .split(separator)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect())
        }
        other => Err(StepInputError::InvalidLoopInput {
            found: json_type_name(&other).to_string(),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
