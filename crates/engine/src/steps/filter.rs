//! Compares two values and reports whether the run should continue.
//!
//! A filter that evaluates to false yields `{ success: false }`. The filter kind halts
//! on failure by default, so a false result stops the run unless the step overrides
//! `halt_on_failure`.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::DateTime;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::StepId;

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::{error::StepExecutionError, resolve::format_json_value};

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterCondition {
    #[default]
    Equal,
    NotEqual,
    LargerThan,
    LessThan,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilterInputs {
    #[serde(default)]
    #[schemars(description = "Reference value, usually a binding.")]
    pub field: Value,
    #[serde(default)]
    pub condition: FilterCondition,
    #[serde(default)]
    #[schemars(description = "Value the field is compared against.")]
    pub value: Value,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilterOutputs {
    pub success: bool,
    pub result: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterStep;

#[async_trait]
impl StepCapability for FilterStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::Filter,
            name: "Condition",
            description: "Stops the run unless the condition holds",
            family: StepFamily::Logic,
            internal: true,
            can_loop: false,
            halts_on_failure: true,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<FilterInputs, FilterOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, _step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: FilterInputs = parse_inputs(StepId::Filter, inputs)?;
        let result = evaluate_filter(inputs.condition, &inputs.field, &inputs.value);
        to_outputs(&FilterOutputs { success: result, result })
    }
}

pub(crate) fn evaluate_filter(condition: FilterCondition, field: &Value, value: &Value) -> bool {
    match condition {
        FilterCondition::Equal => loosely_equal(field, value),
        FilterCondition::NotEqual => !loosely_equal(field, value),
        FilterCondition::LargerThan => compare_values(field, value) == Some(Ordering::Greater),
        FilterCondition::LessThan => compare_values(field, value) == Some(Ordering::Less),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    if let (Some(left_number), Some(right_number)) = (as_number(left), as_number(right)) {
        return left_number == right_number;
    }
    format_json_value(left) == format_json_value(right)
}

/// Orders numbers numerically, RFC 3339 timestamps chronologically and anything else as text.
fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(left_number), Some(right_number)) = (as_number(left), as_number(right)) {
        return left_number.partial_cmp(&right_number);
    }
    if let (Value::String(left_text), Value::String(right_text)) = (left, right)
        && let (Ok(left_time), Ok(right_time)) = (DateTime::parse_from_rfc3339(left_text), DateTime::parse_from_rfc3339(right_text))
    {
        return Some(left_time.cmp(&right_time));
    }
    if left.is_null() || right.is_null() {
        return None;
    }
    Some(format_json_value(left).cmp(&format_json_value(right)))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::TenantId;

    use crate::{
        context::ExecutionContext,
        steps::{StepServices, test_support::run_kind},
    };

    #[test]
    fn numeric_strings_compare_as_numbers() {
        assert!(evaluate_filter(FilterCondition::LargerThan, &json!("10"), &json!(9)));
        assert!(evaluate_filter(FilterCondition::Equal, &json!("2.0"), &json!(2)));
        assert!(evaluate_filter(FilterCondition::LessThan, &json!(-1), &json!("0")));
    }

    #[test]
    fn timestamps_compare_chronologically() {
        assert!(evaluate_filter(
            FilterCondition::LessThan,
            &json!("2026-01-01T00:00:00Z"),
            &json!("2026-01-01T01:00:00+00:00")
        ));
    }

    #[test]
    fn null_is_never_ordered() {
        assert!(!evaluate_filter(FilterCondition::LargerThan, &Value::Null, &json!(1)));
        assert!(!evaluate_filter(FilterCondition::LessThan, &Value::Null, &json!(1)));
        assert!(evaluate_filter(FilterCondition::NotEqual, &Value::Null, &json!(1)));
    }

    #[tokio::test]
    async fn false_filter_reports_failure() {
        let execution = ExecutionContext::new(TenantId::new("t"), json!({}));
        let outputs = run_kind(
            StepId::Filter,
            json!({"field": "draft", "condition": "EQUAL", "value": "paid"}),
            &execution,
            &StepServices::in_memory(),
        )
        .await
        .expect("filter runs");
        assert_eq!(outputs, json!({"success": false, "result": false}));
    }
}
