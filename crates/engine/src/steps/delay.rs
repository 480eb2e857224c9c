//! Pauses the run for a bounded amount of time.

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::{Map, Value};
use stepwise_types::StepId;
use tracing::debug;

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::error::StepExecutionError;

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DelayInputs {
    /// Accepts a number or a numeric string, since bindings spliced into text produce strings.
    #[serde(deserialize_with = "deserialize_milliseconds")]
    #[schemars(with = "u64", description = "Delay in milliseconds.")]
    pub time: u64,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DelayOutputs {
    pub success: bool,
    /// Milliseconds actually slept after clamping.
    pub slept_ms: u64,
}

fn deserialize_milliseconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| D::Error::custom("time must be a non-negative integer")),
        Value::String(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("time '{text}' is not a number of milliseconds"))),
        other => Err(D::Error::custom(format!("time must be a number, got {other}"))),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DelayStep;

#[async_trait]
impl StepCapability for DelayStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::Delay,
            name: "Delay",
            description: "Waits before continuing with the next step",
            family: StepFamily::Logic,
            internal: true,
            can_loop: false,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<DelayInputs, DelayOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: DelayInputs = parse_inputs(StepId::Delay, inputs)?;
        let requested = Duration::from_millis(inputs.time);
        let delay = requested.min(step_context.config.max_delay());
        debug!(step = step_context.step_identifier, requested_ms = inputs.time, "delay step sleeping");
        tokio::time::sleep(delay).await;
        to_outputs(&DelayOutputs {
            success: true,
            slept_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        })
    }
}
