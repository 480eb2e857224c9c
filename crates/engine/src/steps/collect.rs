//! Collects a value into the step outputs.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::StepId;

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::error::StepExecutionError;

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectInputs {
    #[schemars(description = "Value to collect. Usually a binding to an earlier step or the trigger.")]
    pub collection: Value,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectOutputs {
    pub success: bool,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectStep;

#[async_trait]
impl StepCapability for CollectStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::Collect,
            name: "Collect Data",
            description: "Collects a value so it can be returned from the run",
            family: StepFamily::Logic,
            internal: true,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<CollectInputs, CollectOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, _step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: CollectInputs = parse_inputs(StepId::Collect, inputs)?;
        to_outputs(&CollectOutputs {
            success: true,
            value: inputs.collection,
        })
    }
}
