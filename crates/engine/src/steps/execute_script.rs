//! Runs a user script in the sandbox and returns its value.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::StepId;
use tokio::task;

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::error::StepExecutionError;

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecuteScriptInputs {
    #[schemars(description = "Script source. The execution context is available as `context`.")]
    pub code: String,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecuteScriptOutputs {
    pub success: bool,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteScriptStep;

#[async_trait]
impl StepCapability for ExecuteScriptStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::ExecuteScript,
            name: "Script",
            description: "Runs a sandboxed script against the run context",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<ExecuteScriptInputs, ExecuteScriptOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: ExecuteScriptInputs = parse_inputs(StepId::ExecuteScript, inputs)?;
        let scripts = Arc::clone(&step_context.services.scripts);
        let context_json = step_context.execution.to_json();
        let timeout = step_context.script_timeout();
        let value = task::spawn_blocking(move || scripts.run(&inputs.code, &context_json, timeout))
            .await
            .map_err(|error| StepExecutionError::Failed {
                message: format!("script task did not complete: {error}"),
            })??;
        to_outputs(&ExecuteScriptOutputs { success: true, value })
    }
}
