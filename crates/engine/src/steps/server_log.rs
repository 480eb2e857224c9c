//! Writes a message to the server log.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::StepId;
use tracing::info;

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::error::StepExecutionError;

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerLogInputs {
    #[schemars(description = "Message to write to the log.")]
    pub text: String,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerLogOutputs {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerLogStep;

#[async_trait]
impl StepCapability for ServerLogStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::ServerLog,
            name: "Backend log",
            description: "Logs a message on the server",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<ServerLogInputs, ServerLogOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: ServerLogInputs = parse_inputs(StepId::ServerLog, inputs)?;
        let message = format!("Tenant {} - {}", step_context.tenant_id, inputs.text);
        info!(
            tenant_id = %step_context.tenant_id,
            run_id = step_context.run_id,
            step = step_context.step_identifier,
            "{message}"
        );
        to_outputs(&ServerLogOutputs { success: true, message })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_types::{StepId, TenantId};

    use crate::{
        context::ExecutionContext,
        steps::{StepServices, test_support::run_kind},
    };

    #[tokio::test]
    async fn message_is_prefixed_with_tenant() {
        let execution = ExecutionContext::new(TenantId::new("acme"), json!({}));
        let outputs = run_kind(StepId::ServerLog, json!({"text": "hello"}), &execution, &StepServices::in_memory())
            .await
            .expect("log runs");
        assert_eq!(outputs["message"], json!("Tenant acme - hello"));
        assert_eq!(outputs["success"], json!(true));
    }
}
