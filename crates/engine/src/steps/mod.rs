//! Step registry and built-in step kinds.
//!
//! Every step kind implements [`StepCapability`]: a descriptor, JSON Schemas for its
//! inputs and outputs, and an async `run`. Kinds are collected in the closed
//! [`StepKind`] enum and looked up by [`StepId`] in a [`StepRegistry`].
//!
//! `run` receives resolved inputs and a shared reference to the execution context.
//! It cannot mutate the context; any side effect goes through the collaborators in
//! [`StepServices`].

mod collect;
mod delay;
mod execute_script;
mod filter;
mod outgoing_webhook;
mod rows;
mod server_log;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use stepwise_types::{StepId, TenantId};
use tokio::time::Instant;

pub use collect::CollectStep;
pub use delay::DelayStep;
pub use execute_script::ExecuteScriptStep;
pub use filter::{FilterCondition, FilterStep};
pub use outgoing_webhook::{HttpMethod, OutgoingWebhookStep, ReqwestWebhookClient, WebhookClient, WebhookRequest, WebhookResponse};
pub use rows::{CreateRowStep, DeleteRowStep, QueryRowsStep, UpdateRowStep};
pub use server_log::ServerLogStep;

use crate::{
    config::EngineConfig,
    context::ExecutionContext,
    error::{EngineFault, StepExecutionError, StepInputError},
    script::{RhaiScriptRunner, ScriptRunner},
    store::{DocumentStore, InMemoryDocumentStore},
};

/// Broad category of a step kind.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepFamily {
    /// Performs work against collaborators (storage, HTTP, scripts).
    Action,
    /// Shapes control flow or data without external effects.
    Logic,
}

/// Static metadata of a step kind.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepDescriptor {
    pub step_id: StepId,
    pub name: &'static str,
    pub description: &'static str,
    pub family: StepFamily,
    /// Engine-provided step that is not surfaced as a user-facing integration.
    pub internal: bool,
    /// The step may be wrapped in a loop.
    pub can_loop: bool,
    /// Default halt policy: a failure of this kind stops the run.
    pub halts_on_failure: bool,
}

/// JSON Schemas describing a step kind's inputs and outputs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepSchema {
    pub inputs: Value,
    pub outputs: Value,
}

impl StepSchema {
    pub fn of<Inputs: JsonSchema, Outputs: JsonSchema>() -> Self {
        Self {
            inputs: schemars::schema_for!(Inputs).to_value(),
            outputs: schemars::schema_for!(Outputs).to_value(),
        }
    }

    /// Input fields listed as required by the input schema.
    pub fn required_inputs(&self) -> Vec<&str> {
        self.inputs
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Collaborator handles available to step kinds.
#[derive(Clone)]
pub struct StepServices {
    pub documents: Arc<dyn DocumentStore>,
    pub webhooks: Arc<dyn WebhookClient>,
    pub scripts: Arc<dyn ScriptRunner>,
}

impl StepServices {
    pub fn new(documents: Arc<dyn DocumentStore>, webhooks: Arc<dyn WebhookClient>, scripts: Arc<dyn ScriptRunner>) -> Self {
        Self {
            documents,
            webhooks,
            scripts,
        }
    }

    /// In-memory storage, reqwest webhooks and the Rhai script runner.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(ReqwestWebhookClient::default()),
            Arc::new(RhaiScriptRunner::new()),
        )
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRunner>) -> Self {
        self.scripts = scripts;
        self
    }
}

/// Everything a step sees while it runs.
pub struct StepContext<'a> {
    pub tenant_id: &'a TenantId,
    pub run_id: &'a str,
    /// Name of the step being executed.
    pub step_identifier: &'a str,
    pub execution: &'a ExecutionContext,
    pub services: &'a StepServices,
    pub config: &'a EngineConfig,
    /// End of the invocation's time budget, when step timeouts are enabled.
    pub deadline: Option<Instant>,
}

impl StepContext<'_> {
    /// Script budget: the configured script timeout, cut short by the step deadline.
    pub fn script_timeout(&self) -> Duration {
        let configured = self.config.script_timeout();
        match self.deadline {
            Some(deadline) => configured.min(deadline.saturating_duration_since(Instant::now())),
            None => configured,
        }
    }
}

/// Common capability of every step kind.
#[async_trait]
pub trait StepCapability: Send + Sync {
    fn descriptor(&self) -> StepDescriptor;

    fn schema(&self) -> StepSchema;

    /// Executes the step. Outputs must be a JSON object carrying a `success` flag.
    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError>;
}

/// Closed set of step implementations, one variant per [`StepId`].
#[derive(Debug, Clone)]
pub enum StepKind {
    Collect(CollectStep),
    ServerLog(ServerLogStep),
    Filter(FilterStep),
    Delay(DelayStep),
    CreateRow(CreateRowStep),
    UpdateRow(UpdateRowStep),
    DeleteRow(DeleteRowStep),
    QueryRows(QueryRowsStep),
    ExecuteScript(ExecuteScriptStep),
    OutgoingWebhook(OutgoingWebhookStep),
}

impl StepKind {
    /// Built-in implementation for a step identifier.
    pub fn builtin(step_id: StepId) -> Self {
        match step_id {
            StepId::Collect => StepKind::Collect(CollectStep),
            StepId::ServerLog => StepKind::ServerLog(ServerLogStep),
            StepId::Filter => StepKind::Filter(FilterStep),
            StepId::Delay => StepKind::Delay(DelayStep),
            StepId::CreateRow => StepKind::CreateRow(CreateRowStep),
            StepId::UpdateRow => StepKind::UpdateRow(UpdateRowStep),
            StepId::DeleteRow => StepKind::DeleteRow(DeleteRowStep),
            StepId::QueryRows => StepKind::QueryRows(QueryRowsStep),
            StepId::ExecuteScript => StepKind::ExecuteScript(ExecuteScriptStep),
            StepId::OutgoingWebhook => StepKind::OutgoingWebhook(OutgoingWebhookStep),
        }
    }

    pub fn capability(&self) -> &dyn StepCapability {
        match self {
            StepKind::Collect(step) => step,
            StepKind::ServerLog(step) => step,
            StepKind::Filter(step) => step,
            StepKind::Delay(step) => step,
            StepKind::CreateRow(step) => step,
            StepKind::UpdateRow(step) => step,
            StepKind::DeleteRow(step) => step,
            StepKind::QueryRows(step) => step,
            StepKind::ExecuteScript(step) => step,
            StepKind::OutgoingWebhook(step) => step,
        }
    }

    pub fn step_id(&self) -> StepId {
        self.capability().descriptor().step_id
    }
}

/// Catalog entry combining descriptor and schema.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepCatalogEntry {
    #[serde(flatten)]
    pub descriptor: StepDescriptor,
    pub schema: StepSchema,
}

/// Lookup table from step identifier to implementation.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    entries: IndexMap<StepId, StepKind>,
}

impl StepRegistry {
    /// Registry containing every built-in step kind.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for step_id in StepId::ALL {
            registry.register(StepKind::builtin(step_id));
        }
        registry
    }

    pub fn register(&mut self, kind: StepKind) {
        self.entries.insert(kind.step_id(), kind);
    }

    pub fn get(&self, step_id: StepId) -> Option<&StepKind> {
        self.entries.get(&step_id)
    }

    /// Looks up a step kind; a miss is an engine fault.
    pub fn resolve(&self, step_id: StepId) -> Result<&StepKind, EngineFault> {
        self.get(step_id).ok_or(EngineFault::UnregisteredStep { step_id })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn catalog(&self) -> Vec<StepCatalogEntry> {
        self.entries
            .values()
            .map(|kind| {
                let capability = kind.capability();
                StepCatalogEntry {
                    descriptor: capability.descriptor(),
                    schema: capability.schema(),
                }
            })
            .collect()
    }
}

/// Deserializes resolved inputs into a kind's typed input struct.
pub(crate) fn parse_inputs<Inputs: DeserializeOwned>(step_id: StepId, inputs: Map<String, Value>) -> Result<Inputs, StepInputError> {
    serde_json::from_value(Value::Object(inputs)).map_err(|error| StepInputError::Invalid {
        step_id,
        reason: error.to_string(),
    })
}

/// Serializes a kind's typed output struct.
pub(crate) fn to_outputs<Outputs: Serialize>(outputs: &Outputs) -> Result<Value, StepExecutionError> {
    serde_json::to_value(outputs).map_err(|error| StepExecutionError::Failed {
        message: format!("failed to serialize step outputs: {error}"),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Runs a step kind against a context with default configuration.
    pub(crate) async fn run_kind(
        step_id: StepId,
        inputs: Value,
        execution: &ExecutionContext,
        services: &StepServices,
    ) -> Result<Value, StepExecutionError> {
        let config = EngineConfig::default();
        let step_context = StepContext {
            tenant_id: execution.tenant_id(),
            run_id: "run-test",
            step_identifier: "under_test",
            execution,
            services,
            config: &config,
            deadline: None,
        };
        let inputs = match inputs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        StepKind::builtin(step_id).capability().run(inputs, &step_context).await
    }
}
