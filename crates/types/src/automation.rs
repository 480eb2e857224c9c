//! Automation definitions as authored by tenants.
//!
//! A definition pairs a trigger with an ordered list of steps. Step order is the
//! execution order; inputs preserve authoring order (via `IndexMap`) so that
//! diagnostics and catalog output read the same way the author wrote them.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TenantId;

/// Declarative automation owned by a single tenant.
///
/// The engine never executes a definition in place: a run captures a clone of
/// the definition when it starts, so edits made while a run is in flight only
/// affect later runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationDefinition {
    /// Unique automation identifier within the tenant.
    pub id: String,
    /// Tenant that owns the automation.
    pub tenant_id: TenantId,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Trigger that starts runs of this automation.
    pub trigger: TriggerSpec,
    /// Ordered list of steps executed sequentially.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl AutomationDefinition {
    /// Returns the step with the given identifier, if present.
    pub fn step(&self, step_identifier: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|step| step.id == step_identifier)
    }

    /// Returns the 1-based position of a step within the definition.
    pub fn step_position(&self, step_identifier: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.id == step_identifier)
            .map(|index| index + 1)
    }
}

/// Trigger configuration. Matching happens upstream; the runner receives the matched payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSpec {
    pub event: TriggerEvent,
    /// Event-specific filter fields (table identifier, cron expression, ...).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub filter: IndexMap<String, Value>,
}

/// Kind of event that starts an automation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerEvent {
    RowCreated,
    RowUpdated,
    RowDeleted,
    Webhook,
    Cron,
    AppAction,
}

/// Single step of an automation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Unique step name within the automation. Outputs are published under it.
    pub id: String,
    /// Step kind dispatched through the registry.
    pub step_id: StepId,
    /// Input fields: literals or strings containing `${{ ... }}` bindings.
    #[serde(default)]
    pub inputs: IndexMap<String, Value>,
    /// Optional loop wrapper; only valid for kinds that can loop.
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub r#loop: Option<LoopSpec>,
    /// Overrides whether a failure of this step stops the whole run.
    ///
    /// When unset the kind default applies (filters halt, actions continue).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_on_failure: Option<bool>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, step_id: StepId) -> Self {
        Self {
            id: id.into(),
            step_id,
            inputs: IndexMap::new(),
            r#loop: None,
            halt_on_failure: None,
        }
    }

    /// Builder-style helper used by tests and the CLI fixtures.
    pub fn with_input(mut self, field: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(field.into(), value);
        self
    }

    pub fn with_loop(mut self, loop_spec: LoopSpec) -> Self {
        self.r#loop = Some(loop_spec);
        self
    }
}

/// Bounded iteration over a collection, wrapping a single step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoopSpec {
    /// Collection literal or binding. Arrays iterate item by item; strings are split on `separator`.
    pub input: Value,
    /// Separator used when `input` resolves to a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    /// Upper bound on iterations. Falls back to the engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Condition evaluated after each iteration; truthy stops the loop and fails it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,
}

/// Closed set of step kinds understood by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepId {
    Collect,
    ServerLog,
    Filter,
    Delay,
    CreateRow,
    UpdateRow,
    DeleteRow,
    QueryRows,
    ExecuteScript,
    OutgoingWebhook,
}

impl StepId {
    pub const ALL: [StepId; 10] = [
        StepId::Collect,
        StepId::ServerLog,
        StepId::Filter,
        StepId::Delay,
        StepId::CreateRow,
        StepId::UpdateRow,
        StepId::DeleteRow,
        StepId::QueryRows,
        StepId::ExecuteScript,
        StepId::OutgoingWebhook,
    ];

    /// Wire name of the step kind.
    pub fn as_str(self) -> &'static str {
        match self {
            StepId::Collect => "COLLECT",
            StepId::ServerLog => "SERVER_LOG",
            StepId::Filter => "FILTER",
            StepId::Delay => "DELAY",
            StepId::CreateRow => "CREATE_ROW",
            StepId::UpdateRow => "UPDATE_ROW",
            StepId::DeleteRow => "DELETE_ROW",
            StepId::QueryRows => "QUERY_ROWS",
            StepId::ExecuteScript => "EXECUTE_SCRIPT",
            StepId::OutgoingWebhook => "OUTGOING_WEBHOOK",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}
