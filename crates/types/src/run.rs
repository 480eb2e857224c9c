//! Run results returned by the runner and persisted as automation logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{StepId, TenantId};

/// Lifecycle state of an automation run.
///
/// `Pending` and `Running` are transient; a returned [`RunResult`] always carries
/// one of the terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Stopped)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Success)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Stopped)
        )
    }
}

/// Outcome of a single step within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunStatus {
    Success,
    Failed,
    /// The step failed and its halt policy stopped the run.
    Stopped,
}

/// Recorded result of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRunResult {
    /// Step name from the definition.
    pub id: String,
    /// Step kind.
    pub step_id: StepId,
    pub status: StepRunStatus,
    /// Outputs merged into the execution context; always carries a `success` flag.
    pub outputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Terminal result of an automation run.
///
/// Serializes to the persisted automation log layout; `steps` keeps execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub automation_id: String,
    pub tenant_id: TenantId,
    pub status: RunStatus,
    #[serde(default)]
    pub steps: Vec<StepRunResult>,
    /// Trigger payload the run started from.
    pub trigger: Value,
    /// Run-level error, set for quota rejections and engine faults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn step(&self, step_identifier: &str) -> Option<&StepRunResult> {
        self.steps.iter().find(|step| step.id == step_identifier)
    }

    /// Outputs recorded for a step, or `Value::Null` when the step never ran.
    pub fn outputs_of(&self, step_identifier: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.step(step_identifier).map(|step| &step.outputs).unwrap_or(&NULL)
    }
}
