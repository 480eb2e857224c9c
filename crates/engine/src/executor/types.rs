//! Core executor data types.

use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_types::{StepId, TenantId};

use crate::{config::EngineConfig, resolve::BindingResolver, steps::StepServices};

/// Collaborators and settings shared by every step of one run.
#[derive(Clone, Copy)]
pub struct ExecutorEnvironment<'a> {
    pub resolver: &'a BindingResolver,
    pub services: &'a StepServices,
    pub config: &'a EngineConfig,
    pub tenant_id: &'a TenantId,
    pub run_id: &'a str,
}

/// Result of executing one step, looped or not.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Name of the step inside its definition.
    pub step_identifier: String,
    pub step_id: StepId,
    /// Outputs merged into the context; always an object carrying `success`.
    pub outputs: Value,
    pub success: bool,
    /// Error message when the step failed with an error rather than a `false` flag.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StepOutcome {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
