//! Error taxonomy for automation execution.
//!
//! Binding, input and execution errors are step-local: the executor turns them into
//! `{ success: false, error }` outputs. Quota rejections become a `FAILED` run before any
//! step executes. Only [`EngineFault`] escapes a run, wrapped in [`RunFault`].

use stepwise_types::{RunResult, RunStatus, StepId, TenantId};
use thiserror::Error;

use crate::{quota::QuotaResource, script::ScriptError, store::StoreError};

/// Failure while resolving a `${{ ... }}` binding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BindingResolutionError {
    #[error("script binding is not valid base64: {reason}")]
    InvalidScriptEncoding { reason: String },
    #[error("malformed script binding: {reason}")]
    MalformedScriptBinding { reason: String },
    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Inputs that cannot satisfy the step's input schema.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepInputError {
    #[error("required input '{field}' is missing")]
    MissingRequired { field: String },
    #[error("required input '{field}' could not be resolved: {source}")]
    Unresolved {
        field: String,
        #[source]
        source: BindingResolutionError,
    },
    #[error("invalid inputs for {step_id}: {reason}")]
    Invalid { step_id: StepId, reason: String },
    #[error("loop input must resolve to an array or a delimited string, got {found}")]
    InvalidLoopInput { found: String },
}

/// Failure raised while a step kind runs.
#[derive(Debug, Error)]
pub enum StepExecutionError {
    #[error(transparent)]
    Input(#[from] StepInputError),
    #[error("step timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("webhook request failed: {message}")]
    Webhook { message: String },
    #[error("{message}")]
    Failed { message: String },
}

/// Tenant exhausted its quota for a resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("quota exceeded for tenant {tenant_id} on {resource}")]
pub struct QuotaExceededError {
    pub tenant_id: TenantId,
    pub resource: QuotaResource,
}

/// Unexpected engine-level failure, distinct from a step reporting `success: false`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineFault {
    #[error("step kind {step_id} is not registered")]
    UnregisteredStep { step_id: StepId },
    #[error("invalid automation definition: {reason}")]
    InvalidDefinition { reason: String },
    #[error("automation {automation_id} belongs to tenant {owner}, not {requested}")]
    TenantMismatch {
        automation_id: String,
        owner: TenantId,
        requested: TenantId,
    },
    #[error("illegal run transition from {from:?} to {to:?}")]
    IllegalTransition { from: RunStatus, to: RunStatus },
    #[error("execution context invariant violated: {reason}")]
    ContextInvariant { reason: String },
}

/// Engine fault together with the partial result of the run it aborted.
#[derive(Debug, Clone, Error)]
#[error("run {} aborted by engine fault: {fault}", .run.run_id)]
pub struct RunFault {
    pub fault: EngineFault,
    pub run: Box<RunResult>,
}
