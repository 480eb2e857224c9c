//! Step executor: resolves a step's inputs, runs it once or through the loop
//! controller, and reports an outcome for the runner to record.
//!
//! - `step_once` resolves bindings, enforces required inputs and the step timeout
//! - `loop_controller` iterates a step over a collection with bounded iterations
//! - Step errors become `{ success: false, error }` outputs and never escape
//!
//! The executor never writes step outputs into the context; the runner does that after
//! inspecting the outcome.

mod loop_controller;
mod step_once;
mod types;

use chrono::Utc;
use serde_json::Value;
use stepwise_types::StepSpec;
use tracing::{debug, warn};

pub use loop_controller::LoopState;
pub use types::{ExecutorEnvironment, StepOutcome};

use crate::{context::ExecutionContext, steps::StepKind};

use step_once::{failure_outputs, reports_success};

/// Executes one step against the run context.
///
/// `context` is borrowed mutably only to install and clear the loop frame; recorded
/// step outputs are left untouched.
pub async fn execute_step(
    step: &StepSpec,
    kind: &StepKind,
    context: &mut ExecutionContext,
    environment: &ExecutorEnvironment<'_>,
) -> StepOutcome {
    let started_at = Utc::now();
    debug!(step = %step.id, step_id = %step.step_id, looped = step.r#loop.is_some(), "step started");

    let result = match &step.r#loop {
        Some(loop_spec) => loop_controller::run_step_looping(step, loop_spec, kind, context, environment).await,
        None => step_once::run_step_once(step, kind, context, environment).await,
    };

    let (outputs, error) = match result {
        Ok(outputs) => {
            let reported = (!reports_success(&outputs))
                .then(|| outputs.get("error").and_then(Value::as_str).map(str::to_string))
                .flatten();
            (outputs, reported)
        }
        Err(error) => {
            warn!(step = %step.id, step_id = %step.step_id, error = %error, "step failed");
            (failure_outputs(&error), Some(error.to_string()))
        }
    };

    StepOutcome {
        step_identifier: step.id.clone(),
        step_id: step.step_id,
        success: reports_success(&outputs),
        outputs,
        error,
        started_at,
        finished_at: Utc::now(),
    }
}
