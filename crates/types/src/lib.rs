//! Shared data model for Stepwise automations.
//!
//! Definitions are authored by tenants and executed by `stepwise-engine`; run
//! results and lifecycle events flow back out to storage and audit sinks. All
//! types serialize with `serde`, enums use `SCREAMING_SNAKE_CASE` on the wire.

pub mod automation;
pub mod event;
pub mod run;
mod tenant;

pub use automation::{AutomationDefinition, LoopSpec, StepId, StepSpec, TriggerEvent, TriggerSpec};
pub use event::{EventKind, LifecycleEvent};
pub use run::{RunResult, RunStatus, StepRunResult, StepRunStatus};
pub use tenant::TenantId;
