//! # Stepwise Engine
//!
//! The Stepwise Engine executes tenant-authored automations: an ordered list of typed
//! steps started by a trigger. It resolves data bindings between steps, iterates steps
//! over collections, enforces usage quotas and emits lifecycle events for every run.
//!
//! ## Key Features
//!
//! - **Binding Resolution**: `${{ ... }}` lookups into the trigger, earlier steps, the
//!   active loop and tenant environment, plus sandboxed script bindings
//! - **Step Registry**: closed set of built-in step kinds with JSON Schema descriptors
//! - **Bounded Loops**: per-step iteration with failure conditions and a hard ceiling
//! - **Tenant Isolation**: storage, quotas and events are always keyed by tenant
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use stepwise_engine::{
//!     AutomationRunner, EngineConfig, InMemoryQuotaGate, StepServices, TracingEventPublisher,
//! };
//! use stepwise_types::{AutomationDefinition, RunStatus, StepId, StepSpec, TenantId, TriggerEvent, TriggerSpec};
//!
//! # tokio::runtime::Runtime::new()?.block_on(async {
//! let runner = AutomationRunner::new(
//!     StepServices::in_memory(),
//!     Arc::new(InMemoryQuotaGate::unlimited()),
//!     Arc::new(TracingEventPublisher),
//!     EngineConfig::default(),
//! );
//! let definition = AutomationDefinition {
//!     id: "au_greet".into(),
//!     tenant_id: TenantId::new("tenant_a"),
//!     name: None,
//!     trigger: TriggerSpec { event: TriggerEvent::Webhook, filter: Default::default() },
//!     steps: vec![StepSpec::new("greet", StepId::Collect).with_input("collection", json!("hi ${{ trigger.name }}"))],
//! };
//!
//! let run = runner.execute(&definition, json!({"name": "ada"}), &TenantId::new("tenant_a")).await?;
//! assert_eq!(run.status, RunStatus::Success);
//! assert_eq!(run.outputs_of("greet")["value"], "hi ada");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`runner`**: run lifecycle, halt policy, events and quota usage
//! - **`executor`**: single-step execution and the loop controller
//! - **`resolve`** / **`templates`**: binding parsing, lookup and condition evaluation
//! - **`steps`**: step capability trait, registry and built-in kinds
//! - **`store`**, **`quota`**, **`events`**, **`script`**: collaborator traits and
//!   in-memory implementations
//! - **`definition`**: parsing, storage and validation of definitions
//! - **`config`**: engine configuration loading

pub mod condition_syntax;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod quota;
pub mod resolve;
pub mod runner;
pub mod script;
pub mod steps;
pub mod store;
pub mod templates;

// Re-export commonly used types for convenience
pub use config::{EngineConfig, load_config, load_config_from_path};
pub use context::{ExecutionContext, LoopFrame};
pub use definition::{DefinitionWarning, load_automation, parse_automation_file, save_automation, validate_definition};
pub use error::{BindingResolutionError, EngineFault, QuotaExceededError, RunFault, StepExecutionError, StepInputError};
pub use events::{ChannelEventPublisher, EventPublisher, PublishError, RecordingEventPublisher, TracingEventPublisher};
pub use executor::{ExecutorEnvironment, StepOutcome, execute_step};
pub use quota::{InMemoryQuotaGate, QuotaError, QuotaGate, QuotaResource};
pub use resolve::{BindingResolver, ResolvedInputs};
pub use runner::AutomationRunner;
pub use script::{RhaiScriptRunner, ScriptError, ScriptLimits, ScriptRunner};
pub use steps::{StepCapability, StepCatalogEntry, StepDescriptor, StepKind, StepRegistry, StepServices};
pub use store::{Document, DocumentStore, InMemoryDocumentStore, RangeQuery, StoreError};
