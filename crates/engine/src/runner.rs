//! Automation runner: admits a run, executes its steps in order and reports the result.
//!
//! A run moves `PENDING → RUNNING → {SUCCESS, FAILED, STOPPED}`. Admission checks the
//! owning tenant, the trigger payload, the quota gate and the definition itself. Once
//! admitted, every step executes strictly in definition order and its outputs are
//! recorded in the run's [`ExecutionContext`] before the next step starts.
//!
//! Step failures never abort the process: they are recorded with the step, and only a
//! step whose halt policy applies stops the run. Engine faults end the run as `FAILED`
//! and are returned as [`RunFault`] together with the partial result.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use stepwise_types::{
    AutomationDefinition, EventKind, LifecycleEvent, RunResult, RunStatus, StepRunResult, StepRunStatus, TenantId,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::EngineConfig,
    context::ExecutionContext,
    definition::{normalize_trigger_payload, validate_definition},
    error::{EngineFault, QuotaExceededError, RunFault},
    events::EventPublisher,
    executor::{ExecutorEnvironment, StepOutcome, execute_step},
    quota::{QuotaGate, QuotaResource},
    resolve::BindingResolver,
    steps::{StepRegistry, StepServices},
    store::Document,
};

/// Executes automation definitions against shared collaborators.
///
/// The runner holds no per-run state; concurrent runs each own their context.
pub struct AutomationRunner {
    registry: Arc<StepRegistry>,
    resolver: BindingResolver,
    services: StepServices,
    quota_gate: Arc<dyn QuotaGate>,
    event_publisher: Arc<dyn EventPublisher>,
    config: EngineConfig,
    tenant_environments: HashMap<TenantId, IndexMap<String, String>>,
}

impl AutomationRunner {
    pub fn new(
        services: StepServices,
        quota_gate: Arc<dyn QuotaGate>,
        event_publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        let resolver = BindingResolver::new(services.scripts.clone(), config.script_timeout());
        Self {
            registry: Arc::new(StepRegistry::builtin()),
            resolver,
            services,
            quota_gate,
            event_publisher,
            config,
            tenant_environments: HashMap::new(),
        }
    }

    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Environment variables exposed to a tenant's runs under `env`.
    pub fn with_tenant_environment(mut self, tenant_id: TenantId, environment_variables: IndexMap<String, String>) -> Self {
        self.tenant_environments.insert(tenant_id, environment_variables);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `definition` for `tenant_id` with the given trigger payload.
    ///
    /// Quota rejections and invalid trigger payloads return `Ok` with a `FAILED` result
    /// and no steps. Engine faults return `Err` carrying the partial result.
    pub async fn execute(
        &self,
        definition: &AutomationDefinition,
        trigger_payload: Value,
        tenant_id: &TenantId,
    ) -> Result<RunResult, RunFault> {
        let definition = definition.clone();
        let started_at = Utc::now();
        let mut run = RunResult {
            run_id: Uuid::new_v4().to_string(),
            automation_id: definition.id.clone(),
            tenant_id: tenant_id.clone(),
            status: RunStatus::Pending,
            steps: Vec::new(),
            trigger: trigger_payload.clone(),
            error: None,
            started_at,
            finished_at: started_at,
        };

        if &definition.tenant_id != tenant_id {
            let fault = EngineFault::TenantMismatch {
                automation_id: definition.id.clone(),
                owner: definition.tenant_id.clone(),
                requested: tenant_id.clone(),
            };
            return Err(refuse_with_fault(run, fault));
        }

        let Some(trigger) = normalize_trigger_payload(trigger_payload) else {
            return self
                .reject(run, "trigger payload must be a JSON object".to_string())
                .await;
        };
        run.trigger = trigger.clone();

        match self.quota_gate.pre_check(tenant_id, QuotaResource::AutomationRuns).await {
            Ok(true) => {}
            Ok(false) => {
                let reason = QuotaExceededError {
                    tenant_id: tenant_id.clone(),
                    resource: QuotaResource::AutomationRuns,
                }
                .to_string();
                return self.reject(run, reason).await;
            }
            Err(quota_error) => {
                warn!(tenant_id = %tenant_id, error = %quota_error, "quota pre-check failed; rejecting run");
                return self.reject(run, format!("quota pre-check failed: {quota_error}")).await;
            }
        }

        let warnings = match validate_definition(&definition, &self.registry) {
            Ok(warnings) => warnings,
            Err(fault) => return Err(refuse_with_fault(run, fault)),
        };
        for warning in &warnings {
            warn!(
                automation_id = %definition.id,
                step = %warning.step,
                source_path = %warning.source_path,
                "{}",
                warning.message
            );
        }

        if let Err(fault) = transition(&mut run, RunStatus::Running) {
            return Err(refuse_with_fault(run, fault));
        }
        info!(
            tenant_id = %tenant_id,
            automation_id = %definition.id,
            run_id = %run.run_id,
            step_count = definition.steps.len(),
            "run started"
        );
        self.publish(
            LifecycleEvent::new(EventKind::RunCreated, tenant_id.clone(), &definition.id, &run.run_id)
                .with_property("step_count", definition.steps.len())
                .with_property("trigger_event", serde_json::to_value(definition.trigger.event).unwrap_or_default()),
        )
        .await;

        let environment_variables = self.tenant_environments.get(tenant_id).cloned().unwrap_or_default();
        let mut context = ExecutionContext::new(tenant_id.clone(), trigger).with_environment(environment_variables);
        let run_id = run.run_id.clone();
        let environment = ExecutorEnvironment {
            resolver: &self.resolver,
            services: &self.services,
            config: &self.config,
            tenant_id,
            run_id: &run_id,
        };

        let step_result = self.run_steps(&definition, &mut run, &mut context, &environment).await;
        let (next_status, mut fault) = match step_result {
            Ok(status) => (status, None),
            Err(fault) => (RunStatus::Failed, Some(fault)),
        };
        if let Err(transition_fault) = transition(&mut run, next_status) {
            run.status = RunStatus::Failed;
            fault.get_or_insert(transition_fault);
        }
        if let Some(fault) = &fault {
            run.error = Some(fault.to_string());
            error!(
                tenant_id = %tenant_id,
                automation_id = %definition.id,
                run_id = %run.run_id,
                completed_steps = run.steps.len(),
                fault = %fault,
                "run aborted by engine fault"
            );
        }
        run.finished_at = Utc::now();

        self.finish(&run).await;

        match fault {
            Some(fault) => Err(RunFault {
                fault,
                run: Box::new(run),
            }),
            None => Ok(run),
        }
    }

    async fn run_steps(
        &self,
        definition: &AutomationDefinition,
        run: &mut RunResult,
        context: &mut ExecutionContext,
        environment: &ExecutorEnvironment<'_>,
    ) -> Result<RunStatus, EngineFault> {
        for (index, step) in definition.steps.iter().enumerate() {
            let kind = self.registry.resolve(step.step_id)?;
            let descriptor = kind.capability().descriptor();

            let outcome = execute_step(step, kind, context, environment).await;
            context.record_step_output(&step.id, outcome.outputs.clone())?;

            let halts_run = step.halt_on_failure.unwrap_or(descriptor.halts_on_failure);
            let status = match (outcome.success, halts_run) {
                (true, _) => StepRunStatus::Success,
                (false, true) => StepRunStatus::Stopped,
                (false, false) => StepRunStatus::Failed,
            };
            self.publish(
                LifecycleEvent::new(EventKind::StepCompleted, run.tenant_id.clone(), &run.automation_id, &run.run_id)
                    .with_property("step", step.id.as_str())
                    .with_property("step_id", step.step_id.as_str())
                    .with_property("position", index + 1)
                    .with_property("status", serde_json::to_value(status).unwrap_or_default())
                    .with_property("internal", descriptor.internal)
                    .with_property("duration_ms", outcome.duration_ms()),
            )
            .await;
            run.steps.push(step_run_result(outcome, status));

            if status == StepRunStatus::Stopped {
                info!(run_id = %run.run_id, step = %step.id, "step failure halted the run");
                run.error = Some(format!("step '{}' failed and halted the run", step.id));
                return Ok(RunStatus::Stopped);
            }
        }
        Ok(RunStatus::Success)
    }

    async fn reject(&self, mut run: RunResult, reason: String) -> Result<RunResult, RunFault> {
        if let Err(fault) = transition(&mut run, RunStatus::Failed) {
            return Err(refuse_with_fault(run, fault));
        }
        warn!(
            tenant_id = %run.tenant_id,
            automation_id = %run.automation_id,
            run_id = %run.run_id,
            reason = %reason,
            "run rejected"
        );
        self.publish(
            LifecycleEvent::new(EventKind::RunRejected, run.tenant_id.clone(), &run.automation_id, &run.run_id)
                .with_property("reason", reason.as_str()),
        )
        .await;
        run.error = Some(reason);
        run.finished_at = Utc::now();
        Ok(run)
    }

    /// Terminal hooks of an admitted run. Failures are logged and never change the result.
    async fn finish(&self, run: &RunResult) {
        let duration_ms = (run.finished_at - run.started_at).num_milliseconds();
        info!(
            run_id = %run.run_id,
            status = ?run.status,
            steps = run.steps.len(),
            duration_ms,
            "run finished"
        );
        let mut finished = LifecycleEvent::new(EventKind::RunFinished, run.tenant_id.clone(), &run.automation_id, &run.run_id)
            .with_property("status", serde_json::to_value(run.status).unwrap_or_default())
            .with_property("steps_completed", run.steps.len())
            .with_property("duration_ms", duration_ms);
        if let Some(run_error) = &run.error {
            finished = finished.with_property("error", run_error.as_str());
        }
        self.publish(finished).await;

        if let Err(quota_error) = self
            .quota_gate
            .record_usage(&run.tenant_id, QuotaResource::AutomationRuns, 1)
            .await
        {
            warn!(run_id = %run.run_id, error = %quota_error, "failed to record run usage");
        }

        if self.config.persist_run_logs {
            self.persist_run_log(run).await;
        }
    }

    async fn persist_run_log(&self, run: &RunResult) {
        let body = match serde_json::to_value(run) {
            Ok(body) => body,
            Err(serialize_error) => {
                warn!(run_id = %run.run_id, error = %serialize_error, "failed to serialize run log");
                return;
            }
        };
        let document = Document::new(run_log_document_id(&run.automation_id, &run.run_id), body);
        if let Err(store_error) = self.services.documents.put(&run.tenant_id, document).await {
            warn!(run_id = %run.run_id, error = %store_error, "failed to persist run log");
        }
    }

    async fn publish(&self, event: LifecycleEvent) {
        let kind = event.kind;
        let run_id = event.run_id.clone();
        if let Err(publish_error) = self.event_publisher.publish(event).await {
            warn!(run_id = %run_id, kind = ?kind, error = %publish_error, "failed to publish lifecycle event");
        }
    }
}

/// Identifier of the automation log document written for a finished run.
pub fn run_log_document_id(automation_id: &str, run_id: &str) -> String {
    format!("log_{automation_id}_{run_id}")
}

fn transition(run: &mut RunResult, next: RunStatus) -> Result<(), EngineFault> {
    if !run.status.can_transition_to(next) {
        return Err(EngineFault::IllegalTransition {
            from: run.status,
            to: next,
        });
    }
    run.status = next;
    Ok(())
}

/// Ends a run that was never admitted because of an engine fault.
fn refuse_with_fault(mut run: RunResult, fault: EngineFault) -> RunFault {
    error!(
        tenant_id = %run.tenant_id,
        automation_id = %run.automation_id,
        run_id = %run.run_id,
        fault = %fault,
        "run refused by engine fault"
    );
    run.status = RunStatus::Failed;
    run.error = Some(fault.to_string());
    run.finished_at = Utc::now();
    RunFault {
        fault,
        run: Box::new(run),
    }
}

fn step_run_result(outcome: StepOutcome, status: StepRunStatus) -> StepRunResult {
    StepRunResult {
        id: outcome.step_identifier,
        step_id: outcome.step_id,
        status,
        outputs: outcome.outputs,
        error: outcome.error,
        started_at: outcome.started_at,
        finished_at: outcome.finished_at,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_types::{StepId, StepSpec, TriggerEvent, TriggerSpec};

    use super::*;
    use crate::{
        events::RecordingEventPublisher,
        quota::InMemoryQuotaGate,
        store::{DocumentStore, InMemoryDocumentStore},
    };

    fn definition(steps: Vec<StepSpec>) -> AutomationDefinition {
        AutomationDefinition {
            id: "au_unit".to_string(),
            tenant_id: TenantId::new("tenant_a"),
            name: None,
            trigger: TriggerSpec {
                event: TriggerEvent::Webhook,
                filter: Default::default(),
            },
            steps,
        }
    }

    fn runner_with(config: EngineConfig, services: StepServices) -> AutomationRunner {
        AutomationRunner::new(
            services,
            Arc::new(InMemoryQuotaGate::unlimited()),
            Arc::new(RecordingEventPublisher::new()),
            config,
        )
    }

    #[test]
    fn transitions_are_checked() {
        let now = Utc::now();
        let mut run = RunResult {
            run_id: "run-1".to_string(),
            automation_id: "au".to_string(),
            tenant_id: TenantId::new("t"),
            status: RunStatus::Pending,
            steps: Vec::new(),
            trigger: json!({}),
            error: None,
            started_at: now,
            finished_at: now,
        };
        assert_eq!(
            transition(&mut run, RunStatus::Success),
            Err(EngineFault::IllegalTransition {
                from: RunStatus::Pending,
                to: RunStatus::Success
            })
        );
        transition(&mut run, RunStatus::Running).expect("pending to running");
        transition(&mut run, RunStatus::Stopped).expect("running to stopped");
        assert!(transition(&mut run, RunStatus::Running).is_err());
    }

    #[tokio::test]
    async fn halt_override_lets_a_failed_filter_continue() {
        let runner = runner_with(EngineConfig::default(), StepServices::in_memory());
        let mut gate = StepSpec::new("gate", StepId::Filter)
            .with_input("field", json!("${{ trigger.kind }}"))
            .with_input("value", json!("order"));
        gate.halt_on_failure = Some(false);
        let definition = definition(vec![
            gate,
            StepSpec::new("after", StepId::Collect).with_input("collection", json!("ran")),
        ]);

        let run = runner
            .execute(&definition, json!({"kind": "refund"}), &TenantId::new("tenant_a"))
            .await
            .expect("run completes");
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.steps[0].status, StepRunStatus::Failed);
        assert_eq!(run.outputs_of("after")["value"], json!("ran"));
    }

    #[tokio::test]
    async fn halt_override_stops_on_an_ordinary_step() {
        let runner = runner_with(EngineConfig::default(), StepServices::in_memory());
        let mut log = StepSpec::new("log", StepId::ServerLog);
        log.halt_on_failure = Some(true);
        let definition = definition(vec![log, StepSpec::new("never", StepId::Collect).with_input("collection", json!(1))]);

        let run = runner
            .execute(&definition, Value::Null, &TenantId::new("tenant_a"))
            .await
            .expect("run completes");
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].status, StepRunStatus::Stopped);
        assert_eq!(run.trigger, json!({}));
    }

    #[tokio::test]
    async fn finished_runs_are_persisted_when_enabled() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let services = StepServices::new(
            store.clone(),
            StepServices::in_memory().webhooks,
            StepServices::in_memory().scripts,
        );
        let config = EngineConfig {
            persist_run_logs: true,
            ..EngineConfig::default()
        };
        let runner = runner_with(config, services);
        let definition = definition(vec![StepSpec::new("echo", StepId::Collect).with_input("collection", json!(1))]);
        let tenant_id = TenantId::new("tenant_a");

        let run = runner.execute(&definition, json!({}), &tenant_id).await.expect("run completes");

        let stored = store
            .get(&tenant_id, &run_log_document_id("au_unit", &run.run_id))
            .await
            .expect("store read")
            .expect("run log stored");
        assert_eq!(stored.body["status"], json!("SUCCESS"));
        assert_eq!(stored.body["steps"][0]["id"], json!("echo"));
    }

    #[tokio::test]
    async fn non_object_trigger_is_rejected() {
        let runner = runner_with(EngineConfig::default(), StepServices::in_memory());
        let definition = definition(vec![StepSpec::new("echo", StepId::Collect).with_input("collection", json!(1))]);

        let run = runner
            .execute(&definition, json!([1, 2]), &TenantId::new("tenant_a"))
            .await
            .expect("rejection is not a fault");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.steps.is_empty());
        assert!(run.error.as_deref().is_some_and(|message| message.contains("JSON object")));
    }
}
