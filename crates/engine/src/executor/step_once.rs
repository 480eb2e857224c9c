//! Single-step execution helpers.

use serde_json::{Map, Value, json};
use stepwise_types::StepSpec;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    context::ExecutionContext,
    error::{StepExecutionError, StepInputError},
    script::ScriptError,
    steps::{StepContext, StepKind},
};

use super::ExecutorEnvironment;

/// Resolves a step's inputs against `context` and runs the step kind once.
///
/// Required inputs whose binding failed, or that resolved to nothing, turn into a
/// [`StepInputError`] before the kind runs. Returned outputs are normalized into an
/// object carrying a `success` flag.
pub(crate) async fn run_step_once(
    step: &StepSpec,
    kind: &StepKind,
    context: &ExecutionContext,
    environment: &ExecutorEnvironment<'_>,
) -> Result<Value, StepExecutionError> {
    let capability = kind.capability();
    let step_timeout = environment.config.step_timeout();
    let deadline = step_timeout.map(|limit| Instant::now() + limit);
    let timed_out = || StepExecutionError::TimedOut {
        timeout_ms: step_timeout.map_or(0, |limit| u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)),
    };

    let resolved = match step_timeout {
        Some(limit) => environment
            .resolver
            .with_script_timeout(limit)
            .resolve_inputs(&step.inputs, context),
        None => environment.resolver.resolve_inputs(&step.inputs, context),
    };
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        return Err(timed_out());
    }
    let schema = capability.schema();

    for field in schema.required_inputs() {
        if let Some(failure) = resolved.failure_for(field) {
            return Err(StepInputError::Unresolved {
                field: field.to_string(),
                source: failure.error.clone(),
            }
            .into());
        }
        if resolved.values.get(field).is_none_or(Value::is_null) {
            return Err(StepInputError::MissingRequired {
                field: field.to_string(),
            }
            .into());
        }
    }
    for failure in &resolved.failures {
        warn!(
            step = %step.id,
            field = %failure.field,
            source_path = %failure.source_path,
            error = %failure.error,
            "optional input binding failed; using null"
        );
    }

    let step_context = StepContext {
        tenant_id: environment.tenant_id,
        run_id: environment.run_id,
        step_identifier: &step.id,
        execution: context,
        services: environment.services,
        config: environment.config,
        deadline,
    };

    let invocation = capability.run(resolved.values, &step_context);
    let outputs = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, invocation).await {
            Ok(Err(StepExecutionError::Script(ScriptError::Timeout { .. }))) if Instant::now() >= deadline => {
                return Err(timed_out());
            }
            Ok(result) => result?,
            Err(_) => return Err(timed_out()),
        },
        None => invocation.await?,
    };
    debug!(step = %step.id, step_id = %step.step_id, "step invocation finished");
    Ok(normalize_outputs(outputs))
}

/// Ensures outputs are an object with a boolean `success` field.
pub(crate) fn normalize_outputs(outputs: Value) -> Value {
    match outputs {
        Value::Object(mut fields) => {
            if !matches!(fields.get("success"), Some(Value::Bool(_))) {
                let success = fields.get("success").map(crate::resolve::is_truthy).unwrap_or(true);
                fields.insert("success".to_string(), Value::Bool(success));
            }
            Value::Object(fields)
        }
        other => {
            let mut fields = Map::new();
            fields.insert("success".to_string(), Value::Bool(true));
            fields.insert("value".to_string(), other);
            Value::Object(fields)
        }
    }
}

/// Outputs recorded for a step that failed with an error.
pub(crate) fn failure_outputs(error: &StepExecutionError) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

pub(crate) fn reports_success(outputs: &Value) -> bool {
    outputs.get("success").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_types::{StepId, StepSpec, TenantId};

    use super::*;
    use crate::{
        config::EngineConfig, error::BindingResolutionError, resolve::BindingResolver, steps::StepServices,
        templates::encode_script_binding,
    };

    fn run_with<'a>(
        resolver: &'a BindingResolver,
        services: &'a StepServices,
        config: &'a EngineConfig,
        tenant_id: &'a TenantId,
    ) -> ExecutorEnvironment<'a> {
        ExecutorEnvironment {
            resolver,
            services,
            config,
            tenant_id,
            run_id: "run-1",
        }
    }

    #[tokio::test]
    async fn missing_required_input_is_an_input_error() {
        let tenant_id = TenantId::new("tenant_a");
        let context = ExecutionContext::new(tenant_id.clone(), json!({}));
        let (resolver, services, config) = (BindingResolver::default(), StepServices::in_memory(), EngineConfig::default());
        let step = StepSpec::new("log", StepId::ServerLog).with_input("text", json!("${{ trigger.absent }}"));

        let error = run_step_once(
            &step,
            &StepKind::builtin(StepId::ServerLog),
            &context,
            &run_with(&resolver, &services, &config, &tenant_id),
        )
        .await
        .expect_err("text resolves to null");
        assert!(matches!(
            error,
            StepExecutionError::Input(StepInputError::MissingRequired { ref field }) if field == "text"
        ));
        assert_eq!(failure_outputs(&error)["success"], json!(false));
    }

    #[tokio::test]
    async fn failed_script_binding_on_required_input_is_unresolved() {
        let tenant_id = TenantId::new("tenant_a");
        let context = ExecutionContext::new(tenant_id.clone(), json!({}));
        let (resolver, services, config) = (BindingResolver::default(), StepServices::in_memory(), EngineConfig::default());
        let step = StepSpec::new("log", StepId::ServerLog).with_input("text", json!(encode_script_binding("throw \"no\";")));

        let error = run_step_once(
            &step,
            &StepKind::builtin(StepId::ServerLog),
            &context,
            &run_with(&resolver, &services, &config, &tenant_id),
        )
        .await
        .expect_err("script fails");
        assert!(matches!(
            error,
            StepExecutionError::Input(StepInputError::Unresolved {
                source: BindingResolutionError::Script(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn step_timeout_applies_per_invocation() {
        let tenant_id = TenantId::new("tenant_a");
        let context = ExecutionContext::new(tenant_id.clone(), json!({}));
        let (resolver, services) = (BindingResolver::default(), StepServices::in_memory());
        let config = EngineConfig {
            step_timeout_ms: Some(20),
            ..EngineConfig::default()
        };
        let step = StepSpec::new("wait", StepId::Delay).with_input("time", json!(2_000));

        let error = run_step_once(
            &step,
            &StepKind::builtin(StepId::Delay),
            &context,
            &run_with(&resolver, &services, &config, &tenant_id),
        )
        .await
        .expect_err("delay exceeds the step timeout");
        assert!(matches!(error, StepExecutionError::TimedOut { timeout_ms: 20 }));
    }

    #[tokio::test]
    async fn step_timeout_cuts_scripts_shorter_than_their_own_limit() {
        let tenant_id = TenantId::new("tenant_a");
        let context = ExecutionContext::new(tenant_id.clone(), json!({}));
        let (resolver, services) = (BindingResolver::default(), StepServices::in_memory());
        let config = EngineConfig {
            step_timeout_ms: Some(20),
            script_timeout_ms: 1_000,
            ..EngineConfig::default()
        };
        let environment = run_with(&resolver, &services, &config, &tenant_id);

        let started_at = std::time::Instant::now();
        let script_step = StepSpec::new("spin", StepId::ExecuteScript).with_input("code", json!("loop { }"));
        let error = run_step_once(&script_step, &StepKind::builtin(StepId::ExecuteScript), &context, &environment)
            .await
            .expect_err("script step exceeds the step timeout");
        assert!(matches!(error, StepExecutionError::TimedOut { timeout_ms: 20 }));

        let binding_step =
            StepSpec::new("log", StepId::ServerLog).with_input("text", json!(encode_script_binding("loop { }")));
        let error = run_step_once(&binding_step, &StepKind::builtin(StepId::ServerLog), &context, &environment)
            .await
            .expect_err("script binding exceeds the step timeout");
        assert!(matches!(error, StepExecutionError::TimedOut { timeout_ms: 20 }));
        assert!(started_at.elapsed() < std::time::Duration::from_millis(900));
    }

    #[test]
    fn outputs_are_normalized_to_objects_with_success() {
        assert_eq!(normalize_outputs(json!(3)), json!({"success": true, "value": 3}));
        assert_eq!(normalize_outputs(json!({"a": 1})), json!({"a": 1, "success": true}));
        assert_eq!(normalize_outputs(json!({"success": 0})), json!({"success": false}));
        assert!(!reports_success(&json!({"success": false})));
    }
}
