//! Loading and validating automation definitions.
//!
//! Validation runs before a run is admitted. Structural problems (duplicate step names,
//! unknown kinds, loops on kinds that cannot loop, malformed failure conditions) are
//! engine faults. References to steps that do not exist or have not run yet are only
//! reported as warnings; at runtime they resolve to `null`.

use std::{collections::HashSet, fs, path::Path};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use stepwise_types::{AutomationDefinition, StepSpec, TenantId};
use tracing::debug;

use crate::{
    condition_syntax::{normalize_condition_expression, validate_condition_expression},
    error::EngineFault,
    steps::StepRegistry,
    store::{Document, DocumentStore},
    templates::{TemplateReference, collect_template_references, parse_step_reference_expression},
};

static STEP_IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("step identifier pattern is valid"));

/// Non-fatal finding produced while validating a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionWarning {
    /// Step whose inputs contain the reference.
    pub step: String,
    /// Location of the reference, e.g. `inputs.row.name` or `loop.input`.
    pub source_path: String,
    pub message: String,
}

/// Checks a definition against the registry.
///
/// Returns warnings for suspicious step references, or the first structural fault.
pub fn validate_definition(definition: &AutomationDefinition, registry: &StepRegistry) -> Result<Vec<DefinitionWarning>, EngineFault> {
    let mut seen_identifiers = HashSet::new();
    for step in &definition.steps {
        if !STEP_IDENTIFIER_PATTERN.is_match(&step.id) {
            return Err(invalid_definition(format!(
                "step identifier '{}' must contain only letters, digits, '-' or '_'",
                step.id
            )));
        }
        if !seen_identifiers.insert(step.id.as_str()) {
            return Err(invalid_definition(format!("step identifier '{}' is used more than once", step.id)));
        }

        let kind = registry.resolve(step.step_id)?;
        if let Some(loop_spec) = &step.r#loop {
            let descriptor = kind.capability().descriptor();
            if !descriptor.can_loop {
                return Err(invalid_definition(format!(
                    "step '{}' loops over {} which does not support loops",
                    step.id, step.step_id
                )));
            }
            if let Some(condition) = &loop_spec.failure_condition {
                let expression = normalize_condition_expression(condition);
                if !expression.is_empty() {
                    validate_condition_expression(&expression).map_err(|error| {
                        invalid_definition(format!("step '{}' has an invalid loop failure condition: {error}", step.id))
                    })?;
                }
            }
        }
    }

    let mut warnings = Vec::new();
    for (index, step) in definition.steps.iter().enumerate() {
        for reference in step_references(step) {
            if let Some(message) = reference_problem(definition, index + 1, &reference.expression) {
                warnings.push(DefinitionWarning {
                    step: step.id.clone(),
                    source_path: reference.source_path,
                    message,
                });
            }
        }
    }
    debug!(automation_id = %definition.id, warnings = warnings.len(), "definition validated");
    Ok(warnings)
}

fn invalid_definition(reason: String) -> EngineFault {
    EngineFault::InvalidDefinition { reason }
}

fn step_references(step: &StepSpec) -> Vec<TemplateReference> {
    let mut references = Vec::new();
    for (field, value) in &step.inputs {
        collect_template_references(value, &format!("inputs.{field}"), &mut references);
    }
    if let Some(loop_spec) = &step.r#loop {
        collect_template_references(&loop_spec.input, "loop.input", &mut references);
    }
    references
}

/// Describes why a `steps.*` reference from the step at `position` looks wrong.
fn reference_problem(definition: &AutomationDefinition, position: usize, expression: &str) -> Option<String> {
    let (step_reference, _) = parse_step_reference_expression(expression)?;
    let referenced_position = match definition.step_position(&step_reference) {
        Some(referenced_position) => referenced_position,
        None => match step_reference.parse::<usize>() {
            Ok(number) if (1..=definition.steps.len()).contains(&number) => number,
            _ => return Some(format!("references unknown step '{step_reference}'")),
        },
    };
    if referenced_position >= position {
        return Some(format!(
            "references step '{step_reference}' which has not run yet; it resolves to null"
        ));
    }
    None
}

/// Loads automation definitions from a YAML or JSON file.
///
/// Accepts either a single definition or a document listing definitions under
/// `automations`.
pub fn parse_automation_file(file_path: impl AsRef<Path>) -> Result<Vec<AutomationDefinition>> {
    let file_path = file_path.as_ref();
    let file_content =
        fs::read_to_string(file_path).with_context(|| format!("failed to read automation file: {}", file_path.display()))?;

    #[derive(Deserialize)]
    struct MultiAutomationDocument {
        automations: Vec<AutomationDefinition>,
    }

    if let Ok(document) = serde_yaml::from_str::<MultiAutomationDocument>(&file_content) {
        return Ok(document.automations);
    }

    let definition = serde_yaml::from_str::<AutomationDefinition>(&file_content).with_context(|| {
        format!(
            "unsupported automation document in {}; expected a definition or an 'automations' list",
            file_path.display()
        )
    })?;
    Ok(vec![definition])
}

/// Reads an automation definition stored in the tenant's document store.
pub async fn load_automation(store: &dyn DocumentStore, tenant_id: &TenantId, automation_id: &str) -> Result<AutomationDefinition> {
    let document = store
        .get(tenant_id, automation_id)
        .await?
        .with_context(|| format!("automation '{automation_id}' not found for tenant {tenant_id}"))?;
    let definition: AutomationDefinition = serde_json::from_value(document.body)
        .with_context(|| format!("automation document '{automation_id}' is not a valid definition"))?;
    if &definition.tenant_id != tenant_id {
        anyhow::bail!("automation '{automation_id}' is owned by tenant {}", definition.tenant_id);
    }
    Ok(definition)
}

/// Stores a definition in its owner's document store under the automation id.
pub async fn save_automation(store: &dyn DocumentStore, definition: &AutomationDefinition) -> Result<Document> {
    let body = serde_json::to_value(definition).context("failed to serialize automation definition")?;
    let stored = store
        .put(&definition.tenant_id, Document::new(definition.id.clone(), body))
        .await?;
    Ok(stored)
}

/// Treats a missing or `null` trigger payload as an empty object.
pub(crate) fn normalize_trigger_payload(payload: Value) -> Option<Value> {
    match payload {
        Value::Null => Some(Value::Object(Default::default())),
        Value::Object(_) => Some(payload),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stepwise_types::{LoopSpec, StepId, TriggerEvent, TriggerSpec};

    use super::*;
    use crate::store::InMemoryDocumentStore;

    fn definition_with(steps: Vec<StepSpec>) -> AutomationDefinition {
        AutomationDefinition {
            id: "au_test".to_string(),
            tenant_id: TenantId::new("tenant_a"),
            name: None,
            trigger: TriggerSpec {
                event: TriggerEvent::Webhook,
                filter: Default::default(),
            },
            steps,
        }
    }

    #[test]
    fn duplicate_and_malformed_step_identifiers_are_faults() {
        let registry = StepRegistry::builtin();
        let duplicate = definition_with(vec![
            StepSpec::new("a", StepId::Collect),
            StepSpec::new("a", StepId::Collect),
        ]);
        assert!(matches!(
            validate_definition(&duplicate, &registry),
            Err(EngineFault::InvalidDefinition { .. })
        ));

        let malformed = definition_with(vec![StepSpec::new("has space", StepId::Collect)]);
        assert!(matches!(
            validate_definition(&malformed, &registry),
            Err(EngineFault::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn loops_are_rejected_on_kinds_that_cannot_loop() {
        let definition = definition_with(vec![StepSpec::new("gate", StepId::Filter).with_loop(LoopSpec {
            input: json!([1, 2]),
            ..LoopSpec::default()
        })]);
        let fault = validate_definition(&definition, &StepRegistry::builtin()).expect_err("filter cannot loop");
        assert!(fault.to_string().contains("does not support loops"));
    }

    #[test]
    fn malformed_failure_condition_is_a_fault() {
        let definition = definition_with(vec![StepSpec::new("each", StepId::Collect).with_loop(LoopSpec {
            input: json!([1]),
            failure_condition: Some("loop.output.value ==".to_string()),
            ..LoopSpec::default()
        })]);
        assert!(validate_definition(&definition, &StepRegistry::builtin()).is_err());
    }

    #[test]
    fn unregistered_kind_is_reported() {
        let definition = definition_with(vec![StepSpec::new("log", StepId::ServerLog)]);
        assert_eq!(
            validate_definition(&definition, &StepRegistry::default()),
            Err(EngineFault::UnregisteredStep { step_id: StepId::ServerLog })
        );
    }

    #[test]
    fn forward_and_unknown_references_are_warnings() {
        let definition = definition_with(vec![
            StepSpec::new("first", StepId::Collect).with_input("collection", json!("${{ steps.second.value }}")),
            StepSpec::new("second", StepId::Collect).with_input("collection", json!("${{ steps.first.value }}")),
            StepSpec::new("third", StepId::Collect)
                .with_input("collection", json!({"a": "${{ steps.missing.value }}", "b": "${{ steps.2.value }}"})),
        ]);

        let warnings = validate_definition(&definition, &StepRegistry::builtin()).expect("valid structure");
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].step, "first");
        assert!(warnings[0].message.contains("has not run yet"));
        assert_eq!(warnings[1].source_path, "inputs.collection.a");
        assert!(warnings[1].message.contains("unknown step"));
    }

    #[test]
    fn parses_single_and_multi_definition_files() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let single_path = temp_dir.path().join("single.yaml");
        fs::write(
            &single_path,
            r#"
id: au_single
tenant_id: tenant_a
trigger:
  event: WEBHOOK
steps:
  - id: echo
    step_id: COLLECT
    inputs:
      collection: "${{ trigger.name }}"
"#,
        )
        .expect("write file");
        let single = parse_automation_file(&single_path).expect("single definition parses");
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].steps[0].step_id, StepId::Collect);

        let multi_path = temp_dir.path().join("multi.yaml");
        fs::write(
            &multi_path,
            r#"
automations:
  - id: au_one
    tenant_id: tenant_a
    trigger: { event: CRON }
  - id: au_two
    tenant_id: tenant_b
    trigger: { event: ROW_CREATED }
"#,
        )
        .expect("write file");
        let multi = parse_automation_file(&multi_path).expect("multi definition parses");
        let identifiers: Vec<&str> = multi.iter().map(|definition| definition.id.as_str()).collect();
        assert_eq!(identifiers, vec!["au_one", "au_two"]);

        let broken_path = temp_dir.path().join("broken.yaml");
        fs::write(&broken_path, "steps: 3").expect("write file");
        assert!(parse_automation_file(&broken_path).is_err());
    }

    #[tokio::test]
    async fn stored_definitions_round_trip_through_the_store() {
        let store = InMemoryDocumentStore::new();
        let definition = definition_with(vec![StepSpec::new("echo", StepId::Collect)]);
        save_automation(&store, &definition).await.expect("save");

        let loaded = load_automation(&store, &TenantId::new("tenant_a"), "au_test")
            .await
            .expect("load");
        assert_eq!(loaded, definition);
        assert!(load_automation(&store, &TenantId::new("tenant_b"), "au_test").await.is_err());
    }

    #[test]
    fn null_trigger_becomes_empty_object() {
        assert_eq!(normalize_trigger_payload(Value::Null), Some(json!({})));
        assert_eq!(normalize_trigger_payload(json!([1])), None);
    }
}
