//! Per-run execution context.
//!
//! The context is created when a run starts and dropped when it ends. It holds the
//! trigger payload, tenant environment variables, step outputs recorded so far and the
//! active loop frame. Step outputs are append-only: once recorded they are never
//! replaced, and a step can only observe steps that ran before it.

use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use stepwise_types::TenantId;

use crate::error::EngineFault;

/// Root names a binding lookup may start from.
pub const LOOKUP_ROOTS: [&str; 4] = ["trigger", "steps", "loop", "env"];

/// State of the loop iteration currently executing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopFrame {
    /// Item of the collection bound to this iteration.
    pub current_item: Value,
    /// Zero-based iteration index.
    pub index: usize,
    /// Outputs of the iterations completed so far.
    pub items: Vec<Value>,
    /// Output of the most recent iteration.
    pub output: Value,
}

impl LoopFrame {
    pub fn to_json(&self) -> Value {
        json!({
            "currentItem": self.current_item,
            "index": self.index,
            "items": self.items,
            "output": self.output,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    tenant_id: TenantId,
    trigger: Value,
    environment_variables: IndexMap<String, String>,
    step_outputs: IndexMap<String, Value>,
    loop_frame: Option<LoopFrame>,
}

impl ExecutionContext {
    /// Creates a fresh context seeded with the trigger payload.
    pub fn new(tenant_id: TenantId, trigger: Value) -> Self {
        Self {
            tenant_id,
            trigger,
            environment_variables: IndexMap::new(),
            step_outputs: IndexMap::new(),
            loop_frame: None,
        }
    }

    pub fn with_environment(mut self, environment_variables: IndexMap<String, String>) -> Self {
        self.environment_variables = environment_variables;
        self
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    pub fn environment_variable(&self, name: &str) -> Option<&str> {
        self.environment_variables.get(name).map(String::as_str)
    }

    /// Looks up recorded outputs by step name, falling back to the 1-based step position.
    pub fn step_output(&self, reference: &str) -> Option<&Value> {
        if let Some(outputs) = self.step_outputs.get(reference) {
            return Some(outputs);
        }
        let position = reference.parse::<usize>().ok()?;
        let index = position.checked_sub(1)?;
        self.step_outputs.get_index(index).map(|(_, outputs)| outputs)
    }

    /// Number of steps whose outputs have been recorded.
    pub fn completed_steps(&self) -> usize {
        self.step_outputs.len()
    }

    /// Records the outputs of a finished step.
    ///
    /// Fails when the step already has outputs; the context never overwrites history.
    pub fn record_step_output(&mut self, step_identifier: &str, outputs: Value) -> Result<(), EngineFault> {
        if self.step_outputs.contains_key(step_identifier) {
            return Err(EngineFault::ContextInvariant {
                reason: format!("outputs for step '{step_identifier}' were already recorded"),
            });
        }
        self.step_outputs.insert(step_identifier.to_string(), outputs);
        Ok(())
    }

    pub fn loop_frame(&self) -> Option<&LoopFrame> {
        self.loop_frame.as_ref()
    }

    pub(crate) fn set_loop_frame(&mut self, loop_frame: Option<LoopFrame>) {
        self.loop_frame = loop_frame;
    }

    /// Serializes the context for script evaluation.
    ///
    /// Steps appear under their name and under their 1-based position.
    pub fn to_json(&self) -> Value {
        let mut steps = Map::new();
        for (index, (step_identifier, outputs)) in self.step_outputs.iter().enumerate() {
            steps.insert(step_identifier.clone(), outputs.clone());
            steps
                .entry((index + 1).to_string())
                .or_insert_with(|| outputs.clone());
        }
        let environment: Map<String, Value> = self
            .environment_variables
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();

        json!({
            "tenantId": self.tenant_id.as_str(),
            "trigger": self.trigger,
            "steps": steps,
            "env": environment,
            "loop": self.loop_frame.as_ref().map(LoopFrame::to_json).unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_are_addressable_by_name_and_position() {
        let mut context = ExecutionContext::new(TenantId::new("t1"), json!({}));
        context.record_step_output("first", json!({"value": 1})).expect("record first");
        context.record_step_output("second", json!({"value": 2})).expect("record second");

        assert_eq!(context.step_output("first"), Some(&json!({"value": 1})));
        assert_eq!(context.step_output("2"), Some(&json!({"value": 2})));
        assert_eq!(context.step_output("0"), None);
        assert_eq!(context.step_output("3"), None);
        assert_eq!(context.completed_steps(), 2);
    }

    #[test]
    fn recording_the_same_step_twice_is_an_invariant_violation() {
        let mut context = ExecutionContext::new(TenantId::new("t1"), json!({}));
        context.record_step_output("only", json!({"success": true})).expect("first record");
        let error = context
            .record_step_output("only", json!({"success": false}))
            .expect_err("second record must fail");

        assert!(matches!(error, EngineFault::ContextInvariant { .. }));
        assert_eq!(context.step_output("only"), Some(&json!({"success": true})));
    }

    #[test]
    fn json_view_exposes_loop_frame_and_environment() {
        let mut environment = IndexMap::new();
        environment.insert("REGION".to_string(), "eu".to_string());
        let mut context = ExecutionContext::new(TenantId::new("t1"), json!({"id": 7})).with_environment(environment);
        context.set_loop_frame(Some(LoopFrame {
            current_item: json!("a"),
            ..Default::default()
        }));

        let view = context.to_json();
        assert_eq!(view["env"]["REGION"], json!("eu"));
        assert_eq!(view["loop"]["currentItem"], json!("a"));
        assert_eq!(view["trigger"]["id"], json!(7));
    }
}
