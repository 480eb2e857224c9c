//! Sandboxed script evaluation.
//!
//! Script bindings and the script step run through a [`ScriptRunner`]. The default
//! implementation builds a fresh Rhai engine per evaluation; the only global a script
//! can see is `context`, a serialized copy of the execution context. Rhai has no file,
//! network or process access. A progress callback aborts evaluation once the
//! wall-clock budget is spent, and [`ScriptLimits`] caps operations and the size of
//! strings, arrays and maps a script may build. `print` and `debug` go to the log.
//!
//! `loop` is a Rhai keyword, so loop state is read with indexing:
//! `context["loop"].currentItem`, `context["loop"].index`.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    task,
};
use tracing::{debug, info};

/// Failure of a single script evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script exceeded its {timeout_ms}ms time limit")]
    Timeout { timeout_ms: u64 },
    #[error("script exceeded a sandbox limit: {message}")]
    LimitExceeded { message: String },
    #[error("script evaluation failed: {message}")]
    Evaluation { message: String },
    #[error("script value conversion failed: {message}")]
    Conversion { message: String },
}

/// Resource caps applied to every script evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScriptLimits {
    pub max_operations: u64,
    /// Longest string, in bytes, a script may create.
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 10_000_000,
            max_string_size: 4 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
        }
    }
}

/// Evaluates script source against a JSON context.
pub trait ScriptRunner: Send + Sync {
    fn run(&self, source: &str, context: &Value, timeout: Duration) -> Result<Value, ScriptError>;
}

/// Rhai-backed script runner.
#[derive(Debug, Clone, Default)]
pub struct RhaiScriptRunner {
    limits: ScriptLimits,
}

impl RhaiScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ScriptLimits) -> Self {
        Self { limits }
    }

    fn build_engine(&self, timeout: Duration) -> Engine {
        let mut engine = Engine::new();
        engine.disable_symbol("eval");
        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);
        engine.on_print(|text| info!(target: "stepwise::script", "{text}"));
        engine.on_debug(|text, source, position| {
            debug!(target: "stepwise::script", source = source.unwrap_or_default(), %position, "{text}")
        });

        let started_at = Instant::now();
        engine.on_progress(move |_operations| {
            if started_at.elapsed() >= timeout {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        engine
    }
}

impl ScriptRunner for RhaiScriptRunner {
    fn run(&self, source: &str, context: &Value, timeout: Duration) -> Result<Value, ScriptError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let engine = self.build_engine(timeout);

        let context_value = rhai::serde::to_dynamic(context).map_err(|error| ScriptError::Conversion {
            message: error.to_string(),
        })?;
        let mut scope = Scope::new();
        scope.push_constant_dynamic("context", context_value);

        let evaluated = engine
            .eval_with_scope::<Dynamic>(&mut scope, source)
            .map_err(|error| classify_failure(*error, timeout_ms))?;
        debug!(timeout_ms, "script evaluated");

        rhai::serde::from_dynamic::<Value>(&evaluated).map_err(|error| ScriptError::Conversion {
            message: error.to_string(),
        })
    }
}

fn classify_failure(error: EvalAltResult, timeout_ms: u64) -> ScriptError {
    match error {
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout { timeout_ms },
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify_failure(*inner, timeout_ms),
        error @ (EvalAltResult::ErrorDataTooLarge(..)
        | EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)) => ScriptError::LimitExceeded {
            message: error.to_string(),
        },
        other => ScriptError::Evaluation { message: other.to_string() },
    }
}

/// Runs synchronous script work without parking the async worker it was called from.
///
/// On a multi-threaded runtime the worker hands its other tasks off first; elsewhere the
/// work simply runs inline.
pub(crate) fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => task::block_in_place(work),
        _ => work(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_reads_context_and_returns_json() {
        let runner = RhaiScriptRunner::new();
        let context = json!({"trigger": {"amount": 21, "name": "ada"}});

        let doubled = runner
            .run("context.trigger.amount * 2", &context, Duration::from_secs(1))
            .expect("script runs");
        assert_eq!(doubled, json!(42));

        let shaped = runner
            .run("#{ upper: context.trigger.name.to_upper(), ok: true }", &context, Duration::from_secs(1))
            .expect("script runs");
        assert_eq!(shaped, json!({"upper": "ADA", "ok": true}));
    }

    #[test]
    fn runaway_script_is_terminated() {
        let runner = RhaiScriptRunner::new();
        let started_at = Instant::now();
        let result = runner.run("loop { }", &json!({}), Duration::from_millis(50));

        assert_eq!(result, Err(ScriptError::Timeout { timeout_ms: 50 }));
        assert!(started_at.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn oversized_allocations_are_refused() {
        let runner = RhaiScriptRunner::new();
        let result = runner.run(
            "let s = \"\"; s.pad(3000000000, 'x'); s.len()",
            &json!({}),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ScriptError::LimitExceeded { .. })));

        let capped = RhaiScriptRunner::with_limits(ScriptLimits {
            max_array_size: 10,
            ..ScriptLimits::default()
        });
        let result = capped.run("let items = []; for i in 0..100 { items.push(i); } items", &json!({}), Duration::from_secs(1));
        assert!(matches!(result, Err(ScriptError::LimitExceeded { .. })));
    }

    #[test]
    fn operation_cap_stops_long_scripts() {
        let runner = RhaiScriptRunner::with_limits(ScriptLimits {
            max_operations: 1_000,
            ..ScriptLimits::default()
        });
        let result = runner.run("let n = 0; while n < 1000000 { n += 1; } n", &json!({}), Duration::from_secs(5));
        assert!(matches!(result, Err(ScriptError::LimitExceeded { .. })));
    }

    #[test]
    fn loop_state_is_read_by_indexing() {
        let runner = RhaiScriptRunner::new();
        let context = json!({"loop": {"index": 2, "currentItem": "c"}});
        let value = runner
            .run(r#"context["loop"].currentItem + context["loop"].index"#, &context, Duration::from_secs(1))
            .expect("indexed access runs");
        assert_eq!(value, json!("c2"));
    }

    #[test]
    fn print_does_not_fail_the_script() {
        let runner = RhaiScriptRunner::new();
        let value = runner
            .run("print(\"hello\"); debug(42); 1", &json!({}), Duration::from_secs(1))
            .expect("print is routed to the log");
        assert_eq!(value, json!(1));
    }

    #[test]
    fn syntax_errors_are_reported() {
        let runner = RhaiScriptRunner::new();
        let result = runner.run("let = ;", &json!({}), Duration::from_secs(1));
        assert!(matches!(result, Err(ScriptError::Evaluation { .. })));
    }
}
