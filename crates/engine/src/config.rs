//! Engine configuration loading and validation.
//!
//! Configuration lives in a YAML (or JSON) file at `$STEPWISE_CONFIG_PATH` or
//! `<config_dir>/stepwise/engine.yaml`. A missing file yields defaults. Individual
//! fields can be overridden with `STEPWISE_*` environment variables.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::script::ScriptLimits;

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_PATH_VARIABLE: &str = "STEPWISE_CONFIG_PATH";

const SCRIPT_TIMEOUT_VARIABLE: &str = "STEPWISE_SCRIPT_TIMEOUT_MS";
const DEFAULT_MAX_ITERATIONS_VARIABLE: &str = "STEPWISE_DEFAULT_MAX_ITERATIONS";
const STEP_TIMEOUT_VARIABLE: &str = "STEPWISE_STEP_TIMEOUT_MS";
const PERSIST_RUN_LOGS_VARIABLE: &str = "STEPWISE_PERSIST_RUN_LOGS";

/// Tunables for binding resolution, looping and step execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock limit for a single script evaluation.
    pub script_timeout_ms: u64,
    /// Operation and allocation caps for script evaluation.
    pub script_limits: ScriptLimits,
    /// Iteration bound applied when a loop does not set `max_iterations`.
    pub default_max_iterations: u32,
    /// Hard ceiling for any loop, whatever the definition asks for.
    pub max_iterations_ceiling: u32,
    /// Separator used to split string loop inputs when the loop does not set one.
    pub loop_separator: String,
    /// Limit for a single step invocation. `None` disables the limit.
    pub step_timeout_ms: Option<u64>,
    /// Longest sleep a delay step may request.
    pub max_delay_ms: u64,
    /// Write finished runs to the tenant's document store.
    pub persist_run_logs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_timeout_ms: 1_000,
            script_limits: ScriptLimits::default(),
            default_max_iterations: 200,
            max_iterations_ceiling: 1_000,
            loop_separator: ",".to_string(),
            step_timeout_ms: Some(60_000),
            max_delay_ms: 60_000,
            persist_run_logs: false,
        }
    }
}

impl EngineConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Effective iteration bound for a loop requesting `requested` iterations.
    pub fn effective_max_iterations(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_max_iterations)
            .clamp(1, self.max_iterations_ceiling.max(1))
    }
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("environment variable {variable} has invalid value '{value}'")]
    InvalidOverride { variable: String, value: String },
}

/// Returns the path of the engine configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_VARIABLE)
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stepwise")
        .join("engine.yaml")
}

/// Loads configuration from the default path.
pub fn load_config() -> anyhow::Result<EngineConfig> {
    load_config_from_path(&default_config_path())
}

/// Loads configuration from `path`, applying environment overrides and validation.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<EngineConfig> {
    let mut config = if path.exists() {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str::<EngineConfig>(&content).with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        debug!(path = %path.display(), "config file not found; using defaults");
        EngineConfig::default()
    };

    apply_environment_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

fn apply_environment_overrides(config: &mut EngineConfig) -> Result<(), ConfigError> {
    if let Some(value) = read_override(SCRIPT_TIMEOUT_VARIABLE) {
        config.script_timeout_ms = parse_override(SCRIPT_TIMEOUT_VARIABLE, &value)?;
    }
    if let Some(value) = read_override(DEFAULT_MAX_ITERATIONS_VARIABLE) {
        config.default_max_iterations = parse_override(DEFAULT_MAX_ITERATIONS_VARIABLE, &value)?;
    }
    if let Some(value) = read_override(STEP_TIMEOUT_VARIABLE) {
        let timeout_ms: u64 = parse_override(STEP_TIMEOUT_VARIABLE, &value)?;
        config.step_timeout_ms = (timeout_ms > 0).then_some(timeout_ms);
    }
    if let Some(value) = read_override(PERSIST_RUN_LOGS_VARIABLE) {
        config.persist_run_logs = parse_override(PERSIST_RUN_LOGS_VARIABLE, &value)?;
    }
    Ok(())
}

fn read_override(variable: &str) -> Option<String> {
    env::var(variable).ok().filter(|value| !value.trim().is_empty())
}

fn parse_override<T: std::str::FromStr>(variable: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidOverride {
        variable: variable.to_string(),
        value: value.to_string(),
    })
}

/// Validates cross-field constraints.
pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.script_timeout_ms == 0 {
        return Err(invalid("script_timeout_ms", "must be greater than zero"));
    }
    let limits = &config.script_limits;
    for (field, value) in [
        ("script_limits.max_operations", limits.max_operations),
        ("script_limits.max_string_size", limits.max_string_size as u64),
        ("script_limits.max_array_size", limits.max_array_size as u64),
        ("script_limits.max_map_size", limits.max_map_size as u64),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be greater than zero"));
        }
    }
    if config.default_max_iterations == 0 {
        return Err(invalid("default_max_iterations", "must be greater than zero"));
    }
    if config.default_max_iterations > config.max_iterations_ceiling {
        return Err(invalid(
            "default_max_iterations",
            &format!("must not exceed max_iterations_ceiling ({})", config.max_iterations_ceiling),
        ));
    }
    if config.loop_separator.is_empty() {
        return Err(invalid("loop_separator", "cannot be empty"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
