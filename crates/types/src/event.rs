//! Lifecycle events emitted for analytics and audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::TenantId;

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A run was admitted and is about to execute.
    RunCreated,
    /// A step finished, successfully or not.
    StepCompleted,
    /// A run reached a terminal state.
    RunFinished,
    /// A run was refused before execution (quota exhausted).
    RunRejected,
}

/// Event handed to the event publisher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub tenant_id: TenantId,
    pub automation_id: String,
    pub run_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, tenant_id: TenantId, automation_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            kind,
            tenant_id,
            automation_id: automation_id.into(),
            run_id: run_id.into(),
            properties: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}
