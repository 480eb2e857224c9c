//! Usage quotas.
//!
//! The runner asks the [`QuotaGate`] before a run starts and records usage once it
//! reaches a terminal state.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepwise_types::TenantId;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Metered resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaResource {
    AutomationRuns,
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaResource::AutomationRuns => formatter.write_str("AUTOMATION_RUNS"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("quota backend failure: {message}")]
    Backend { message: String },
}

/// Quota collaborator.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Returns `true` when the tenant may consume one more unit of `resource`.
    async fn pre_check(&self, tenant_id: &TenantId, resource: QuotaResource) -> Result<bool, QuotaError>;

    async fn record_usage(&self, tenant_id: &TenantId, resource: QuotaResource, delta: u64) -> Result<(), QuotaError>;
}

/// Quota gate with per-tenant limits kept in memory.
///
/// Tenants without an explicit limit fall back to `default_limit`; `None` means unlimited.
#[derive(Debug, Default)]
pub struct InMemoryQuotaGate {
    default_limit: Option<u64>,
    limits: HashMap<(TenantId, QuotaResource), u64>,
    usage: Mutex<HashMap<(TenantId, QuotaResource), u64>>,
}

impl InMemoryQuotaGate {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_default_limit(default_limit: u64) -> Self {
        Self {
            default_limit: Some(default_limit),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, tenant_id: TenantId, resource: QuotaResource, limit: u64) -> Self {
        self.limits.insert((tenant_id, resource), limit);
        self
    }

    pub async fn usage(&self, tenant_id: &TenantId, resource: QuotaResource) -> u64 {
        self.usage
            .lock()
            .await
            .get(&(tenant_id.clone(), resource))
            .copied()
            .unwrap_or(0)
    }

    fn limit_for(&self, tenant_id: &TenantId, resource: QuotaResource) -> Option<u64> {
        self.limits
            .get(&(tenant_id.clone(), resource))
            .copied()
            .or(self.default_limit)
    }
}

#[async_trait]
impl QuotaGate for InMemoryQuotaGate {
    async fn pre_check(&self, tenant_id: &TenantId, resource: QuotaResource) -> Result<bool, QuotaError> {
        let Some(limit) = self.limit_for(tenant_id, resource) else {
            return Ok(true);
        };
        let used = self.usage(tenant_id, resource).await;
        debug!(tenant_id = %tenant_id, %resource, used, limit, "quota pre-check");
        Ok(used < limit)
    }

    async fn record_usage(&self, tenant_id: &TenantId, resource: QuotaResource, delta: u64) -> Result<(), QuotaError> {
        let mut usage = self.usage.lock().await;
        let counter = usage.entry((tenant_id.clone(), resource)).or_insert(0);
        *counter = counter.saturating_add(delta);
        Ok(())
    }
}
