//! Tenant-partitioned document storage.
//!
//! The engine talks to storage only through [`DocumentStore`]. Every call names the
//! tenant whose partition it reads or writes; there is no way to address another
//! tenant's documents.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::TenantId;
use thiserror::Error;
use tokio::sync::RwLock;

/// Stored JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    /// Incremented on every write; zero for documents that were never stored.
    #[serde(default)]
    pub revision: u64,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            body,
        }
    }
}

/// Key-range query over document identifiers (inclusive bounds).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeQuery {
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub limit: Option<usize>,
}

impl RangeQuery {
    /// Every document whose identifier starts with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            start_key: Some(prefix.to_string()),
            end_key: Some(format!("{prefix}\u{fff0}")),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn contains(&self, key: &str) -> bool {
        self.start_key.as_deref().is_none_or(|start_key| key >= start_key)
            && self.end_key.as_deref().is_none_or(|end_key| key <= end_key)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document '{doc_id}' not found")]
    NotFound { doc_id: String },
    #[error("document store failure: {message}")]
    Backend { message: String },
}

/// Storage collaborator.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, tenant_id: &TenantId, doc_id: &str) -> Result<Option<Document>, StoreError>;

    /// Documents in key order whose identifiers fall inside `range`.
    async fn all_docs(&self, tenant_id: &TenantId, range: &RangeQuery) -> Result<Vec<Document>, StoreError>;

    /// Inserts or replaces a document, returning it with its new revision.
    async fn put(&self, tenant_id: &TenantId, document: Document) -> Result<Document, StoreError>;

    /// Removes a document and returns it.
    async fn remove(&self, tenant_id: &TenantId, doc_id: &str) -> Result<Document, StoreError>;
}

/// In-process store keeping one ordered map per tenant.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    partitions: RwLock<HashMap<TenantId, BTreeMap<String, Document>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents stored for a tenant.
    pub async fn document_count(&self, tenant_id: &TenantId) -> usize {
        self.partitions
            .read()
            .await
            .get(tenant_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, tenant_id: &TenantId, doc_id: &str) -> Result<Option<Document>, StoreError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(tenant_id)
            .and_then(|partition| partition.get(doc_id))
            .cloned())
    }

    async fn all_docs(&self, tenant_id: &TenantId, range: &RangeQuery) -> Result<Vec<Document>, StoreError> {
        let partitions = self.partitions.read().await;
        let Some(partition) = partitions.get(tenant_id) else {
            return Ok(Vec::new());
        };
        let matching = partition
            .values()
            .filter(|document| range.contains(&document.id))
            .take(range.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn put(&self, tenant_id: &TenantId, mut document: Document) -> Result<Document, StoreError> {
        let mut partitions = self.partitions.write().await;
        let partition = partitions.entry(tenant_id.clone()).or_default();
        let previous_revision = partition.get(&document.id).map(|existing| existing.revision).unwrap_or(0);
        document.revision = previous_revision + 1;
        partition.insert(document.id.clone(), document.clone());
        Ok(document)
    }

    async fn remove(&self, tenant_id: &TenantId, doc_id: &str) -> Result<Document, StoreError> {
        let mut partitions = self.partitions.write().await;
        partitions
            .get_mut(tenant_id)
            .and_then(|partition| partition.remove(doc_id))
            .ok_or_else(|| StoreError::NotFound {
                doc_id: doc_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn partitions_are_isolated_per_tenant() {
        let store = InMemoryDocumentStore::new();
        let tenant_a = TenantId::new("tenant_a");
        let tenant_b = TenantId::new("tenant_b");

        store
            .put(&tenant_a, Document::new("ro_people_1", json!({"name": "Ada"})))
            .await
            .expect("put succeeds");

        assert!(store.get(&tenant_a, "ro_people_1").await.expect("get").is_some());
        assert!(store.get(&tenant_b, "ro_people_1").await.expect("get").is_none());
        assert!(matches!(
            store.remove(&tenant_b, "ro_people_1").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn revisions_increment_and_ranges_respect_prefix_and_limit() {
        let store = InMemoryDocumentStore::new();
        let tenant = TenantId::new("tenant_a");
        for identifier in ["ro_people_1", "ro_people_2", "ro_pets_1", "au_flow"] {
            store
                .put(&tenant, Document::new(identifier, json!({})))
                .await
                .expect("put succeeds");
        }
        let rewritten = store
            .put(&tenant, Document::new("ro_people_1", json!({"v": 2})))
            .await
            .expect("put succeeds");
        assert_eq!(rewritten.revision, 2);

        let people = store
            .all_docs(&tenant, &RangeQuery::prefix("ro_people_"))
            .await
            .expect("query succeeds");
        let identifiers: Vec<&str> = people.iter().map(|document| document.id.as_str()).collect();
        assert_eq!(identifiers, vec!["ro_people_1", "ro_people_2"]);

        let limited = store
            .all_docs(&tenant, &RangeQuery::prefix("ro_").with_limit(1))
            .await
            .expect("query succeeds");
        assert_eq!(limited.len(), 1);
        assert_eq!(store.document_count(&tenant).await, 4);
    }
}
