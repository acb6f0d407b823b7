//! # Record Store
//!
//! ## Purpose
//! Two storage tiers for delivery records:
//!
//! - [`RecordCache`]: the in-process working cache, the single writer of
//!   record. All mutation goes through `update`, which holds the keyed entry
//!   for the duration of the closure — the load→mutate→save protocol — so
//!   concurrent receptors, affectors and monitor passes never interleave
//!   mid-mutation on one record.
//! - [`DocumentStore`]: the durable document database used only for
//!   terminal/archival persistence. Absence is a `None`, never an error.

use crate::error::{DeliveryError, DeliveryResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

/// Keyed working cache for POA/POD/POR records.
pub struct RecordCache<T> {
    records: DashMap<String, T>,
}

impl<T: Clone> Default for RecordCache<T> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<T: Clone> RecordCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record only if absent; returns whether it was created.
    /// Idempotent against duplicate receipt of the creating message.
    pub fn create(&self, key: impl Into<String>, build: impl FnOnce() -> T) -> bool {
        let mut created = false;
        self.records.entry(key.into()).or_insert_with(|| {
            created = true;
            build()
        });
        created
    }

    /// Load→mutate→save: the closure runs with the entry locked, so exactly
    /// one writer mutates a given record at a time. Returns `None` when the
    /// record is missing.
    pub fn update<R>(&self, key: &str, mutate: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.records.get_mut(key).map(|mut entry| mutate(&mut entry))
    }

    /// Snapshot copy for read-only inspection.
    pub fn get(&self, key: &str) -> Option<T> {
        self.records.get(key).map(|entry| entry.clone())
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.records.remove(key).map(|(_, record)| record)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Durable document database collaborator, keyed by a partition/sort
/// composite (`P:<producerPort>` / `R:<consumerPort>` plus message id).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save(&self, partition: &str, sort: &str, document: Value) -> DeliveryResult<()>;

    /// `Ok(None)` when the document does not exist.
    async fn load(&self, partition: &str, sort: &str) -> DeliveryResult<Option<Value>>;

    async fn delete(&self, partition: &str, sort: &str) -> DeliveryResult<()>;
}

/// In-memory document store used by the node binaries and tests; a real
/// deployment substitutes its database client behind the same trait.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: DashMap<(String, String), Value>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn save(&self, partition: &str, sort: &str, document: Value) -> DeliveryResult<()> {
        debug!(partition, sort, "archiving document");
        self.documents
            .insert((partition.to_string(), sort.to_string()), document);
        Ok(())
    }

    async fn load(&self, partition: &str, sort: &str) -> DeliveryResult<Option<Value>> {
        Ok(self
            .documents
            .get(&(partition.to_string(), sort.to_string()))
            .map(|entry| entry.clone()))
    }

    async fn delete(&self, partition: &str, sort: &str) -> DeliveryResult<()> {
        self.documents
            .remove(&(partition.to_string(), sort.to_string()));
        Ok(())
    }
}

/// Archive one record as JSON, surfacing serialization problems as
/// persistence failures for the caller to log and abandon.
pub async fn archive_record<T: serde::Serialize>(
    store: &dyn DocumentStore,
    partition: &str,
    sort: &str,
    record: &T,
) -> DeliveryResult<()> {
    let document = serde_json::to_value(record)
        .map_err(|e| DeliveryError::Persistence(format!("archiving {partition}/{sort}: {e}")))?;
    store.save(partition, sort, document).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent() {
        let cache: RecordCache<u32> = RecordCache::new();
        assert!(cache.create("123-7", || 1));
        assert!(!cache.create("123-7", || 2));
        assert_eq!(cache.get("123-7"), Some(1));
    }

    #[test]
    fn update_missing_record_returns_none() {
        let cache: RecordCache<u32> = RecordCache::new();
        assert_eq!(cache.update("nope", |v| *v += 1), None);
    }

    #[tokio::test]
    async fn absent_document_is_none_not_error() {
        let store = InMemoryDocumentStore::new();
        assert!(store.load("P:1000", "123-7").await.unwrap().is_none());
        store
            .save("P:1000", "123-7", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert!(store.load("P:1000", "123-7").await.unwrap().is_some());
        store.delete("P:1000", "123-7").await.unwrap();
        assert!(store.load("P:1000", "123-7").await.unwrap().is_none());
    }
}
