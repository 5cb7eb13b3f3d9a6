// Persistence collaborator seam: loads the sanitized field map for a record.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use modelsync_common::types::{FieldMap, SubscriptionKey};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::SourceError;

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// Produces sanitized field maps for records by (type, id).
pub trait RecordSource: Send + Sync {
    /// Sanitized fields of the record, or `None` when it does not exist.
    fn find_by_id<'a>(&'a self, model: &'a str, id: &'a str) -> SourceFuture<'a, Option<FieldMap>>;

    /// Whether a save touching `updates` should notify listeners at all.
    fn requires_update<'a>(
        &'a self,
        _model: &'a str,
        _id: &'a str,
        _updates: &'a [String],
    ) -> SourceFuture<'a, bool> {
        Box::pin(async { Ok(true) })
    }
}

/// Map-backed record source for the standalone daemon and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordSource {
    records: Arc<RwLock<HashMap<SubscriptionKey, FieldMap>>>,
}

impl MemoryRecordSource {
    pub async fn insert(&self, model: &str, id: &str, fields: FieldMap) {
        self.records.write().await.insert(SubscriptionKey::new(model, id), fields);
    }

    /// Merge `fields` into the stored record, creating it when absent.
    /// Returns the names of fields whose value actually changed.
    pub async fn apply(&self, model: &str, id: &str, fields: FieldMap) -> Vec<String> {
        let mut guard = self.records.write().await;
        let record = guard.entry(SubscriptionKey::new(model, id)).or_default();

        let mut changed = Vec::new();
        for (field, value) in fields {
            if record.get(&field) != Some(&value) {
                changed.push(field.clone());
                record.insert(field, value);
            }
        }
        changed
    }

    pub async fn remove(&self, model: &str, id: &str) -> Option<FieldMap> {
        self.records.write().await.remove(&SubscriptionKey::new(model, id))
    }

    pub async fn get_field(&self, model: &str, id: &str, field: &str) -> Option<Value> {
        let guard = self.records.read().await;
        guard.get(&SubscriptionKey::new(model, id)).and_then(|record| record.get(field)).cloned()
    }
}

impl RecordSource for MemoryRecordSource {
    fn find_by_id<'a>(&'a self, model: &'a str, id: &'a str) -> SourceFuture<'a, Option<FieldMap>> {
        Box::pin(async move {
            let guard = self.records.read().await;
            Ok(guard.get(&SubscriptionKey::new(model, id)).cloned())
        })
    }
}
