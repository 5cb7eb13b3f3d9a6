// Per-component viewer scope.
//
// A UI component owns one scope. Records it asks for are viewed under the
// scope's viewer id while mounted, and every observer it registered is
// cancelled on unmount. A scope without a store (server-side rendering)
// hands out plain local mirrors.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use modelsync_common::types::{FieldMap, SubscriptionKey};
use serde_json::Value;

use crate::observer::Subscription;
use crate::record::{LiveRecord, UPDATE_EVENT};
use crate::store::RecordStore;

pub struct ViewerScope {
    viewer_id: String,
    store: Option<RecordStore>,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    mounted: bool,
    models: HashMap<SubscriptionKey, LiveRecord>,
    subscriptions: Vec<Subscription>,
}

impl ViewerScope {
    pub fn new(store: Option<RecordStore>) -> Self {
        Self {
            viewer_id: uuid::Uuid::new_v4().to_string(),
            store,
            state: Mutex::new(ScopeState::default()),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_mounted(&self) -> bool {
        self.state().mounted
    }

    /// Records this scope currently views.
    pub fn model_count(&self) -> usize {
        self.state().models.len()
    }

    /// The live record for `seed["id"]`, tracked by this scope. Without a
    /// store, a detached local mirror of `seed`.
    pub fn model(&self, model: &str, seed: FieldMap) -> LiveRecord {
        let id = match seed.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };

        let Some(store) = &self.store else {
            return LiveRecord::new(model, id, seed);
        };
        let record = store.get(model, id.as_deref(), seed);
        let Some(id) = id else {
            return record;
        };

        let mounted = {
            let mut state = self.state();
            state.models.insert(SubscriptionKey::new(model, id), record.clone());
            state.mounted
        };
        if mounted {
            store.add_viewer(&record, &self.viewer_id);
        }
        record
    }

    /// Re-render hook: `handler` runs on every `update` of `record` until
    /// unmount.
    pub fn on_update<F>(&self, record: &LiveRecord, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let subscription = record.on(UPDATE_EVENT, handler);
        self.state().subscriptions.push(subscription);
    }

    pub fn on_mount(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let records: Vec<LiveRecord> = {
            let mut state = self.state();
            state.mounted = true;
            state.models.values().cloned().collect()
        };
        for record in &records {
            store.add_viewer(record, &self.viewer_id);
        }
    }

    /// Cancel observers and release every viewed record.
    pub fn on_unmount(&self) {
        let (records, subscriptions) = {
            let mut state = self.state();
            state.mounted = false;
            (
                state.models.drain().map(|(_, record)| record).collect::<Vec<_>>(),
                std::mem::take(&mut state.subscriptions),
            )
        };

        for subscription in subscriptions {
            subscription.cancel();
        }
        if let Some(store) = &self.store {
            for record in &records {
                store.remove_viewer(record, &self.viewer_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::LoopbackTransport;

    fn seed(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn scope_without_store_returns_local_mirrors() {
        let scope = ViewerScope::new(None);
        let record = scope.model("user", seed(json!({ "id": "1", "name": "Ada" })));

        assert_eq!(record.get("name"), Some(json!("Ada")));
        assert!(!record.is_listening());
        assert_eq!(scope.model_count(), 0);
    }

    #[tokio::test]
    async fn mount_views_and_unmount_releases() {
        let transport = Arc::new(LoopbackTransport::default());
        let store = RecordStore::new(transport.clone(), ClientConfig::default());
        let scope = ViewerScope::new(Some(store.clone()));

        let record = scope.model("user", seed(json!({ "id": "1" })));
        assert!(!record.has_viewer(scope.viewer_id()));

        scope.on_mount();
        assert!(record.has_viewer(scope.viewer_id()));
        assert!(record.is_listening());

        scope.on_unmount();
        assert_eq!(record.viewer_count(), 0);
        assert_eq!(scope.model_count(), 0);
    }

    #[tokio::test]
    async fn unmount_cancels_update_observers() {
        let transport = Arc::new(LoopbackTransport::default());
        let store = RecordStore::new(transport.clone(), ClientConfig::default());
        let scope = ViewerScope::new(Some(store));
        scope.on_mount();

        let record = scope.model("user", seed(json!({ "id": "1" })));
        let renders = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&renders);
        scope.on_update(&record, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        transport.push("model.update.user.1", json!({ "name": "Ada" }));
        scope.on_unmount();
        transport.push("model.update.user.1", json!({ "name": "Grace" }));

        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(record.observer_count(UPDATE_EVENT), 0);
    }
}
