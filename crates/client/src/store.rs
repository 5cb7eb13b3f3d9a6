// One shared LiveRecord per (type, id) per store, with viewer reference
// counting and debounced teardown.
//
// Creating a record or removing a viewer (re)starts a grace timer on the
// record; when it fires and the record still has no viewers, the record is
// dropped from the store and destroyed. Adding a viewer cancels any pending
// timer immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use modelsync_common::types::{FieldMap, SubscriptionKey};
use tracing::{debug, warn};

use crate::collection::CollectionQuery;
use crate::config::ClientConfig;
use crate::record::{LiveRecord, RecordOptions, DESTROY_EVENT};
use crate::scheduler::DelayedTasks;
use crate::transport::Transport;

#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    transport: Option<Arc<dyn Transport>>,
    config: ClientConfig,
    records: Mutex<HashMap<SubscriptionKey, LiveRecord>>,
    tasks: DelayedTasks,
}

impl RecordStore {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self::build(Some(transport), config)
    }

    /// A store whose records are local mirrors only.
    pub fn offline(config: ClientConfig) -> Self {
        Self::build(None, config)
    }

    fn build(transport: Option<Arc<dyn Transport>>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                transport,
                config,
                records: Mutex::new(HashMap::new()),
                tasks: DelayedTasks::default(),
            }),
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.transport.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn records(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, LiveRecord>> {
        self.inner.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared record for `(model, id)`. A known record has `seed`
    /// merged into it; otherwise a new one is created from `seed`. Records
    /// without an id are never shared.
    pub fn get(&self, model: &str, id: Option<&str>, seed: FieldMap) -> LiveRecord {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return self.new_record(model, None, seed);
        };
        let key = SubscriptionKey::new(model, id);

        let existing = self.records().get(&key).cloned();
        if let Some(record) = existing {
            record.set_opts(&seed);
            return record;
        }

        let record = self.new_record(model, Some(id.to_string()), seed);
        let raced = {
            let mut records = self.records();
            match records.get(&key) {
                Some(raced) => Some(raced.clone()),
                None => {
                    records.insert(key.clone(), record.clone());
                    None
                }
            }
        };
        if let Some(raced) = raced {
            return raced;
        }

        self.drop_on_destroy(key, &record);
        // A record nobody ever views is torn down like one whose last viewer left.
        self.restart_eviction(&record);
        record
    }

    fn new_record(&self, model: &str, id: Option<String>, seed: FieldMap) -> LiveRecord {
        match &self.inner.transport {
            Some(transport) => LiveRecord::with_transport(
                model,
                id,
                seed,
                Arc::clone(transport),
                RecordOptions::default(),
            ),
            None => LiveRecord::new(model, id, seed),
        }
    }

    fn drop_on_destroy(&self, key: SubscriptionKey, record: &LiveRecord) {
        let store: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let listener_id = record.listener_id().to_string();
        // Subscription stays registered for the record's lifetime.
        let _subscription = record.on(DESTROY_EVENT, move |_| {
            let Some(inner) = store.upgrade() else {
                return;
            };
            let mut records = inner.records.lock().unwrap_or_else(PoisonError::into_inner);
            if records.get(&key).is_some_and(|current| current.listener_id() == listener_id) {
                records.remove(&key);
            }
        });
    }

    pub fn record(&self, model: &str, id: &str) -> Option<LiveRecord> {
        self.records().get(&SubscriptionKey::new(model, id)).cloned()
    }

    pub fn contains(&self, model: &str, id: &str) -> bool {
        self.records().contains_key(&SubscriptionKey::new(model, id))
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    // ── Viewers ────────────────────────────────────────────────────

    /// Register `viewer` on `record`, cancel any pending teardown, and make
    /// sure the record is listening.
    pub fn add_viewer(&self, record: &LiveRecord, viewer: &str) {
        record.insert_viewer(viewer);
        if let Some(pending) = record.replace_pending_eviction(None) {
            self.inner.tasks.cancel(pending);
            debug!(model = record.model(), id = ?record.id(), "eviction cancelled");
        }

        if let Some(id) = record.id() {
            self.records().entry(SubscriptionKey::new(record.model(), id)).or_insert_with(|| record.clone());
        }
        record.listen();
    }

    /// Drop `viewer` from `record` and restart the grace timer.
    pub fn remove_viewer(&self, record: &LiveRecord, viewer: &str) {
        record.remove_viewer_id(viewer);
        self.restart_eviction(record);
    }

    fn restart_eviction(&self, record: &LiveRecord) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!(model = record.model(), id = ?record.id(), "no runtime, eviction not scheduled");
            return;
        }
        if let Some(pending) = record.replace_pending_eviction(None) {
            self.inner.tasks.cancel(pending);
        }

        let store = self.clone();
        let target = record.clone();
        let handle = self
            .inner
            .tasks
            .schedule(self.inner.config.eviction_grace, async move { store.evict_if_idle(target).await });
        record.replace_pending_eviction(Some(handle));
    }

    async fn evict_if_idle(&self, record: LiveRecord) {
        record.replace_pending_eviction(None);
        if record.viewer_count() > 0 {
            return;
        }

        self.forget(&record);
        debug!(model = record.model(), id = ?record.id(), "evicting idle record");
        if let Err(error) = record.destroy().await {
            warn!(model = record.model(), id = ?record.id(), error = %error, "deafen on eviction failed");
        }
    }

    fn forget(&self, record: &LiveRecord) {
        let Some(id) = record.id() else {
            return;
        };
        let key = SubscriptionKey::new(record.model(), id);
        let mut records = self.records();
        if records.get(&key).is_some_and(|current| current.ptr_eq(record)) {
            records.remove(&key);
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Start a live collection query over `model`. Hydrated records are
    /// viewed by `listener_id`, or by a fresh id when none is given.
    pub fn query(&self, model: &str, listener_id: Option<&str>) -> CollectionQuery {
        CollectionQuery::new(self.clone(), model, listener_id)
    }

    /// Cancel every pending teardown and destroy every record.
    pub async fn shutdown(&self) {
        self.inner.tasks.cancel_all();
        let records: Vec<LiveRecord> = self.records().drain().map(|(_, record)| record).collect();
        for record in records {
            if let Err(error) = record.destroy().await {
                warn!(model = record.model(), id = ?record.id(), error = %error, "deafen on shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("records", &self.len())
            .field("online", &self.inner.transport.is_some())
            .finish()
    }
}
