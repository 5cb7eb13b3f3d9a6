// Live collection queries.
//
// A query accumulates predicate ops in call order and ships them to
// `model.find.<type>` untouched; the backend owns their meaning. Results are
// hydrated through the store so a record seen by both a collection and a
// detail view is one shared mirror. A listening collection follows
// membership pushes on `collection.<subscription>.model.add` / `.remove`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use modelsync_common::protocol::channels::{collection_add_channel, collection_remove_channel};
use modelsync_common::protocol::rpc_methods::find_method;
use modelsync_common::types::FieldMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::observer::{Observer, Subscription};
use crate::record::{LiveRecord, UPDATE_EVENT};
use crate::store::RecordStore;
use crate::transport::HandlerId;

/// One predicate op, e.g. `{"op": "lt", "args": ["age", 30]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOp {
    pub op: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct CollectionQuery {
    store: RecordStore,
    model: String,
    listener_id: String,
    ops: Vec<QueryOp>,
}

impl CollectionQuery {
    pub(crate) fn new(store: RecordStore, model: &str, listener_id: Option<&str>) -> Self {
        Self {
            store,
            model: model.to_lowercase(),
            listener_id: listener_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ops: Vec::new(),
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn ops(&self) -> &[QueryOp] {
        &self.ops
    }

    /// Append an arbitrary op.
    pub fn op(mut self, op: &str, args: Vec<Value>) -> Self {
        self.ops.push(QueryOp { op: op.to_string(), args });
        self
    }

    pub fn where_(self, field: &str, value: Value) -> Self {
        self.op("where", vec![json!(field), value])
    }

    pub fn lt(self, field: &str, value: Value) -> Self {
        self.op("lt", vec![json!(field), value])
    }

    pub fn gt(self, field: &str, value: Value) -> Self {
        self.op("gt", vec![json!(field), value])
    }

    pub fn in_(self, field: &str, values: Vec<Value>) -> Self {
        self.op("in", vec![json!(field), Value::Array(values)])
    }

    pub fn nin(self, field: &str, values: Vec<Value>) -> Self {
        self.op("nin", vec![json!(field), Value::Array(values)])
    }

    pub fn elem(self, field: &str, matcher: Value) -> Self {
        self.op("elem", vec![json!(field), matcher])
    }

    pub fn sort(self, field: &str, direction: i8) -> Self {
        self.op("sort", vec![json!(field), json!(direction)])
    }

    pub fn limit(self, count: u64) -> Self {
        self.op("limit", vec![json!(count)])
    }

    /// Run the query and hydrate every result through the store.
    pub async fn find(&self) -> Result<LiveCollection, ClientError> {
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let rows = self.fetch(&subscription_id).await?;
        let items = rows.into_iter().map(|fields| self.hydrate(fields)).collect();

        Ok(LiveCollection::new(
            self.store.clone(),
            &self.model,
            &self.listener_id,
            subscription_id,
            items,
        ))
    }

    /// Run the query and hydrate only the first result.
    pub async fn find_one(&self) -> Result<Option<LiveRecord>, ClientError> {
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let rows = self.fetch(&subscription_id).await?;
        Ok(rows.into_iter().next().map(|fields| self.hydrate(fields)))
    }

    async fn fetch(&self, subscription_id: &str) -> Result<Vec<FieldMap>, ClientError> {
        let transport = self.store.transport().ok_or(ClientError::NoTransport)?;
        let method = find_method(&self.model);
        let params = json!({ "query": self.ops, "subscription_id": subscription_id });

        let response = transport.call(&method, params).await?;
        let Value::Array(rows) = response else {
            return Err(ClientError::UnexpectedResponse { method, reason: "expected an array".into() });
        };
        rows.into_iter()
            .map(|row| match row {
                Value::Object(fields) => Ok(fields),
                other => Err(ClientError::UnexpectedResponse {
                    method: method.clone(),
                    reason: format!("expected a record, got {other}"),
                }),
            })
            .collect()
    }

    fn hydrate(&self, fields: FieldMap) -> LiveRecord {
        hydrate(&self.store, &self.model, &self.listener_id, fields)
    }
}

fn record_id(fields: &FieldMap) -> Option<String> {
    match fields.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn hydrate(store: &RecordStore, model: &str, viewer: &str, fields: FieldMap) -> LiveRecord {
    let id = record_id(&fields);
    let record = store.get(model, id.as_deref(), fields);
    store.add_viewer(&record, viewer);
    record
}

#[derive(Clone)]
pub struct LiveCollection {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    store: RecordStore,
    model: String,
    viewer: String,
    subscription_id: String,
    items: Mutex<Vec<LiveRecord>>,
    handlers: Mutex<Vec<(String, HandlerId)>>,
    events: Observer<Value>,
}

impl LiveCollection {
    fn new(
        store: RecordStore,
        model: &str,
        viewer: &str,
        subscription_id: String,
        items: Vec<LiveRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                store,
                model: model.to_string(),
                viewer: viewer.to_string(),
                subscription_id,
                items: Mutex::new(items),
                handlers: Mutex::new(Vec::new()),
                events: Observer::default(),
            }),
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.inner.subscription_id
    }

    fn items_guard(&self) -> MutexGuard<'_, Vec<LiveRecord>> {
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn items(&self) -> Vec<LiveRecord> {
        self.items_guard().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items_guard().iter().filter_map(|record| record.id().map(str::to_string)).collect()
    }

    pub fn len(&self) -> usize {
        self.items_guard().len()
    }

    /// Observe membership changes (`update`).
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(event, handler)
    }

    pub fn is_listening(&self) -> bool {
        !self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Follow membership pushes. Idempotent; a no-op without a transport.
    pub fn listen(&self) {
        let Some(transport) = self.inner.store.transport() else {
            return;
        };
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if !handlers.is_empty() {
            return;
        }

        let add_channel = collection_add_channel(&self.inner.subscription_id);
        let weak = Arc::downgrade(&self.inner);
        let add = transport.on(
            &add_channel,
            Arc::new(move |payload| {
                if let Some(collection) = upgrade(&weak) {
                    collection.apply_add(payload);
                }
            }),
        );

        let remove_channel = collection_remove_channel(&self.inner.subscription_id);
        let weak = Arc::downgrade(&self.inner);
        let remove = transport.on(
            &remove_channel,
            Arc::new(move |payload| {
                if let Some(collection) = upgrade(&weak) {
                    collection.apply_remove(payload);
                }
            }),
        );

        handlers.push((add_channel, add));
        handlers.push((remove_channel, remove));
        debug!(model = %self.inner.model, subscription = %self.inner.subscription_id, "collection listen");
    }

    fn apply_add(&self, payload: Value) {
        let Value::Object(fields) = payload else {
            warn!(subscription = %self.inner.subscription_id, "ignoring non-object collection add");
            return;
        };
        let id = record_id(&fields);
        let existing = id.as_deref().and_then(|id| {
            self.items_guard().iter().find(|record| record.id() == Some(id)).cloned()
        });
        if let Some(record) = existing {
            record.set_opts(&fields);
            return;
        }

        let record = hydrate(&self.inner.store, &self.inner.model, &self.inner.viewer, fields);
        self.items_guard().push(record);
        self.inner.events.emit(UPDATE_EVENT, &json!({ "added": id }));
    }

    fn apply_remove(&self, payload: Value) {
        let id = match &payload {
            Value::Object(fields) => record_id(fields),
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        };
        let Some(id) = id else {
            warn!(subscription = %self.inner.subscription_id, "collection remove without an id");
            return;
        };

        let removed = {
            let mut items = self.items_guard();
            let position = items.iter().position(|record| record.id() == Some(id.as_str()));
            position.map(|index| items.remove(index))
        };
        if let Some(record) = removed {
            self.inner.store.remove_viewer(&record, &self.inner.viewer);
            self.inner.events.emit(UPDATE_EVENT, &json!({ "removed": id }));
        }
    }

    /// Release every item's viewer reference and stop following pushes.
    pub fn destroy(&self) {
        let handlers = std::mem::take(&mut *self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(transport) = self.inner.store.transport() {
            for (channel, handler) in handlers {
                transport.off(&channel, handler);
            }
        }

        let items = std::mem::take(&mut *self.items_guard());
        for record in &items {
            self.inner.store.remove_viewer(record, &self.inner.viewer);
        }
    }
}

impl std::fmt::Debug for LiveCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("model", &self.inner.model)
            .field("subscription_id", &self.inner.subscription_id)
            .field("len", &self.len())
            .finish()
    }
}

fn upgrade(weak: &Weak<CollectionInner>) -> Option<LiveCollection> {
    weak.upgrade().map(|inner| LiveCollection { inner })
}
