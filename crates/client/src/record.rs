// Client-resident mirror of one record.
//
// A `LiveRecord` is a cheap handle; clones share one mirror. The mirror
// starts `Unsubscribed`, moves to `Listening` on `listen()` and back on
// `destroy()`. Incoming `model.update.<type>.<id>` pushes are merged field
// by field, and observers hear about each changed field plus one aggregate
// `update` event.
//
// Locks are never held while calling the transport or emitting events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use modelsync_common::protocol::channels::{update_channel, CONNECTED_SIGNAL, CONNECT_SIGNAL};
use modelsync_common::protocol::rpc_methods::{
    persist_method, refresh_method, session_deafen_method, session_listen_method,
};
use modelsync_common::types::FieldMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::observer::{Observer, Subscription};
use crate::path;
use crate::scheduler::TaskHandle;
use crate::transport::{HandlerId, Transport};

/// Emitted once after a merge that changed at least one field.
pub const UPDATE_EVENT: &str = "update";
/// Emitted first thing in `destroy()`.
pub const DESTROY_EVENT: &str = "destroy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Unsubscribed,
    Listening,
}

#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    /// Reuse a known listener id instead of minting a fresh one.
    pub listener_id: Option<String>,
    /// Ask for only the changed fields on each push.
    pub atomic: bool,
}

#[derive(Clone)]
pub struct LiveRecord {
    inner: Arc<RecordInner>,
}

struct RecordInner {
    model: String,
    id: Option<String>,
    listener_id: String,
    atomic: bool,
    transport: Option<Arc<dyn Transport>>,
    events: Observer<Value>,
    state: Mutex<RecordState>,
}

struct RecordState {
    data: FieldMap,
    listen: ListenState,
    handlers: Vec<(String, HandlerId)>,
    viewers: HashSet<String>,
    pending_eviction: Option<TaskHandle>,
}

impl LiveRecord {
    /// A plain local mirror: `listen` and `destroy` only do local
    /// bookkeeping.
    pub fn new(model: &str, id: Option<String>, seed: FieldMap) -> Self {
        Self::build(model, id, seed, None, RecordOptions::default())
    }

    pub fn with_transport(
        model: &str,
        id: Option<String>,
        seed: FieldMap,
        transport: Arc<dyn Transport>,
        options: RecordOptions,
    ) -> Self {
        Self::build(model, id, seed, Some(transport), options)
    }

    fn build(
        model: &str,
        id: Option<String>,
        seed: FieldMap,
        transport: Option<Arc<dyn Transport>>,
        options: RecordOptions,
    ) -> Self {
        let listener_id = options.listener_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            inner: Arc::new(RecordInner {
                model: model.to_lowercase(),
                id: id.filter(|id| !id.is_empty()),
                listener_id,
                atomic: options.atomic,
                transport,
                events: Observer::default(),
                state: Mutex::new(RecordState {
                    data: seed,
                    listen: ListenState::Unsubscribed,
                    handlers: Vec::new(),
                    viewers: HashSet::new(),
                    pending_eviction: None,
                }),
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn id(&self) -> Option<&str> {
        self.inner.id.as_deref()
    }

    pub fn listener_id(&self) -> &str {
        &self.inner.listener_id
    }

    pub fn listen_state(&self) -> ListenState {
        self.state().listen
    }

    pub fn is_listening(&self) -> bool {
        self.listen_state() == ListenState::Listening
    }

    /// Whether two handles share one mirror.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, RecordState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Observers ──────────────────────────────────────────────────

    /// Observe a field path, `update`, or `destroy`.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(event, handler)
    }

    pub fn observer_count(&self, event: &str) -> usize {
        self.inner.events.handler_count(event)
    }

    // ── Data ───────────────────────────────────────────────────────

    /// Snapshot of every field.
    pub fn data(&self) -> FieldMap {
        self.state().data.clone()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        path::get(&self.state().data, path).cloned()
    }

    /// Write `value` at `path` and notify `path` observers, then the
    /// top-level field's observers when `path` is nested. With `persist`,
    /// the delta is also sent to `model.persist.<type>` without waiting.
    pub fn set(&self, path: &str, value: Value, persist: bool) {
        path::set(&mut self.state().data, path, value.clone());

        self.inner.events.emit(path, &value);
        let root = path::root(path);
        if root != path {
            let root_value = self.get(root).unwrap_or(Value::Null);
            self.inner.events.emit(root, &root_value);
        }

        if !persist {
            return;
        }
        let (Some(transport), Some(id)) = (self.inner.transport.clone(), self.inner.id.clone()) else {
            return;
        };
        let mut fields = FieldMap::new();
        fields.insert(path.to_string(), value);
        spawn_call(transport, persist_method(&self.inner.model), json!({ "id": id, "fields": fields }));
    }

    /// Merge `fields` into the mirror. Returns the names of fields whose
    /// value changed; equal values are left alone and raise no events.
    pub fn merge(&self, fields: &FieldMap) -> Vec<String> {
        let changed: Vec<(String, Value)> = {
            let mut state = self.state();
            let mut changed = Vec::new();
            for (key, value) in fields {
                if state.data.get(key) == Some(value) {
                    continue;
                }
                state.data.insert(key.clone(), value.clone());
                changed.push((key.clone(), value.clone()));
            }
            changed
        };

        for (key, value) in &changed {
            self.inner.events.emit(key, value);
        }
        let names: Vec<String> = changed.into_iter().map(|(key, _)| key).collect();
        if !names.is_empty() {
            self.inner.events.emit(UPDATE_EVENT, &json!(names));
        }
        names
    }

    /// Merge seed fields from a later lookup of the same record.
    pub fn set_opts(&self, seed: &FieldMap) -> Vec<String> {
        self.merge(seed)
    }

    fn apply_push(&self, payload: Value) {
        match payload {
            Value::Object(fields) => {
                let changed = self.merge(&fields);
                debug!(model = %self.inner.model, id = ?self.inner.id, changed = changed.len(), "merged update push");
            }
            other => warn!(model = %self.inner.model, payload = %other, "ignoring non-object update push"),
        }
    }

    // ── Subscription lifecycle ─────────────────────────────────────

    /// Subscribe to pushes for this record. Idempotent; the subscribe call
    /// is not awaited. Records without an id or transport stay local.
    pub fn listen(&self) {
        let (Some(transport), Some(id)) = (self.inner.transport.clone(), self.inner.id.clone()) else {
            return;
        };
        {
            let mut state = self.state();
            if state.listen == ListenState::Listening {
                return;
            }
            state.listen = ListenState::Listening;
        }

        let channel = update_channel(&self.inner.model, &id);
        let weak = Arc::downgrade(&self.inner);
        let update_handler = transport.on(
            &channel,
            Arc::new(move |payload| {
                if let Some(record) = upgrade(&weak) {
                    record.apply_push(payload);
                }
            }),
        );

        let mut handlers = vec![(channel, update_handler)];
        for signal in [CONNECT_SIGNAL, CONNECTED_SIGNAL] {
            let weak = Arc::downgrade(&self.inner);
            let handler = transport.on(
                signal,
                Arc::new(move |_| {
                    if let Some(record) = upgrade(&weak) {
                        record.resubscribe();
                    }
                }),
            );
            handlers.push((signal.to_string(), handler));
        }
        self.state().handlers = handlers;

        debug!(model = %self.inner.model, id = %id, listener = %self.inner.listener_id, "listen");
        self.send_subscribe(transport, id);
    }

    fn resubscribe(&self) {
        if !self.is_listening() {
            return;
        }
        let (Some(transport), Some(id)) = (self.inner.transport.clone(), self.inner.id.clone()) else {
            return;
        };
        debug!(model = %self.inner.model, id = %id, listener = %self.inner.listener_id, "resubscribe after reconnect");
        self.send_subscribe(transport, id);
    }

    fn send_subscribe(&self, transport: Arc<dyn Transport>, id: String) {
        spawn_call(
            transport,
            session_listen_method(&self.inner.model),
            json!([id, self.inner.listener_id, self.inner.atomic]),
        );
    }

    /// Fetch the authoritative fields and merge them.
    pub async fn refresh(&self) -> Result<Vec<String>, ClientError> {
        let transport = self.inner.transport.clone().ok_or(ClientError::NoTransport)?;
        let id = self
            .inner
            .id
            .clone()
            .ok_or_else(|| ClientError::MissingId { model: self.inner.model.clone() })?;

        let method = refresh_method(&self.inner.model);
        let response = transport.call(&method, json!([id])).await?;
        match response {
            Value::Object(fields) => Ok(self.merge(&fields)),
            other => Err(ClientError::UnexpectedResponse {
                method,
                reason: format!("expected a field map, got {other}"),
            }),
        }
    }

    /// Emit `destroy`, then drop push handlers and unsubscribe. The
    /// unsubscribe call is only made when the record was listening.
    pub async fn destroy(&self) -> Result<(), ClientError> {
        self.inner.events.emit(DESTROY_EVENT, &Value::Null);

        let Some(transport) = self.inner.transport.clone() else {
            return Ok(());
        };
        let (was_listening, handlers) = {
            let mut state = self.state();
            let was_listening = state.listen == ListenState::Listening;
            state.listen = ListenState::Unsubscribed;
            (was_listening, std::mem::take(&mut state.handlers))
        };
        for (channel, handler) in handlers {
            transport.off(&channel, handler);
        }

        let Some(id) = self.inner.id.as_deref() else {
            return Ok(());
        };
        if !was_listening {
            return Ok(());
        }

        debug!(model = %self.inner.model, id = %id, listener = %self.inner.listener_id, "deafen");
        let method = session_deafen_method(&self.inner.model);
        transport.call(&method, json!([id, self.inner.listener_id])).await?;
        Ok(())
    }

    // ── Viewer bookkeeping (driven by the store) ───────────────────

    pub fn viewer_count(&self) -> usize {
        self.state().viewers.len()
    }

    pub fn has_viewer(&self, viewer: &str) -> bool {
        self.state().viewers.contains(viewer)
    }

    pub(crate) fn insert_viewer(&self, viewer: &str) -> bool {
        self.state().viewers.insert(viewer.to_string())
    }

    pub(crate) fn remove_viewer_id(&self, viewer: &str) -> bool {
        self.state().viewers.remove(viewer)
    }

    pub(crate) fn replace_pending_eviction(&self, handle: Option<TaskHandle>) -> Option<TaskHandle> {
        std::mem::replace(&mut self.state().pending_eviction, handle)
    }
}

impl std::fmt::Debug for LiveRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRecord")
            .field("model", &self.inner.model)
            .field("id", &self.inner.id)
            .field("listener_id", &self.inner.listener_id)
            .field("state", &self.listen_state())
            .finish()
    }
}

fn upgrade(weak: &Weak<RecordInner>) -> Option<LiveRecord> {
    weak.upgrade().map(|inner| LiveRecord { inner })
}

/// Issue `method` without waiting for the answer. Failures are logged;
/// reconnect resubscription and registry expiry cover recovery.
fn spawn_call(transport: Arc<dyn Transport>, method: String, params: Value) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(method = %method, "no async runtime, dropping call");
        return;
    };
    runtime.spawn(async move {
        if let Err(error) = transport.call(&method, params).await {
            warn!(method = %method, error = %error, "fire-and-forget call failed");
        }
    });
}
