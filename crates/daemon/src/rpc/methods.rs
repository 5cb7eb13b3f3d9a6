use std::sync::Arc;

use modelsync_common::protocol::jsonrpc::{
    named_params, Request, RequestId, Response, RpcError, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use modelsync_common::protocol::rpc_methods::{
    refresh_target, DAEMON_SHUTDOWN, MODEL_DEAFEN, MODEL_LISTEN, MODEL_SAVE, RPC_PING,
};
use modelsync_common::types::{
    DeafenParams, FieldMap, ListenParams, RefreshParams, SaveEvent,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::SourceError;
use crate::fanout::{FanoutEngine, PayloadHook};
use crate::hub::{SessionHub, SessionPublisher};
use crate::registry::{RegistrySettings, SubscriptionRegistry};
use crate::source::{MemoryRecordSource, RecordSource};

/// Everything the registry owner needs to answer RPC calls.
#[derive(Clone)]
pub struct RpcServerState {
    registry: SubscriptionRegistry,
    source: Arc<dyn RecordSource>,
    fanout: FanoutEngine,
    /// Push sink sessions can attach to, when the state owns one.
    hub: Option<SessionHub>,
    /// Set when the record source accepts field writes through `model.save`.
    writable: Option<MemoryRecordSource>,
    shutdown_notifier: Option<broadcast::Sender<()>>,
}

impl Default for RpcServerState {
    fn default() -> Self {
        Self::in_memory(RegistrySettings::default(), SessionHub::default())
    }
}

impl RpcServerState {
    pub fn new(
        registry: SubscriptionRegistry,
        source: Arc<dyn RecordSource>,
        publisher: Arc<dyn SessionPublisher>,
    ) -> Self {
        let fanout = FanoutEngine::new(registry.clone(), Arc::clone(&source), publisher);
        Self { registry, source, fanout, hub: None, writable: None, shutdown_notifier: None }
    }

    /// Fully in-process state: memory registry, memory record source, and
    /// `hub` as the push sink.
    pub fn in_memory(settings: RegistrySettings, hub: SessionHub) -> Self {
        Self::in_memory_with(
            SubscriptionRegistry::in_memory(settings),
            MemoryRecordSource::default(),
            hub,
        )
    }

    /// Like [`RpcServerState::in_memory`], with caller-owned parts.
    pub fn in_memory_with(
        registry: SubscriptionRegistry,
        records: MemoryRecordSource,
        hub: SessionHub,
    ) -> Self {
        let mut state = Self::new(registry, Arc::new(records.clone()), Arc::new(hub.clone()));
        state.hub = Some(hub);
        state.writable = Some(records);
        state
    }

    pub fn with_shutdown_notifier(mut self, shutdown_notifier: broadcast::Sender<()>) -> Self {
        self.shutdown_notifier = Some(shutdown_notifier);
        self
    }

    pub fn with_payload_hook(mut self, hook: Arc<dyn PayloadHook>) -> Self {
        self.fanout = self.fanout.with_payload_hook(hook);
        self
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn fanout(&self) -> &FanoutEngine {
        &self.fanout
    }

    pub fn hub(&self) -> Option<&SessionHub> {
        self.hub.as_ref()
    }

    /// The writable record map, when the state was built in memory.
    pub fn records(&self) -> Option<&MemoryRecordSource> {
        self.writable.as_ref()
    }
}

/// `model.save` params: the save notification, optionally carrying the new
/// field values for a writable record source.
#[derive(Debug, Deserialize)]
struct SaveParams {
    model: String,
    id: String,
    #[serde(default)]
    updates: Vec<String>,
    #[serde(default)]
    fields: Option<FieldMap>,
}

impl SaveParams {
    const POSITIONAL: &'static [&'static str] = &["model", "id", "updates", "fields"];
}

pub async fn handle_raw_request(raw: &[u8], state: &RpcServerState) -> Response {
    let request = match serde_json::from_slice::<Request>(raw) {
        Ok(request) => request,
        Err(error) => {
            return Response::error(
                RequestId::Null,
                RpcError::new(PARSE_ERROR, "Parse error")
                    .with_data(json!({ "reason": error.to_string() })),
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return Response::error(request.id, RpcError::new(INVALID_REQUEST, "Invalid Request"));
    }

    dispatch_request(request, state).await
}

pub async fn dispatch_request(request: Request, state: &RpcServerState) -> Response {
    match request.method.as_str() {
        RPC_PING => Response::success(request.id, json!({ "ok": true })),
        DAEMON_SHUTDOWN => {
            if let Some(notifier) = &state.shutdown_notifier {
                let _ = notifier.send(());
            }
            Response::success(request.id, json!({ "ok": true }))
        }
        MODEL_LISTEN => handle_listen(request, state).await,
        MODEL_DEAFEN => handle_deafen(request, state).await,
        MODEL_SAVE => handle_save(request, state).await,
        method => match refresh_target(method) {
            Some(model) => {
                let model = model.to_string();
                handle_refresh(request, &model, state).await
            }
            None => Response::error(request.id, RpcError::new(METHOD_NOT_FOUND, "Method not found")),
        },
    }
}

async fn handle_listen(request: Request, state: &RpcServerState) -> Response {
    let params: ListenParams =
        match parse_params(request.params, request.id.clone(), MODEL_LISTEN, ListenParams::POSITIONAL)
        {
            Ok(params) => params,
            Err(response) => return response,
        };

    match state.registry.listen(&params).await {
        Ok(()) => Response::success(request.id, Value::Null),
        Err(error) => {
            warn!(model = %params.model, id = %params.id, error = %error, "listen failed");
            Response::error(request.id, (&error).into())
        }
    }
}

async fn handle_deafen(request: Request, state: &RpcServerState) -> Response {
    let params: DeafenParams =
        match parse_params(request.params, request.id.clone(), MODEL_DEAFEN, DeafenParams::POSITIONAL)
        {
            Ok(params) => params,
            Err(response) => return response,
        };

    match state.registry.deafen(&params).await {
        Ok(()) => Response::success(request.id, Value::Null),
        Err(error) => {
            warn!(model = %params.model, id = %params.id, error = %error, "deafen failed");
            Response::error(request.id, (&error).into())
        }
    }
}

async fn handle_refresh(request: Request, model: &str, state: &RpcServerState) -> Response {
    let params: RefreshParams =
        match parse_params(request.params, request.id.clone(), "model.refresh", RefreshParams::POSITIONAL)
        {
            Ok(params) => params,
            Err(response) => return response,
        };

    match state.source.find_by_id(model, &params.id).await {
        Ok(Some(record)) => Response::success(request.id, Value::Object(record)),
        Ok(None) => {
            let error = SourceError::NotFound { model: model.to_lowercase(), id: params.id };
            Response::error(request.id, (&error).into())
        }
        Err(error) => Response::error(request.id, (&error).into()),
    }
}

async fn handle_save(request: Request, state: &RpcServerState) -> Response {
    let params: SaveParams =
        match parse_params(request.params, request.id.clone(), MODEL_SAVE, SaveParams::POSITIONAL) {
            Ok(params) => params,
            Err(response) => return response,
        };

    let mut updates = params.updates;
    if let Some(fields) = params.fields {
        let Some(records) = &state.writable else {
            return invalid_params_response(
                request.id,
                "model.save `fields` requires a writable record source".to_string(),
            );
        };
        for field in records.apply(&params.model, &params.id, fields).await {
            if !updates.contains(&field) {
                updates.push(field);
            }
        }
    }

    let event = SaveEvent { model: params.model, id: params.id, updates };
    match state.fanout.on_save(&event).await {
        Ok(outcome) => Response::success(request.id, json!(outcome)),
        Err(error) => {
            warn!(model = %event.model, id = %event.id, error = %error, "fan-out aborted");
            Response::error(request.id, (&error).into())
        }
    }
}

fn parse_params<T: DeserializeOwned>(
    params: Option<Value>,
    request_id: RequestId,
    method: &str,
    positional: &[&str],
) -> Result<T, Response> {
    let Some(params) = params else {
        return Err(invalid_params_response(request_id, format!("{method} requires params")));
    };

    serde_json::from_value::<T>(named_params(params, positional)).map_err(|error| {
        invalid_params_response(request_id, format!("failed to decode {method} params: {error}"))
    })
}

fn invalid_params_response(request_id: RequestId, reason: String) -> Response {
    Response::error(
        request_id,
        RpcError::new(INVALID_PARAMS, "Invalid params").with_data(json!({ "reason": reason })),
    )
}

#[cfg(test)]
mod tests {
    use modelsync_common::types::SubscriptionKey;

    use super::*;

    fn request(method: &str, params: Value) -> Request {
        Request::new(method, Some(params), RequestId::Number(1))
    }

    // ── Envelope ───────────────────────────────────────────────────

    #[tokio::test]
    async fn malformed_json_is_a_parse_error_with_null_id() {
        let response = handle_raw_request(b"{not json", &RpcServerState::default()).await;
        assert_eq!(response.id, RequestId::Null);
        assert_eq!(response.error.expect("error expected").code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn wrong_version_is_an_invalid_request() {
        let raw = br#"{"jsonrpc":"1.0","method":"rpc.ping","id":7}"#;
        let response = handle_raw_request(raw, &RpcServerState::default()).await;
        assert_eq!(response.id, RequestId::Number(7));
        assert_eq!(response.error.expect("error expected").code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn shutdown_notifies_the_runtime() {
        let (tx, mut rx) = broadcast::channel(1);
        let state = RpcServerState::default().with_shutdown_notifier(tx);
        let response = dispatch_request(request(DAEMON_SHUTDOWN, json!({})), &state).await;
        assert_eq!(response.result, Some(json!({ "ok": true })));
        rx.try_recv().expect("shutdown should be signalled");
    }

    // ── Registry methods ───────────────────────────────────────────

    #[tokio::test]
    async fn listen_accepts_positional_and_named_params() {
        let state = RpcServerState::default();
        let positional =
            dispatch_request(request(MODEL_LISTEN, json!(["s1", "User", "1", "l1"])), &state).await;
        assert!(positional.error.is_none(), "{positional:?}");

        let named = dispatch_request(
            request(
                MODEL_LISTEN,
                json!({ "session_id": "s2", "model": "user", "id": "1", "listener_id": "l2", "atomic": true }),
            ),
            &state,
        )
        .await;
        assert!(named.error.is_none(), "{named:?}");

        let entries = state.registry().listeners(&SubscriptionKey::new("user", "1")).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].atomic);
    }

    #[tokio::test]
    async fn listen_without_params_is_invalid() {
        let state = RpcServerState::default();
        let response =
            dispatch_request(Request::new(MODEL_LISTEN, None, RequestId::Number(3)), &state).await;
        assert_eq!(response.error.expect("error expected").code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn deafen_removes_the_entry() {
        let state = RpcServerState::default();
        dispatch_request(request(MODEL_LISTEN, json!(["s1", "user", "1", "l1"])), &state).await;
        let response =
            dispatch_request(request(MODEL_DEAFEN, json!(["s1", "user", "1", "l1"])), &state).await;
        assert_eq!(response.result, Some(Value::Null));
        assert!(state
            .registry()
            .listeners(&SubscriptionKey::new("user", "1"))
            .await
            .unwrap()
            .is_empty());
    }

    // ── Refresh ────────────────────────────────────────────────────

    #[tokio::test]
    async fn refresh_returns_the_sanitized_record() {
        let state = RpcServerState::default();
        let records = state.records().expect("in-memory state is writable");
        records.insert("user", "1", json!({ "name": "Ada" }).as_object().cloned().unwrap()).await;

        let response = dispatch_request(request("model.refresh.user", json!(["1"])), &state).await;
        assert_eq!(response.result, Some(json!({ "name": "Ada" })));
    }

    #[tokio::test]
    async fn refresh_of_missing_record_is_not_found() {
        let response =
            dispatch_request(request("model.refresh.user", json!({ "id": "9" })), &RpcServerState::default())
                .await;
        let error = response.error.expect("error expected");
        assert_eq!(error.code, modelsync_common::protocol::jsonrpc::RECORD_NOT_FOUND);
    }

    #[tokio::test]
    async fn bare_refresh_prefix_is_method_not_found() {
        let response =
            dispatch_request(request("model.refresh.", json!(["1"])), &RpcServerState::default()).await;
        assert_eq!(response.error.expect("error expected").code, METHOD_NOT_FOUND);
    }

    // ── Save ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn save_with_fields_writes_and_fans_out() {
        let hub = SessionHub::default();
        let state = RpcServerState::in_memory(RegistrySettings::default(), hub.clone());
        let mut push = hub.attach("s1");
        dispatch_request(request(MODEL_LISTEN, json!(["s1", "user", "1", "l1", true])), &state).await;

        let response = dispatch_request(
            request(MODEL_SAVE, json!({ "model": "user", "id": "1", "fields": { "name": "Ada" } })),
            &state,
        )
        .await;
        assert_eq!(response.result.expect("result expected")["outcome"], "delivered");

        let frame = push.recv().await.expect("push expected");
        assert_eq!(frame.channel, "model.update.user.1");
        assert_eq!(frame.payload, json!({ "name": "Ada" }));
    }

    #[tokio::test]
    async fn save_of_bookkeeping_fields_reports_no_effective_updates() {
        let response = dispatch_request(
            request(MODEL_SAVE, json!(["user", "1", ["updated_at"]])),
            &RpcServerState::default(),
        )
        .await;
        assert_eq!(response.result, Some(json!({ "outcome": "no_effective_updates" })));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let response =
            dispatch_request(request("model.explode", json!({})), &RpcServerState::default()).await;
        assert_eq!(response.error.expect("error expected").code, METHOD_NOT_FOUND);
    }
}
