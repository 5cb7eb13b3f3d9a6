// Session gateway: one WebSocket per browser connection.
//
// Outbound, the socket carries every push frame the hub routes to the
// session. Inbound, it accepts the session-scoped calls a live record makes
// (`model.listen.<type>`, `model.deafen.<type>`, `model.refresh.<type>`),
// answering each with a JSON-RPC response on the same socket.
//
// A gateway in front of a remote registry owner also relays the owner's
// push stream for the session; losing that stream closes the socket so the
// client reconnects and resubscribes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use modelsync_common::protocol::channels::PushFrame;
use modelsync_common::protocol::jsonrpc::{
    named_params, Request, RequestId, Response, RpcError, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR, UPSTREAM_UNAVAILABLE,
};
use modelsync_common::protocol::rpc_methods::{
    refresh_target, session_deafen_target, session_listen_target, RPC_PING,
};
use modelsync_common::types::SessionListenParams;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::hub::SessionHub;
use crate::proxy::SubscriptionProxy;
use crate::rpc::methods::{dispatch_request, RpcServerState};

#[derive(Clone)]
pub struct GatewayState {
    pub rpc: RpcServerState,
    pub hub: SessionHub,
    pub proxy: SubscriptionProxy,
    /// Relay the registry owner's pushes; set when the owner publishes
    /// into a hub other than `hub`.
    pub follow_owner: bool,
}

impl GatewayState {
    /// Gateway whose registry owner is the in-process `rpc` state.
    pub fn local(rpc: RpcServerState, hub: SessionHub) -> Self {
        let proxy = SubscriptionProxy::local(rpc.clone());
        Self { rpc, hub, proxy, follow_owner: false }
    }

    /// Gateway in front of the registry owner reached through `proxy`.
    pub fn forwarding(rpc: RpcServerState, hub: SessionHub, proxy: SubscriptionProxy) -> Self {
        Self { rpc, hub, proxy, follow_owner: true }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new().route("/v1/sessions/{session_id}/push", get(session_ws_route)).with_state(state)
}

async fn session_ws_route(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(mut socket: WebSocket, session_id: String, state: GatewayState) {
    let mut upstream = if state.follow_owner {
        match state.proxy.follow(&session_id).await {
            Ok(pushes) => Some(pushes),
            Err(error) => {
                warn!(session = %session_id, error = %error, "registry owner push stream unavailable");
                return;
            }
        }
    } else {
        None
    };
    let mut pushes = state.hub.attach(&session_id);
    info!(session = %session_id, "session connected");

    loop {
        tokio::select! {
            maybe_frame = pushes.recv() => {
                let Some(frame) = maybe_frame else {
                    break;
                };
                if !send_frame(&mut socket, &frame).await {
                    break;
                }
            }
            maybe_frame = next_upstream(&mut upstream) => {
                let Some(frame) = maybe_frame else {
                    warn!(session = %session_id, "registry owner push stream ended");
                    break;
                };
                if !send_frame(&mut socket, &frame).await {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };
                match message {
                    Message::Text(payload) => {
                        let response = handle_session_request(payload.as_bytes(), &session_id, &state).await;
                        let Ok(encoded) = serde_json::to_string(&response) else {
                            break;
                        };
                        if socket.send(Message::Text(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    Message::Binary(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    info!(session = %session_id, "session disconnected");
}

async fn next_upstream(upstream: &mut Option<mpsc::UnboundedReceiver<PushFrame>>) -> Option<PushFrame> {
    match upstream {
        Some(pushes) => pushes.recv().await,
        None => std::future::pending().await,
    }
}

/// Returns false once the socket is gone.
async fn send_frame(socket: &mut WebSocket, frame: &PushFrame) -> bool {
    let Ok(encoded) = serde_json::to_string(frame) else {
        return true;
    };
    socket.send(Message::Text(encoded.into())).await.is_ok()
}

/// Answer one inbound frame from `session_id`.
pub async fn handle_session_request(raw: &[u8], session_id: &str, state: &GatewayState) -> Response {
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

    let method = request.method.as_str();
    if let Some(model) = session_listen_target(method) {
        let model = model.to_string();
        let params = match session_params(&request) {
            Ok(params) => params,
            Err(response) => return response,
        };
        debug!(model = %model, session = session_id, listener = %params.listener_id, "session listen");
        let result = state
            .proxy
            .subscribe(session_id, &model, params.id.as_deref(), &params.listener_id, params.atomic)
            .await;
        return proxy_response(request.id, result);
    }

    if let Some(model) = session_deafen_target(method) {
        let model = model.to_string();
        let params = match session_params(&request) {
            Ok(params) => params,
            Err(response) => return response,
        };
        let result = state
            .proxy
            .unsubscribe(session_id, &model, params.id.as_deref(), &params.listener_id)
            .await;
        return proxy_response(request.id, result);
    }

    if method == RPC_PING || refresh_target(method).is_some() {
        return dispatch_request(request, &state.rpc).await;
    }

    Response::error(request.id, RpcError::new(METHOD_NOT_FOUND, "Method not found"))
}

fn session_params(request: &Request) -> Result<SessionListenParams, Response> {
    let params = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(named_params(params, SessionListenParams::POSITIONAL)).map_err(|error| {
        Response::error(
            request.id.clone(),
            RpcError::new(INVALID_PARAMS, "Invalid params")
                .with_data(json!({ "reason": error.to_string() })),
        )
    })
}

fn proxy_response(id: RequestId, result: Result<(), ProxyError>) -> Response {
    match result {
        Ok(()) => Response::success(id, Value::Null),
        Err(ProxyError::Rpc(error)) => Response::error(id, error),
        Err(error) => {
            warn!(error = %error, "registry owner call failed");
            Response::error(
                id,
                RpcError::new(UPSTREAM_UNAVAILABLE, "Registry unavailable")
                    .with_data(json!({ "reason": error.to_string() })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use modelsync_common::types::SubscriptionKey;

    use super::*;

    fn frame(method: &str, params: Value) -> Vec<u8> {
        serde_json::to_vec(&Request::new(method, Some(params), RequestId::Number(1))).unwrap()
    }

    fn gateway() -> GatewayState {
        let hub = SessionHub::default();
        GatewayState::local(RpcServerState::default(), hub)
    }

    #[tokio::test]
    async fn session_listen_registers_under_the_connection_session() {
        let state = gateway();
        let response =
            handle_session_request(&frame("model.listen.User", json!(["5", "l1"])), "s9", &state).await;
        assert!(response.error.is_none(), "{response:?}");

        let entries =
            state.rpc.registry().listeners(&SubscriptionKey::new("user", "5")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is("s9", "l1"));
    }

    #[tokio::test]
    async fn session_deafen_removes_only_this_session_entry() {
        let state = gateway();
        handle_session_request(&frame("model.listen.user", json!(["5", "l1"])), "s1", &state).await;
        handle_session_request(&frame("model.listen.user", json!(["5", "l1"])), "s2", &state).await;
        handle_session_request(&frame("model.deafen.user", json!(["5", "l1"])), "s1", &state).await;

        let entries =
            state.rpc.registry().listeners(&SubscriptionKey::new("user", "5")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "s2");
    }

    #[tokio::test]
    async fn registry_owner_methods_are_not_exposed_to_sessions() {
        let state = gateway();
        let response = handle_session_request(
            &frame("model.save", json!({ "model": "user", "id": "1", "updates": ["name"] })),
            "s1",
            &state,
        )
        .await;
        assert_eq!(response.error.expect("error expected").code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_listener_id_is_invalid_params() {
        let state = gateway();
        let response =
            handle_session_request(&frame("model.listen.user", json!(["5"])), "s1", &state).await;
        assert_eq!(response.error.expect("error expected").code, INVALID_PARAMS);
    }
}
