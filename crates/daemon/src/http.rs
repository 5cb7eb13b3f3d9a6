// HTTP surface: health check plus the session push gateway.

use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::rpc::ws::{self, GatewayState};

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn build_router(state: GatewayState) -> Router {
    let hub = state.hub.clone();
    let health = Router::new().route(
        "/healthz",
        get(move || {
            let sessions = hub.session_count();
            async move { healthz(sessions) }
        }),
    );

    health.merge(ws::router(state)).layer(middleware::from_fn(request_context_middleware))
}

pub async fn serve_until_shutdown(
    listener: TcpListener,
    state: GatewayState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .context("http server exited unexpectedly")
}

fn healthz(sessions: usize) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "ok": true, "sessions": sessions })))
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;
    if let Ok(header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}
