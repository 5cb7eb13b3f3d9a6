// Subscription client proxy.
//
// Thin facade that forwards subscribe/unsubscribe to the registry owner,
// which may live in another process. Holds no state of its own. When the
// owner is remote, its fan-out publishes into its own hub, so a gateway
// follows the owner's push stream for each session it serves.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modelsync_common::protocol::channels::PushFrame;
use modelsync_common::protocol::jsonrpc::{Request, RequestId, Response};
use modelsync_common::protocol::rpc_methods::{MODEL_DEAFEN, MODEL_LISTEN, SESSION_ATTACH};
use modelsync_common::types::{DeafenParams, ListenParams};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::rpc::methods::{dispatch_request, RpcServerState};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

pub type CallFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ProxyError>> + Send + 'a>>;
pub type FollowFuture<'a> =
    Pin<Box<dyn Future<Output = Result<mpsc::UnboundedReceiver<PushFrame>, ProxyError>> + Send + 'a>>;

/// Point-to-point RPC toward the registry owner.
pub trait RegistryCaller: Send + Sync {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> CallFuture<'a>;

    /// Open the owner's push stream for `session_id`. The stream ends when
    /// the owner goes away.
    fn follow<'a>(&'a self, session_id: &'a str) -> FollowFuture<'a> {
        let reason = format!("cannot follow pushes for session `{session_id}`");
        Box::pin(async move { Err(ProxyError::Unreachable(reason)) })
    }
}

#[derive(Clone)]
pub struct SubscriptionProxy {
    caller: Arc<dyn RegistryCaller>,
}

impl SubscriptionProxy {
    pub fn new(caller: Arc<dyn RegistryCaller>) -> Self {
        Self { caller }
    }

    /// Proxy into an in-process registry owner.
    pub fn local(state: RpcServerState) -> Self {
        Self::new(Arc::new(LocalCaller::new(state)))
    }

    /// Register `listener_id` for `(model, id)`. A record without an id has
    /// nothing to subscribe to, so the call is skipped.
    pub async fn subscribe(
        &self,
        session_id: &str,
        model: &str,
        id: Option<&str>,
        listener_id: &str,
        atomic: bool,
    ) -> Result<(), ProxyError> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            debug!(model, session = session_id, listener = listener_id, "subscribe skipped, no id");
            return Ok(());
        };

        let params = ListenParams {
            session_id: session_id.to_string(),
            model: model.to_lowercase(),
            id: id.to_string(),
            listener_id: listener_id.to_string(),
            atomic,
        };
        self.caller.call(MODEL_LISTEN, serde_json::to_value(params)?).await.map(drop)
    }

    pub async fn unsubscribe(
        &self,
        session_id: &str,
        model: &str,
        id: Option<&str>,
        listener_id: &str,
    ) -> Result<(), ProxyError> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return Ok(());
        };

        let params = DeafenParams {
            session_id: session_id.to_string(),
            model: model.to_lowercase(),
            id: id.to_string(),
            listener_id: listener_id.to_string(),
        };
        self.caller.call(MODEL_DEAFEN, serde_json::to_value(params)?).await.map(drop)
    }

    /// Pushes the registry owner routes to `session_id`.
    pub async fn follow(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<PushFrame>, ProxyError> {
        self.caller.follow(session_id).await
    }
}

/// Calls straight into a registry owner living in this process.
#[derive(Clone)]
pub struct LocalCaller {
    state: RpcServerState,
    next_request_id: Arc<AtomicI64>,
}

impl LocalCaller {
    pub fn new(state: RpcServerState) -> Self {
        Self { state, next_request_id: Arc::new(AtomicI64::new(1)) }
    }
}

impl RegistryCaller for LocalCaller {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> CallFuture<'a> {
        Box::pin(async move {
            let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::Relaxed));
            let response = dispatch_request(Request::new(method, Some(params), id), &self.state).await;
            Ok(response.into_result()?)
        })
    }

    fn follow<'a>(&'a self, session_id: &'a str) -> FollowFuture<'a> {
        Box::pin(async move {
            match self.state.hub() {
                Some(hub) => Ok(hub.attach(session_id)),
                None => Err(ProxyError::Unreachable("registry owner has no session hub".to_string())),
            }
        })
    }
}

/// Calls a registry owner over its newline-delimited JSON-RPC Unix socket.
///
/// No retry: a failed subscribe is recovered by the client's reconnect
/// resubscription and, failing that, by registry TTL expiry.
#[derive(Debug)]
pub struct UnixSocketCaller {
    socket_path: PathBuf,
    timeout: Duration,
    next_request_id: AtomicI64,
}

impl UnixSocketCaller {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            next_request_id: AtomicI64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request on a fresh connection and read its response line.
    /// The connection halves come back so a streaming method can keep going.
    async fn exchange(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(Response, BufReader<OwnedReadHalf>, OwnedWriteHalf), ProxyError> {
        let id = RequestId::Number(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let mut payload = serde_json::to_vec(&Request::new(method, Some(params), id))?;
        payload.push(b'\n');

        let stream = timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| self.unreachable("timed out connecting"))?
            .map_err(|error| self.unreachable(&error.to_string()))?;

        let (read_half, mut write_half) = stream.into_split();
        timeout(self.timeout, write_half.write_all(&payload))
            .await
            .map_err(|_| self.unreachable("timed out writing request"))?
            .map_err(|error| self.unreachable(&error.to_string()))?;

        let mut reader = BufReader::new(read_half);
        let mut line = Vec::new();
        timeout(self.timeout, reader.read_until(b'\n', &mut line))
            .await
            .map_err(|_| self.unreachable("timed out waiting for response"))?
            .map_err(|error| self.unreachable(&error.to_string()))?;
        if line.is_empty() {
            return Err(self.unreachable("connection closed before response"));
        }

        Ok((serde_json::from_slice(&line)?, reader, write_half))
    }

    fn unreachable(&self, reason: &str) -> ProxyError {
        ProxyError::Unreachable(format!("{}: {reason}", self.socket_path.display()))
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value, ProxyError> {
        let (response, _, _) = self.exchange(method, params).await?;
        Ok(response.into_result()?)
    }

    async fn follow_session(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<PushFrame>, ProxyError> {
        let (response, mut reader, write_half) =
            self.exchange(SESSION_ATTACH, json!({ "session_id": session_id })).await?;
        response.into_result()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            // Dropping the write half would signal EOF and end the stream.
            let _write_half = write_half;
            let mut line = Vec::new();
            loop {
                line.clear();
                let read = tokio::select! {
                    _ = sender.closed() => break,
                    read = reader.read_until(b'\n', &mut line) => read,
                };
                if !matches!(read, Ok(read) if read > 0) {
                    break;
                }
                match serde_json::from_slice::<PushFrame>(&line) {
                    Ok(frame) => {
                        if sender.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(session = %session_id, error = %error, "skipping unreadable upstream push");
                    }
                }
            }
            debug!(session = %session_id, "upstream push stream ended");
        });
        Ok(receiver)
    }
}

impl RegistryCaller for UnixSocketCaller {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> CallFuture<'a> {
        Box::pin(self.call_once(method, params))
    }

    fn follow<'a>(&'a self, session_id: &'a str) -> FollowFuture<'a> {
        Box::pin(self.follow_session(session_id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use modelsync_common::protocol::jsonrpc::LOCK_TIMEOUT;
    use modelsync_common::types::SubscriptionKey;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl RegistryCaller for Recorder {
        fn call<'a>(&'a self, method: &'a str, params: Value) -> CallFuture<'a> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            Box::pin(async { Ok(Value::Null) })
        }
    }

    #[tokio::test]
    async fn subscribe_forwards_lowercased_listen() {
        let recorder = Arc::new(Recorder::default());
        let proxy = SubscriptionProxy::new(recorder.clone());

        proxy.subscribe("s1", "User", Some("7"), "l1", true).await.unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls[0].0, "model.listen");
        assert_eq!(
            calls[0].1,
            json!({ "session_id": "s1", "model": "user", "id": "7", "listener_id": "l1", "atomic": true })
        );
    }

    #[tokio::test]
    async fn records_without_id_are_never_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let proxy = SubscriptionProxy::new(recorder.clone());

        proxy.subscribe("s1", "user", None, "l1", false).await.unwrap();
        proxy.subscribe("s1", "user", Some(""), "l1", false).await.unwrap();
        proxy.unsubscribe("s1", "user", None, "l1").await.unwrap();

        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_proxy_round_trips_through_the_registry() {
        let state = RpcServerState::default();
        let proxy = SubscriptionProxy::local(state.clone());
        let key = SubscriptionKey::new("user", "7");

        proxy.subscribe("s1", "User", Some("7"), "l1", false).await.unwrap();
        assert_eq!(state.registry().listeners(&key).await.unwrap().len(), 1);

        proxy.unsubscribe("s1", "user", Some("7"), "l1").await.unwrap();
        assert!(state.registry().listeners(&key).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_errors_surface_as_rpc_errors() {
        use crate::registry::{MemoryRegistry, RegistryBackend, RegistrySettings, SubscriptionRegistry};
        use crate::source::MemoryRecordSource;

        let backend = Arc::new(MemoryRegistry::default());
        let settings =
            RegistrySettings { lock_timeout: Duration::from_millis(20), ..Default::default() };
        let state = RpcServerState::new(
            SubscriptionRegistry::new(backend.clone(), settings),
            Arc::new(MemoryRecordSource::default()),
            Arc::new(crate::hub::SessionHub::default()),
        );
        let _held = backend
            .lock(&SubscriptionKey::new("user", "7").storage_key(), Duration::from_secs(1))
            .await
            .unwrap();

        let error = SubscriptionProxy::local(state)
            .subscribe("s1", "user", Some("7"), "l1", false)
            .await
            .unwrap_err();
        match error {
            ProxyError::Rpc(rpc) => assert_eq!(rpc.code, LOCK_TIMEOUT),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unix_caller_reports_missing_socket_as_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let caller = UnixSocketCaller::new(dir.path().join("absent.sock"));
        let error = caller.call("rpc.ping", json!({})).await.unwrap_err();
        assert!(matches!(error, ProxyError::Unreachable(_)));
    }
}
