// WebSocket transport against the daemon's session gateway.
//
// One socket per session carries both directions: JSON-RPC requests out,
// JSON-RPC responses and `{channel, payload}` push frames in. A driver task
// owns the socket; callers reach it through an unbounded writer queue and
// wait on a oneshot keyed by request id. When the socket drops, the driver
// fails every pending call, waits `reconnect_delay`, dials again and fires
// the `connect`/`connected` signals once the new writer is in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use modelsync_common::protocol::channels::{PushFrame, CONNECTED_SIGNAL, CONNECT_SIGNAL};
use modelsync_common::protocol::jsonrpc::{Request, RequestId, Response};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{ChannelHandler, ChannelRouter, HandlerId, Transport, TransportFuture};
use crate::config::ClientConfig;
use crate::error::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    url: String,
    router: ChannelRouter,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Response>>>,
    next_request_id: AtomicI64,
    call_timeout: Duration,
    reconnect_delay: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

/// `<base>/v1/sessions/<session>/push`, with any trailing slash on `base`
/// dropped.
pub fn session_url(base: &str, session_id: &str) -> String {
    format!("{}/v1/sessions/{session_id}/push", base.trim_end_matches('/'))
}

impl WsTransport {
    /// Dial the gateway at `base` (e.g. `ws://127.0.0.1:7420`) as
    /// `session_id`. The first connection must succeed; later drops are
    /// retried in the background until [`WsTransport::close`].
    pub async fn connect(
        base: &str,
        session_id: &str,
        config: &ClientConfig,
    ) -> Result<Self, TransportError> {
        let url = session_url(base, session_id);
        let (socket, _) =
            connect_async(url.as_str()).await.map_err(|error| TransportError::Socket(error.to_string()))?;
        info!(session = session_id, "session socket connected");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let inner = Arc::new(WsInner {
            url,
            router: ChannelRouter::default(),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(1),
            call_timeout: config.call_timeout,
            reconnect_delay: config.reconnect_delay,
            shutdown_tx,
        });

        // Install the writer before returning so the first call never races
        // the driver task.
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        inner.set_outbound(Some(writer_tx));
        tokio::spawn(run_driver(Arc::clone(&inner), socket, writer_rx, shutdown_rx));

        Ok(Self { inner })
    }

    /// Stop the driver and fail outstanding calls.
    pub fn close(&self) {
        let _ = self.inner.shutdown_tx.send(());
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl WsInner {
    fn set_outbound(&self, writer: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = writer;
    }

    fn send_raw(&self, encoded: String) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|writer| writer.send(encoded).is_ok())
    }

    fn take_pending(&self, id: i64) -> Option<oneshot::Sender<Response>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id)
    }

    /// Dropping the senders wakes every waiter with `Disconnected`.
    fn fail_pending(&self) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn route_frame(&self, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(error) => {
                warn!(error = %error, "ignoring unreadable frame");
                return;
            }
        };

        if value.get("jsonrpc").is_some() {
            let response: Response = match serde_json::from_value(value) {
                Ok(response) => response,
                Err(error) => {
                    warn!(error = %error, "ignoring malformed response");
                    return;
                }
            };
            let RequestId::Number(id) = response.id else {
                debug!(id = ?response.id, "response without a numeric id");
                return;
            };
            if let Some(waiter) = self.take_pending(id) {
                let _ = waiter.send(response);
            }
            return;
        }

        match serde_json::from_value::<PushFrame>(value) {
            Ok(frame) => {
                self.router.dispatch(&frame.channel, frame.payload);
            }
            Err(error) => warn!(error = %error, "ignoring malformed push frame"),
        }
    }

    fn announce_connected(&self) {
        self.router.dispatch(CONNECT_SIGNAL, Value::Null);
        self.router.dispatch(CONNECTED_SIGNAL, Value::Null);
    }
}

enum DriveOutcome {
    Shutdown,
    Lost,
}

async fn run_driver(
    inner: Arc<WsInner>,
    socket: Socket,
    writer_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut socket = socket;
    let mut writer_rx = writer_rx;
    let mut announce = true;

    loop {
        if announce {
            inner.announce_connected();
        }
        if let DriveOutcome::Shutdown = drive(&inner, socket, &mut writer_rx, &mut shutdown_rx).await {
            inner.set_outbound(None);
            inner.fail_pending();
            return;
        }
        inner.set_outbound(None);
        inner.fail_pending();
        warn!(url = %inner.url, "session socket lost, reconnecting");

        socket = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(inner.reconnect_delay) => {}
            }
            match connect_async(inner.url.as_str()).await {
                Ok((socket, _)) => break socket,
                Err(error) => debug!(error = %error, "reconnect attempt failed"),
            }
        };

        let (writer_tx, next_rx) = mpsc::unbounded_channel();
        inner.set_outbound(Some(writer_tx));
        writer_rx = next_rx;
        announce = true;
        info!(url = %inner.url, "session socket reconnected");
    }
}

async fn drive(
    inner: &WsInner,
    socket: Socket,
    writer_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> DriveOutcome {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                return DriveOutcome::Shutdown;
            }
            maybe_outbound = writer_rx.recv() => {
                let Some(encoded) = maybe_outbound else {
                    return DriveOutcome::Lost;
                };
                if sink.send(Message::Text(encoded.into())).await.is_err() {
                    return DriveOutcome::Lost;
                }
            }
            maybe_message = stream.next() => {
                match maybe_message {
                    Some(Ok(Message::Text(text))) => inner.route_frame(text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return DriveOutcome::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return DriveOutcome::Lost,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Transport for WsTransport {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> TransportFuture<'a> {
        Box::pin(async move {
            let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
            let encoded =
                serde_json::to_string(&Request::new(method, Some(params), RequestId::Number(id)))?;

            let (waiter_tx, waiter_rx) = oneshot::channel();
            self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id, waiter_tx);
            if !self.inner.send_raw(encoded) {
                self.inner.take_pending(id);
                return Err(TransportError::Disconnected);
            }

            match tokio::time::timeout(self.inner.call_timeout, waiter_rx).await {
                Ok(Ok(response)) => Ok(response.into_result()?),
                Ok(Err(_)) => Err(TransportError::Disconnected),
                Err(_) => {
                    self.inner.take_pending(id);
                    Err(TransportError::Timeout {
                        method: method.to_string(),
                        timeout_ms: millis(self.inner.call_timeout),
                    })
                }
            }
        })
    }

    fn on(&self, channel: &str, handler: ChannelHandler) -> HandlerId {
        self.inner.router.add(channel, handler)
    }

    fn off(&self, channel: &str, id: HandlerId) {
        self.inner.router.remove(channel, id);
    }
}
