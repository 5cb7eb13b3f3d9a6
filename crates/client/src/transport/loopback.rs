// In-process transport: records every call, answers through a pluggable
// responder, and lets the owner inject pushes and connection signals.

use std::sync::{Arc, Mutex, PoisonError};

use modelsync_common::protocol::channels::{CONNECTED_SIGNAL, CONNECT_SIGNAL};
use serde_json::Value;

use super::{ChannelHandler, ChannelRouter, HandlerId, Transport, TransportFuture};
use crate::error::TransportError;

type Responder = Arc<dyn Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync>;

#[derive(Clone)]
pub struct LoopbackTransport {
    router: ChannelRouter,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    responder: Responder,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::with_responder(|_, _| Ok(Value::Null))
    }
}

impl LoopbackTransport {
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        Self {
            router: ChannelRouter::default(),
            calls: Arc::default(),
            responder: Arc::new(responder),
        }
    }

    /// Every call issued so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(called, _)| called == method)
            .map(|(_, params)| params)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn push(&self, channel: &str, payload: Value) -> usize {
        self.router.dispatch(channel, payload)
    }

    /// Fire both connection signals, as after a reconnect.
    pub fn reconnect(&self) {
        self.router.dispatch(CONNECT_SIGNAL, Value::Null);
        self.router.dispatch(CONNECTED_SIGNAL, Value::Null);
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.router.handler_count(channel)
    }
}

impl Transport for LoopbackTransport {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> TransportFuture<'a> {
        let result = (self.responder)(method, &params);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((method.to_string(), params));
        Box::pin(async move { result })
    }

    fn on(&self, channel: &str, handler: ChannelHandler) -> HandlerId {
        self.router.add(channel, handler)
    }

    fn off(&self, channel: &str, id: HandlerId) {
        self.router.remove(channel, id);
    }
}
