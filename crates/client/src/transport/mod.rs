// Transport seam: request/response calls plus per-channel push handlers.

pub mod loopback;
pub mod ws;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::error::TransportError;

pub use loopback::LoopbackTransport;
pub use ws::WsTransport;

pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, TransportError>> + Send + 'a>>;

/// Handler for one push channel or connection signal.
pub type ChannelHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Reliable point-to-point RPC plus named push channels. Connection
/// signals (`connect`, `connected`) are delivered as channels too.
pub trait Transport: Send + Sync {
    fn call<'a>(&'a self, method: &'a str, params: Value) -> TransportFuture<'a>;

    fn on(&self, channel: &str, handler: ChannelHandler) -> HandlerId;

    fn off(&self, channel: &str, id: HandlerId);
}

/// Channel name to handlers, shared by transport implementations.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    next_id: Arc<AtomicU64>,
    channels: Arc<Mutex<HashMap<String, Vec<(HandlerId, ChannelHandler)>>>>,
}

impl ChannelRouter {
    pub fn add(&self, channel: &str, handler: ChannelHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    pub fn remove(&self, channel: &str, id: HandlerId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = channels.get_mut(channel) {
            handlers.retain(|(existing, _)| *existing != id);
            if handlers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Run every handler of `channel` with `payload`. Returns how many ran.
    pub fn dispatch(&self, channel: &str, payload: Value) -> usize {
        let snapshot: Vec<ChannelHandler> = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(|handlers| handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        for handler in &snapshot {
            handler(payload.clone());
        }
        snapshot.len()
    }

    pub fn handler_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }
}
