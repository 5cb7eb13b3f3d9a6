// Subscription registry: per-(type, id) listener lists behind a per-key lock.
//
// Every listen/deafen is a locked read-modify-write against the backend:
//   lock(key) -> get(key) -> mutate -> set(key, entries, ttl) -> release
// The lock guard is a value, so early returns and `?` release it too.

pub mod memory;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use modelsync_common::types::{DeafenParams, ListenParams, ListenerEntry, SubscriptionKey};
use tracing::{debug, trace};

use crate::error::RegistryError;

pub use memory::MemoryRegistry;

/// Default time-to-live of a listener list, refreshed on every write.
pub const DEFAULT_LISTEN_TTL: Duration = Duration::from_secs(60 * 60);
/// Default wait for a per-key lock before the call fails.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RegistryError>> + Send + 'a>>;

/// Exclusive hold on one registry key. Dropping it releases the key.
pub struct KeyLock {
    key: String,
    _release: Box<dyn Send + Sync>,
}

impl KeyLock {
    pub fn new(key: impl Into<String>, release: impl Send + Sync + 'static) -> Self {
        Self { key: key.into(), _release: Box::new(release) }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly; equivalent to dropping.
    pub fn release(self) {}
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        trace!(key = %self.key, "registry key released");
    }
}

/// Shared TTL-backed key/value store holding listener lists.
///
/// Implementations may be process-local or shared between daemon instances;
/// `lock` must exclude every other holder of the same key.
pub trait RegistryBackend: Send + Sync {
    fn lock<'a>(&'a self, key: &'a str, timeout: Duration) -> RegistryFuture<'a, KeyLock>;

    /// Listener list for `key`; empty for unknown or expired keys.
    fn get<'a>(&'a self, key: &'a str) -> RegistryFuture<'a, Vec<ListenerEntry>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        entries: Vec<ListenerEntry>,
        ttl: Duration,
    ) -> RegistryFuture<'a, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub ttl: Duration,
    pub lock_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self { ttl: DEFAULT_LISTEN_TTL, lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }
}

/// Registry operations used by the RPC endpoints and the fan-out engine.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    backend: Arc<dyn RegistryBackend>,
    settings: RegistrySettings,
    /// Model types this process has seen a listen/deafen for.
    interest: Arc<RwLock<HashSet<String>>>,
}

impl SubscriptionRegistry {
    pub fn new(backend: Arc<dyn RegistryBackend>, settings: RegistrySettings) -> Self {
        Self { backend, settings, interest: Arc::default() }
    }

    pub fn in_memory(settings: RegistrySettings) -> Self {
        Self::new(Arc::new(MemoryRegistry::default()), settings)
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// Whether any listen/deafen for `model` reached this process.
    pub fn has_interest(&self, model: &str) -> bool {
        self.interest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&model.to_lowercase())
    }

    fn note_interest(&self, model: &str) {
        if self.has_interest(model) {
            return;
        }
        self.interest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.to_lowercase());
    }

    /// Register or refresh a listener.
    ///
    /// An existing `(session, listener)` entry only gets `last_seen` bumped;
    /// its position and `atomic` flag are kept.
    pub async fn listen(&self, params: &ListenParams) -> Result<(), RegistryError> {
        let key = params.key();
        self.note_interest(key.model());
        debug!(
            model = %key.model(),
            id = %key.id(),
            session = %params.session_id,
            listener = %params.listener_id,
            "[listen]"
        );

        let now = Utc::now();
        self.modify(&key, |entries| {
            match entries.iter_mut().find(|entry| entry.is(&params.session_id, &params.listener_id))
            {
                Some(existing) => existing.last_seen = now,
                None => entries.push(ListenerEntry::new(
                    params.session_id.clone(),
                    params.listener_id.clone(),
                    params.atomic,
                    now,
                )),
            }
        })
        .await
    }

    /// Remove the `(session, listener)` entry, leaving every other one.
    pub async fn deafen(&self, params: &DeafenParams) -> Result<(), RegistryError> {
        let key = params.key();
        self.note_interest(key.model());
        debug!(
            model = %key.model(),
            id = %key.id(),
            session = %params.session_id,
            listener = %params.listener_id,
            "[deafen]"
        );

        self.modify(&key, |entries| {
            entries.retain(|entry| !entry.is(&params.session_id, &params.listener_id));
        })
        .await
    }

    /// Current listener list, unlocked. Unknown keys yield an empty list.
    pub async fn listeners(&self, key: &SubscriptionKey) -> Result<Vec<ListenerEntry>, RegistryError> {
        self.backend.get(&key.storage_key()).await
    }

    async fn modify<F>(&self, key: &SubscriptionKey, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Vec<ListenerEntry>),
    {
        let storage_key = key.storage_key();
        let lock = self.backend.lock(&storage_key, self.settings.lock_timeout).await?;

        let mut entries = self.backend.get(&storage_key).await?;
        mutate(&mut entries);
        self.backend.set(&storage_key, entries, self.settings.ttl).await?;

        lock.release();
        Ok(())
    }
}
