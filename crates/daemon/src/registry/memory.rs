// Process-local registry backend.
//
// Listener lists live in a map with a per-key expiry deadline; a key past its
// deadline reads as empty and is dropped lazily. Key locks are tokio mutexes
// so a waiter can give up after the configured timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use modelsync_common::types::ListenerEntry;
use tokio::time::Instant;

use super::{KeyLock, RegistryBackend, RegistryFuture};
use crate::error::RegistryError;

#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    records: Arc<Mutex<HashMap<String, StoredRecord>>>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    entries: Vec<ListenerEntry>,
    expires_at: Instant,
}

impl MemoryRegistry {
    fn key_mutex(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drop expired lists and idle key locks. Returns the number of lists
    /// removed. Call periodically for memory hygiene.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let before = records.len();
            records.retain(|_, record| record.expires_at > now);
            before - records.len()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);

        removed
    }

    /// Number of stored lists, including ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryBackend for MemoryRegistry {
    fn lock<'a>(&'a self, key: &'a str, timeout: Duration) -> RegistryFuture<'a, KeyLock> {
        Box::pin(async move {
            let mutex = self.key_mutex(key);
            let guard = tokio::time::timeout(timeout, mutex.lock_owned()).await.map_err(|_| {
                RegistryError::LockTimeout {
                    key: key.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            })?;
            Ok(KeyLock::new(key, guard))
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> RegistryFuture<'a, Vec<ListenerEntry>> {
        Box::pin(async move {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            match records.get(key) {
                Some(record) if record.expires_at > Instant::now() => Ok(record.entries.clone()),
                Some(_) => {
                    records.remove(key);
                    Ok(Vec::new())
                }
                None => Ok(Vec::new()),
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        entries: Vec<ListenerEntry>,
        ttl: Duration,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            let record = StoredRecord { entries, expires_at: Instant::now() + ttl };
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_string(), record);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    const KEY: &str = "model.listen.user.1";

    fn entry(session: &str) -> ListenerEntry {
        ListenerEntry::new(session, format!("{session}-listener"), false, Utc::now())
    }

    #[tokio::test]
    async fn set_then_get_round_trips_entries() {
        let registry = MemoryRegistry::default();
        registry.set(KEY, vec![entry("s1"), entry("s2")], Duration::from_secs(60)).await.unwrap();

        let entries = registry.get(KEY).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].session_id, "s2");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_list_reads_empty_and_is_dropped() {
        let registry = MemoryRegistry::default();
        registry.set(KEY, vec![entry("s1")], Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.get(KEY).await.unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_expired_sweeps_only_stale_lists() {
        let registry = MemoryRegistry::default();
        registry.set("a", vec![entry("s1")], Duration::from_secs(5)).await.unwrap();
        registry.set("b", vec![entry("s2")], Duration::from_secs(50)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.evict_expired(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_locker_waits_for_release() {
        let registry = MemoryRegistry::default();
        let first = registry.lock(KEY, Duration::from_secs(1)).await.unwrap();

        let contender = registry.clone();
        let waiter = tokio::spawn(async move {
            contender.lock(KEY, Duration::from_secs(30)).await.map(|lock| lock.key().to_string())
        });

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        first.release();
        let acquired = waiter.await.expect("waiter should not panic").expect("lock should be acquired");
        assert_eq!(acquired, KEY);
    }

    #[tokio::test]
    async fn different_keys_lock_independently() {
        let registry = MemoryRegistry::default();
        let _a = registry.lock("a", Duration::from_millis(10)).await.unwrap();
        let _b = registry.lock("b", Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn idle_key_locks_are_swept() {
        let registry = MemoryRegistry::default();
        let held = registry.lock("held", Duration::from_millis(10)).await.unwrap();
        registry.lock("idle", Duration::from_millis(10)).await.unwrap().release();

        registry.evict_expired();
        let locks = registry.locks.lock().unwrap();
        assert!(locks.contains_key("held"));
        assert!(!locks.contains_key("idle"));
        drop(locks);
        held.release();
    }
}
