// Cancellable delayed tasks on the tokio runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

#[derive(Debug, Clone, Default)]
pub struct DelayedTasks {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl DelayedTasks {
    /// Run `task` after `delay` unless cancelled first. Must be called from
    /// inside a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);

        // Hold the map lock across spawn so the task cannot look itself up
        // before it has been recorded.
        let mut guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_scheduled =
                pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id).is_some();
            if still_scheduled {
                task.await;
            }
        });
        guard.insert(id, join);
        TaskHandle(id)
    }

    /// Cancel a task that has not fired yet. Returns whether it was pending.
    /// A task that already fired runs to completion.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        let removed = self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&handle.0);
        match removed {
            Some(join) => {
                join.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, handle: TaskHandle) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&handle.0)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Cancel everything still waiting.
    pub fn cancel_all(&self) {
        let drained: Vec<JoinHandle<()>> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, join)| join)
            .collect();
        for join in drained {
            join.abort();
        }
    }
}
