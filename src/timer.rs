use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use tokio::task::AbortHandle;

use crate::model::Ms;
use crate::store::now_ms;

/// One-shot deferred callbacks, keyed so they can be cancelled.
pub trait TimerService: Send + Sync {
    /// Run `task` once at `at` (unix ms). Replaces any pending timer under the same key.
    fn schedule_once(&self, key: String, at: Ms, task: BoxFuture<'static, Result<(), String>>);

    /// Drop a pending timer. Returns false if none was pending.
    fn cancel(&self, key: &str) -> bool;
}

/// Timers backed by sleeping tokio tasks. Lost on restart; the reaper covers that.
#[derive(Default)]
pub struct TokioTimers {
    /// key → (generation, task). The generation tells a replaced task it lost.
    pending: Arc<DashMap<String, (u64, AbortHandle)>>,
    generation: AtomicU64,
}

impl TokioTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl TimerService for TokioTimers {
    fn schedule_once(&self, key: String, at: Ms, task: BoxFuture<'static, Result<(), String>>) {
        let delay = std::time::Duration::from_millis((at - now_ms()).max(0) as u64);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let task_key = key.clone();

        // The entry's shard lock is held until the handle is stored, so a
        // zero-delay task cannot look itself up before it is registered.
        let entry = self.pending.entry(key);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Deregister first: once fired, cancel() must not abort the callback halfway.
            if pending
                .remove_if(&task_key, |_, (g, _)| *g == generation)
                .is_none()
            {
                return;
            }
            if let Err(e) = task.await {
                tracing::warn!(key = %task_key, "timer callback failed: {e}");
            }
        });
        match entry {
            Entry::Occupied(mut e) => {
                let (_, previous) = e.insert((generation, handle.abort_handle()));
                previous.abort();
            }
            Entry::Vacant(e) => {
                e.insert((generation, handle.abort_handle()));
            }
        }
    }

    fn cancel(&self, key: &str) -> bool {
        match self.pending.remove(key) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}
