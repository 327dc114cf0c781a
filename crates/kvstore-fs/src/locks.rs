//! Per-file lock table.
//!
//! Acquisition is FIFO-fair (a `tokio::sync::Mutex` queues waiters in
//! arrival order) and creation is lock-free: [`dashmap::DashMap::entry`]
//! does the compare-and-swap. Entries are garbage-collected once idle and
//! the backing file is gone, so the table stays bounded even for
//! short-lived keys.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn handle(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for `path`, run `body`, then release and garbage
    /// collect the table entry if nothing else holds it and the file no
    /// longer exists.
    pub(crate) async fn with_lock<F, Fut, R>(&self, path: &Path, body: F) -> R
    where
        F: FnOnce(MutexGuard<'_, ()>) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        let handle = self.handle(path);
        let guard = handle.lock().await;
        let result = body(guard).await;
        self.maybe_evict(path, handle);
        result
    }

    fn maybe_evict(&self, path: &Path, handle: Arc<Mutex<()>>) {
        drop(handle);
        if path.exists() {
            return;
        }
        if let Some(entry) = self.locks.get(path) {
            // One strong reference lives in the map itself, one in `entry`.
            // Anything beyond that means another task is still waiting.
            if Arc::strong_count(&entry) <= 2 {
                let key = path.to_path_buf();
                drop(entry);
                self.locks.remove(&key);
            }
        }
    }
}
