//! C7: lifts any non-transactional [`Store`] into a [`Resource`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kvstore_core::{default_key, Entity, Predicate, Store, StoreResult};
use tokio::sync::Mutex;

use crate::error::{TxnError, TxnResult};
use crate::resource::Resource;

#[derive(Clone)]
enum StagedOp<T> {
    Insert(T),
    Update(T),
    Delete,
}

struct LogEntry<T> {
    key: String,
    op: StagedOp<T>,
}

struct SavepointFrame<T> {
    name: String,
    log_len: usize,
    latest_snapshot: HashMap<String, StagedOp<T>>,
}

/// Buffers `save`/`delete` calls against a backing [`Store`] and replays
/// them on commit, in call order. Reads overlay the staged effect for this
/// transaction before falling back to the backing store.
///
/// Single-writer per instance: wrap the same backing store in a fresh
/// adapter for every transaction that touches it.
pub struct StagedWrites<T: Entity, S: Store<T>> {
    id: String,
    backing: Arc<S>,
    latest: Mutex<HashMap<String, StagedOp<T>>>,
    log: Mutex<Vec<LogEntry<T>>>,
    savepoints: Mutex<Vec<SavepointFrame<T>>>,
}

impl<T: Entity, S: Store<T> + 'static> StagedWrites<T, S> {
    /// Wrap `backing` as a transactional resource identified by `id` (used
    /// in `PrepareFailed` and log messages).
    pub fn new(id: impl Into<String>, backing: Arc<S>) -> Self {
        Self {
            id: id.into(),
            backing,
            latest: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            savepoints: Mutex::new(Vec::new()),
        }
    }

    /// Fetch a single entity, overlaying any staged effect for `key`.
    pub async fn get(&self, key: &str) -> StoreResult<Option<T>> {
        match self.latest.lock().await.get(key) {
            Some(StagedOp::Insert(v) | StagedOp::Update(v)) => return Ok(Some(v.clone())),
            Some(StagedOp::Delete) => return Ok(None),
            None => {}
        }
        self.backing.get(key).await
    }

    /// Fetch every entity, overlaying staged effects on the backing
    /// store's snapshot before applying `predicate`.
    pub async fn get_all(&self, predicate: Option<&Predicate<T>>) -> StoreResult<Vec<T>> {
        let snapshot = self.backing.get_all(None).await?;
        let mut by_key: HashMap<String, T> = snapshot
            .into_iter()
            .map(|v| (default_key(&v), v))
            .collect();
        for (key, op) in self.latest.lock().await.iter() {
            match op {
                StagedOp::Insert(v) | StagedOp::Update(v) => {
                    by_key.insert(key.clone(), v.clone());
                }
                StagedOp::Delete => {
                    by_key.remove(key);
                }
            }
        }
        Ok(by_key
            .into_values()
            .filter(|v| predicate.map(|p| p.matches(v)).unwrap_or(true))
            .collect())
    }

    /// Stage a write. Not visible to the backing store until `commit`.
    pub async fn save(&self, key: &str, entity: T) {
        let existed = self.backing.get(key).await.ok().flatten().is_some()
            || matches!(
                self.latest.lock().await.get(key),
                Some(StagedOp::Insert(_)) | Some(StagedOp::Update(_))
            );
        let op = if existed {
            StagedOp::Update(entity)
        } else {
            StagedOp::Insert(entity)
        };
        self.latest.lock().await.insert(key.to_string(), op.clone());
        self.log.lock().await.push(LogEntry {
            key: key.to_string(),
            op,
        });
    }

    /// Stage a delete. Not visible to the backing store until `commit`.
    pub async fn delete(&self, key: &str) {
        self.latest
            .lock()
            .await
            .insert(key.to_string(), StagedOp::Delete);
        self.log.lock().await.push(LogEntry {
            key: key.to_string(),
            op: StagedOp::Delete,
        });
    }

    /// Record the current staged state under `name`.
    pub async fn create_savepoint(&self, name: &str) -> TxnResult<()> {
        let mut savepoints = self.savepoints.lock().await;
        if savepoints.iter().any(|s| s.name == name) {
            return Err(TxnError::DuplicateSavepoint(name.to_string()));
        }
        let log_len = self.log.lock().await.len();
        let latest_snapshot = self.latest.lock().await.clone();
        savepoints.push(SavepointFrame {
            name: name.to_string(),
            log_len,
            latest_snapshot,
        });
        Ok(())
    }

    /// Restore the staged buffer to exactly the point `name` was created,
    /// discarding savepoints created after it.
    pub async fn rollback_to_savepoint(&self, name: &str) -> TxnResult<()> {
        let mut savepoints = self.savepoints.lock().await;
        let idx = savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| TxnError::UnknownSavepoint(name.to_string()))?;
        let frame_log_len = savepoints[idx].log_len;
        let frame_latest = savepoints[idx].latest_snapshot.clone();
        savepoints.truncate(idx + 1);
        drop(savepoints);

        self.log.lock().await.truncate(frame_log_len);
        *self.latest.lock().await = frame_latest;
        Ok(())
    }

    /// Drop the recorded frame for `name` without changing current state.
    pub async fn release_savepoint(&self, name: &str) -> TxnResult<()> {
        let mut savepoints = self.savepoints.lock().await;
        let idx = savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| TxnError::UnknownSavepoint(name.to_string()))?;
        savepoints.remove(idx);
        Ok(())
    }
}

#[async_trait]
impl<T: Entity, S: Store<T> + 'static> Resource for StagedWrites<T, S> {
    fn resource_id(&self) -> &str {
        &self.id
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let entries = std::mem::take(&mut *self.log.lock().await);
        self.latest.lock().await.clear();
        self.savepoints.lock().await.clear();
        for entry in entries {
            match entry.op {
                StagedOp::Insert(v) | StagedOp::Update(v) => {
                    self.backing.save(&entry.key, v).await?;
                }
                StagedOp::Delete => {
                    self.backing.delete(&entry.key).await?;
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.log.lock().await.clear();
        self.latest.lock().await.clear();
        self.savepoints.lock().await.clear();
        Ok(())
    }

    async fn create_savepoint(&self, name: &str) -> anyhow::Result<()> {
        Ok(StagedWrites::create_savepoint(self, name).await?)
    }

    async fn rollback_to_savepoint(&self, name: &str) -> anyhow::Result<()> {
        Ok(StagedWrites::rollback_to_savepoint(self, name).await?)
    }

    async fn release_savepoint(&self, name: &str) -> anyhow::Result<()> {
        Ok(StagedWrites::release_savepoint(self, name).await?)
    }
}
