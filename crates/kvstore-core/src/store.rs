//! The CRUD provider contract every storage backend implements.

use async_trait::async_trait;

use crate::entity::Entity;
use crate::error::StoreResult;
use crate::predicate::Predicate;

/// Abstract storage operations over entity type `T`, keyed by string.
///
/// Guarantees every implementation must uphold:
/// - **Atomic per-key writes**: once `save` returns, a subsequent `get` on
///   the same key returns exactly that entity; no reader ever observes a
///   half-written value.
/// - **Read-your-writes** within a single process for a single backend
///   instance.
/// - **Iteration snapshot**: `get_all` returns a point-in-time snapshot;
///   returned entities are always individually consistent.
/// - **Idempotent delete**: deleting a missing key succeeds.
#[async_trait]
pub trait Store<T: Entity>: Send + Sync {
    /// Fetch a single entity by key.
    async fn get(&self, key: &str) -> StoreResult<Option<T>>;

    /// Fetch several entities by key, skipping any that are missing.
    /// The result preserves the order of `keys`.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<T>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Fetch every entity, optionally filtered by an in-process predicate.
    async fn get_all(&self, predicate: Option<&Predicate<T>>) -> StoreResult<Vec<T>>;

    /// Durably write `entity` under `key`, creating or overwriting it.
    async fn save(&self, key: &str, entity: T) -> StoreResult<()>;

    /// Write several entries. Not guaranteed atomic across keys unless the
    /// backend documents otherwise.
    async fn save_many(&self, entries: Vec<(String, T)>) -> StoreResult<()> {
        for (key, entity) in entries {
            self.save(&key, entity).await?;
        }
        Ok(())
    }

    /// Remove a key. Succeeds even if the key was never present.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// `true` if `key` currently has a value.
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Count live entries, optionally restricted to those matching a
    /// predicate.
    async fn count(&self, predicate: Option<&Predicate<T>>) -> StoreResult<usize> {
        Ok(self.get_all(predicate).await?.len())
    }

    /// Remove every entry, returning the number removed.
    async fn clear(&self) -> StoreResult<usize>;
}
