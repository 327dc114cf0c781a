//! The interface a transaction coordinator enlists.

use async_trait::async_trait;

/// A transactional resource: something a [`crate::Transaction`] can drive
/// through prepare/commit/rollback and, optionally, through savepoints.
///
/// Backends that don't support savepoints can leave the default no-op
/// implementations in place.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Stable identifier used in error messages (e.g. `PrepareFailed`).
    fn resource_id(&self) -> &str;

    /// Validate that this resource can commit. Returning an error aborts
    /// the whole transaction and triggers rollback on every resource.
    async fn prepare(&self) -> anyhow::Result<()>;

    /// Make the resource's staged effects durable. Only called after every
    /// enlisted resource's `prepare` has succeeded.
    async fn commit(&self) -> anyhow::Result<()>;

    /// Discard the resource's staged effects. Called on every enlisted
    /// resource, including ones that never prepared.
    async fn rollback(&self) -> anyhow::Result<()>;

    /// Record a restore point named `name`.
    async fn create_savepoint(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Restore state to the point `name` was created at.
    async fn rollback_to_savepoint(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Forget the restore point `name` without changing current state.
    async fn release_savepoint(&self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
