//! C8: the 2PC state machine, enlistment, and savepoint bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{TxnError, TxnResult};
use crate::resource::Resource;

/// Isolation level a transaction was created with. The coordinator itself
/// is isolation-agnostic; this is advisory metadata a resource's `prepare`
/// may inspect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Readers never observe another transaction's uncommitted writes.
    ReadCommitted,
    /// As `ReadCommitted`, plus no non-repeatable reads within the
    /// transaction's own lifetime.
    Serializable,
}

/// Tunables a transaction is created with.
#[derive(Clone, Debug)]
pub struct TransactionOptions {
    /// Isolation level advertised to enlisted resources.
    pub isolation: IsolationLevel,
    /// Wall-clock budget before the coordinator force-rolls-back.
    pub timeout: Duration,
    /// Whether `create_savepoint` is permitted.
    pub enable_savepoints: bool,
    /// Whether a transaction still `Active` when dropped rolls back
    /// automatically (logged; see [`Transaction`]'s `Drop` impl).
    pub auto_rollback_on_dispose: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            timeout: Duration::from_secs(30),
            enable_savepoints: true,
            auto_rollback_on_dispose: true,
        }
    }
}

/// Where a transaction is in its two-phase-commit lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting enlistments, staged writes, and savepoints.
    Active,
    /// `commit` is calling `prepare` on enlisted resources.
    Preparing,
    /// Every resource prepared successfully.
    Prepared,
    /// `commit` is calling `commit` on enlisted resources.
    Committing,
    /// Terminal: every resource committed.
    Committed,
    /// Rolling back enlisted resources, in reverse enlistment order.
    RollingBack,
    /// Terminal: every resource was told to roll back.
    RolledBack,
    /// Terminal: a resource's `commit` failed after others already
    /// committed. Equivalent to `RolledBack` from the caller's
    /// perspective, but flags possible cross-resource inconsistency.
    Failed,
    /// Terminal: the transaction's wall-clock budget elapsed.
    Timeout,
}

impl TransactionState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Committed
                | TransactionState::RolledBack
                | TransactionState::Failed
                | TransactionState::Timeout
        )
    }
}

/// A handle returned by [`Transaction::create_savepoint`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavepointHandle {
    name: String,
    sequence: u64,
}

/// A recorded savepoint frame: its name, a monotonic creation sequence, and
/// the sequence of the savepoint that was on top of the stack when it was
/// created (`None` for the first savepoint in the transaction).
///
/// The parent link is what lets [`Transaction::rollback_to_savepoint`]
/// detect and reject rollback to a savepoint whose enclosing savepoint has
/// since been released — a flat name list can't distinguish that case from
/// an ordinary nested rollback.
struct SavepointFrame {
    name: String,
    sequence: u64,
    parent: Option<u64>,
}

/// A unit of work composing one or more [`Resource`]s into an atomic
/// two-phase commit.
///
/// `state` doubles as the internal lock the spec requires: commit,
/// rollback, and the timeout task each hold it across their entire
/// operation, so the three can never interleave.
pub struct Transaction {
    id: Uuid,
    state: Mutex<TransactionState>,
    created_at: DateTime<Utc>,
    options: TransactionOptions,
    enlisted: Mutex<Vec<Arc<dyn Resource>>>,
    savepoints: Mutex<Vec<SavepointFrame>>,
    next_savepoint_seq: AtomicU64,
    timeout_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Transaction {
    /// Create a new `Active` transaction and arm its timeout.
    pub fn create(options: TransactionOptions) -> Arc<Self> {
        let txn = Arc::new(Self {
            id: Uuid::new_v4(),
            state: Mutex::new(TransactionState::Active),
            created_at: Utc::now(),
            options,
            enlisted: Mutex::new(Vec::new()),
            savepoints: Mutex::new(Vec::new()),
            next_savepoint_seq: AtomicU64::new(0),
            timeout_handle: Mutex::new(None),
        });
        txn.arm_timeout();
        txn
    }

    /// Unique identifier assigned at creation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state. Racy by nature (another task may transition it
    /// immediately after this returns) but useful for diagnostics.
    pub async fn state(&self) -> TransactionState {
        *self.state.lock().await
    }

    fn arm_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.options.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(txn) = weak.upgrade() else {
                return;
            };
            let mut guard = txn.state.lock().await;
            if matches!(
                *guard,
                TransactionState::Active | TransactionState::Preparing | TransactionState::Prepared
            ) {
                *guard = TransactionState::Timeout;
                let enlisted = txn.enlisted.lock().await.clone();
                Self::rollback_resources(&enlisted).await;
                *guard = TransactionState::RolledBack;
            }
        });
        // Nothing else observes this slot before `create` returns.
        if let Ok(mut slot) = self.timeout_handle.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Register `resource` with this transaction. Enlistment order fixes
    /// `prepare`/`commit` order; rollback runs in reverse.
    pub async fn enlist(&self, resource: Arc<dyn Resource>) -> TxnResult<()> {
        let guard = self.state.lock().await;
        if *guard != TransactionState::Active {
            return Err(TxnError::State {
                expected: TransactionState::Active,
                actual: *guard,
            });
        }
        self.enlisted.lock().await.push(resource);
        Ok(())
    }

    /// Record a restore point named `name` on every enlisted resource.
    pub async fn create_savepoint(&self, name: impl Into<String>) -> TxnResult<SavepointHandle> {
        let guard = self.state.lock().await;
        if *guard != TransactionState::Active {
            return Err(TxnError::State {
                expected: TransactionState::Active,
                actual: *guard,
            });
        }
        if !self.options.enable_savepoints {
            return Err(TxnError::SavepointsDisabled);
        }
        let name = name.into();
        let sequence = self.next_savepoint_seq.fetch_add(1, Ordering::SeqCst);
        {
            let mut frames = self.savepoints.lock().await;
            if frames.iter().any(|f| f.name == name) {
                return Err(TxnError::DuplicateSavepoint(name));
            }
            let parent = frames.last().map(|f| f.sequence);
            frames.push(SavepointFrame {
                name: name.clone(),
                sequence,
                parent,
            });
        }
        for resource in self.enlisted.lock().await.iter() {
            resource
                .create_savepoint(&name)
                .await
                .map_err(TxnError::Backend)?;
        }
        Ok(SavepointHandle { name, sequence })
    }

    /// `true` if every savepoint in `parent`'s ancestor chain is still
    /// present in `frames`.
    fn ancestor_chain_intact(frames: &[SavepointFrame], mut parent: Option<u64>) -> bool {
        while let Some(sequence) = parent {
            match frames.iter().find(|f| f.sequence == sequence) {
                Some(frame) => parent = frame.parent,
                None => return false,
            }
        }
        true
    }

    /// Restore every enlisted resource to the point `sp` was created,
    /// discarding savepoints created after it.
    pub async fn rollback_to_savepoint(&self, sp: &SavepointHandle) -> TxnResult<()> {
        let guard = self.state.lock().await;
        if *guard != TransactionState::Active {
            return Err(TxnError::State {
                expected: TransactionState::Active,
                actual: *guard,
            });
        }
        {
            let mut frames = self.savepoints.lock().await;
            let idx = frames
                .iter()
                .position(|f| f.sequence == sp.sequence)
                .ok_or_else(|| TxnError::UnknownSavepoint(sp.name.clone()))?;
            if !Self::ancestor_chain_intact(&frames, frames[idx].parent) {
                return Err(TxnError::SavepointParentReleased(sp.name.clone()));
            }
            frames.truncate(idx + 1);
        }
        for resource in self.enlisted.lock().await.iter() {
            resource
                .rollback_to_savepoint(&sp.name)
                .await
                .map_err(TxnError::Backend)?;
        }
        Ok(())
    }

    /// Forget the recorded frame for `sp` without changing current state.
    pub async fn release_savepoint(&self, sp: &SavepointHandle) -> TxnResult<()> {
        {
            let mut frames = self.savepoints.lock().await;
            let idx = frames
                .iter()
                .position(|f| f.sequence == sp.sequence)
                .ok_or_else(|| TxnError::UnknownSavepoint(sp.name.clone()))?;
            frames.remove(idx);
        }
        for resource in self.enlisted.lock().await.iter() {
            resource
                .release_savepoint(&sp.name)
                .await
                .map_err(TxnError::Backend)?;
        }
        Ok(())
    }

    /// Drive every enlisted resource through prepare, then commit.
    ///
    /// See §4.8: all-prepare-ok transitions through `Prepared` ->
    /// `Committing` -> `Committed`; any prepare failure rolls every
    /// resource back and surfaces `PrepareFailed`; a commit-phase failure
    /// transitions to `Failed` without attempting to undo resources that
    /// already committed.
    pub async fn commit(self: &Arc<Self>) -> TxnResult<()> {
        let mut guard = self.state.lock().await;
        if *guard != TransactionState::Active {
            return Err(TxnError::State {
                expected: TransactionState::Active,
                actual: *guard,
            });
        }
        *guard = TransactionState::Preparing;

        let enlisted = self.enlisted.lock().await.clone();
        for resource in &enlisted {
            if let Err(cause) = resource.prepare().await {
                *guard = TransactionState::RollingBack;
                Self::rollback_resources(&enlisted).await;
                *guard = TransactionState::RolledBack;
                drop(guard);
                self.cancel_timeout().await;
                return Err(TxnError::PrepareFailed {
                    resource: resource.resource_id().to_string(),
                    cause,
                });
            }
        }

        *guard = TransactionState::Prepared;
        *guard = TransactionState::Committing;
        for resource in &enlisted {
            if let Err(cause) = resource.commit().await {
                *guard = TransactionState::Failed;
                drop(guard);
                self.cancel_timeout().await;
                return Err(TxnError::Backend(cause));
            }
        }

        *guard = TransactionState::Committed;
        drop(guard);
        self.cancel_timeout().await;
        Ok(())
    }

    /// Roll every enlisted resource back, in reverse enlistment order.
    /// Idempotent on a terminal state; individual resource failures are
    /// logged and aggregated, never surfaced to the caller — rollback
    /// always reaches a terminal state.
    pub async fn rollback(self: &Arc<Self>) -> TxnResult<()> {
        let mut guard = self.state.lock().await;
        if guard.is_terminal() {
            return Ok(());
        }
        *guard = TransactionState::RollingBack;
        let enlisted = self.enlisted.lock().await.clone();
        Self::rollback_resources(&enlisted).await;
        *guard = TransactionState::RolledBack;
        drop(guard);
        self.cancel_timeout().await;
        Ok(())
    }

    async fn rollback_resources(enlisted: &[Arc<dyn Resource>]) {
        for resource in enlisted.iter().rev() {
            if let Err(e) = resource.rollback().await {
                tracing::warn!(
                    resource = resource.resource_id(),
                    error = %e,
                    "resource rollback failed"
                );
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.options.auto_rollback_on_dispose {
            return;
        }
        if let Ok(guard) = self.state.try_lock() {
            if !guard.is_terminal() {
                tracing::warn!(
                    transaction = %self.id,
                    "transaction dropped while still active; enlisted resources were never told to roll back"
                );
            }
        }
        if let Ok(mut slot) = self.timeout_handle.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}
