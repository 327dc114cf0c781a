#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kvstore-txn** – Transaction coordinator for the kvstore persistence
//! kernel.
//!
//! Composes independent, non-transactional [`kvstore_core::Store`]
//! backends into an atomic unit of work via two-phase commit: enlist each
//! backend (wrapped in [`StagedWrites`] if it isn't already transactional
//! itself), stage writes against it, then `commit` or `rollback` the
//! [`Transaction`] as a whole.

mod ambient;
mod error;
mod resource;
mod retry;
mod staged;
mod transaction;

pub use ambient::{current, with_transaction};
pub use error::{AggregateError, TxnError, TxnResult};
pub use resource::Resource;
pub use retry::{execute_in_tx, execute_with_retry};
pub use staged::StagedWrites;
pub use transaction::{IsolationLevel, SavepointHandle, Transaction, TransactionOptions, TransactionState};

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        current, execute_in_tx, execute_with_retry, with_transaction, IsolationLevel, Resource,
        SavepointHandle, StagedWrites, Transaction, TransactionOptions, TransactionState, TxnError,
        TxnResult,
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kvstore_core::{Entity, Store};
    use kvstore_memory::MemoryBackend;
    use serde::{Deserialize, Serialize};

    use crate::{Resource, StagedWrites, Transaction, TransactionOptions, TransactionState};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        version: u64,
        name: String,
    }

    impl Entity for Widget {
        fn type_name() -> &'static str {
            "Widget"
        }
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn widget(id: &str) -> Widget {
        Widget {
            id: id.into(),
            version: 0,
            name: id.to_uppercase(),
        }
    }

    struct AlwaysFailsPrepare(&'static str);

    #[async_trait::async_trait]
    impl Resource for AlwaysFailsPrepare {
        fn resource_id(&self) -> &str {
            self.0
        }
        async fn prepare(&self) -> anyhow::Result<()> {
            anyhow::bail!("prepare refused")
        }
        async fn commit(&self) -> anyhow::Result<()> {
            unreachable!("commit must never run after a failed prepare")
        }
        async fn rollback(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn commit_drives_every_enlisted_resource_through_prepare_then_commit() {
        let backing = Arc::new(MemoryBackend::<Widget>::new());
        let staged = Arc::new(StagedWrites::new("memory", backing.clone()));

        let txn = Transaction::create(TransactionOptions::default());
        txn.enlist(staged.clone()).await.unwrap();
        staged.save("Widget/a", widget("a")).await;

        txn.commit().await.unwrap();
        assert_eq!(txn.state().await, TransactionState::Committed);
        assert_eq!(backing.get("Widget/a").await.unwrap(), Some(widget("a")));
    }

    #[tokio::test]
    async fn rollback_leaves_no_backing_store_untouched() {
        let backing = Arc::new(MemoryBackend::<Widget>::new());
        let staged = Arc::new(StagedWrites::new("memory", backing.clone()));

        let txn = Transaction::create(TransactionOptions::default());
        txn.enlist(staged.clone()).await.unwrap();
        staged.save("Widget/a", widget("a")).await;

        txn.rollback().await.unwrap();
        assert_eq!(txn.state().await, TransactionState::RolledBack);
        assert_eq!(backing.get("Widget/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prepare_failure_on_one_resource_rolls_back_every_resource() {
        let backing1 = Arc::new(MemoryBackend::<Widget>::new());
        let backing2 = Arc::new(MemoryBackend::<Widget>::new());
        let r1 = Arc::new(StagedWrites::new("r1", backing1.clone()));
        let r2: Arc<AlwaysFailsPrepare> = Arc::new(AlwaysFailsPrepare("r2"));
        let r3 = Arc::new(StagedWrites::new("r3", backing2.clone()));

        let txn = Transaction::create(TransactionOptions::default());
        txn.enlist(r1.clone()).await.unwrap();
        txn.enlist(r2).await.unwrap();
        txn.enlist(r3.clone()).await.unwrap();

        r1.save("Widget/a", widget("a")).await;
        r3.save("Widget/c", widget("c")).await;

        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, crate::TxnError::PrepareFailed { resource, .. } if resource == "r2"));
        assert_eq!(txn.state().await, TransactionState::RolledBack);
        assert_eq!(backing1.get("Widget/a").await.unwrap(), None);
        assert_eq!(backing2.get("Widget/c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn savepoint_partial_rollback_across_a_real_transaction() {
        let backing = Arc::new(MemoryBackend::<Widget>::new());
        let staged = Arc::new(StagedWrites::new("memory", backing.clone()));

        let txn = Transaction::create(TransactionOptions::default());
        txn.enlist(staged.clone()).await.unwrap();

        staged.save("Widget/a", widget("a")).await;
        let sp1 = txn.create_savepoint("sp1").await.unwrap();
        staged.save("Widget/b", widget("b")).await;
        staged.delete("Widget/a").await;
        txn.rollback_to_savepoint(&sp1).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(backing.get("Widget/a").await.unwrap(), Some(widget("a")));
        assert_eq!(backing.get("Widget/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rollback_to_a_savepoint_whose_parent_was_released_is_rejected() {
        let backing = Arc::new(MemoryBackend::<Widget>::new());
        let staged = Arc::new(StagedWrites::new("memory", backing));

        let txn = Transaction::create(TransactionOptions::default());
        txn.enlist(staged.clone()).await.unwrap();

        let sp1 = txn.create_savepoint("sp1").await.unwrap();
        let sp2 = txn.create_savepoint("sp2").await.unwrap();
        txn.release_savepoint(&sp1).await.unwrap();

        let err = txn.rollback_to_savepoint(&sp2).await.unwrap_err();
        assert!(matches!(err, crate::TxnError::SavepointParentReleased(name) if name == "sp2"));
    }

    #[tokio::test]
    async fn enlist_after_commit_is_rejected() {
        let txn = Transaction::create(TransactionOptions::default());
        txn.commit().await.unwrap();
        let backing = Arc::new(MemoryBackend::<Widget>::new());
        let staged = Arc::new(StagedWrites::new("memory", backing));
        assert!(txn.enlist(staged).await.is_err());
    }

    #[tokio::test]
    async fn transaction_times_out_and_rolls_back_when_never_committed() {
        let options = TransactionOptions {
            timeout: std::time::Duration::from_millis(20),
            ..TransactionOptions::default()
        };
        let backing = Arc::new(MemoryBackend::<Widget>::new());
        let staged = Arc::new(StagedWrites::new("memory", backing.clone()));
        let txn = Transaction::create(options);
        txn.enlist(staged.clone()).await.unwrap();
        staged.save("Widget/a", widget("a")).await;

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(txn.state().await, TransactionState::RolledBack);
        assert_eq!(backing.get("Widget/a").await.unwrap(), None);
    }
}
