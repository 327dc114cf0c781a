//! Ambient transaction context: a task-local slot so scoped helpers (C9)
//! don't need the caller to thread a transaction handle explicitly.

use std::future::Future;
use std::sync::Arc;

use crate::transaction::Transaction;

tokio::task_local! {
    static CURRENT: Arc<Transaction>;
}

/// Run `f` with `txn` installed as the ambient transaction for its
/// duration. Nested calls save and restore the prior value, including on
/// an early return or panic inside `f`.
pub async fn with_transaction<F, Fut, R>(txn: Arc<Transaction>, f: F) -> R
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    CURRENT.scope(txn, f()).await
}

/// The ambient transaction, if one is installed in the current task.
pub fn current() -> Option<Arc<Transaction>> {
    CURRENT.try_with(Arc::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionOptions;

    #[tokio::test]
    async fn nested_scopes_restore_the_outer_transaction_on_exit() {
        assert!(current().is_none());
        let outer = Transaction::create(TransactionOptions::default());
        let outer_id = outer.id();

        with_transaction(outer.clone(), || async {
            assert_eq!(current().unwrap().id(), outer_id);
            let inner = Transaction::create(TransactionOptions::default());
            let inner_id = inner.id();
            with_transaction(inner, || async {
                assert_eq!(current().unwrap().id(), inner_id);
            })
            .await;
            assert_eq!(current().unwrap().id(), outer_id);
        })
        .await;

        assert!(current().is_none());
    }
}
