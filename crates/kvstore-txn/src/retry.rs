//! C9: scoped-transaction runner with classified retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kvstore_core::Classify;
use rand::Rng;

use crate::ambient::with_transaction;
use crate::error::{AggregateError, TxnError, TxnResult};
use crate::transaction::{Transaction, TransactionOptions};

/// Create a transaction, install it as the ambient context, run `body`,
/// then commit. If `body` fails, roll back and re-raise; if rollback
/// itself also fails, surface both causes together.
pub async fn execute_in_tx<F, Fut, R>(options: TransactionOptions, body: F) -> TxnResult<R>
where
    F: FnOnce(Arc<Transaction>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let txn = Transaction::create(options);
    let outcome = with_transaction(txn.clone(), || body(txn.clone())).await;

    match outcome {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(body_err) => {
            let body_err = TxnError::Backend(body_err);
            match txn.rollback().await {
                Ok(()) => Err(body_err),
                Err(rollback_err) => Err(TxnError::Aggregate(AggregateError(vec![
                    body_err,
                    rollback_err,
                ]))),
            }
        }
    }
}

/// Retry `execute_in_tx` up to `max_retries` attempts, backing off between
/// transient failures and re-raising non-transient ones immediately.
///
/// Backoff is `initial_delay * 2^(attempt-1)` plus up to 10% jitter,
/// capped at `max_delay`.
pub async fn execute_with_retry<F, Fut, R>(
    options: TransactionOptions,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    mut body: F,
) -> TxnResult<R>
where
    F: FnMut(Arc<Transaction>) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    if max_retries < 1 {
        return Err(TxnError::InvalidArgument(
            "max_retries must be at least 1".to_string(),
        ));
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match execute_in_tx(options.clone(), &mut body).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_retries || !err.is_transient() {
                    return Err(err);
                }
                let exponent = attempt.saturating_sub(1).min(16);
                let backoff = initial_delay
                    .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
                    .min(max_delay);
                let jitter_ms = rand::thread_rng().gen_range(0..=(backoff.as_millis() as u64 / 10).max(1));
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore_core::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn execute_in_tx_commits_on_success() {
        let result: TxnResult<i32> =
            execute_in_tx(TransactionOptions::default(), |_txn| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn execute_in_tx_rolls_back_and_reraises_on_body_failure() {
        let result: TxnResult<()> = execute_in_tx(TransactionOptions::default(), |_txn| async {
            anyhow::bail!("body blew up")
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn retry_converges_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result: TxnResult<&'static str> = execute_with_retry(
            TransactionOptions::default(),
            3,
            Duration::from_millis(5),
            Duration::from_millis(100),
            |_txn| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::Error::new(StoreError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "transient",
                        ))))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: TxnResult<()> = execute_with_retry(
            TransactionOptions::default(),
            3,
            Duration::from_millis(5),
            Duration::from_millis(100),
            |_txn| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { anyhow::bail!("not transient") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_max_retries_is_rejected() {
        let result: TxnResult<()> =
            execute_with_retry(
                TransactionOptions::default(),
                0,
                Duration::from_millis(1),
                Duration::from_millis(10),
                |_txn| async { Ok(()) },
            )
            .await;
        assert!(matches!(result, Err(TxnError::InvalidArgument(_))));
    }
}
