//! Serialized-retry transaction queue.
//!
//! A single worker drains enqueued ledger operations strictly one at a time,
//! respecting chain nonce/ordering constraints. Failed operations retry with
//! linearly increasing backoff and requeue at the *front*, so a struggling
//! transaction blocks everything behind it; callers must tolerate
//! head-of-line blocking.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub type TxFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;
/// A retryable ledger operation: each attempt builds a fresh future.
pub type TxOperation = Box<dyn Fn() -> TxFuture + Send>;

#[derive(Debug, Error)]
pub enum TxError {
    #[error("transaction {id} exhausted {attempts} attempts: {last_error}")]
    Exhausted {
        id: String,
        attempts: u32,
        last_error: String,
    },
    #[error("transaction queue shut down")]
    Closed,
}

struct QueuedTx {
    id: String,
    operation: TxOperation,
    retries: u32,
    done: oneshot::Sender<Result<String, TxError>>,
}

/// Handle to the queue worker. Cheap to clone.
#[derive(Clone)]
pub struct TxQueue {
    tx: mpsc::UnboundedSender<QueuedTx>,
}

impl TxQueue {
    /// Spawn the drain worker.
    pub fn new(max_retries: u32, backoff_step_ms: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, max_retries, backoff_step_ms));
        Self { tx }
    }

    /// Enqueue an operation and wait for it to settle. Resolves with the
    /// transaction hash, or rejects once retries are exhausted.
    pub async fn submit(&self, id: impl Into<String>, operation: TxOperation) -> Result<String, TxError> {
        let (done, wait) = oneshot::channel();
        let item = QueuedTx {
            id: id.into(),
            operation,
            retries: 0,
            done,
        };
        if self.tx.send(item).is_err() {
            return Err(TxError::Closed);
        }
        wait.await.map_err(|_| TxError::Closed)?
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedTx>,
    max_retries: u32,
    backoff_step_ms: u64,
) {
    let mut pending: VecDeque<QueuedTx> = VecDeque::new();

    loop {
        // Pull everything already waiting without blocking
        loop {
            match rx.try_recv() {
                Ok(item) => pending.push_back(item),
                Err(_) => break,
            }
        }

        let mut item = match pending.pop_front() {
            Some(item) => item,
            None => match rx.recv().await {
                Some(item) => {
                    pending.push_back(item);
                    continue;
                }
                // All senders gone and nothing pending
                None => break,
            },
        };

        debug!("Tx {} attempt {}", item.id, item.retries + 1);
        match (item.operation)().await {
            Ok(hash) => {
                debug!("Tx {} confirmed: {hash}", item.id);
                let _ = item.done.send(Ok(hash));
            }
            Err(e) => {
                item.retries += 1;
                if item.retries > max_retries {
                    warn!("Tx {} exhausted after {} attempts: {e}", item.id, item.retries);
                    let _ = item.done.send(Err(TxError::Exhausted {
                        id: item.id,
                        attempts: item.retries,
                        last_error: e.to_string(),
                    }));
                } else {
                    let backoff = item.retries as u64 * backoff_step_ms;
                    warn!(
                        "Tx {} failed (retry {}/{max_retries}, backing off {backoff}ms): {e}",
                        item.id, item.retries
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(backoff)).await;
                    // Front of the queue: retries block later-enqueued work
                    pending.push_front(item);
                }
            }
        }
    }
    debug!("Tx queue worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn always_fails(counter: Arc<AtomicU32>) -> TxOperation {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(anyhow!("revert")) })
        })
    }

    #[tokio::test]
    async fn failing_operation_retries_then_rejects() {
        let queue = TxQueue::new(3, 1);
        let attempts = Arc::new(AtomicU32::new(0));

        let result = queue.submit("tx-1", always_fails(attempts.clone())).await;

        match result {
            Err(TxError::Exhausted { attempts: n, .. }) => assert_eq!(n, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // Initial attempt plus max_retries retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn operations_settle_strictly_in_order() {
        let queue = TxQueue::new(2, 1);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // First operation fails once, then succeeds
        let first_calls = Arc::new(AtomicU32::new(0));
        let first_op: TxOperation = {
            let order = order.clone();
            let calls = first_calls.clone();
            Box::new(move || {
                let order = order.clone();
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    order.lock().unwrap().push("first");
                    if n == 0 {
                        Err(anyhow!("transient"))
                    } else {
                        Ok("0x1".to_string())
                    }
                })
            })
        };
        let second_op: TxOperation = {
            let order = order.clone();
            Box::new(move || {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push("second");
                    Ok("0x2".to_string())
                })
            })
        };

        let q1 = queue.clone();
        let h1 = tokio::spawn(async move { q1.submit("tx-1", first_op).await });
        // Make sure tx-1 is enqueued before tx-2
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        let q2 = queue.clone();
        let h2 = tokio::spawn(async move { q2.submit("tx-2", second_op).await });

        assert_eq!(h1.await.unwrap().unwrap(), "0x1");
        assert_eq!(h2.await.unwrap().unwrap(), "0x2");

        // The retried head blocked the second item: first, first, second
        let order = order.lock().unwrap();
        assert_eq!(order.as_slice(), &["first", "first", "second"]);
    }

    #[tokio::test]
    async fn successes_resolve_with_their_hash() {
        let queue = TxQueue::new(3, 1);
        let op: TxOperation = Box::new(|| Box::pin(async { Ok("0xabc".to_string()) }));
        assert_eq!(queue.submit("tx-ok", op).await.unwrap(), "0xabc");
    }
}
