//! Bounded worker pool for transfer batches
//!
//! At most `concurrency` items run at once, each end to end in its own task.
//! After the first failure no further items are started; tasks already in
//! flight run to completion and the batch fails with a report of what
//! succeeded, what failed and what never started.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use medusa_core::{BatchFailure, MedusaError, MedusaResult, TransferFailure};
use tokio::sync::Semaphore;
use tracing::{debug, error};

/// Run `work` over labelled `items` with bounded parallelism.
///
/// Results come back in completion order.
pub async fn run_batch<I, T, F, Fut>(
    operation: &str,
    items: Vec<(String, I)>,
    concurrency: usize,
    work: F,
) -> MedusaResult<Vec<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = MedusaResult<T>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let halted = Arc::new(AtomicBool::new(false));
    let (result_tx, mut result_rx) =
        tokio::sync::mpsc::unbounded_channel::<(String, MedusaResult<T>)>();

    debug!(operation, items = items.len(), concurrency, "starting batch");

    let mut not_started = Vec::new();
    let mut spawned = 0usize;
    let mut pending = items.into_iter();
    while let Some((label, item)) = pending.next() {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MedusaError::Other(anyhow::anyhow!("{operation} worker pool closed: {e}")))?;
        if halted.load(Ordering::SeqCst) {
            not_started.push(label);
            not_started.extend(pending.by_ref().map(|(label, _)| label));
            break;
        }

        let fut = work(item);
        let halted = halted.clone();
        let tx = result_tx.clone();
        spawned += 1;
        tokio::spawn(async move {
            let _permit = permit;
            // inner task so a panic surfaces here as a JoinError
            let outcome = match tokio::spawn(fut).await {
                Ok(outcome) => outcome,
                Err(join) => Err(MedusaError::Transfer(format!("worker panicked: {join}"))),
            };
            if outcome.is_err() {
                halted.store(true, Ordering::SeqCst);
            }
            let _ = tx.send((label, outcome));
        });
    }
    drop(result_tx);

    let mut done = Vec::with_capacity(spawned);
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    while let Some((label, outcome)) = result_rx.recv().await {
        match outcome {
            Ok(value) => {
                succeeded.push(label);
                done.push(value);
            }
            Err(e) => {
                error!(operation, item = %label, error = %e, "transfer failed");
                failed.push(TransferFailure {
                    item: label,
                    error: e.to_string(),
                });
            }
        }
    }

    // only reachable if the runtime shuts down under us
    let lost = spawned - succeeded.len() - failed.len();
    if lost > 0 {
        failed.push(TransferFailure {
            item: format!("{lost} task(s)"),
            error: "worker lost".into(),
        });
    }

    if failed.is_empty() {
        return Ok(done);
    }
    let failure = BatchFailure {
        operation: operation.to_string(),
        succeeded,
        failed,
        not_started,
    };
    error!(
        operation,
        failed = failure.failed.len(),
        succeeded = failure.succeeded.len(),
        not_started = failure.not_started.len(),
        "batch failed"
    );
    Err(MedusaError::Batch(failure))
}
