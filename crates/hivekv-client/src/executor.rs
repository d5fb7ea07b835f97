//! Fan-out coordination for batch, scan and query commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use hivekv_common::error::{HiveError, Result};

/// Coordinates a set of child commands dispatched over the cluster.
///
/// The first child failure is recorded under a lock and raises the shared
/// stop flag, which peers observe at record boundaries and abort. Children
/// that die *because* of the abort report termination errors that arrive
/// after the original failure and are ignored. The aggregate outcome is
/// published exactly once, when every child has wound down.
pub(crate) struct MultiExecutor {
    exception: Mutex<Option<HiveError>>,
    stop: Arc<AtomicBool>,
}

impl MultiExecutor {
    pub fn new(stop: Arc<AtomicBool>) -> MultiExecutor {
        MultiExecutor {
            exception: Mutex::new(None),
            stop,
        }
    }

    /// Records the first failure and aborts the peers. Later failures are
    /// dropped.
    fn stop_children(&self, error: HiveError) {
        let mut exception = self.exception.lock();
        if exception.is_none() {
            tracing::debug!(error = %error, "stream child failed, aborting peers");
            *exception = Some(error);
        }
        self.stop.store(true, Ordering::Release);
    }

    /// Dispatches the children with bounded parallelism and waits for all of
    /// them. `max_concurrent` of 0 releases every child at once, 1 runs them
    /// sequentially, n bounds the fan-out.
    pub async fn run<F>(self, max_concurrent: usize, children: Vec<F>) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if children.is_empty() {
            return Ok(());
        }
        let permits = if max_concurrent == 0 {
            children.len()
        } else {
            max_concurrent
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let executor = Arc::new(self);

        let mut tasks = Vec::with_capacity(children.len());
        for child in children {
            let semaphore = Arc::clone(&semaphore);
            let executor = Arc::clone(&executor);
            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                // A peer already failed while this child was queued.
                if executor.stop.load(Ordering::Acquire) {
                    return;
                }
                if let Err(error) = child.await {
                    executor.stop_children(error);
                }
            }));
        }

        for joined in join_all(tasks).await {
            if joined.is_err() {
                executor.stop_children(HiveError::Connection(
                    "stream child task failed".to_string(),
                ));
            }
        }

        let result = match executor.exception.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        result
    }
}
