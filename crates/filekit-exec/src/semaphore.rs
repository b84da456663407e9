//! Permit-based concurrency gate and batch runner.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use filekit_core::FsError;
use futures::future::join_all;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counting semaphore with FIFO hand-off.
///
/// Waiters are served in arrival order. At any time
/// `available_permits() + holders() == permits()`.
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    permits: usize,
    waiting: Arc<AtomicUsize>,
}

/// A held permit. Dropping it releases the permit to the next waiter.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(permits)),
            permits,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a permit.
    ///
    /// Fails with [`FsError::Cancelled`] only if the semaphore was closed.
    pub async fn acquire(&self) -> Result<Permit, FsError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(&self.waiting);
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FsError::Cancelled)?;
        Ok(Permit { _permit: permit })
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Wake every waiter with an error and refuse new acquisitions.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    /// Permits currently held.
    pub fn holders(&self) -> usize {
        self.permits - self.available_permits()
    }

    /// Callers suspended in [`acquire`](Self::acquire).
    pub fn queue_length(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Outcome of a cancellable batched run.
#[derive(Debug)]
pub struct BatchRun<T> {
    /// Results of every task that ran, in submission order.
    pub results: Vec<T>,
    /// A later batch was skipped because cancellation was requested.
    pub cancelled: bool,
}

/// Limits how many tasks run at the same time.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    semaphore: Semaphore,
}

impl ConcurrencyController {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Semaphore::new(concurrency.max(1)),
        }
    }

    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Run one task under a permit. The permit is released however the task ends.
    pub async fn run<Fut, T>(&self, task: Fut) -> Result<T, FsError>
    where
        Fut: Future<Output = T>,
    {
        let _permit = self.semaphore.acquire().await?;
        Ok(task.await)
    }

    /// Run every task concurrently, at most `concurrency` at a time.
    pub async fn run_all<I, Fut, T>(&self, tasks: I) -> Result<Vec<T>, FsError>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = T>,
    {
        join_all(tasks.into_iter().map(|task| self.run(task)))
            .await
            .into_iter()
            .collect()
    }

    /// Run tasks in groups of `batch_size`; a group starts only after the
    /// previous group has completed entirely.
    pub async fn run_in_batches<I, Fut, T>(
        &self,
        tasks: I,
        batch_size: usize,
    ) -> Result<Vec<T>, FsError>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = T>,
    {
        let run = self
            .run_in_batches_cancellable(tasks, batch_size, &CancellationToken::new())
            .await?;
        Ok(run.results)
    }

    /// Like [`run_in_batches`](Self::run_in_batches), checking `cancel` before
    /// each group. Tasks of a started group always finish.
    pub async fn run_in_batches_cancellable<I, Fut, T>(
        &self,
        tasks: I,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchRun<T>, FsError>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = T>,
    {
        let batch_size = batch_size.max(1);
        let mut tasks = tasks.into_iter().peekable();
        let mut results = Vec::new();
        let mut batch_index = 0usize;

        while tasks.peek().is_some() {
            if cancel.is_cancelled() {
                debug!(batch_index, "Batch run cancelled");
                return Ok(BatchRun {
                    results,
                    cancelled: true,
                });
            }

            let batch: Vec<Fut> = tasks.by_ref().take(batch_size).collect();
            debug!(batch_index, size = batch.len(), "Starting batch");
            results.extend(self.run_all(batch).await?);
            batch_index += 1;
        }

        Ok(BatchRun {
            results,
            cancelled: false,
        })
    }
}
