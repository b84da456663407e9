//! Execution primitives for filekit.
//!
//! - [`Semaphore`] / [`ConcurrencyController`]: bound how many tasks run at once
//!   and run them in fixed-size batches.
//! - [`RetryPolicy`]: exponential backoff for transient I/O failures.
//! - [`WorkerPool`]: offload heavy per-file jobs to dedicated threads.

mod pool;
mod retry;
mod semaphore;

pub use pool::{JobHandler, WorkerPool};
pub use retry::RetryPolicy;
pub use semaphore::{BatchRun, ConcurrencyController, Permit, Semaphore};

pub use tokio_util::sync::CancellationToken;
