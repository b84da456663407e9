//! Thread-backed worker pool.
//!
//! A single coordinator task owns the job queue and the worker table. Workers
//! are OS threads that report back over a channel, so every state change is
//! applied by the coordinator one message at a time.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;

use filekit_core::FsError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Function run on a worker thread for each job.
pub type JobHandler<J, R> = Arc<dyn Fn(J) -> Result<R, FsError> + Send + Sync>;

type TaskId = u64;
type WorkerId = u64;
type Reply<R> = oneshot::Sender<Result<R, FsError>>;

enum Command<J, R> {
    Submit { job: J, reply: Reply<R> },
    SetMax(usize),
    Shutdown { done: oneshot::Sender<()> },
}

enum WorkerEvent<R> {
    Done {
        worker: WorkerId,
        task: TaskId,
        result: Result<R, FsError>,
    },
    Exited {
        worker: WorkerId,
        task: Option<TaskId>,
        reason: Option<String>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    workers: AtomicUsize,
    busy: AtomicUsize,
    queued: AtomicUsize,
    max_workers: AtomicUsize,
}

/// Pool of worker threads running one handler over submitted jobs.
///
/// Jobs go to an idle worker, else to a newly spawned worker while below the
/// ceiling, else into a FIFO queue. A worker that panics rejects its in-flight
/// job with [`FsError::WorkerCrashed`] and is replaced if work is still queued.
pub struct WorkerPool<J, R> {
    commands: mpsc::UnboundedSender<Command<J, R>>,
    counters: Arc<Counters>,
}

impl<J, R> Clone for WorkerPool<J, R> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<J, R> std::fmt::Debug for WorkerPool<J, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("active", &self.active_workers())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

impl<J, R> WorkerPool<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    /// Create a pool. Must be called from within a Tokio runtime.
    pub fn new<F>(max_workers: usize, handler: F) -> Self
    where
        F: Fn(J) -> Result<R, FsError> + Send + Sync + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        counters.max_workers.store(max_workers.max(1), Ordering::SeqCst);

        let coordinator = Coordinator {
            handler: Arc::new(handler),
            max_workers: max_workers.max(1),
            workers: Vec::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            next_task: 1,
            next_worker: 1,
            events_tx,
            counters: counters.clone(),
        };
        tokio::spawn(coordinator.run(command_rx, events_rx));

        Self { commands, counters }
    }

    /// Run `job` on a worker and wait for its result.
    pub async fn execute(&self, job: J) -> Result<R, FsError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit { job, reply })
            .map_err(|_| FsError::PoolShutdown)?;
        rx.await.map_err(|_| FsError::PoolShutdown)?
    }

    /// Change the worker ceiling for later dispatch decisions.
    ///
    /// Running workers above a lowered ceiling are not stopped.
    pub fn set_max_workers(&self, max: usize) {
        let _ = self.commands.send(Command::SetMax(max.max(1)));
    }

    /// Stop all workers and reject queued jobs. Safe to call repeatedly.
    ///
    /// Workers finish the job they are running; its caller gets
    /// [`FsError::PoolShutdown`].
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl<J, R> WorkerPool<J, R> {
    pub fn is_shutdown(&self) -> bool {
        self.commands.is_closed()
    }

    /// Workers currently running a job.
    pub fn active_workers(&self) -> usize {
        self.counters.busy.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.counters.workers.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a free worker.
    pub fn pending_tasks(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.counters.max_workers.load(Ordering::SeqCst)
    }
}

struct WorkerSlot<J> {
    id: WorkerId,
    jobs: std_mpsc::Sender<(TaskId, J)>,
    task: Option<TaskId>,
}

struct Pending<J, R> {
    job: J,
    reply: Reply<R>,
}

struct Coordinator<J, R> {
    handler: JobHandler<J, R>,
    max_workers: usize,
    workers: Vec<WorkerSlot<J>>,
    queue: VecDeque<Pending<J, R>>,
    in_flight: HashMap<TaskId, Reply<R>>,
    next_task: TaskId,
    next_worker: WorkerId,
    events_tx: mpsc::UnboundedSender<WorkerEvent<R>>,
    counters: Arc<Counters>,
}

impl<J, R> Coordinator<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<J, R>>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent<R>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { job, reply }) => self.dispatch(Pending { job, reply }),
                    Some(Command::SetMax(max)) => {
                        self.max_workers = max;
                        self.counters.max_workers.store(max, Ordering::SeqCst);
                        self.pump();
                    }
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        commands.close();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.publish();
        }
        self.publish();
        debug!("Worker pool coordinator stopped");
    }

    fn publish(&self) {
        let busy = self.workers.iter().filter(|w| w.task.is_some()).count();
        self.counters.workers.store(self.workers.len(), Ordering::SeqCst);
        self.counters.busy.store(busy, Ordering::SeqCst);
        self.counters.queued.store(self.queue.len(), Ordering::SeqCst);
    }

    fn dispatch(&mut self, pending: Pending<J, R>) {
        if pending.reply.is_closed() {
            return;
        }

        if let Some(index) = self.workers.iter().position(|w| w.task.is_none()) {
            self.assign(index, pending);
        } else if self.workers.len() < self.max_workers {
            match self.spawn_worker() {
                Ok(index) => self.assign(index, pending),
                Err(e) => {
                    warn!(error = %e, "Failed to spawn worker");
                    if self.workers.is_empty() {
                        let _ = pending.reply.send(Err(FsError::WorkerCrashed {
                            message: format!("cannot spawn worker: {e}"),
                        }));
                    } else {
                        self.queue.push_back(pending);
                    }
                }
            }
        } else {
            self.queue.push_back(pending);
        }
    }

    /// Hand queued jobs to idle workers, spawning up to the ceiling.
    fn pump(&mut self) {
        while let Some(pending) = self.queue.pop_front() {
            let idle = self.workers.iter().any(|w| w.task.is_none());
            if !idle && self.workers.len() >= self.max_workers {
                self.queue.push_front(pending);
                break;
            }
            let before = self.queue.len();
            self.dispatch(pending);
            if self.queue.len() > before {
                // dispatch re-queued it; nothing more can start now
                break;
            }
        }
    }

    fn assign(&mut self, index: usize, pending: Pending<J, R>) {
        let task = self.next_task;
        self.next_task += 1;

        let worker = &mut self.workers[index];
        match worker.jobs.send((task, pending.job)) {
            Ok(()) => {
                worker.task = Some(task);
                self.in_flight.insert(task, pending.reply);
            }
            Err(std_mpsc::SendError((_, job))) => {
                // Thread is gone; its exit event will arrive separately.
                let id = worker.id;
                self.workers.remove(index);
                debug!(worker = id, "Dropped dead worker during dispatch");
                self.queue.push_front(Pending {
                    job,
                    reply: pending.reply,
                });
                self.pump();
            }
        }
    }

    fn spawn_worker(&mut self) -> std::io::Result<usize> {
        let id = self.next_worker;
        self.next_worker += 1;

        let (jobs_tx, jobs_rx) = std_mpsc::channel::<(TaskId, J)>();
        let handler = self.handler.clone();
        let events = self.events_tx.clone();

        thread::Builder::new()
            .name(format!("filekit-worker-{id}"))
            .spawn(move || worker_loop(id, jobs_rx, handler, events))?;

        debug!(worker = id, "Spawned worker");
        self.workers.push(WorkerSlot {
            id,
            jobs: jobs_tx,
            task: None,
        });
        Ok(self.workers.len() - 1)
    }

    fn handle_event(&mut self, event: WorkerEvent<R>) {
        match event {
            WorkerEvent::Done {
                worker,
                task,
                result,
            } => {
                if let Some(reply) = self.in_flight.remove(&task) {
                    let _ = reply.send(result);
                }
                let Some(index) = self.workers.iter().position(|w| w.id == worker) else {
                    return;
                };
                self.workers[index].task = None;
                if let Some(next) = self.queue.pop_front() {
                    self.assign(index, next);
                }
            }
            WorkerEvent::Exited {
                worker,
                task,
                reason,
            } => {
                if let Some(reply) = task.and_then(|task| self.in_flight.remove(&task)) {
                    let message = reason.unwrap_or_else(|| "worker exited".to_string());
                    warn!(worker, ?task, %message, "Worker crashed while running a job");
                    let _ = reply.send(Err(FsError::WorkerCrashed { message }));
                }
                self.workers.retain(|w| w.id != worker);
                self.pump();
            }
        }
    }

    fn shutdown(&mut self) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(FsError::PoolShutdown));
        }
        for (_, reply) in self.in_flight.drain() {
            let _ = reply.send(Err(FsError::PoolShutdown));
        }
        // Dropping the job senders lets each thread leave its receive loop.
        self.workers.clear();
    }
}

fn worker_loop<J, R>(
    id: WorkerId,
    jobs: std_mpsc::Receiver<(TaskId, J)>,
    handler: JobHandler<J, R>,
    events: mpsc::UnboundedSender<WorkerEvent<R>>,
) {
    while let Ok((task, job)) = jobs.recv() {
        match catch_unwind(AssertUnwindSafe(|| handler(job))) {
            Ok(result) => {
                if events
                    .send(WorkerEvent::Done {
                        worker: id,
                        task,
                        result,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(payload) => {
                let _ = events.send(WorkerEvent::Exited {
                    worker: id,
                    task: Some(task),
                    reason: Some(panic_message(payload.as_ref())),
                });
                return;
            }
        }
    }
    let _ = events.send(WorkerEvent::Exited {
        worker: id,
        task: None,
        reason: None,
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_returns_result() {
        let pool = WorkerPool::new(2, |n: u64| Ok(n * 2));
        assert_eq!(pool.execute(21).await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let pool = WorkerPool::new(1, |_: ()| -> Result<(), FsError> {
            Err(FsError::Unknown {
                message: "bad job".into(),
            })
        });
        let err = pool.execute(()).await.unwrap_err();
        assert!(matches!(err, FsError::Unknown { .. }));

        // Worker survives a returned error.
        assert_eq!(pool.worker_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_ceiling_and_queue() {
        let pool = WorkerPool::new(2, |ms: u64| {
            thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        });

        let jobs: Vec<_> = (0..6).map(|_| pool.execute(20)).collect();
        let results = futures::future::join_all(jobs).await;
        assert!(results.iter().all(|r| matches!(r, Ok(20))));
        assert!(pool.worker_count() <= 2);
        assert_eq!(pool.pending_tasks(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_rejects_job_and_queue_continues() {
        let pool = WorkerPool::new(1, |n: u32| {
            if n == 0 {
                panic!("job zero explodes");
            }
            thread::sleep(Duration::from_millis(5));
            Ok(n)
        });

        let (crashed, ok_a, ok_b) =
            tokio::join!(pool.execute(0), pool.execute(1), pool.execute(2));

        match crashed {
            Err(FsError::WorkerCrashed { message }) => assert!(message.contains("explodes")),
            other => panic!("expected crash, got {other:?}"),
        }
        assert_eq!(ok_a.unwrap(), 1);
        assert_eq!(ok_b.unwrap(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let pool = WorkerPool::new(1, |n: u8| Ok(n));
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(pool.is_shutdown());
        assert!(matches!(pool.execute(1).await, Err(FsError::PoolShutdown)));
    }

    #[tokio::test]
    async fn test_set_max_workers() {
        let pool = WorkerPool::new(1, |n: u8| Ok(n));
        pool.set_max_workers(3);
        assert_eq!(pool.execute(5).await.unwrap(), 5);
        assert_eq!(pool.max_workers(), 3);
        pool.shutdown().await;
    }
}
