//! The single-threaded worker owning all protocol state.
//!
//! One worker task runs per [`crate::client::Context`]. It drains a FIFO
//! queue of jobs, each a closure receiving exclusive access to the state
//! value, so nothing in the protocol core needs a lock. Cross-thread
//! entry is by [`Worker::dispatch`] (enqueue and return) or
//! [`Worker::call`] (enqueue and await the job's return value). User
//! callbacks run inside jobs and must not block, or they starve every
//! other operation on the same context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_WORKER: u64;
}

/// Handle to a worker task. Cheap to clone; the task stops when
/// [`Worker::shutdown`] is called.
pub(crate) struct Worker<S> {
    jobs: mpsc::UnboundedSender<Job<S>>,
    cancel: CancellationToken,
    id: u64,
}

impl<S> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Worker {
            jobs: self.jobs.clone(),
            cancel: self.cancel.clone(),
            id: self.id,
        }
    }
}

impl<S: Send + 'static> Worker<S> {
    /// Spawn the worker task. The state is constructed inside the task
    /// from a handle to the worker itself, so it can dispatch follow-up
    /// jobs (timers, I/O readiness) back to itself.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        name: &'static str,
        mk_state: impl FnOnce(&Worker<S>) -> S + Send + 'static,
    ) -> Worker<S> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job<S>>();
        let cancel = CancellationToken::new();
        let worker = Worker {
            jobs,
            cancel: cancel.clone(),
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
        };
        let handle = worker.clone();
        tokio::spawn(CURRENT_WORKER.scope(worker.id, async move {
            let mut state = mk_state(&handle);
            loop {
                select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job(&mut state),
                        None => break,
                    },
                }
            }
            debug!("worker '{name}' stopped");
            // state (and with it every pending waiter) drops here
        }));
        worker
    }

    /// True if this is being executed on the worker's own task.
    pub fn on_worker(&self) -> bool {
        CURRENT_WORKER.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Enqueue a job and return immediately. Returns false if the worker
    /// has stopped.
    pub fn dispatch(&self, job: impl FnOnce(&mut S) + Send + 'static) -> bool {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Enqueue a job after a delay.
    pub fn dispatch_after(&self, delay: Duration, job: impl FnOnce(&mut S) + Send + 'static) {
        let me = self.clone();
        tokio::spawn(async move {
            select! {
                _ = me.cancel.cancelled() => (),
                _ = tokio::time::sleep(delay) => {
                    me.dispatch(job);
                }
            }
        });
    }

    /// Enqueue a job and await its return value.
    ///
    /// Invoking this from the worker task itself would deadlock, so it is
    /// rejected as a logic error.
    pub async fn call<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, Error> {
        if self.on_worker() {
            return Err(Error::logic("worker call() invoked from the worker itself"));
        }
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |state| {
                let _ = tx.send(job(state));
            }))
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// A token cancelled when the worker shuts down, for auxiliary I/O
    /// tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
