//! Fixed-size worker pool for CPU-bound per-frame work
//!
//! The heavy stages (segmentation pre-processing, mask post-processing) fan
//! the frames of a batch out to this pool of OS threads and await the
//! completion handles from async context. The task backlog is bounded;
//! submission fails fast instead of queueing unboundedly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Maximum number of queued-but-not-started tasks.
pub const TASK_BACKLOG: usize = 64;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a submitted task. Awaiting it yields the task's
/// return value, or the captured panic as an error.
pub struct CompletionHandle<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> CompletionHandle<R> {
    pub async fn wait(self) -> Result<R> {
        match self.rx.await {
            Ok(result) => result,
            // The job was discarded before running (pool torn down).
            Err(_) => Err(PipelineError::PoolStopped),
        }
    }
}

/// A task the pool would not accept. The caller decides whether to run it
/// on its own thread or discard it.
pub struct RejectedTask<R> {
    pub reason: PipelineError,
    job: Job,
    handle: CompletionHandle<R>,
}

impl<R> RejectedTask<R> {
    /// Runs the task synchronously on the calling thread and returns its
    /// (already resolved) completion handle.
    pub fn run_inline(self) -> CompletionHandle<R> {
        (self.job)();
        self.handle
    }
}

pub struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<crossbeam_channel::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(name: &'static str, threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(TASK_BACKLOG);

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        info!(pool = name, threads, "Worker pool started");

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            running: AtomicBool::new(true),
        }
    }

    /// Enqueues a task and returns its completion handle. Fails with
    /// `QueueFull` when the backlog is at capacity and `PoolStopped` after
    /// `stop`; the rejected task comes back inside the error so no captured
    /// state is lost. A panicking task never takes its worker down; the
    /// panic is captured into the handle.
    pub fn submit<F, R>(&self, task: F) -> std::result::Result<CompletionHandle<R>, RejectedTask<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                PipelineError::TaskPanicked(message)
            });
            let _ = tx.send(outcome);
        });
        let handle = CompletionHandle { rx };

        if !self.running.load(Ordering::SeqCst) {
            return Err(RejectedTask {
                reason: PipelineError::PoolStopped,
                job,
                handle,
            });
        }

        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(RejectedTask {
                reason: PipelineError::PoolStopped,
                job,
                handle,
            });
        };
        match sender.try_send(job) {
            Ok(()) => Ok(handle),
            Err(crossbeam_channel::TrySendError::Full(job)) => Err(RejectedTask {
                reason: PipelineError::QueueFull,
                job,
                handle,
            }),
            Err(crossbeam_channel::TrySendError::Disconnected(job)) => Err(RejectedTask {
                reason: PipelineError::PoolStopped,
                job,
                handle,
            }),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops intake, lets the workers drain the queued tasks, and joins
    /// them. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender disconnects the channel; workers finish the
        // remaining backlog and exit on the disconnect.
        self.sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        debug!(pool = self.name, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
