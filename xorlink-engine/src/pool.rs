use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a task was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Why a submitted task produced no value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task panicked")]
    Panicked,
    #[error("task was dropped before it ran")]
    Dropped,
}

/// Result handle returned by [`WorkerPool::submit`].
#[must_use = "dropping the handle discards the task's result, not the task"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Waits for the task to finish and returns its output.
    ///
    /// # Errors
    ///
    /// [`TaskError::Panicked`] if the task panicked, [`TaskError::Dropped`]
    /// if the runtime went away before a worker could run it.
    pub async fn join(self) -> Result<T, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Dropped))
    }
}

struct PoolState {
    queue: VecDeque<Task>,
    terminating: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Tasks never run under the lock, so a poisoned guard still holds a
        // consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed set of worker tasks draining a FIFO queue.
///
/// Each worker runs one task to completion before taking the next, so the
/// number of tasks in flight never exceeds [`worker_count`](Self::worker_count).
/// Excess submissions wait in the queue in arrival order.
///
/// Must be created inside a Tokio runtime.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` worker tasks (at least one).
    #[must_use]
    pub fn start(workers: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                terminating: false,
            }),
            available: Notify::new(),
        });

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&shared))))
            .collect();

        info!(workers, "Worker pool started");
        Self {
            shared,
            workers: handles,
        }
    }

    /// Spawns one worker per available hardware thread.
    #[must_use]
    pub fn with_default_workers() -> Self {
        Self::start(default_worker_count())
    }

    /// Number of workers, and therefore the concurrency cap.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks waiting for a free worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Queues `task` and returns a handle to its eventual output.
    ///
    /// A panic inside the task is caught and reported through the handle;
    /// the worker that ran it survives.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShuttingDown`] once [`close`](Self::close) or
    /// [`shutdown`](Self::shutdown) has been called.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Task = Box::pin(async move {
            let result = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(|_| TaskError::Panicked);
            // Receiver may have been dropped; the result is simply discarded.
            let _ = tx.send(result);
        });

        {
            let mut state = self.shared.lock();
            if state.terminating {
                return Err(PoolError::ShuttingDown);
            }
            state.queue.push_back(wrapped);
        }
        self.shared.available.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Stops accepting new tasks. Queued tasks still run.
    pub fn close(&self) {
        self.shared.lock().terminating = true;
        self.shared.available.notify_waiters();
    }

    /// Stops accepting tasks, lets the workers drain the queue, and waits
    /// for every worker to exit.
    ///
    /// Tasks already running are awaited, so a task that never finishes
    /// blocks this call forever.
    pub async fn shutdown(mut self) {
        self.close();
        debug!(pending = self.pending(), "Draining worker pool");
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker exited abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers drain the queue and exit on their own; nothing to join here.
        self.close();
    }
}

/// One worker per hardware thread, or a single worker if that cannot be
/// determined.
#[must_use]
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

enum Next {
    Run(Task),
    Wait,
    Exit,
}

async fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        let task = {
            // Register for wakeups before inspecting the queue so a submit
            // or close landing in between is not missed. The registration
            // is dropped before the task runs so that a busy worker never
            // absorbs a wakeup meant for an idle one.
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = shared.lock();
                match state.queue.pop_front() {
                    Some(task) => Next::Run(task),
                    None if state.terminating => Next::Exit,
                    None => Next::Wait,
                }
            };

            match next {
                Next::Run(task) => task,
                Next::Wait => {
                    notified.await;
                    continue;
                }
                Next::Exit => {
                    trace!(worker = id, "Worker exiting");
                    return;
                }
            }
        };

        trace!(worker = id, "Task picked");
        task.await;
    }
}
