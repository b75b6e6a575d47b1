//! Fixed-size worker pool over a shared, unbounded task queue.
//!
//! - `submit` never blocks: the queue is an unbounded crossbeam channel.
//! - A panicking task is caught at the task boundary and logged; the worker
//!   keeps consuming the queue.
//! - `shutdown` drains. It stops accepting work from outside the pool, waits
//!   until every queued and running task (including follow-up tasks those
//!   tasks submit) has finished, then joins the workers.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, warn};

use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Identity of the pool whose worker runs on this thread; 0 elsewhere.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

fn pool_identity(shared: &Arc<Shared>) -> usize {
    Arc::as_ptr(shared) as usize
}

/// How many workers to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize(usize);

impl PoolSize {
    /// Available hardware threads, floored to 2 when the platform reports none.
    pub fn default_for_host() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(0);
        PoolSize(if threads == 0 { 2 } else { threads })
    }

    /// Uses `requested` when it is a positive number, the host default otherwise.
    pub fn resolve(requested: Option<i64>) -> Self {
        match requested {
            Some(n) if n > 0 => PoolSize(usize::try_from(n).unwrap_or(usize::MAX)),
            Some(n) => {
                let fallback = Self::default_for_host();
                warn!(requested = n, fallback = fallback.0, "invalid worker count, using default");
                fallback
            }
            None => Self::default_for_host(),
        }
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl From<usize> for PoolSize {
    fn from(size: usize) -> Self {
        PoolSize(size.max(1))
    }
}

struct PoolState {
    accepting: bool,
    /// Tasks queued or running.
    outstanding: usize,
    sender: Option<Sender<Job>>,
}

struct Shared {
    state: Mutex<PoolState>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn task_finished(&self) {
        let mut state = self.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `size` workers named `<name>-worker-<n>`.
    pub fn new(name: &str, size: impl Into<PoolSize>) -> Result<Self, PoolError> {
        let size = size.into().get();
        let (sender, receiver) = unbounded::<Job>();
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                accepting: true,
                outstanding: 0,
                sender: Some(sender),
            }),
            idle: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || run_worker(receiver, shared))
                .map_err(PoolError::Spawn)?;
            workers.push(worker);
        }

        debug!(pool = name, size, "worker pool started");
        Ok(Self {
            name: name.to_string(),
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueues `task` and returns immediately.
    ///
    /// Once shutdown has begun only tasks running on this pool's workers may
    /// still submit; everyone else gets [`PoolError::Closed`].
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if !state.accepting && !self.on_own_worker() {
            return Err(PoolError::Closed);
        }
        let Some(sender) = state.sender.as_ref() else {
            return Err(PoolError::Closed);
        };
        sender
            .send(Box::new(task))
            .map_err(|_| PoolError::Closed)?;
        state.outstanding += 1;
        Ok(())
    }

    /// Stops accepting work, waits for the queue to drain and joins the workers.
    ///
    /// Calling it again after it has returned is a no-op. Calling it from one
    /// of this pool's own tasks would wait on itself and is refused.
    pub fn shutdown(&self) -> Result<(), PoolError> {
        if self.on_own_worker() {
            return Err(PoolError::ShutdownFromWorker);
        }

        {
            let mut state = self.shared.lock();
            state.accepting = false;
            while state.outstanding > 0 {
                state = self
                    .shared
                    .idle
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            // Disconnects the channel so idle workers fall out of `recv`.
            state.sender.take();
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!(pool = %self.name, "worker thread panicked outside a task");
            }
        }
        debug!(pool = %self.name, "worker pool stopped");
        Ok(())
    }

    fn on_own_worker(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == pool_identity(&self.shared)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(pool = %self.name, error = %err, "worker pool dropped without draining");
        }
    }
}

fn run_worker(receiver: Receiver<Job>, shared: Arc<Shared>) {
    CURRENT_POOL.with(|pool| pool.set(pool_identity(&shared)));
    let current = thread::current();
    let worker = current.name().unwrap_or("pool-worker");
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker,
                panic = panic_message(payload.as_ref()),
                "pool task failed"
            );
        }
        shared.task_finished();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("malformed command")).unwrap();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.shutdown().unwrap();
        assert!(matches!(pool.submit(|| {}), Err(PoolError::Closed)));
        // Second shutdown is a no-op.
        pool.shutdown().unwrap();
    }

    #[test]
    fn follow_up_tasks_are_drained() {
        let pool = Arc::new(WorkerPool::new("test", 2).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let inner_pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(20));
                for _ in 0..5 {
                    let counter = Arc::clone(&counter);
                    inner_pool
                        .submit(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
            .unwrap();
        }

        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn shutdown_from_own_task_is_refused() {
        let pool = Arc::new(WorkerPool::new("test", 1).unwrap());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = Arc::clone(&pool);
        pool.submit(move || {
            let _ = tx.send(inner.shutdown());
        })
        .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, Err(PoolError::ShutdownFromWorker)));
        pool.shutdown().unwrap();
    }

    #[test]
    fn resolve_falls_back_on_non_positive_sizes() {
        let default = PoolSize::default_for_host();
        assert!(default.get() >= 1);
        assert_eq!(PoolSize::resolve(Some(3)).get(), 3);
        assert_eq!(PoolSize::resolve(Some(0)), default);
        assert_eq!(PoolSize::resolve(Some(-2)), default);
        assert_eq!(PoolSize::resolve(None), default);
    }
}
