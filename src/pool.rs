//! Work-stealing thread pool.
//!
//! Each worker owns a deque of type-erased tasks behind its own mutex.
//! Submission picks the owning deque by a round-robin counter and pushes at
//! the front; a worker pops from the front of its own deque and, finding it
//! empty, scans the other deques cyclically starting just past itself and
//! steals from the back. When every deque is empty the worker yields.
//!
//! `submit` returns a [`TaskHandle`] tied to the task's eventual result;
//! a panic inside a task is captured and surfaces at the handle as
//! [`Error::TaskPanicked`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::error::Error;
use crate::promise::Promise;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queues: Vec<CachePadded<Mutex<VecDeque<Task>>>>,
    stop: AtomicBool,
    next_queue: AtomicUsize,
}

impl Shared {
    /// Round-robin selection of the deque that owns the next task.
    fn pick_queue(&self) -> usize {
        let len = self.queues.len();
        let mut current = self.next_queue.load(Ordering::Relaxed);
        loop {
            match self.next_queue.compare_exchange_weak(
                current,
                (current + 1) % len,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run one task: own deque first, then steal, else yield.
    fn run_pending_task(&self, id: usize) {
        let own = self.queues[id].lock().pop_front();
        if let Some(task) = own {
            task();
            return;
        }

        let len = self.queues.len();
        for offset in 1..len {
            let victim = (id + offset) % len;
            let stolen = self.queues[victim].lock().pop_back();
            if let Some(task) = stolen {
                task();
                return;
            }
        }

        thread::yield_now();
    }
}

/// A fixed-size pool of workers with per-worker task deques.
pub struct WorkStealingPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkStealingPool {
    /// Create a pool sized to the machine's available parallelism.
    pub fn new() -> Self {
        Self::with_size(num_cpus::get().max(1))
    }

    /// Create a pool with `size` workers.
    pub fn with_size(size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queues: (0..size)
                .map(|_| CachePadded::new(Mutex::new(VecDeque::new())))
                .collect(),
            stop: AtomicBool::new(false),
            next_queue: AtomicUsize::new(0),
        });

        let workers = (0..size)
            .map(|id| {
                let shared = shared.clone();
                thread::spawn(move || {
                    while !shared.stop.load(Ordering::Acquire) {
                        shared.run_pending_task(id);
                    }
                })
            })
            .collect();

        debug!(size, "work-stealing pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.queues.len()
    }

    /// Submit a task and receive a handle to its eventual result.
    ///
    /// Fails with [`Error::PoolStopped`] after [`stop_all`](Self::stop_all).
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(Error::PoolStopped);
        }

        let promise = Arc::new(Promise::new());
        let completion = promise.clone();
        let job: Task = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => completion.complete(value),
                Err(_) => completion.fail(Error::TaskPanicked),
            };
        });

        let id = self.shared.pick_queue();
        self.shared.queues[id].lock().push_front(job);
        Ok(TaskHandle { promise })
    }

    /// Stop every worker and join them.
    ///
    /// Idempotent; tasks still queued when the workers notice the flag are
    /// dropped unexecuted.
    pub fn stop_all(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let workers = mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            let _ = worker.join();
        }
        debug!("work-stealing pool stopped");
    }
}

impl Default for WorkStealingPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkStealingPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// A handle to the eventual result of a submitted task.
pub struct TaskHandle<T> {
    promise: Arc<Promise<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes and take its result.
    pub fn wait(self) -> Result<T, Error> {
        self.promise.wait()
    }

    /// Whether the task has finished.
    pub fn is_complete(&self) -> bool {
        self.promise.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_submit_returns_value() {
        let pool = WorkStealingPool::with_size(2);
        let handle = pool.submit(|| 2 + 3).unwrap();
        assert_eq!(handle.wait(), Ok(5));
    }

    #[test]
    fn test_size() {
        let pool = WorkStealingPool::with_size(3);
        assert_eq!(pool.size(), 3);
    }

    #[test]
    fn test_panicking_task_surfaces_at_handle() {
        let pool = WorkStealingPool::with_size(2);
        let handle = pool.submit(|| -> i32 { panic!("task went wrong") }).unwrap();
        assert_eq!(handle.wait(), Err(Error::TaskPanicked));

        // the worker that ran the panicking task is still alive
        let handle = pool.submit(|| 1).unwrap();
        assert_eq!(handle.wait(), Ok(1));
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let pool = WorkStealingPool::with_size(2);
        pool.stop_all();
        assert!(matches!(pool.submit(|| 1), Err(Error::PoolStopped)));
    }

    #[test]
    fn test_stop_all_is_idempotent() {
        let pool = WorkStealingPool::with_size(2);
        pool.stop_all();
        pool.stop_all();
    }

    #[test]
    fn test_saturation_every_task_runs_once() {
        const TASKS: usize = 10_000;

        let pool = WorkStealingPool::with_size(4);
        let executions = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..TASKS)
            .map(|i| {
                let executions = executions.clone();
                pool.submit(move || {
                    executions.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(1));
                    i
                })
                .unwrap()
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait(), Ok(i));
        }
        assert_eq!(executions.load(Ordering::Relaxed), TASKS);
        pool.stop_all();
    }
}
