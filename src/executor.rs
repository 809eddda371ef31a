use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::{ExecutorError, Result};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads draining a shared FIFO queue.
///
/// Submitting never blocks: the queue is unbounded and grows under overload.
/// Shutting down wakes every worker; tasks still queued at that point are
/// dropped without running.
pub struct ThreadPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Internal state shared between the pool and its worker threads
struct Inner {
    /// Shared state protected by a mutex
    shared: Mutex<Shared>,
    /// Condition variable idle workers block on
    condvar: Condvar,
}

/// Shared state for the thread pool
struct Shared {
    /// Queue of pending tasks
    queue: VecDeque<Task>,
    /// Set once by `shutdown`
    closed: bool,
}

impl ThreadPool {
    /// Creates a pool and starts `threads` workers.
    ///
    /// # Errors
    /// Returns `ExecutorError::NoWorkers` for a zero thread count, or an
    /// error if a worker thread cannot be spawned.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(ExecutorError::NoWorkers);
        }

        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                queue: VecDeque::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name("sparrow-worker".to_owned())
                .spawn(move || {
                    if let Err(e) = inner.run() {
                        log::error!("Worker thread {} error: {}", id, e);
                    }
                })
                .map_err(ExecutorError::ThreadSpawn)?;
            workers.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.lock().map(|shared| shared.queue.len()).unwrap_or(0)
    }

    /// Queues a task and wakes one idle worker.
    ///
    /// # Errors
    /// Returns `ExecutorError::Closed` (dropping the task) after shutdown.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut shared = self.inner.lock()?;
            if shared.closed {
                return Err(ExecutorError::Closed);
            }
            shared.queue.push_back(Box::new(task));
        }
        self.inner.condvar.notify_one();
        Ok(())
    }

    /// Closes the pool and waits for every worker to finish its current task.
    pub fn shutdown(&self) {
        let dropped = match self.inner.lock() {
            Ok(mut shared) => {
                shared.closed = true;
                let dropped = shared.queue.len();
                shared.queue.clear();
                dropped
            }
            Err(e) => {
                log::error!("Failed to close thread pool: {}", e);
                return;
            }
        };
        self.inner.condvar.notify_all();
        if dropped > 0 {
            log::debug!("Thread pool closed with {} queued tasks dropped", dropped);
        }

        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        let current = thread::current().id();
        for handle in handles {
            // A task that drops the last pool handle runs on a worker.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, Shared>> {
        self.shared.lock().map_err(|_| ExecutorError::LockPoisoned)
    }

    /// Main worker thread loop.
    ///
    /// The worker will:
    /// 1. Pop the oldest task and run it outside the lock
    /// 2. Wait on the condition variable while the queue is empty
    /// 3. Exit once the pool is closed
    ///
    /// # Errors
    /// Returns an error if mutex operations fail
    fn run(&self) -> Result<()> {
        let mut shared = self.lock()?;

        loop {
            if shared.closed {
                break;
            }
            if let Some(task) = shared.queue.pop_front() {
                drop(shared);
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!("Task panicked on {:?}", thread::current().name());
                }
                shared = self.lock()?;
                continue;
            }
            shared = self
                .condvar
                .wait(shared)
                .map_err(|_| ExecutorError::LockPoisoned)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Tests that every submitted task executes exactly once.
    #[test]
    fn test_tasks_run_exactly_once() {
        let pool = ThreadPool::new(4).unwrap();
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..200).map(|_| AtomicUsize::new(0)).collect());
        let (tx, rx) = mpsc::channel();

        for i in 0..200 {
            let hits = hits.clone();
            let tx = tx.clone();
            pool.execute(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            })
            .unwrap();
        }

        for _ in 0..200 {
            rx.recv_timeout(Duration::from_secs(5)).expect("task did not run");
        }
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    /// A single worker must run tasks in submission order.
    #[test]
    fn test_fifo_order_with_one_worker() {
        let pool = ThreadPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let order: Vec<_> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_execute_after_shutdown_is_rejected() {
        let pool = ThreadPool::new(2).unwrap();
        pool.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let result = pool.execute(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(result, Err(ExecutorError::Closed)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    /// Tasks queued behind a busy worker are dropped at shutdown.
    #[test]
    fn test_shutdown_drops_queued_tasks() {
        let pool = ThreadPool::new(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..5 {
            let ran = ran.clone();
            pool.execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert_eq!(pool.queued(), 5);

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        pool.shutdown();
        releaser.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_workers_is_an_error() {
        assert!(matches!(ThreadPool::new(0), Err(ExecutorError::NoWorkers)));
    }

    /// A panicking task must not take its worker down.
    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = ThreadPool::new(1).unwrap();
        pool.execute(|| panic!("boom")).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }
}
