//! Bounded worker pool backing the apply stages of the write pipeline.
//!
//! The pool keeps `min_threads` permanent workers and grows on demand up to
//! `max_threads`; extra workers exit after `idle_timeout` without work.
//! Submissions beyond `max_queue_size` are rejected with `ServiceUnavailable`
//! instead of blocking the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// A unit of work accepted by [`ThreadPool::submit`].
pub trait Runnable: Send + Sync {
    fn run(&self);
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Builder with sane defaults for the pool knobs.
///
/// `name` doubles as the worker thread name, so keep it short; Linux caps
/// thread names at 16 characters.
pub struct ThreadPoolBuilder {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue_size: usize,
    idle_timeout: Duration,
}

impl ThreadPoolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let max_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            name: name.into(),
            min_threads: 0,
            max_threads,
            max_queue_size: usize::MAX,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn min_threads(mut self, min_threads: usize) -> Self {
        self.min_threads = min_threads;
        self
    }

    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Start the pool with `min_threads` permanent workers.
    pub fn build(self) -> Result<ThreadPool> {
        if self.max_threads == 0 {
            return Err(Error::InvalidArgument(format!(
                "thread pool {}: max_threads must be positive",
                self.name
            )));
        }
        if self.min_threads > self.max_threads {
            return Err(Error::InvalidArgument(format!(
                "thread pool {}: min_threads {} exceeds max_threads {}",
                self.name, self.min_threads, self.max_threads
            )));
        }

        let pool = ThreadPool {
            inner: Arc::new(PoolInner {
                name: self.name,
                min_threads: self.min_threads,
                max_threads: self.max_threads,
                max_queue_size: self.max_queue_size,
                idle_timeout: self.idle_timeout,
                lock: Mutex::new(PoolState {
                    shutdown: false,
                    queue: VecDeque::new(),
                    num_threads: 0,
                    active_threads: 0,
                }),
                not_empty: Condvar::new(),
                idle_cond: Condvar::new(),
                no_threads_cond: Condvar::new(),
            }),
        };

        {
            let mut state = pool.inner.lock.lock().unwrap();
            for _ in 0..self.min_threads {
                PoolInner::spawn_worker(&pool.inner, &mut state, true)?;
            }
        }
        Ok(pool)
    }
}

struct PoolState {
    shutdown: bool,
    queue: VecDeque<Task>,
    num_threads: usize,
    active_threads: usize,
}

struct PoolInner {
    name: String,
    min_threads: usize,
    max_threads: usize,
    max_queue_size: usize,
    idle_timeout: Duration,
    lock: Mutex<PoolState>,
    not_empty: Condvar,
    idle_cond: Condvar,
    no_threads_cond: Condvar,
}

/// Thread pool with a variable number of workers.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Submit a [`Runnable`] task.
    pub fn submit(&self, task: Arc<dyn Runnable>) -> Result<()> {
        self.submit_func(move || task.run())
    }

    /// Submit a closure.
    pub fn submit_func<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock.lock().unwrap();
        if state.shutdown {
            return Err(Error::ServiceUnavailable(format!(
                "thread pool {} has been shut down",
                self.inner.name
            )));
        }
        if state.queue.len() >= self.inner.max_queue_size {
            return Err(Error::ServiceUnavailable(format!(
                "thread pool {} queue full ({} items)",
                self.inner.name,
                state.queue.len()
            )));
        }

        // Grow the pool when every current worker is busy.
        let idle = state.num_threads - state.active_threads;
        if idle == 0 && state.num_threads < self.inner.max_threads {
            if let Err(err) = PoolInner::spawn_worker(&self.inner, &mut state, false) {
                if state.num_threads == 0 {
                    // No worker will ever drain the queue.
                    return Err(err);
                }
                tracing::warn!(
                    pool = %self.inner.name,
                    error = %err,
                    "could not grow thread pool, task stays queued"
                );
            }
        }

        state.queue.push_back(Box::new(func));
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Block until the queue is drained and no task is running.
    pub fn wait(&self) {
        let mut state = self.inner.lock.lock().unwrap();
        while !(state.queue.is_empty() && state.active_threads == 0) {
            state = self.inner.idle_cond.wait(state).unwrap();
        }
    }

    /// Like [`ThreadPool::wait`] with a bound; returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock.lock().unwrap();
        while !(state.queue.is_empty() && state.active_threads == 0) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, result) = self
                .inner
                .idle_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if result.timed_out()
                && !(state.queue.is_empty() && state.active_threads == 0)
            {
                return false;
            }
        }
        true
    }

    /// Fail the pool, drop queued tasks, and join every worker. Tasks that
    /// are already running finish normally.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock.lock().unwrap();
        if !state.shutdown {
            state.shutdown = true;
            state.queue.clear();
            self.inner.not_empty.notify_all();
        }
        while state.num_threads > 0 {
            state = self.inner.no_threads_cond.wait(state).unwrap();
        }
        self.inner.idle_cond.notify_all();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock.lock().unwrap().queue.len()
    }

    pub fn num_threads(&self) -> usize {
        self.inner.lock.lock().unwrap().num_threads
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolInner {
    fn spawn_worker(inner: &Arc<Self>, state: &mut PoolState, permanent: bool) -> Result<()> {
        let worker = Arc::clone(inner);
        std::thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || worker.worker_loop(permanent))
            .map_err(|err| {
                Error::ServiceUnavailable(format!(
                    "thread pool {}: could not spawn worker: {err}",
                    inner.name
                ))
            })?;
        state.num_threads += 1;
        Ok(())
    }

    fn worker_loop(&self, permanent: bool) {
        let mut state = self.lock.lock().unwrap();
        loop {
            while state.queue.is_empty() && !state.shutdown {
                if permanent {
                    state = self.not_empty.wait(state).unwrap();
                } else {
                    let (next, result) = self
                        .not_empty
                        .wait_timeout(state, self.idle_timeout)
                        .unwrap();
                    state = next;
                    if result.timed_out() && state.queue.is_empty() {
                        // Idle long enough; retire this worker.
                        state.num_threads -= 1;
                        if state.num_threads == 0 {
                            self.no_threads_cond.notify_all();
                        }
                        return;
                    }
                }
            }

            let Some(task) = state.queue.pop_front() else {
                break;
            };
            state.active_threads += 1;
            drop(state);

            // Run outside all pool locks.
            task();

            state = self.lock.lock().unwrap();
            state.active_threads -= 1;
            if state.queue.is_empty() && state.active_threads == 0 {
                self.idle_cond.notify_all();
            }
        }

        state.num_threads -= 1;
        if state.num_threads == 0 {
            self.no_threads_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn runs_submitted_closures() {
        let pool = ThreadPoolBuilder::new("test-run")
            .max_threads(4)
            .build()
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.submit_func(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    struct CountingTask {
        counter: Arc<AtomicUsize>,
    }

    impl Runnable for CountingTask {
        fn run(&self) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn runs_runnable_tasks() {
        let pool = ThreadPoolBuilder::new("test-task")
            .max_threads(2)
            .build()
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(Arc::new(CountingTask {
            counter: Arc::clone(&counter),
        }))
        .unwrap();
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn saturated_pool_rejects_with_service_unavailable() {
        let pool = ThreadPoolBuilder::new("test-sat")
            .min_threads(2)
            .max_threads(2)
            .max_queue_size(1)
            .build()
            .unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (started_tx, started_rx) = mpsc::channel::<()>();

        for _ in 0..2 {
            let release_rx = Arc::clone(&release_rx);
            let started_tx = started_tx.clone();
            pool.submit_func(move || {
                started_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            })
            .unwrap();
        }
        // Both workers are busy before the queue-capacity probes.
        started_rx.recv().unwrap();
        started_rx.recv().unwrap();

        // Third task fills the queue slot, fourth is rejected.
        pool.submit_func(|| {}).unwrap();
        let err = pool.submit_func(|| {}).unwrap_err();
        assert!(err.is_service_unavailable(), "unexpected error: {err}");

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pool.wait();
    }

    #[test]
    fn submit_after_shutdown_never_runs() {
        let pool = ThreadPoolBuilder::new("test-shut")
            .max_threads(2)
            .build()
            .unwrap();
        pool.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let err = pool
            .submit_func(move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert!(err.is_service_unavailable());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_drops_queued_tasks_but_finishes_running_ones() {
        let pool = Arc::new(
            ThreadPoolBuilder::new("test-drain")
                .min_threads(1)
                .max_threads(1)
                .build()
                .unwrap(),
        );

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));

        let finished_running = Arc::clone(&finished);
        pool.submit_func(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            finished_running.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        started_rx.recv().unwrap();

        let finished_queued = Arc::clone(&finished);
        pool.submit_func(move || {
            finished_queued.fetch_add(100, Ordering::SeqCst);
        })
        .unwrap();

        // Initiate shutdown while the first task is still running: the
        // queued task is dropped before the worker can reach it.
        let shutter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.shutdown())
        };
        std::thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
        shutter.join().unwrap();

        // Only the running task completed; the queued one was dropped.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn grows_to_max_threads_on_demand() {
        let pool = ThreadPoolBuilder::new("test-grow")
            .min_threads(0)
            .max_threads(3)
            .build()
            .unwrap();
        assert_eq!(pool.num_threads(), 0);

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (started_tx, started_rx) = mpsc::channel::<()>();
        for _ in 0..3 {
            let release_rx = Arc::clone(&release_rx);
            let started_tx = started_tx.clone();
            pool.submit_func(move || {
                started_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            })
            .unwrap();
        }
        for _ in 0..3 {
            started_rx.recv().unwrap();
        }
        assert_eq!(pool.num_threads(), 3);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        pool.wait();
    }

    #[test]
    fn wait_timeout_reports_busy_pool() {
        let pool = ThreadPoolBuilder::new("test-wait")
            .min_threads(1)
            .max_threads(1)
            .build()
            .unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.submit_func(move || {
            release_rx.recv().unwrap();
        })
        .unwrap();

        assert!(!pool.wait_timeout(Duration::from_millis(50)));
        release_tx.send(()).unwrap();
        assert!(pool.wait_timeout(Duration::from_secs(10)));
    }
}
