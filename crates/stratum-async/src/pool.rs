//! Worker pool.
//!
//! A fixed set of worker threads draining a lock-free injector queue. All
//! completion callbacks, service hooks and timer callbacks in the runtime
//! are posted here, which keeps user code off the threads that mutate
//! queue and sender state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// How long an idle worker parks before re-checking the injector.
const IDLE_PARK: Duration = Duration::from_millis(50);

struct PoolShared {
    injector: SegQueue<Job>,
    sleep_lock: Mutex<bool>,
    wakeup: Condvar,
    posted: AtomicU64,
    executed: AtomicU64,
}

/// Fixed-size worker pool.
///
/// Jobs run in posting order per the injector's FIFO discipline, but with
/// multiple workers two jobs may execute concurrently; callers that need
/// mutual exclusion serialize through their own locks.
pub struct WorkPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    /// Spawns `worker_count` threads (minimum 1).
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(PoolShared {
            injector: SegQueue::new(),
            sleep_lock: Mutex::new(false),
            wakeup: Condvar::new(),
            posted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        });

        let count = worker_count.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("stratum-worker-{index}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a job for execution on a worker thread.
    ///
    /// Jobs posted after [`WorkPool::shutdown`] are silently dropped.
    pub fn post(&self, job: Job) {
        self.shared.posted.fetch_add(1, Ordering::Relaxed);
        self.shared.injector.push(job);
        let _guard = self
            .shared
            .sleep_lock.lock().expect("lock poisoned");
        self.shared.wakeup.notify_one();
    }

    /// Number of jobs posted over the pool's lifetime.
    pub fn posted_count(&self) -> u64 {
        self.shared.posted.load(Ordering::Relaxed)
    }

    /// Number of jobs fully executed.
    pub fn executed_count(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Blocks until every job posted so far has executed or `timeout`
    /// elapses. Returns `true` on quiesce.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.shared.injector.is_empty() && self.posted_count() == self.executed_count() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shared.injector.is_empty() && self.posted_count() == self.executed_count()
    }

    /// Stops the workers after the injector drains. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut stopping = self
                .shared
                .sleep_lock
                .lock().expect("lock poisoned");
            *stopping = true;
            self.shared.wakeup.notify_all();
        }
        let mut workers = self
            .workers.lock().expect("lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        if let Some(job) = shared.injector.pop() {
            job();
            shared.executed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let stopping = shared
            .sleep_lock.lock().expect("lock poisoned");
        if *stopping {
            // Drain whatever raced in before the stop flag.
            drop(stopping);
            while let Some(job) = shared.injector.pop() {
                job();
                shared.executed.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        if shared.injector.is_empty() {
            let _ = shared.wakeup.wait_timeout(stopping, IDLE_PARK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_posted_jobs() {
        let pool = WorkPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn shutdown_runs_pending_jobs() {
        let pool = WorkPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
