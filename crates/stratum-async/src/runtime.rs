//! Runtime bundle: worker pool + timer service.

use std::sync::Arc;
use std::time::Duration;

use crate::pool::{Job, WorkPool};
use crate::timer::{TimerHandle, TimerService};

/// The scheduling substrate shared by every async object.
///
/// One `AsyncRuntime` typically serves a whole replicator instance; tests
/// spin up a small one per case.
pub struct AsyncRuntime {
    pool: Arc<WorkPool>,
    timers: TimerService,
}

impl AsyncRuntime {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let pool = Arc::new(WorkPool::new(worker_count));
        let timers = TimerService::new(Arc::clone(&pool));
        Arc::new(Self { pool, timers })
    }

    /// A two-worker runtime, the default for tests.
    pub fn for_tests() -> Arc<Self> {
        Self::new(2)
    }

    /// Posts a job to the worker pool.
    pub fn post(&self, job: Job) {
        self.pool.post(job);
    }

    /// Schedules a cancellable timer callback.
    pub fn schedule(&self, delay: Duration, job: Job) -> TimerHandle {
        self.timers.schedule(delay, job)
    }

    pub fn pool(&self) -> &Arc<WorkPool> {
        &self.pool
    }

    /// Blocks until posted work quiesces (test synchronization aid).
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    /// Stops timers first (no new posts), then drains and joins workers.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.pool.shutdown();
    }
}
