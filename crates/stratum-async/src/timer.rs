//! Timer service.
//!
//! One dedicated thread orders deadlines in a binary heap and posts due
//! callbacks to the worker pool. Cancellation is O(1): the handle flips a
//! pending-set entry and the expiry check discards the job at fire time.
//! A cancel that races the firing resolves by the first-completer rule:
//! whichever side removes the pending entry wins.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::pool::{Job, WorkPool};

struct TimerEntry {
    deadline: Instant,
    id: u64,
    job: Option<Job>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    pending: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Handle to a scheduled timer.
pub struct TimerHandle {
    id: u64,
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Cancels the timer. Returns `true` if the callback was still pending
    /// (it will not run); `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared
            .state.lock().expect("lock poisoned");
        state.pending.remove(&self.id)
    }

    /// True if the timer has neither fired nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            shared
                .state
                .lock().expect("lock poisoned")
                .pending
                .contains(&self.id)
        })
    }
}

/// Monotonic timer with cancel, backed by a single dispatcher thread.
pub struct TimerService {
    shared: Arc<TimerShared>,
    pool: Arc<WorkPool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new(pool: Arc<WorkPool>) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                pending: HashSet::new(),
                next_id: 1,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_pool = Arc::clone(&pool);
        let thread = std::thread::Builder::new()
            .name("stratum-timer".to_string())
            .spawn(move || dispatcher_loop(&thread_shared, &thread_pool))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            pool,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Schedules `job` to run on the worker pool after `delay`.
    pub fn schedule(&self, delay: Duration, job: Job) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let mut state = self
            .shared
            .state.lock().expect("lock poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id);
        state.heap.push(TimerEntry {
            deadline,
            id,
            job: Some(job),
        });
        self.shared.wakeup.notify_one();
        TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of timers scheduled but not yet fired or cancelled.
    pub fn pending_count(&self) -> usize {
        self.shared
            .state.lock().expect("lock poisoned")
            .pending
            .len()
    }

    /// Stops the dispatcher thread. Pending timers never fire.
    pub fn shutdown(&self) {
        {
            let mut state = self
                .shared
                .state
                .lock().expect("lock poisoned");
            state.shutdown = true;
            state.pending.clear();
            state.heap.clear();
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = self
            .thread.lock().expect("lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatcher_loop(shared: &TimerShared, pool: &Arc<WorkPool>) {
    let mut state = shared
        .state
        .lock()
        .expect("lock poisoned");
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(top) = state.heap.peek() {
            if top.deadline > now {
                break;
            }
            let mut entry = state.heap.pop().expect("peeked entry");
            // Cancelled entries were removed from `pending`; drop them.
            if state.pending.remove(&entry.id)
                && let Some(job) = entry.job.take()
            {
                due.push(job);
            }
        }

        if !due.is_empty() {
            drop(state);
            for job in due {
                pool.post(job);
            }
            state = shared
                .state
                .lock().expect("lock poisoned");
            continue;
        }

        let wait = state
            .heap
            .peek()
            .map_or(Duration::from_secs(3600), |top| {
                top.deadline.saturating_duration_since(now)
            });
        let (next, _timeout) = shared
            .wakeup
            .wait_timeout(state, wait)
            .expect("lock poisoned");
        state = next;
    }
}

// ============================================================================
// Delay context
// ============================================================================

/// A delay modeled as an async context.
///
/// Starting it schedules the deadline; the context completes with success
/// when the timer fires, or with [`Status::OperationCanceled`] when
/// cancelled first. A cancel racing the firing resolves by the context's
/// first-completer rule.
pub struct DelayContext {
    core: crate::context::ContextCore,
    delay: Duration,
    handle: Mutex<Option<TimerHandle>>,
    me: Weak<DelayContext>,
}

impl DelayContext {
    pub fn new(runtime: Arc<crate::runtime::AsyncRuntime>, delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: crate::context::ContextCore::new(runtime),
            delay,
            handle: Mutex::new(None),
            me: me.clone(),
        })
    }
}

impl crate::context::AsyncOp for DelayContext {
    fn core(&self) -> &crate::context::ContextCore {
        &self.core
    }

    fn on_start(&self) {
        let me = self.me.clone();
        let handle = self.core.runtime().schedule(
            self.delay,
            Box::new(move || {
                if let Some(ctx) = me.upgrade() {
                    ctx.core.complete(Ok(()));
                }
            }),
        );
        *self.handle.lock().expect("lock poisoned") = Some(handle);
    }

    fn on_cancel(&self) {
        if let Some(handle) = self.handle.lock().expect("lock poisoned").take() {
            handle.cancel();
        }
        self.core
            .complete(Err(stratum_types::Status::OperationCanceled));
    }

    fn on_reuse(&self) {
        *self.handle.lock().expect("lock poisoned") = None;
    }
}
