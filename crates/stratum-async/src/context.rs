//! The async-context lifecycle kernel.
//!
//! Every async operation embeds a [`ContextCore`] and implements
//! [`AsyncOp`]. The core owns the lifecycle state machine:
//!
//! ```text
//! Initialized --start_op--> Operating --last activity released--> CompletionPending
//!      ^                                                               |
//!      |                                       completion callback ran |
//!      +------------------------- reuse ------------------------- Completed
//! ```
//!
//! Activities are counted reasons to stay alive. `start_op` acquires the
//! first; `complete` releases it after capturing the status; user code may
//! hold extra activities across deferred work. When the count reaches zero
//! in `Operating`, the core captures the pending status (success if none
//! was set), switches to `CompletionPending`, and dispatches the completion
//! callback on the runtime's worker pool.
//!
//! Parent/child ordering: a child started with a parent holds one activity
//! on the parent until the child's completion callback has returned, so a
//! parent's own completion strictly follows the completion callbacks of all
//! of its children. Cancelling a parent cancels its children; cancelling a
//! child never touches the parent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use stratum_types::{Completion, Status};

use crate::runtime::AsyncRuntime;

/// Lifecycle states of an async context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Constructed or reused; not yet started.
    Initialized,

    /// Started; activities may be acquired and released.
    Operating,

    /// Status captured; completion callback queued or running.
    CompletionPending,

    /// Completion callback has returned; the context may be reused.
    Completed,
}

/// Callback invoked exactly once when a context completes.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Shared tag propagated through a parent/child tree, used for correlated
/// tracing of nested operations.
#[derive(Debug, Clone)]
pub struct GlobalContext {
    pub activity_id: String,
}

impl GlobalContext {
    pub fn new(activity_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            activity_id: activity_id.into(),
        })
    }
}

/// The behavior hooks of an async operation.
///
/// All hooks run outside the core's internal lock. The default hooks do
/// nothing; operations that suspend (wait contexts, acquire contexts,
/// timers) override `on_start` to register themselves and `on_cancel` to
/// unregister and complete with [`Status::OperationCanceled`].
pub trait AsyncOp: Send + Sync + 'static {
    fn core(&self) -> &ContextCore;

    fn on_start(&self) {}

    fn on_cancel(&self) {}

    fn on_reuse(&self) {}
}

struct CoreInner {
    state: ContextState,
    activities: u32,
    completing: bool,
    status: Completion,
    callback: Option<CompletionCallback>,
    parent: Option<Arc<dyn AsyncOp>>,
    children: Vec<Weak<dyn AsyncOp>>,
    self_keepalive: Option<Arc<dyn AsyncOp>>,
    global: Option<Arc<GlobalContext>>,
}

/// Lifecycle state embedded by every async operation.
pub struct ContextCore {
    runtime: Arc<AsyncRuntime>,
    inner: Mutex<CoreInner>,
    cancel_requested: AtomicBool,
}

impl ContextCore {
    pub fn new(runtime: Arc<AsyncRuntime>) -> Self {
        Self {
            runtime,
            inner: Mutex::new(CoreInner {
                state: ContextState::Initialized,
                activities: 0,
                completing: false,
                status: Ok(()),
                callback: None,
                parent: None,
                children: Vec::new(),
                self_keepalive: None,
                global: None,
            }),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &Arc<AsyncRuntime> {
        &self.runtime
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().expect("lock poisoned").state
    }

    /// The status captured at completion. Success while still operating.
    pub fn status(&self) -> Completion {
        self.inner.lock().expect("lock poisoned").status
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub fn global_context(&self) -> Option<Arc<GlobalContext>> {
        self.inner.lock().expect("lock poisoned").global.clone()
    }

    /// Adds `count` activities. The context must be operating.
    ///
    /// # Panics
    ///
    /// Panics if the context holds no activities (the completion decision
    /// has been made); that is an invariant violation, not a recoverable
    /// state.
    pub fn acquire_activities(&self, count: u32) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        assert!(
            inner.state == ContextState::Operating && inner.activities > 0,
            "activity acquired on a context that is not operating"
        );
        inner.activities += count;
    }

    /// Attempts to add `count` activities; fails once the activity count
    /// has reached zero (completion already decided) or the context is not
    /// operating.
    pub fn try_acquire_activities(&self, count: u32) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.state != ContextState::Operating || inner.activities == 0 {
            return false;
        }
        inner.activities += count;
        true
    }

    /// Releases `count` activities; the release that drives the count to
    /// zero while operating begins completion dispatch.
    pub fn release_activities(&self, count: u32) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        assert!(
            inner.activities >= count,
            "activity count underflow: {} - {count}",
            inner.activities
        );
        inner.activities -= count;
        if inner.activities == 0 && inner.state == ContextState::Operating {
            self.begin_completion(&mut inner);
        }
    }

    /// Captures `status` and releases the start activity. First caller
    /// wins; later calls return `false` and change nothing.
    pub fn complete(&self, status: Completion) -> bool {
        self.complete_with(status, || {})
    }

    /// [`ContextCore::complete`] that additionally runs `under_lock` inside
    /// the core's lock after the status is captured, for callers that must
    /// publish state atomically with the completion decision.
    pub fn complete_with(&self, status: Completion, under_lock: impl FnOnce()) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.state != ContextState::Operating || inner.completing {
            return false;
        }
        inner.completing = true;
        inner.status = status;
        under_lock();

        assert!(inner.activities > 0, "complete without a start activity");
        inner.activities -= 1;
        if inner.activities == 0 {
            self.begin_completion(&mut inner);
        }
        true
    }

    // Runs with the inner lock held; schedules the callback outside of it.
    fn begin_completion(&self, inner: &mut CoreInner) {
        inner.state = ContextState::CompletionPending;
        let status = inner.status;
        let callback = inner.callback.take();
        let keepalive = inner.self_keepalive.take();
        let parent = inner.parent.take();
        inner.children.clear();

        let Some(op) = keepalive else {
            // Completed without ever being started through `start_op`
            // (unit-test shortcut); finish inline.
            inner.state = ContextState::Completed;
            if let Some(callback) = callback {
                self.runtime.post(Box::new(move || callback(status)));
            }
            return;
        };

        self.runtime.post(Box::new(move || {
            if let Some(callback) = callback {
                callback(status);
            }
            {
                let mut inner = op.core().inner.lock().expect("lock poisoned");
                inner.state = ContextState::Completed;
            }
            if let Some(parent) = parent {
                parent.core().release_activities(1);
            }
            drop(op);
        }));
    }

    fn register_child(&self, child: Weak<dyn AsyncOp>) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.children.retain(|c| c.strong_count() > 0);
        inner.children.push(child);
    }
}

/// Starts an operation: `Initialized → Operating`, acquires the first
/// activity, records the callback and parent link, then invokes
/// [`AsyncOp::on_start`].
///
/// With a parent, one activity is acquired on the parent for the child's
/// whole life; starting a child under a parent whose completion has already
/// been decided fails with [`Status::InvalidState`].
pub fn start_op<T: AsyncOp>(
    op: &Arc<T>,
    parent: Option<Arc<dyn AsyncOp>>,
    callback: Option<CompletionCallback>,
) -> Result<(), Status> {
    start_op_with_global(op, parent, callback, None)
}

/// [`start_op`] with an explicit global (tracing) context. When absent and
/// a parent exists, the parent's global context is inherited.
pub fn start_op_with_global<T: AsyncOp>(
    op: &Arc<T>,
    parent: Option<Arc<dyn AsyncOp>>,
    callback: Option<CompletionCallback>,
    global: Option<Arc<GlobalContext>>,
) -> Result<(), Status> {
    let core = op.core();
    {
        let mut inner = core.inner.lock().expect("lock poisoned");
        if inner.state != ContextState::Initialized {
            return Err(Status::InvalidState);
        }

        if let Some(parent) = &parent {
            if !parent.core().try_acquire_activities(1) {
                return Err(Status::InvalidState);
            }
            let child: Arc<dyn AsyncOp> = Arc::clone(op) as Arc<dyn AsyncOp>;
            parent.core().register_child(Arc::downgrade(&child));
        }

        inner.state = ContextState::Operating;
        inner.activities = 1;
        inner.completing = false;
        inner.status = Ok(());
        inner.callback = callback;
        inner.global = global.or_else(|| {
            parent
                .as_ref()
                .and_then(|p| p.core().inner.lock().expect("lock poisoned").global.clone())
        });
        inner.parent = parent;
        inner.self_keepalive = Some(Arc::clone(op) as Arc<dyn AsyncOp>);
        core.cancel_requested.store(false, Ordering::Release);
    }

    op.on_start();
    Ok(())
}

/// Requests cancellation: sets the cancel bit (idempotent), invokes
/// [`AsyncOp::on_cancel`] once, and propagates to live children. Returns
/// `false` if the context is already completing or completed.
pub fn cancel_op<T: AsyncOp + ?Sized>(op: &Arc<T>) -> bool {
    let core = op.core();
    let children: Vec<Weak<dyn AsyncOp>>;
    {
        let inner = core.inner.lock().expect("lock poisoned");
        if inner.state != ContextState::Operating || inner.completing {
            return false;
        }
        children = inner.children.clone();
    }

    if core.cancel_requested.swap(true, Ordering::AcqRel) {
        // Already requested; the hook has run.
        return true;
    }

    tracing::trace!(children = children.len(), "cancel requested");
    op.on_cancel();
    for child in children {
        if let Some(child) = child.upgrade() {
            cancel_op(&child);
        }
    }
    true
}

/// Returns a completed context to `Initialized` and calls
/// [`AsyncOp::on_reuse`]. Fails with [`Status::InvalidState`] unless the
/// context is `Completed`.
pub fn reuse_op<T: AsyncOp>(op: &Arc<T>) -> Result<(), Status> {
    let core = op.core();
    {
        let mut inner = core.inner.lock().expect("lock poisoned");
        if inner.state != ContextState::Completed {
            return Err(Status::InvalidState);
        }
        inner.state = ContextState::Initialized;
        inner.activities = 0;
        inner.completing = false;
        inner.status = Ok(());
        inner.callback = None;
        inner.parent = None;
        inner.children.clear();
        inner.self_keepalive = None;
        inner.global = None;
        core.cancel_requested.store(false, Ordering::Release);
    }
    op.on_reuse();
    Ok(())
}

/// RAII guard for an extra activity on a context.
///
/// Obtained through [`ActivityGuard::acquire`]; the activity is released on
/// drop, on every exit path.
pub struct ActivityGuard {
    op: Arc<dyn AsyncOp>,
}

impl ActivityGuard {
    pub fn acquire<T: AsyncOp>(op: &Arc<T>) -> Option<Self> {
        if op.core().try_acquire_activities(1) {
            Some(Self {
                op: Arc::clone(op) as Arc<dyn AsyncOp>,
            })
        } else {
            None
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.op.core().release_activities(1);
    }
}
