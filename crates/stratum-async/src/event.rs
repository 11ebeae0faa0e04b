//! Manual/auto-reset async event.
//!
//! Waiting is itself an async operation: [`AsyncEvent::create_wait_context`]
//! returns a context whose completion callback fires when the event
//! signals. Wait contexts are cancellable; cancelling one removes it from
//! the waiter list and completes it with [`Status::OperationCanceled`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use stratum_types::Status;

use crate::context::{AsyncOp, ContextCore};
use crate::runtime::AsyncRuntime;

struct EventInner {
    signaled: bool,
    waiters: VecDeque<Arc<WaitContext>>,
}

/// Async flag with FIFO waiters.
pub struct AsyncEvent {
    manual_reset: bool,
    inner: Mutex<EventInner>,
}

impl AsyncEvent {
    /// `manual_reset = true` keeps the event signaled until `reset_event`;
    /// auto-reset consumes the signal when releasing a single waiter.
    pub fn new(manual_reset: bool, initially_signaled: bool) -> Arc<Self> {
        Arc::new(Self {
            manual_reset,
            inner: Mutex::new(EventInner {
                signaled: initially_signaled,
                waiters: VecDeque::new(),
            }),
        })
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.lock().expect("lock poisoned").signaled
    }

    /// Signals the event.
    ///
    /// Manual-reset: stays signaled and completes every waiter.
    /// Auto-reset: completes at most one waiter; stays unsignaled if one
    /// was dequeued. Signaling an already-signaled event is a no-op.
    pub fn set_event(&self) {
        let released: Vec<Arc<WaitContext>> = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.signaled {
                return;
            }
            if self.manual_reset {
                inner.signaled = true;
                inner.waiters.drain(..).collect()
            } else if let Some(waiter) = inner.waiters.pop_front() {
                vec![waiter]
            } else {
                inner.signaled = true;
                Vec::new()
            }
        };

        for waiter in released {
            waiter.core.complete(Ok(()));
        }
    }

    /// Clears the signal.
    pub fn reset_event(&self) {
        self.inner.lock().expect("lock poisoned").signaled = false;
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").waiters.len()
    }

    /// Builds a wait context bound to this event. Start it with
    /// [`crate::context::start_op`]; it completes when the event signals.
    pub fn create_wait_context(self: &Arc<Self>, runtime: Arc<AsyncRuntime>) -> Arc<WaitContext> {
        Arc::new_cyclic(|me| WaitContext {
            core: ContextCore::new(runtime),
            event: Arc::downgrade(self),
            me: me.clone(),
        })
    }
}

/// A single wait on an [`AsyncEvent`].
pub struct WaitContext {
    core: ContextCore,
    event: Weak<AsyncEvent>,
    me: Weak<WaitContext>,
}

impl AsyncOp for WaitContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn on_start(&self) {
        let Some(event) = self.event.upgrade() else {
            self.core.complete(Err(Status::ObjectClosed));
            return;
        };
        let completed_inline = {
            let mut inner = event.inner.lock().expect("lock poisoned");
            if inner.signaled {
                if !event.manual_reset {
                    inner.signaled = false;
                }
                true
            } else {
                let me = self.me.upgrade().expect("wait context alive during start");
                inner.waiters.push_back(me);
                false
            }
        };
        if completed_inline {
            self.core.complete(Ok(()));
        }
    }

    fn on_cancel(&self) {
        if let Some(event) = self.event.upgrade() {
            let mut inner = event.inner.lock().expect("lock poisoned");
            inner
                .waiters
                .retain(|w| !std::ptr::eq(Arc::as_ptr(w), std::ptr::from_ref(self)));
        }
        self.core.complete(Err(Status::OperationCanceled));
    }
}
