//! Quota gate: a counted semaphore with FIFO async acquisition.
//!
//! Consumers build an [`AcquireContext`] for the quanta they need and start
//! it; the context completes when the quanta are granted. Grants are
//! strictly FIFO: a large waiter at the head blocks smaller waiters behind
//! it even when they would fit, which keeps acquisition starvation-free.
//!
//! Deactivation fails every suspended acquire with
//! [`Status::ShutdownPending`] and bumps the gate's version; acquire
//! contexts created before the bump complete with `ShutdownPending` when
//! started afterwards.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use stratum_types::Status;

use crate::context::{AsyncOp, ContextCore};
use crate::runtime::AsyncRuntime;

struct GateInner {
    free_quanta: u64,
    active: bool,
    version: u32,
    waiters: VecDeque<Arc<AcquireContext>>,
}

/// Counted semaphore with FIFO async waiters.
pub struct QuotaGate {
    runtime: Arc<AsyncRuntime>,
    inner: Mutex<GateInner>,
}

impl QuotaGate {
    pub fn new(runtime: Arc<AsyncRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            inner: Mutex::new(GateInner {
                free_quanta: 0,
                active: false,
                version: 1,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Activates the gate with an initial quanta pool. Fails with
    /// [`Status::InvalidState`] if already active.
    pub fn activate(&self, initial_free_quanta: u64) -> Result<(), Status> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.active {
            return Err(Status::InvalidState);
        }
        inner.active = true;
        inner.free_quanta = initial_free_quanta;
        Ok(())
    }

    /// Deactivates the gate: suspended acquires complete with
    /// [`Status::ShutdownPending`] and the version advances so stale
    /// acquire contexts cannot start against the next activation.
    pub fn deactivate(&self) {
        let drained: Vec<Arc<AcquireContext>> = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if !inner.active {
                return;
            }
            inner.active = false;
            inner.version += 1;
            inner.waiters.drain(..).collect()
        };
        tracing::debug!(waiters = drained.len(), "quota gate deactivated");
        for waiter in drained {
            waiter.core.complete(Err(Status::ShutdownPending));
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("lock poisoned").active
    }

    pub fn free_quanta(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").free_quanta
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").waiters.len()
    }

    /// Builds an acquire context for `desired_quanta`, stamped with the
    /// gate's current version.
    pub fn create_acquire_context(
        self: &Arc<Self>,
        desired_quanta: u64,
    ) -> Arc<AcquireContext> {
        let version = self.inner.lock().expect("lock poisoned").version;
        Arc::new_cyclic(|me| AcquireContext {
            core: ContextCore::new(Arc::clone(&self.runtime)),
            gate: Arc::downgrade(self),
            me: me.clone(),
            desired_quanta,
            version,
        })
    }

    /// Returns `quanta` to the pool and completes FIFO waiters whose
    /// desires now fit, stopping at the first that does not.
    pub fn release_quanta(&self, quanta: u64) {
        let granted: Vec<Arc<AcquireContext>> = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.free_quanta += quanta;
            let mut granted = Vec::new();
            while let Some(head) = inner.waiters.front() {
                if head.desired_quanta > inner.free_quanta {
                    break;
                }
                inner.free_quanta -= head.desired_quanta;
                granted.push(inner.waiters.pop_front().expect("peeked waiter"));
            }
            granted
        };
        for waiter in granted {
            waiter.core.complete(Ok(()));
        }
    }
}

/// One pending acquisition of gate quanta.
pub struct AcquireContext {
    core: ContextCore,
    gate: Weak<QuotaGate>,
    me: Weak<AcquireContext>,
    desired_quanta: u64,
    version: u32,
}

impl AcquireContext {
    pub fn desired_quanta(&self) -> u64 {
        self.desired_quanta
    }
}

impl AsyncOp for AcquireContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn on_start(&self) {
        let Some(gate) = self.gate.upgrade() else {
            self.core.complete(Err(Status::ShutdownPending));
            return;
        };
        let outcome = {
            let mut inner = gate.inner.lock().expect("lock poisoned");
            if !inner.active || inner.version != self.version {
                Some(Err(Status::ShutdownPending))
            } else if inner.waiters.is_empty() && inner.free_quanta >= self.desired_quanta {
                inner.free_quanta -= self.desired_quanta;
                Some(Ok(()))
            } else {
                let me = self.me.upgrade().expect("acquire context alive");
                inner.waiters.push_back(me);
                None
            }
        };
        if let Some(status) = outcome {
            self.core.complete(status);
        }
    }

    fn on_cancel(&self) {
        if let Some(gate) = self.gate.upgrade() {
            let mut inner = gate.inner.lock().expect("lock poisoned");
            inner
                .waiters
                .retain(|w| !std::ptr::eq(Arc::as_ptr(w), std::ptr::from_ref(self)));
        }
        self.core.complete(Err(Status::OperationCanceled));
    }
}
