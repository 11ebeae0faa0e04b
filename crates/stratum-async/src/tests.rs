//! Integration tests for the async kernel: lifecycle ordering, service
//! open/close, deferred close draining, event and gate wakeups.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum_types::Status;

use crate::completion::CompletionSource;
use crate::context::{
    ActivityGuard, AsyncOp, ContextCore, ContextState, cancel_op, reuse_op, start_op,
};
use crate::event::AsyncEvent;
use crate::gate::QuotaGate;
use crate::runtime::AsyncRuntime;
use crate::service::{
    AsyncService, ServiceActivityGuard, ServiceCore, ServicePhase, complete_close, complete_open,
    start_close, start_open,
};

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

/// Minimal op: completes when told to.
struct NoopOp {
    core: ContextCore,
}

impl NoopOp {
    fn new(runtime: &Arc<AsyncRuntime>) -> Arc<Self> {
        Arc::new(Self {
            core: ContextCore::new(Arc::clone(runtime)),
        })
    }
}

impl AsyncOp for NoopOp {
    fn core(&self) -> &ContextCore {
        &self.core
    }
}

fn completion_probe() -> (
    Arc<CompletionSource<Result<(), Status>>>,
    crate::context::CompletionCallback,
) {
    let source = Arc::new(CompletionSource::new());
    let relay = Arc::clone(&source);
    let callback: crate::context::CompletionCallback = Box::new(move |status| {
        relay.set_result(status);
    });
    (source, callback)
}

// ============================================================================
// Context lifecycle
// ============================================================================

#[test]
fn start_complete_reuse_cycle() {
    let runtime = AsyncRuntime::for_tests();
    let op = NoopOp::new(&runtime);

    let (probe, callback) = completion_probe();
    start_op(&op, None, Some(callback)).unwrap();
    assert_eq!(op.core().state(), ContextState::Operating);

    // Double start is rejected while operating.
    assert_eq!(start_op(&op, None, None), Err(Status::InvalidState));

    assert!(op.core().complete(Ok(())));
    assert!(!op.core().complete(Err(Status::Timeout)), "first complete wins");

    assert_eq!(probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert!(runtime.wait_idle(WAIT));
    assert_eq!(op.core().state(), ContextState::Completed);
    assert_eq!(op.core().status(), Ok(()));

    reuse_op(&op).unwrap();
    assert_eq!(op.core().state(), ContextState::Initialized);
    start_op(&op, None, None).unwrap();
    op.core().complete(Ok(()));
}

#[test]
fn extra_activities_defer_completion() {
    let runtime = AsyncRuntime::for_tests();
    let op = NoopOp::new(&runtime);

    let (probe, callback) = completion_probe();
    start_op(&op, None, Some(callback)).unwrap();

    let dyn_op: Arc<NoopOp> = Arc::clone(&op);
    let guard = ActivityGuard::acquire(&dyn_op).expect("operating context");

    assert!(op.core().complete(Ok(())));
    // Completion is held by the outstanding activity.
    assert!(!probe.is_completed());
    assert_eq!(op.core().state(), ContextState::Operating);

    drop(guard);
    assert_eq!(probe.wait_timeout(WAIT).unwrap(), Ok(()));
}

#[test]
fn try_acquire_fails_after_completion_decided() {
    let runtime = AsyncRuntime::for_tests();
    let op = NoopOp::new(&runtime);
    start_op(&op, None, None).unwrap();
    op.core().complete(Ok(()));
    assert!(runtime.wait_idle(WAIT));
    assert!(!op.core().try_acquire_activities(1));
}

#[test]
fn parent_completes_after_child_callback() {
    let runtime = AsyncRuntime::for_tests();
    let parent = NoopOp::new(&runtime);
    let child = NoopOp::new(&runtime);

    let order = Arc::new(Mutex::new(Vec::new()));

    let (parent_probe, parent_cb) = {
        let order = Arc::clone(&order);
        let source = Arc::new(CompletionSource::<()>::new());
        let relay = Arc::clone(&source);
        let cb: crate::context::CompletionCallback = Box::new(move |_| {
            order.lock().expect("lock poisoned").push("parent");
            relay.set_result(());
        });
        (source, cb)
    };
    let child_cb: crate::context::CompletionCallback = {
        let order = Arc::clone(&order);
        Box::new(move |_| {
            order.lock().expect("lock poisoned").push("child");
        })
    };

    start_op(&parent, None, Some(parent_cb)).unwrap();
    start_op(
        &child,
        Some(Arc::clone(&parent) as Arc<dyn AsyncOp>),
        Some(child_cb),
    )
    .unwrap();

    // Parent's own completion is decided, but it must wait for the child.
    parent.core().complete(Ok(()));
    assert!(!parent_probe.is_completed());

    child.core().complete(Ok(()));
    parent_probe.wait_timeout(WAIT).unwrap();
    assert!(runtime.wait_idle(WAIT));

    let order = order.lock().expect("lock poisoned");
    assert_eq!(*order, vec!["child", "parent"]);
}

#[test]
fn cancel_is_idempotent_and_propagates_to_children() {
    struct CancelTracker {
        core: ContextCore,
        cancels: AtomicUsize,
    }
    impl AsyncOp for CancelTracker {
        fn core(&self) -> &ContextCore {
            &self.core
        }
        fn on_cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.core.complete(Err(Status::OperationCanceled));
        }
    }

    let runtime = AsyncRuntime::for_tests();
    let parent = Arc::new(CancelTracker {
        core: ContextCore::new(Arc::clone(&runtime)),
        cancels: AtomicUsize::new(0),
    });
    let child = Arc::new(CancelTracker {
        core: ContextCore::new(Arc::clone(&runtime)),
        cancels: AtomicUsize::new(0),
    });

    start_op(&parent, None, None).unwrap();
    start_op(&child, Some(Arc::clone(&parent) as Arc<dyn AsyncOp>), None).unwrap();

    assert!(cancel_op(&parent));
    assert!(runtime.wait_idle(WAIT));

    assert_eq!(parent.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(child.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(parent.core().status(), Err(Status::OperationCanceled));
    assert_eq!(child.core().status(), Err(Status::OperationCanceled));

    // Completed contexts refuse further cancels.
    assert!(!cancel_op(&parent));
}

// ============================================================================
// Service lifecycle
// ============================================================================

struct TestService {
    core: ContextCore,
    svc: ServiceCore,
    auto_open: bool,
    closed: AtomicBool,
}

impl TestService {
    fn new(runtime: &Arc<AsyncRuntime>, auto_open: bool) -> Arc<Self> {
        Arc::new(Self {
            core: ContextCore::new(Arc::clone(runtime)),
            svc: ServiceCore::new(),
            auto_open,
            closed: AtomicBool::new(false),
        })
    }
}

impl AsyncOp for TestService {
    fn core(&self) -> &ContextCore {
        &self.core
    }
}

impl AsyncService for TestService {
    fn service(&self) -> &ServiceCore {
        &self.svc
    }

    fn on_service_open(&self) {
        if self.auto_open {
            self.svc.complete_open_internal(Ok(()));
        }
    }

    fn on_service_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.svc.complete_close_internal(Ok(()));
    }
}

#[test]
fn open_then_close() {
    let runtime = AsyncRuntime::for_tests();
    let svc = TestService::new(&runtime, true);

    let (open_probe, open_cb) = completion_probe();
    start_open(&svc, None, Some(open_cb)).unwrap();
    assert_eq!(open_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert!(svc.service().is_open());
    assert_eq!(svc.service().open_status(), Some(Ok(())));

    // Second open is a sharing violation.
    assert_eq!(
        start_open(&svc, None, None),
        Err(Status::SharingViolation)
    );

    let (close_probe, close_cb) = completion_probe();
    start_close(&svc, Some(close_cb)).unwrap();
    assert_eq!(close_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert!(runtime.wait_idle(WAIT));
    assert_eq!(svc.service().phase(), ServicePhase::Closed);
    assert!(svc.closed.load(Ordering::SeqCst));
    assert_eq!(svc.core().state(), ContextState::Completed);
}

#[test]
fn failed_open_is_sticky_and_close_reports_it() {
    let runtime = AsyncRuntime::for_tests();
    let svc = TestService::new(&runtime, false);

    let (open_probe, open_cb) = completion_probe();
    start_open(&svc, None, Some(open_cb)).unwrap();
    complete_open(&svc, Err(Status::InsufficientResources));

    assert_eq!(
        open_probe.wait_timeout(WAIT).unwrap(),
        Err(Status::InsufficientResources)
    );
    assert_eq!(svc.service().phase(), ServicePhase::Faulted);
    assert_eq!(
        svc.service().open_status(),
        Some(Err(Status::InsufficientResources))
    );

    // Close after a failed open carries the open's failure.
    let (close_probe, close_cb) = completion_probe();
    start_close(&svc, Some(close_cb)).unwrap();
    assert_eq!(
        close_probe.wait_timeout(WAIT).unwrap(),
        Err(Status::InsufficientResources)
    );
    // The close hook never ran; there was nothing to tear down.
    assert!(!svc.closed.load(Ordering::SeqCst));
}

#[test]
fn close_during_opening_waits_for_open() {
    let runtime = AsyncRuntime::for_tests();
    let svc = TestService::new(&runtime, false);

    start_open(&svc, None, None).unwrap();
    let (close_probe, close_cb) = completion_probe();
    start_close(&svc, Some(close_cb)).unwrap();
    assert!(!close_probe.is_completed());

    complete_open(&svc, Ok(()));
    assert_eq!(close_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert!(svc.closed.load(Ordering::SeqCst));
}

#[test]
fn complete_open_and_close_are_idempotent() {
    let runtime = AsyncRuntime::for_tests();
    let svc = TestService::new(&runtime, false);

    start_open(&svc, None, None).unwrap();
    assert!(complete_open(&svc, Ok(())));
    assert!(!complete_open(&svc, Err(Status::Timeout)));
    assert_eq!(svc.service().open_status(), Some(Ok(())));

    start_close(&svc, None).unwrap();
    assert!(runtime.wait_idle(WAIT));
    assert!(!complete_close(&svc, Err(Status::Timeout)));
}

#[test]
fn deferred_close_waits_for_service_activities() {
    let runtime = AsyncRuntime::for_tests();
    let svc = TestService::new(&runtime, true);
    svc.service().set_deferred_close_behavior();

    start_open(&svc, None, None).unwrap();
    assert!(runtime.wait_idle(WAIT));
    assert!(svc.service().is_open());

    let gate = ServiceActivityGuard::enter(svc.service()).expect("service open");

    let (close_probe, close_cb) = completion_probe();
    start_close(&svc, Some(close_cb)).unwrap();
    assert!(runtime.wait_idle(WAIT));
    // Close pending, but held by the in-flight API entry.
    assert!(svc.service().is_close_pending());
    assert!(!svc.closed.load(Ordering::SeqCst));

    // New entries are refused while close is pending.
    assert!(matches!(
        ServiceActivityGuard::enter(svc.service()),
        Err(Status::ObjectClosed)
    ));

    drop(gate);
    assert_eq!(close_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert!(svc.closed.load(Ordering::SeqCst));
}

// ============================================================================
// Events
// ============================================================================

#[test]
fn manual_reset_event_releases_all_waiters() {
    let runtime = AsyncRuntime::for_tests();
    let event = AsyncEvent::new(true, false);

    let completed = Arc::new(AtomicUsize::new(0));
    let mut waits = Vec::new();
    for _ in 0..3 {
        let wait = event.create_wait_context(Arc::clone(&runtime));
        let completed = Arc::clone(&completed);
        start_op(
            &wait,
            None,
            Some(Box::new(move |status| {
                assert_eq!(status, Ok(()));
                completed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        waits.push(wait);
    }
    assert_eq!(event.waiter_count(), 3);

    event.set_event();
    assert!(runtime.wait_idle(WAIT));
    assert_eq!(completed.load(Ordering::SeqCst), 3);

    // Still signaled: a late waiter completes synchronously.
    let wait = event.create_wait_context(Arc::clone(&runtime));
    let completed2 = Arc::clone(&completed);
    start_op(
        &wait,
        None,
        Some(Box::new(move |_| {
            completed2.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert!(runtime.wait_idle(WAIT));
    assert_eq!(completed.load(Ordering::SeqCst), 4);
}

#[test]
fn auto_reset_event_releases_one_waiter() {
    let runtime = AsyncRuntime::for_tests();
    let event = AsyncEvent::new(false, false);

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let wait = event.create_wait_context(Arc::clone(&runtime));
        let completed = Arc::clone(&completed);
        start_op(
            &wait,
            None,
            Some(Box::new(move |_| {
                completed.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }

    event.set_event();
    assert!(runtime.wait_idle(WAIT));
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(event.waiter_count(), 1);
    assert!(!event.is_signaled(), "signal consumed by the waiter");

    event.set_event();
    assert!(runtime.wait_idle(WAIT));
    assert_eq!(completed.load(Ordering::SeqCst), 2);
}

#[test]
fn cancelled_wait_leaves_the_list() {
    let runtime = AsyncRuntime::for_tests();
    let event = AsyncEvent::new(true, false);

    let wait = event.create_wait_context(Arc::clone(&runtime));
    let (probe, callback) = completion_probe();
    start_op(&wait, None, Some(callback)).unwrap();
    assert_eq!(event.waiter_count(), 1);

    assert!(cancel_op(&wait));
    assert_eq!(
        probe.wait_timeout(WAIT).unwrap(),
        Err(Status::OperationCanceled)
    );
    assert_eq!(event.waiter_count(), 0);
}

// ============================================================================
// Quota gate
// ============================================================================

#[test]
fn gate_grants_in_fifo_order() {
    let runtime = AsyncRuntime::for_tests();
    let gate = QuotaGate::new(Arc::clone(&runtime));
    gate.activate(10).unwrap();

    // Fits immediately.
    let first = gate.create_acquire_context(8);
    let (first_probe, first_cb) = completion_probe();
    start_op(&first, None, Some(first_cb)).unwrap();
    assert_eq!(first_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert_eq!(gate.free_quanta(), 2);

    // Head waiter wants 6; a later small request must wait behind it.
    let big = gate.create_acquire_context(6);
    let (big_probe, big_cb) = completion_probe();
    start_op(&big, None, Some(big_cb)).unwrap();

    let small = gate.create_acquire_context(1);
    let (small_probe, small_cb) = completion_probe();
    start_op(&small, None, Some(small_cb)).unwrap();

    assert_eq!(gate.waiter_count(), 2);
    assert!(!big_probe.is_completed());
    assert!(!small_probe.is_completed());

    // 2 free + 3 released = 5: still short of the head's 6, nothing moves.
    gate.release_quanta(3);
    assert!(!big_probe.is_completed());
    assert_eq!(gate.waiter_count(), 2);

    // 5 + 2 = 7: head takes 6, then the small waiter takes 1.
    gate.release_quanta(2);
    assert_eq!(big_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert_eq!(small_probe.wait_timeout(WAIT).unwrap(), Ok(()));
    assert_eq!(gate.free_quanta(), 0);
    assert_eq!(gate.waiter_count(), 0);
}

#[test]
fn deactivate_fails_waiters_with_shutdown_pending() {
    let runtime = AsyncRuntime::for_tests();
    let gate = QuotaGate::new(Arc::clone(&runtime));
    gate.activate(0).unwrap();

    let acquire = gate.create_acquire_context(5);
    let (probe, callback) = completion_probe();
    start_op(&acquire, None, Some(callback)).unwrap();

    // A context stamped before deactivation must not start afterwards.
    let stale = gate.create_acquire_context(1);

    gate.deactivate();
    assert_eq!(
        probe.wait_timeout(WAIT).unwrap(),
        Err(Status::ShutdownPending)
    );

    gate.activate(100).unwrap();
    let (stale_probe, stale_cb) = completion_probe();
    start_op(&stale, None, Some(stale_cb)).unwrap();
    assert_eq!(
        stale_probe.wait_timeout(WAIT).unwrap(),
        Err(Status::ShutdownPending)
    );

    // Double activation is invalid.
    assert_eq!(gate.activate(1), Err(Status::InvalidState));
}
