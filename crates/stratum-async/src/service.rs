//! Open/close service lifecycle.
//!
//! A service is an async context with a two-phase life: `start_open` runs
//! the [`AsyncService::on_service_open`] hook and resolves through
//! `complete_open`; `start_close` runs [`AsyncService::on_service_close`]
//! and resolves through `complete_close`. Both completes are idempotent:
//! the first caller wins.
//!
//! ```text
//! NotOpened --start_open--> Opening --complete_open(ok)--> Open
//!                                  \--complete_open(err)--> Faulted
//! Open --start_close--> Closing --complete_close--> Closed
//! Opening --start_close (held)--> close deferred until the open resolves
//! ```
//!
//! A failed open is sticky: `open_status` keeps returning the failure. A
//! close requested while opening is accepted and waits; if the open then
//! fails, the close callback is invoked with the open's failure status, and
//! the open and close callbacks may race.
//!
//! # Deferred close
//!
//! With deferred-close behavior enabled, API entries are gated on service
//! activities counted in a packed word
//! `PendingActivities(30b) | IsDeferredCloseEnabled(1b) | IsClosePending(1b)`
//! updated with bounded CAS loops. `start_close` sets `IsClosePending`; the
//! close hook runs only once the last service activity is released, so
//! in-flight API calls drain before the service tears down. Debug builds
//! count CAS retries to aid stress diagnosis.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use stratum_types::{Completion, Status};

use crate::context::{AsyncOp, CompletionCallback, start_op};

#[cfg(debug_assertions)]
pub mod spin_counters {
    //! CAS retry counters for the packed deferred-close word.
    use std::sync::atomic::AtomicU64;

    pub static TRY_ACQUIRE: AtomicU64 = AtomicU64::new(0);
    pub static RELEASE: AtomicU64 = AtomicU64::new(0);
    pub static SCHEDULE_CLOSE: AtomicU64 = AtomicU64::new(0);
}

const ACTIVITY_MASK: u32 = (1 << 30) - 1;
const DEFERRED_ENABLED_BIT: u32 = 1 << 30;
const CLOSE_PENDING_BIT: u32 = 1 << 31;

/// Externally observable phases of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    NotOpened,
    Opening,
    Open,
    /// Open completed with an error; sticky until reuse.
    Faulted,
    Closing,
    Closed,
}

struct ServiceInner {
    phase: ServicePhase,
    open_completed: bool,
    close_completed: bool,
    open_status: Option<Completion>,
    open_callback: Option<CompletionCallback>,
    close_callback: Option<CompletionCallback>,
    /// Close arrived while opening; run it when the open resolves.
    close_while_opening: bool,
    svc: Option<Weak<dyn AsyncService>>,
}

/// State embedded by every async service next to its [`ContextCore`].
pub struct ServiceCore {
    inner: Mutex<ServiceInner>,
    deferred: AtomicU32,
}

impl Default for ServiceCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceCore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ServiceInner {
                phase: ServicePhase::NotOpened,
                open_completed: false,
                close_completed: false,
                open_status: None,
                open_callback: None,
                close_callback: None,
                close_while_opening: false,
                svc: None,
            }),
            deferred: AtomicU32::new(0),
        }
    }

    pub fn phase(&self) -> ServicePhase {
        self.inner.lock().expect("lock poisoned").phase
    }

    /// True between a successful open and the start of close.
    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("lock poisoned").phase == ServicePhase::Open
    }

    pub fn open_completed(&self) -> bool {
        self.inner.lock().expect("lock poisoned").open_completed
    }

    /// The sticky open status; `None` until the open resolves.
    pub fn open_status(&self) -> Option<Completion> {
        self.inner.lock().expect("lock poisoned").open_status
    }

    // ------------------------------------------------------------------
    // Deferred-close activity word
    // ------------------------------------------------------------------

    /// Enables deferred-close behavior. Must be called before activities
    /// are acquired; typically from the constructor or `on_service_open`.
    pub fn set_deferred_close_behavior(&self) {
        self.deferred
            .fetch_or(DEFERRED_ENABLED_BIT, Ordering::AcqRel);
    }

    pub fn is_deferred_close_enabled(&self) -> bool {
        self.deferred.load(Ordering::Acquire) & DEFERRED_ENABLED_BIT != 0
    }

    pub fn is_close_pending(&self) -> bool {
        self.deferred.load(Ordering::Acquire) & CLOSE_PENDING_BIT != 0
    }

    pub fn pending_service_activities(&self) -> u32 {
        self.deferred.load(Ordering::Acquire) & ACTIVITY_MASK
    }

    /// Acquires a service activity. Fails once close is pending or when
    /// deferred-close behavior is not enabled.
    pub fn try_acquire_service_activity(&self) -> bool {
        let mut current = self.deferred.load(Ordering::Acquire);
        loop {
            if current & DEFERRED_ENABLED_BIT == 0 {
                debug_assert!(false, "service activity without deferred-close behavior");
                return false;
            }
            if current & CLOSE_PENDING_BIT != 0 {
                return false;
            }
            let next = current + 1;
            assert!(next & ACTIVITY_MASK != 0, "service activity overflow");
            match self.deferred.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => {
                    #[cfg(debug_assertions)]
                    spin_counters::TRY_ACQUIRE.fetch_add(1, Ordering::Relaxed);
                    current = observed;
                }
            }
        }
    }

    /// Releases a service activity. The release that drives the count to
    /// zero while close is pending invokes the close hook.
    pub fn release_service_activity(&self) {
        let mut current = self.deferred.load(Ordering::Acquire);
        loop {
            assert!(current & ACTIVITY_MASK > 0, "service activity underflow");
            let next = current - 1;
            match self.deferred.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next & ACTIVITY_MASK == 0 && next & CLOSE_PENDING_BIT != 0 {
                        self.invoke_close_hook();
                    }
                    return;
                }
                Err(observed) => {
                    #[cfg(debug_assertions)]
                    spin_counters::RELEASE.fetch_add(1, Ordering::Relaxed);
                    current = observed;
                }
            }
        }
    }

    /// Marks close pending; runs the close hook directly when no service
    /// activities are outstanding.
    fn schedule_on_service_close(&self) {
        let mut current = self.deferred.load(Ordering::Acquire);
        loop {
            debug_assert!(
                current & CLOSE_PENDING_BIT == 0,
                "close scheduled twice on the deferred-close word"
            );
            let next = current | CLOSE_PENDING_BIT;
            match self.deferred.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next & ACTIVITY_MASK == 0 {
                        self.invoke_close_hook();
                    }
                    return;
                }
                Err(observed) => {
                    #[cfg(debug_assertions)]
                    spin_counters::SCHEDULE_CLOSE.fetch_add(1, Ordering::Relaxed);
                    current = observed;
                }
            }
        }
    }

    fn invoke_close_hook(&self) {
        let svc = self.inner.lock().expect("lock poisoned").svc.clone();
        if let Some(svc) = svc.and_then(|weak| weak.upgrade()) {
            let runtime = Arc::clone(svc.core().runtime());
            runtime.post(Box::new(move || svc.on_service_close()));
        }
    }

    fn invoke_open_hook(&self) {
        let svc = self.inner.lock().expect("lock poisoned").svc.clone();
        if let Some(svc) = svc.and_then(|weak| weak.upgrade()) {
            let runtime = Arc::clone(svc.core().runtime());
            runtime.post(Box::new(move || svc.on_service_open()));
        }
    }
}

/// An async operation with an open/close service lifecycle.
///
/// The hooks default to immediate success so a trivial service opens and
/// closes without overrides.
pub trait AsyncService: AsyncOp {
    fn service(&self) -> &ServiceCore;

    fn on_service_open(&self) {
        self.service().complete_open_internal(Ok(()));
    }

    fn on_service_close(&self) {
        self.service().complete_close_internal(Ok(()));
    }
}

/// Begins opening a service. Fails with [`Status::SharingViolation`] when
/// the service is already opening or open.
pub fn start_open<T: AsyncService>(
    svc: &Arc<T>,
    parent: Option<Arc<dyn AsyncOp>>,
    open_callback: Option<CompletionCallback>,
) -> Result<(), Status> {
    let core = svc.service();
    {
        let mut inner = core.inner.lock().expect("lock poisoned");
        if inner.phase != ServicePhase::NotOpened {
            return Err(Status::SharingViolation);
        }
        inner.phase = ServicePhase::Opening;
        inner.open_callback = open_callback;
        inner.svc = Some(Arc::downgrade(&(Arc::clone(svc) as Arc<dyn AsyncService>)));
    }

    // The service itself is an async context; its completion is the final
    // close. Failure here unwinds the phase so the open can be retried.
    if let Err(status) = start_op(svc, parent, None) {
        let mut inner = core.inner.lock().expect("lock poisoned");
        inner.phase = ServicePhase::NotOpened;
        inner.open_callback = None;
        inner.svc = None;
        return Err(status);
    }

    core.invoke_open_hook();
    Ok(())
}

/// Begins closing a service.
///
/// Accepted while opening (the close waits for the open to resolve), from
/// `Open`, and from `Faulted` (the close completes with the open failure).
pub fn start_close<T: AsyncService>(
    svc: &Arc<T>,
    close_callback: Option<CompletionCallback>,
) -> Result<(), Status> {
    let core = svc.service();
    let action = {
        let mut inner = core.inner.lock().expect("lock poisoned");
        match inner.phase {
            ServicePhase::NotOpened | ServicePhase::Closing | ServicePhase::Closed => {
                return Err(Status::InvalidState);
            }
            ServicePhase::Opening => {
                if inner.close_while_opening {
                    return Err(Status::InvalidState);
                }
                inner.close_while_opening = true;
                inner.close_callback = close_callback;
                CloseAction::Deferred
            }
            ServicePhase::Open => {
                inner.phase = ServicePhase::Closing;
                inner.close_callback = close_callback;
                CloseAction::Begin
            }
            ServicePhase::Faulted => {
                let status = inner.open_status.unwrap_or(Err(Status::InvalidState));
                inner.phase = ServicePhase::Closing;
                inner.close_callback = close_callback;
                CloseAction::FinishWith(status)
            }
        }
    };

    match action {
        CloseAction::Deferred => {}
        CloseAction::Begin => begin_close(core),
        CloseAction::FinishWith(status) => {
            // Nothing to tear down; the open never succeeded.
            core.complete_close_internal(status);
        }
    }
    Ok(())
}

enum CloseAction {
    Deferred,
    Begin,
    FinishWith(Completion),
}

fn begin_close(core: &ServiceCore) {
    if core.is_deferred_close_enabled() {
        core.schedule_on_service_close();
    } else {
        core.invoke_close_hook();
    }
}

impl ServiceCore {
    /// Resolves the open. First caller wins; later calls return `false`.
    pub(crate) fn complete_open_internal(&self, status: Completion) -> bool {
        let (open_callback, deferred_close) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.open_completed {
                return false;
            }
            inner.open_completed = true;
            inner.open_status = Some(status);
            inner.phase = if status.is_ok() {
                ServicePhase::Open
            } else {
                ServicePhase::Faulted
            };
            tracing::debug!(?status, phase = ?inner.phase, "service open resolved");
            (inner.open_callback.take(), inner.close_while_opening)
        };

        if let Some(callback) = open_callback {
            let svc = self.inner.lock().expect("lock poisoned").svc.clone();
            if let Some(svc) = svc.and_then(|weak| weak.upgrade()) {
                svc.core()
                    .runtime()
                    .post(Box::new(move || callback(status)));
            } else {
                callback(status);
            }
        }

        if deferred_close {
            let finish_with = {
                let mut inner = self.inner.lock().expect("lock poisoned");
                inner.phase = ServicePhase::Closing;
                if status.is_err() { Some(status) } else { None }
            };
            match finish_with {
                // The open failed; the held close finishes with that status.
                Some(status) => {
                    self.complete_close_internal(status);
                }
                None => begin_close(self),
            }
        }
        true
    }

    /// Resolves the close. First caller wins; later calls return `false`.
    pub(crate) fn complete_close_internal(&self, status: Completion) -> bool {
        let (close_callback, svc) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.close_completed {
                return false;
            }
            inner.close_completed = true;
            inner.phase = ServicePhase::Closed;
            tracing::debug!(?status, "service close resolved");
            (inner.close_callback.take(), inner.svc.clone())
        };

        let svc = svc.and_then(|weak| weak.upgrade());
        if let Some(callback) = close_callback {
            if let Some(svc) = &svc {
                svc.core()
                    .runtime()
                    .post(Box::new(move || callback(status)));
            } else {
                callback(status);
            }
        }

        // The close resolves the service's own async context, which is what
        // releases parents waiting on this service.
        if let Some(svc) = svc {
            svc.core().complete(status);
        }
        true
    }
}

/// Public wrappers mirroring the service API surface.
pub fn complete_open<T: AsyncService>(svc: &Arc<T>, status: Completion) -> bool {
    svc.service().complete_open_internal(status)
}

pub fn complete_close<T: AsyncService>(svc: &Arc<T>, status: Completion) -> bool {
    svc.service().complete_close_internal(status)
}

/// RAII gate for API entry on a deferred-close service.
///
/// `enter` fails with [`Status::ObjectClosed`] once close is pending; a
/// successful gate releases its activity on every exit path.
pub struct ServiceActivityGuard<'a> {
    core: &'a ServiceCore,
}

impl<'a> ServiceActivityGuard<'a> {
    pub fn enter(core: &'a ServiceCore) -> Result<Self, Status> {
        if core.try_acquire_service_activity() {
            Ok(Self { core })
        } else {
            Err(Status::ObjectClosed)
        }
    }
}

impl Drop for ServiceActivityGuard<'_> {
    fn drop(&mut self) {
        self.core.release_service_activity();
    }
}
