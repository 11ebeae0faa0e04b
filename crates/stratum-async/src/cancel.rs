//! Cancellation tokens.
//!
//! A [`CancellationTokenSource`] owns shared cancel state; tokens observe
//! it. `cancel(status)` fails every token with that status; the first
//! cancel wins, later calls are no-ops.

use std::sync::{Arc, Mutex};

use stratum_types::Status;

type CancelCallback = Box<dyn FnOnce(Status) + Send + 'static>;

struct CancelInner {
    cancelled: Option<Status>,
    callbacks: Vec<CancelCallback>,
}

/// Shared cancellation state.
pub struct CancellationTokenSource {
    inner: Mutex<CancelInner>,
}

impl CancellationTokenSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(CancelInner {
                cancelled: None,
                callbacks: Vec::new(),
            }),
        })
    }

    /// Cancels all tokens with `status`. Returns `false` if already
    /// cancelled.
    pub fn cancel(&self, status: Status) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.cancelled.is_some() {
                return false;
            }
            inner.cancelled = Some(status);
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(status);
        }
        true
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.lock().expect("lock poisoned").cancelled.is_some()
    }

    pub fn token(self: &Arc<Self>) -> CancellationToken {
        CancellationToken {
            source: Arc::clone(self),
        }
    }
}

/// Observer half of a [`CancellationTokenSource`].
#[derive(Clone)]
pub struct CancellationToken {
    source: Arc<CancellationTokenSource>,
}

impl CancellationToken {
    /// `Err(status)` once the source has been cancelled.
    pub fn check(&self) -> Result<(), Status> {
        match self.source.inner.lock().expect("lock poisoned").cancelled {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.source.is_cancellation_requested()
    }

    /// Registers a callback that fires exactly once when the source is
    /// cancelled; fires immediately (on the caller's thread) if it already
    /// was.
    pub fn register(&self, callback: impl FnOnce(Status) + Send + 'static) {
        let immediate = {
            let mut inner = self.source.inner.lock().expect("lock poisoned");
            match inner.cancelled {
                Some(status) => Some(status),
                None => {
                    inner.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(status) = immediate {
            callback(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_cancel_wins_and_tokens_observe_it() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        assert_eq!(token.check(), Ok(()));

        assert!(source.cancel(Status::ShutdownPending));
        assert!(!source.cancel(Status::Timeout), "second cancel loses");

        assert_eq!(token.check(), Err(Status::ShutdownPending));
        assert!(token.is_cancellation_requested());
        // A token minted after cancellation sees the same status.
        assert_eq!(source.token().check(), Err(Status::ShutdownPending));
    }

    #[test]
    fn callbacks_fire_exactly_once() {
        let source = CancellationTokenSource::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        source.token().register(move |status| {
            assert_eq!(status, Status::OperationCanceled);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel(Status::OperationCanceled);
        source.cancel(Status::OperationCanceled);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Late registration fires immediately with the original status.
        let counter = Arc::clone(&fired);
        source.token().register(move |status| {
            assert_eq!(status, Status::OperationCanceled);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
