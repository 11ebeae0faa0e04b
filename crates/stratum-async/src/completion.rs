//! Awaitable completion source.
//!
//! A set-once result cell with both callback subscription (the async path)
//! and blocking waits (tests and shutdown drains). The first setter wins;
//! later setters report `false`.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use stratum_types::Status;

type Subscriber<T> = Box<dyn FnOnce(&Result<T, Status>) + Send + 'static>;

struct CompletionInner<T> {
    result: Option<Result<T, Status>>,
    subscribers: Vec<Subscriber<T>>,
}

/// One-shot result cell.
pub struct CompletionSource<T> {
    inner: Mutex<CompletionInner<T>>,
    signal: Condvar,
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CompletionInner {
                result: None,
                subscribers: Vec::new(),
            }),
            signal: Condvar::new(),
        }
    }

    /// Completes with a value. First setter wins.
    pub fn set_result(&self, value: T) -> bool {
        self.set(Ok(value))
    }

    /// Completes with an error. First setter wins.
    pub fn set_error(&self, status: Status) -> bool {
        self.set(Err(status))
    }

    /// Completes with [`Status::OperationCanceled`].
    pub fn set_cancelled(&self) -> bool {
        self.set(Err(Status::OperationCanceled))
    }

    fn set(&self, result: Result<T, Status>) -> bool {
        let subscribers = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result);
            self.signal.notify_all();
            std::mem::take(&mut inner.subscribers)
        };
        if !subscribers.is_empty() {
            let inner = self.inner.lock().expect("lock poisoned");
            let result = inner.result.as_ref().expect("result just set");
            for subscriber in subscribers {
                subscriber(result);
            }
        }
        true
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().expect("lock poisoned").result.is_some()
    }

    /// Runs `subscriber` when the result is set; immediately if it already
    /// is.
    pub fn subscribe(&self, subscriber: impl FnOnce(&Result<T, Status>) + Send + 'static) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(result) = &inner.result {
            subscriber(result);
        } else {
            inner.subscribers.push(Box::new(subscriber));
        }
    }
}

impl<T: Clone> CompletionSource<T> {
    /// Blocks until the result is set.
    pub fn wait(&self) -> Result<T, Status> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        while inner.result.is_none() {
            inner = self.signal.wait(inner).expect("lock poisoned");
        }
        inner.result.clone().expect("checked above")
    }

    /// Blocks until the result is set or `timeout` elapses, in which case
    /// the wait itself reports [`Status::Timeout`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, Status> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("lock poisoned");
        while inner.result.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Status::Timeout);
            }
            let (next, _) = self
                .signal
                .wait_timeout(inner, deadline - now)
                .expect("lock poisoned");
            inner = next;
        }
        inner.result.clone().expect("checked above")
    }
}
