//! Ordered operation streams.
//!
//! The secondary dispatches committed operations to its service consumer
//! through a stream per source (copy, replication). `get_operation`
//! returns a completion source resolving to the next operation in LSN
//! order, or `None` once the stream terminates. The consumer must
//! acknowledge every non-`None` operation through the owning replicator.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use stratum_async::CompletionSource;
use stratum_types::Operation;

type OperationWait = Arc<CompletionSource<Option<Arc<Operation>>>>;

struct StreamInner {
    ready: VecDeque<Arc<Operation>>,
    waiters: VecDeque<OperationWait>,
    finished: bool,
}

/// FIFO hand-off of committed operations to the service consumer.
pub struct OperationStream {
    name: String,
    inner: Mutex<StreamInner>,
}

impl OperationStream {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(StreamInner {
                ready: VecDeque::new(),
                waiters: VecDeque::new(),
                finished: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves with the next operation, or `None` at end of stream.
    pub fn get_operation(&self) -> OperationWait {
        let wait = Arc::new(CompletionSource::new());
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(op) = inner.ready.pop_front() {
            wait.set_result(Some(op));
        } else if inner.finished {
            wait.set_result(None);
        } else {
            inner.waiters.push_back(Arc::clone(&wait));
        }
        wait
    }

    /// Hands one committed operation to the consumer side.
    pub fn push(&self, op: Arc<Operation>) {
        let waiter = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.finished {
                tracing::debug!(stream = %self.name, lsn = %op.lsn(), "dropping push to finished stream");
                return;
            }
            match inner.waiters.pop_front() {
                Some(waiter) => Some((waiter, op)),
                None => {
                    inner.ready.push_back(op);
                    None
                }
            }
        };
        if let Some((waiter, op)) = waiter {
            waiter.set_result(Some(op));
        }
    }

    /// Terminates the stream: queued operations still drain, then every
    /// `get_operation` resolves `None`. Outstanding waiters resolve with
    /// the sentinel immediately.
    pub fn finish(&self) {
        let waiters: Vec<OperationWait> = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.waiters.drain(..).collect()
        };
        for waiter in waiters {
            waiter.set_result(None);
        }
    }

    /// Terminates and drops anything not yet consumed (the abort path of
    /// a close).
    pub fn abort(&self) {
        let waiters: Vec<OperationWait> = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.finished = true;
            inner.ready.clear();
            inner.waiters.drain(..).collect()
        };
        for waiter in waiters {
            waiter.set_result(None);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().expect("lock poisoned").finished
    }

    pub fn ready_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").ready.len()
    }
}
