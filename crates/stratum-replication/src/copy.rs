//! Copy engine: builds a new replica from the state provider's enumeration.
//!
//! The primary pulls copy-state items one at a time, stamps them with copy
//! sequence numbers starting at 1, and offers them to the target session's
//! copy sender. The sender's window is the backpressure: the pump only
//! refills while the pending count sits below it, and resumes on each copy
//! acknowledgement. A terminating end-of-stream operation always follows
//! the last item.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use stratum_async::CompletionSource;
use stratum_types::{Lsn, Operation, OperationMetadata, Status};

use crate::session::ReplicationSession;

/// Pull-based stream of operation payloads ("pull an optional item, with
/// errors explicit").
pub trait OperationDataStream: Send {
    /// The next payload, `Ok(None)` at end of enumeration.
    fn next(&mut self) -> crate::Result<Option<Vec<Bytes>>>;
}

struct PumpInner {
    stream: Option<Box<dyn OperationDataStream>>,
    next_lsn: i64,
    end_of_stream_lsn: Option<Lsn>,
    cancelled: bool,
    failed: bool,
}

/// One in-flight replica build.
pub struct CopyPump {
    session: Arc<ReplicationSession>,
    inner: Mutex<PumpInner>,
    completion: Arc<CompletionSource<Lsn>>,
    me: Weak<Self>,
}

impl CopyPump {
    pub fn new(session: Arc<ReplicationSession>, stream: Box<dyn OperationDataStream>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            session,
            inner: Mutex::new(PumpInner {
                stream: Some(stream),
                next_lsn: 1,
                end_of_stream_lsn: None,
                cancelled: false,
                failed: false,
            }),
            completion: Arc::new(CompletionSource::new()),
            me: me.clone(),
        })
    }

    /// Resolves with the end-of-stream LSN once the target acknowledged
    /// the whole copy, or with the failure/cancel status.
    pub fn completion(&self) -> &Arc<CompletionSource<Lsn>> {
        &self.completion
    }

    pub fn session(&self) -> &Arc<ReplicationSession> {
        &self.session
    }

    /// Fills the copy sender up to its send window. Called at build start
    /// and again from every copy acknowledgement.
    pub fn pump(&self) {
        loop {
            let window = self.session.copy_sender().send_window() as usize;
            let op = {
                let mut inner = self.inner.lock().expect("lock poisoned");
                if inner.cancelled || inner.failed || inner.end_of_stream_lsn.is_some() {
                    break;
                }
                if self.session.copy_sender().pending_count() >= window {
                    break;
                }
                let Some(stream) = inner.stream.as_mut() else {
                    break;
                };
                match stream.next() {
                    Ok(Some(buffers)) => {
                        let lsn = Lsn::new(inner.next_lsn);
                        inner.next_lsn += 1;
                        Operation::new(
                            OperationMetadata {
                                kind: stratum_types::OperationKind::Normal,
                                lsn,
                                epoch: None,
                            },
                            buffers,
                        )
                    }
                    Ok(None) => {
                        let lsn = Lsn::new(inner.next_lsn);
                        inner.next_lsn += 1;
                        inner.end_of_stream_lsn = Some(lsn);
                        inner.stream = None;
                        Operation::end_of_stream(lsn)
                    }
                    Err(status) => {
                        inner.failed = true;
                        inner.stream = None;
                        drop(inner);
                        tracing::warn!(
                            replica = %self.session.replica_id(),
                            %status,
                            "copy enumeration failed"
                        );
                        self.completion.set_error(status);
                        return;
                    }
                }
            };
            self.session.add_copy_operation(op);
        }
        self.check_done();
    }

    /// Reacts to copy acknowledgement progress on the session.
    pub fn on_copy_ack(&self) {
        self.pump();
    }

    /// Cancels the build: outstanding sends are released and the
    /// completion fires with [`Status::OperationCanceled`].
    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.stream = None;
        }
        self.session.copy_sender().close();
        self.completion.set_error(Status::OperationCanceled);
        tracing::debug!(replica = %self.session.replica_id(), "copy cancelled");
    }

    fn check_done(&self) {
        let end = {
            let inner = self.inner.lock().expect("lock poisoned");
            if inner.cancelled || inner.failed {
                return;
            }
            inner.end_of_stream_lsn
        };
        let Some(end) = end else { return };
        let (copy_received, _) = self.session.copy_progress();
        if copy_received >= end && self.session.copy_sender().pending_count() == 0 {
            self.session.establish_progress();
            self.completion.set_result(end);
        }
    }

    /// Keeps the pump alive in closures without a strong cycle.
    pub fn weak(&self) -> Weak<Self> {
        self.me.clone()
    }
}

/// Buffers the copy-context operations a persisted target pushes to the
/// primary before its copy starts.
///
/// The primary acknowledges each context operation and, once the context's
/// end-of-stream arrives, replays the buffered payloads to the state
/// provider as an [`OperationDataStream`].
pub struct CopyContextReceiver {
    inner: Mutex<ContextInner>,
}

struct ContextInner {
    payloads: Vec<Vec<Bytes>>,
    next_lsn: i64,
    finished: bool,
}

impl Default for CopyContextReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyContextReceiver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                payloads: Vec::new(),
                next_lsn: 1,
                finished: false,
            }),
        }
    }

    /// Accepts one context operation; returns the LSN to acknowledge, or
    /// `None` for an out-of-order or duplicate arrival the caller should
    /// ignore.
    pub fn accept(&self, op: &Operation) -> Option<Lsn> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.finished || op.lsn().get() != inner.next_lsn {
            return None;
        }
        inner.next_lsn += 1;
        if op.is_end_of_stream() {
            inner.finished = true;
        } else {
            inner.payloads.push(op.buffers.clone());
        }
        Some(op.lsn())
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().expect("lock poisoned").finished
    }

    /// The buffered payloads as a pull stream. Call after
    /// [`CopyContextReceiver::is_finished`].
    pub fn into_stream(&self) -> Box<dyn OperationDataStream> {
        let payloads = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            std::mem::take(&mut inner.payloads)
        };
        Box::new(BufferedStream {
            items: payloads.into_iter(),
        })
    }
}

struct BufferedStream {
    items: std::vec::IntoIter<Vec<Bytes>>,
}

impl OperationDataStream for BufferedStream {
    fn next(&mut self) -> crate::Result<Option<Vec<Bytes>>> {
        Ok(self.items.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_types::{Epoch, OperationKind};

    #[test]
    fn context_receiver_orders_and_finishes() {
        let receiver = CopyContextReceiver::new();
        let op1 = Operation::new(
            OperationMetadata {
                kind: OperationKind::Normal,
                lsn: Lsn::new(1),
                epoch: None,
            },
            vec![Bytes::from_static(b"ctx-1")],
        );
        let op3 = Operation::new(
            OperationMetadata {
                kind: OperationKind::Normal,
                lsn: Lsn::new(3),
                epoch: None,
            },
            vec![Bytes::from_static(b"ctx-3")],
        );

        assert_eq!(receiver.accept(&op1), Some(Lsn::new(1)));
        // Out of order: ignored until 2 arrives.
        assert_eq!(receiver.accept(&op3), None);

        let op2 = Operation::new(
            OperationMetadata {
                kind: OperationKind::Normal,
                lsn: Lsn::new(2),
                epoch: None,
            },
            vec![Bytes::from_static(b"ctx-2")],
        );
        assert_eq!(receiver.accept(&op2), Some(Lsn::new(2)));
        assert_eq!(receiver.accept(&op3), Some(Lsn::new(3)));

        let end = Operation::end_of_stream(Lsn::new(4));
        assert_eq!(receiver.accept(&end), Some(Lsn::new(4)));
        assert!(receiver.is_finished());
        // Duplicate after finish is ignored.
        assert_eq!(receiver.accept(&end), None);

        let mut stream = receiver.into_stream();
        assert_eq!(
            stream.next().unwrap().unwrap(),
            vec![Bytes::from_static(b"ctx-1")]
        );
        assert_eq!(
            stream.next().unwrap().unwrap(),
            vec![Bytes::from_static(b"ctx-2")]
        );
        assert_eq!(
            stream.next().unwrap().unwrap(),
            vec![Bytes::from_static(b"ctx-3")]
        );
        assert!(stream.next().unwrap().is_none());
    }

    #[test]
    fn epoch_free_metadata_for_copy_items() {
        let op = Operation::new(
            OperationMetadata {
                kind: OperationKind::Normal,
                lsn: Lsn::new(1),
                epoch: None,
            },
            vec![],
        );
        assert_eq!(op.metadata.epoch, None);
        assert_ne!(
            op.metadata.epoch,
            Some(Epoch::ZERO),
            "copy items exist outside primary generations"
        );
    }
}
