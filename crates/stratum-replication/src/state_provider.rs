//! State-provider contract.
//!
//! The replicator treats the service's durable state as an external
//! collaborator reached through this trait: the service reports its local
//! progress, applies epoch changes, and enumerates copy state for builds.

use stratum_types::{Completion, Epoch, Lsn};

use crate::copy::OperationDataStream;

/// The service-side callbacks the replicator depends on.
pub trait StateProvider: Send + Sync {
    /// Highest sequence number the service has locally committed.
    fn get_last_committed_sequence_number(&self) -> Lsn;

    /// Applies an epoch change to the service's progress vector.
    fn update_epoch(&self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> Completion;

    /// Invoked when quorum is lost; returns whether service state changed.
    fn on_data_loss(&self) -> crate::Result<bool>;

    /// The copy context this replica would send when being built, or
    /// `None` for a volatile service.
    fn get_copy_context(&self) -> Option<Box<dyn OperationDataStream>>;

    /// Enumerates copy state up to `upto`, optionally consuming the
    /// target's copy context.
    fn get_copy_state(
        &self,
        upto: Lsn,
        copy_context: Option<Box<dyn OperationDataStream>>,
    ) -> Box<dyn OperationDataStream>;
}

#[cfg(test)]
pub mod testing {
    //! Deterministic provider used across the crate's tests.

    use std::sync::Mutex;

    use super::{OperationDataStream, StateProvider};
    use bytes::Bytes;
    use stratum_types::{Completion, Epoch, Lsn, ProgressVector, Status};

    pub struct TestStateProvider {
        last_committed: Mutex<Lsn>,
        progress: Mutex<ProgressVector>,
        copy_item_count: usize,
        persisted: bool,
        fail_update_epoch: Mutex<Option<Status>>,
    }

    impl TestStateProvider {
        pub fn new(copy_item_count: usize, persisted: bool) -> Self {
            let mut progress = ProgressVector::new();
            progress.append(Epoch::ZERO, Lsn::INVALID);
            Self {
                last_committed: Mutex::new(Lsn::ZERO),
                progress: Mutex::new(progress),
                copy_item_count,
                persisted,
                fail_update_epoch: Mutex::new(None),
            }
        }

        pub fn set_last_committed(&self, lsn: Lsn) {
            *self.last_committed.lock().expect("lock poisoned") = lsn;
        }

        pub fn fail_next_update_epoch(&self, status: Status) {
            *self.fail_update_epoch.lock().expect("lock poisoned") = Some(status);
        }

        /// `"dataloss.config:lsn;"` per entry, the diagnostic form.
        pub fn progress_vector_string(&self) -> String {
            self.progress
                .lock()
                .expect("lock poisoned")
                .to_compact_string()
        }

    }

    impl StateProvider for TestStateProvider {
        fn get_last_committed_sequence_number(&self) -> Lsn {
            *self.last_committed.lock().expect("lock poisoned")
        }

        fn update_epoch(&self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> Completion {
            if let Some(status) = self.fail_update_epoch.lock().expect("lock poisoned").take() {
                return Err(status);
            }
            let mut progress = self.progress.lock().expect("lock poisoned");
            if progress.advance_epoch(epoch, previous_epoch_last_lsn) {
                Ok(())
            } else {
                Err(Status::InvalidEpoch)
            }
        }

        fn on_data_loss(&self) -> crate::Result<bool> {
            Ok(false)
        }

        fn get_copy_context(&self) -> Option<Box<dyn OperationDataStream>> {
            if self.persisted {
                Some(Box::new(CountedStream {
                    remaining: 2,
                    tag: "context",
                }))
            } else {
                None
            }
        }

        fn get_copy_state(
            &self,
            _upto: Lsn,
            mut copy_context: Option<Box<dyn OperationDataStream>>,
        ) -> Box<dyn OperationDataStream> {
            // A persisted target's context is drained before state is
            // produced; the test provider just consumes it.
            if let Some(context) = copy_context.as_mut() {
                while let Ok(Some(_)) = context.next() {}
            }
            Box::new(CountedStream {
                remaining: self.copy_item_count,
                tag: "state",
            })
        }
    }

    struct CountedStream {
        remaining: usize,
        tag: &'static str,
    }

    impl OperationDataStream for CountedStream {
        fn next(&mut self) -> crate::Result<Option<Vec<Bytes>>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(vec![Bytes::from(format!(
                "{}-{}",
                self.tag, self.remaining
            ))]))
        }
    }
}
