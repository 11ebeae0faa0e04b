//! # stratum-replication: the replication engine
//!
//! A primary/secondary replicator built on the `stratum-async` kernel and
//! the `stratum-wire` transport contract.
//!
//! # Architecture
//!
//! ```text
//! service call ──► PrimaryReplicator::replicate
//!                    │ allocates an LSN, enqueues on the primary queue
//!                    ▼
//!            ReliableOperationSender (per session, retry + send window)
//!                    │
//!                    ▼  ReplicationOperation
//!            SecondaryReplicator ── OperationQueue (out-of-order intake)
//!                    │ ordered dispatch
//!                    ▼
//!            OperationStream ──► service consumer ── acknowledge
//!                    │
//!                    ▼  ReplicationAck (four LSNs, batched)
//!            ReplicaManager ── quorum ──► replicate completion
//! ```
//!
//! The [`OperationQueue`] is the heart: a sequence-number-indexed buffer
//! with out-of-order enqueue, in-order commit/complete, adaptive capacity
//! and exact memory accounting. The [`ReliableOperationSender`] drives the
//! queue's contents to one remote with retries and an adaptive send
//! window. The [`ReplicaManager`] owns the per-remote sessions across
//! configuration changes and derives committed/completed progress under
//! quorum.

pub mod config;
pub mod copy;
pub mod primary;
pub mod queue;
pub mod replica_manager;
pub mod secondary;
pub mod sender;
pub mod session;
pub mod state_provider;
pub mod stream;

pub use config::ReplicatorConfig;
pub use copy::{CopyPump, OperationDataStream};
pub use primary::{CatchUpMode, PrimaryReplicator};
pub use queue::{EnqueueOutcome, OperationQueue, OperationQueueOptions};
pub use replica_manager::{ProgressSnapshot, ReplicaInformation, ReplicaManager};
pub use secondary::SecondaryReplicator;
pub use sender::{OperationLatencyList, ReliableOperationSender, SendFn, SendKind, SenderConfig};
pub use session::{ReplicationSession, SessionRole};
pub use state_provider::StateProvider;
pub use stream::OperationStream;

pub use stratum_types::{Completion, Status};

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, Status>;
