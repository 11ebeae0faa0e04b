//! The status taxonomy shared by every Stratum layer.
//!
//! Async contexts complete with a [`Completion`]; services gate their API
//! entries on it; the wire carries it inside acknowledgement bodies. The
//! variants mirror the semantic taxonomy of the runtime, not any transport's
//! native error space.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic failure classes of the runtime.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Status {
    /// Operation issued in a state that forbids it.
    #[error("invalid state for the requested operation")]
    InvalidState,

    /// Second concurrent open of a single-open resource.
    #[error("resource is already open or opening")]
    SharingViolation,

    /// Enqueue rejected by the queue's count or memory limit.
    #[error("operation queue is full")]
    QueueFull,

    /// Enqueue at or below the queue's completed head.
    #[error("operation is below the completed head")]
    StaleOperation,

    /// The resource is deactivating; new work is refused.
    #[error("shutdown pending")]
    ShutdownPending,

    /// The resource has been closed; the API gate refused entry.
    #[error("object closed")]
    ObjectClosed,

    /// Explicit cancel, or a parent context was cancelled.
    #[error("operation canceled")]
    OperationCanceled,

    /// A wait exceeded its configured bound.
    #[error("timeout")]
    Timeout,

    /// Allocation or admission failure.
    #[error("insufficient resources")]
    InsufficientResources,

    /// An epoch did not advance monotonically.
    #[error("epoch did not advance")]
    InvalidEpoch,

    /// The replica is not in the primary role.
    #[error("not primary")]
    NotPrimary,

    /// The replica is not in a secondary role.
    #[error("not secondary")]
    NotSecondary,

    /// A send failed at the transport; surfaces as no-progress and retry.
    #[error("transport send failure")]
    TransportFailure,
}

/// Result of an async operation: success or a [`Status`].
pub type Completion = Result<(), Status>;
