//! # stratum-types: Core types for Stratum
//!
//! This crate contains the shared vocabulary of the Stratum replication
//! runtime:
//! - Sequence numbers ([`Lsn`])
//! - Primary generations ([`Epoch`])
//! - Replica identity ([`ReplicaId`], [`PartitionId`], [`IncarnationId`],
//!   [`ReplicationEndpointId`])
//! - Operation payloads ([`Operation`], [`OperationMetadata`],
//!   [`OperationKind`])
//! - Epoch history ([`ProgressVector`], [`ProgressVectorEntry`])
//! - The status taxonomy ([`Status`], [`Completion`])

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod status;

pub use status::{Completion, Status};

// ============================================================================
// Sequence Numbers
// ============================================================================

/// Log sequence number: position of an operation within a replication or
/// copy stream.
///
/// LSNs are strictly monotonically increasing per stream. `Lsn::INVALID`
/// (`-1`) marks "no progress yet"; the first real operation of a stream
/// carries LSN 1 for replication and whatever base the start-copy handshake
/// establishes for copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(i64);

impl Lsn {
    /// Sentinel for "no sequence number observed yet".
    pub const INVALID: Lsn = Lsn(-1);

    /// The zero sequence number (below any real operation).
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// The next sequence number.
    pub const fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    /// The previous sequence number.
    pub const fn prev(self) -> Lsn {
        Lsn(self.0 - 1)
    }

    /// Distance from `other` to `self` (may be negative).
    pub const fn distance_from(self, other: Lsn) -> i64 {
        self.0 - other.0
    }

    pub const fn is_invalid(self) -> bool {
        self.0 < 0
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Lsn {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for i64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

// ============================================================================
// Epoch
// ============================================================================

/// Identifies a primary generation.
///
/// Epochs order lexicographically: the data-loss number dominates, the
/// configuration number breaks ties. A new primary always operates under an
/// epoch that strictly dominates every epoch it has observed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch {
    /// Incremented when the partition may have lost state.
    pub data_loss: i64,

    /// Incremented on every reconfiguration within a data-loss generation.
    pub configuration: i64,
}

impl Epoch {
    pub const ZERO: Epoch = Epoch {
        data_loss: 0,
        configuration: 0,
    };

    pub const fn new(data_loss: i64, configuration: i64) -> Self {
        Self {
            data_loss,
            configuration,
        }
    }

    /// True if `self` is strictly newer than `other`.
    pub fn dominates(self, other: Epoch) -> bool {
        self > other
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_loss, self.configuration)
    }
}

// ============================================================================
// Replica Identity
// ============================================================================

/// Unique identifier for a replica within a partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(i64);

impl ReplicaId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ReplicaId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifies the partition a replica set serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PartitionId(Uuid);

impl PartitionId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// A fresh random partition id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn get(self) -> Uuid {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes successive incarnations of the same replica id.
///
/// A replica that is dropped and rebuilt keeps its `ReplicaId` but receives
/// a fresh incarnation, so stale messages from the previous build are
/// filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct IncarnationId(Uuid);

impl IncarnationId {
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// A fresh random incarnation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn get(self) -> Uuid {
        self.0
    }
}

impl Display for IncarnationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full replication identity of an endpoint: which partition, which replica,
/// which incarnation of that replica.
///
/// Receivers drop messages whose partition id does not match their own or
/// whose incarnation id is not the one they expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ReplicationEndpointId {
    pub partition_id: PartitionId,
    pub replica_id: ReplicaId,
    pub incarnation_id: IncarnationId,
}

impl ReplicationEndpointId {
    pub const fn new(
        partition_id: PartitionId,
        replica_id: ReplicaId,
        incarnation_id: IncarnationId,
    ) -> Self {
        Self {
            partition_id,
            replica_id,
            incarnation_id,
        }
    }

    /// Convenience constructor with a fresh incarnation.
    pub fn generate(partition_id: PartitionId, replica_id: ReplicaId) -> Self {
        Self {
            partition_id,
            replica_id,
            incarnation_id: IncarnationId::generate(),
        }
    }
}

impl Display for ReplicationEndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.partition_id, self.replica_id, self.incarnation_id
        )
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Discriminates payload-carrying operations from stream terminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A regular operation carrying user buffers (possibly zero of them).
    Normal,

    /// Stream terminator. Carries no buffers.
    EndOfStream,
}

/// Metadata block carried by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub kind: OperationKind,

    /// Position of the operation in its stream.
    pub lsn: Lsn,

    /// Epoch under which the primary created the operation.
    ///
    /// `None` for copy-context operations, which exist outside any primary
    /// generation.
    pub epoch: Option<Epoch>,
}

impl OperationMetadata {
    pub fn normal(lsn: Lsn, epoch: Epoch) -> Self {
        Self {
            kind: OperationKind::Normal,
            lsn,
            epoch: Some(epoch),
        }
    }

    pub fn end_of_stream(lsn: Lsn) -> Self {
        Self {
            kind: OperationKind::EndOfStream,
            lsn,
            epoch: None,
        }
    }
}

/// A replicated unit of user data.
///
/// Operations are shared as `Arc<Operation>`: the queue, every session's
/// pending list, and the dispatch streams all hold references to the same
/// allocation, and the payload is released when the last holder drops it.
/// Zero buffers and zero-length buffers are both legal ("sentinel with no
/// payload").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub metadata: OperationMetadata,
    pub buffers: Vec<Bytes>,
}

impl Operation {
    pub fn new(metadata: OperationMetadata, buffers: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self { metadata, buffers })
    }

    /// A stream terminator at the given sequence number.
    pub fn end_of_stream(lsn: Lsn) -> Arc<Self> {
        Arc::new(Self {
            metadata: OperationMetadata::end_of_stream(lsn),
            buffers: Vec::new(),
        })
    }

    pub fn lsn(&self) -> Lsn {
        self.metadata.lsn
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.metadata.kind == OperationKind::EndOfStream
    }

    /// Total payload bytes across all buffers.
    ///
    /// This is the value the operation queue charges against its memory
    /// limit.
    pub fn payload_size(&self) -> u64 {
        self.buffers.iter().map(|b| b.len() as u64).sum()
    }
}

// ============================================================================
// Progress Vector
// ============================================================================

/// One epoch's worth of history: the epoch and the last sequence number the
/// replica observed under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,

    /// Highest LSN received under `epoch`; `Lsn::INVALID` if none.
    pub last_lsn: Lsn,
}

/// Ordered history of the epochs a replica has lived through.
///
/// Entries are appended with strictly dominating epochs; the vector never
/// reorders or rewrites past entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressVector {
    entries: Vec<ProgressVectorEntry>,
}

impl ProgressVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `(epoch, last_lsn)`.
    ///
    /// Returns `false` (and leaves the vector unchanged) if `epoch` does not
    /// strictly dominate the last recorded epoch.
    pub fn append(&mut self, epoch: Epoch, last_lsn: Lsn) -> bool {
        if let Some(last) = self.entries.last()
            && !epoch.dominates(last.epoch)
        {
            return false;
        }
        self.entries.push(ProgressVectorEntry { epoch, last_lsn });
        true
    }

    /// Seals the running entry with the last LSN observed under it, then
    /// opens a new entry for `epoch` with no progress yet.
    ///
    /// This is the shape of an update-epoch: the previous generation's
    /// final LSN is only known when the next generation begins. Returns
    /// `false` if `epoch` does not strictly dominate the running entry.
    pub fn advance_epoch(&mut self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> bool {
        if let Some(last) = self.entries.last_mut() {
            if !epoch.dominates(last.epoch) {
                return false;
            }
            last.last_lsn = previous_epoch_last_lsn;
        }
        self.entries.push(ProgressVectorEntry {
            epoch,
            last_lsn: Lsn::INVALID,
        });
        true
    }

    /// The most recent entry, if any.
    pub fn last(&self) -> Option<&ProgressVectorEntry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[ProgressVectorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compact `"dataloss.config:lsn;"` rendering used by diagnostics and
    /// tests.
    pub fn to_compact_string(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("{}:{};", entry.epoch, entry.last_lsn));
        }
        out
    }
}
