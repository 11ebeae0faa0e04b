//! # Stratum
//!
//! An async runtime and replication engine for building reliable storage
//! services.
//!
//! Stratum is built around a callback-driven async kernel and a
//! primary/secondary replicator with quorum acknowledgement:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           Stratum                              │
//! │  ┌───────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐ │
//! │  │   async   │ → │   queue   │ → │ sessions │ → │ replicator│ │
//! │  │  kernel   │   │ (ordered) │   │ (retry)  │   │ (quorum)  │ │
//! │  └───────────┘   └───────────┘   └──────────┘   └───────────┘ │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Kernel**: [`AsyncRuntime`], [`AsyncEvent`], [`QuotaGate`] - the
//!   lifecycle and scheduling substrate.
//! - **Queue**: [`OperationQueue`] - out-of-order intake, in-order
//!   commit/complete, adaptive capacity.
//! - **Sessions**: [`ReliableOperationSender`] - retry with an adaptive
//!   send window and batched acknowledgements.
//! - **Replicator**: [`PrimaryReplicator`] / [`SecondaryReplicator`] -
//!   replicate, build, catch-up, update-configuration.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stratum::prelude::*;
//!
//! let runtime = AsyncRuntime::new(4);
//! let transport = InMemoryTransport::new();
//!
//! let primary = PrimaryReplicator::new(
//!     ReplicatorConfig::default(),
//!     Arc::clone(&runtime),
//!     transport,
//!     endpoint,
//!     provider,
//!     Epoch::new(1, 1),
//! );
//!
//! let (lsn, completion) = primary.replicate(vec![payload])?;
//! completion.wait()?;
//! ```

pub use stratum_async::{
    AsyncEvent, AsyncOp, AsyncRuntime, AsyncService, CancellationToken, CancellationTokenSource,
    CompletionSource, ContextCore, ContextState, QuotaGate, ServiceCore, TimerService, WorkPool,
};
pub use stratum_replication::{
    CatchUpMode, OperationQueue, OperationQueueOptions, OperationStream, PrimaryReplicator,
    ReliableOperationSender, ReplicaInformation, ReplicaManager, ReplicatorConfig,
    SecondaryReplicator, StateProvider,
};
pub use stratum_types::{
    Completion, Epoch, IncarnationId, Lsn, Operation, OperationKind, OperationMetadata,
    PartitionId, ProgressVector, ReplicaId, ReplicationEndpointId, Status,
};
pub use stratum_wire::{InMemoryTransport, Message, MessageAction, MessageProcessor, Transport};

pub mod prelude {
    //! The commonly needed surface in one import.

    pub use stratum_async::{AsyncRuntime, CompletionSource};
    pub use stratum_replication::{
        CatchUpMode, PrimaryReplicator, ReplicatorConfig, SecondaryReplicator, StateProvider,
    };
    pub use stratum_types::{
        Epoch, Lsn, Operation, PartitionId, ReplicaId, ReplicationEndpointId, Status,
    };
    pub use stratum_wire::{InMemoryTransport, Transport};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_surface_is_reachable() {
        let lsn = Lsn::new(1);
        assert_eq!(lsn.next(), Lsn::new(2));
        let epoch = Epoch::new(1, 1);
        assert!(Epoch::new(1, 2).dominates(epoch));
        let config = ReplicatorConfig::default();
        assert!(config.initial_replication_queue_size > 0);
    }
}
