//! Message model.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use stratum_types::{Epoch, Lsn, OperationMetadata, ReplicaId, ReplicationEndpointId, Status};

// ============================================================================
// Actions
// ============================================================================

/// The action identifying a message's purpose and payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageAction {
    ReplicationOperation,
    CopyOperation,
    CopyContextOperation,
    StartCopy,
    ReplicationAck,
    CopyContextAck,
    RequestAck,
}

impl MessageAction {
    /// Stable wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplicationOperation => "ReplicationOperation",
            Self::CopyOperation => "CopyOperation",
            Self::CopyContextOperation => "CopyContextOperation",
            Self::StartCopy => "StartCopy",
            Self::ReplicationAck => "ReplicationAck",
            Self::CopyContextAck => "CopyContextAck",
            Self::RequestAck => "RequestAck",
        }
    }
}

impl std::fmt::Display for MessageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Headers and bodies
// ============================================================================

/// Sender identity carried by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromHeader {
    /// Transport address the sender listens on.
    pub address: String,

    /// Full replication identity of the sender.
    pub endpoint_id: ReplicationEndpointId,
}

impl FromHeader {
    pub fn new(address: impl Into<String>, endpoint_id: ReplicationEndpointId) -> Self {
        Self {
            address: address.into(),
            endpoint_id,
        }
    }
}

/// One operation as carried on the wire: metadata plus payload buffers.
///
/// A replication frame carries a vector of these; the receiver rebuilds the
/// operations in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOperation {
    pub metadata: OperationMetadata,
    pub buffers: Vec<Bytes>,
}

/// The four-LSN acknowledgement.
///
/// `repl_received`/`repl_quorum` describe the replication stream
/// (buffered / applied by the service); `copy_received`/`copy_quorum` the
/// copy stream. None of the four ever regresses across successive acks
/// from the same secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub repl_received: Lsn,
    pub repl_quorum: Lsn,
    pub copy_received: Lsn,
    pub copy_quorum: Lsn,
    pub error: Option<Status>,
}

impl AckBody {
    pub fn new(repl_received: Lsn, repl_quorum: Lsn, copy_received: Lsn, copy_quorum: Lsn) -> Self {
        Self {
            repl_received,
            repl_quorum,
            copy_received,
            copy_quorum,
            error: None,
        }
    }
}

/// Acknowledgement of copy-context progress (primary → secondary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyContextAckBody {
    pub lsn: Lsn,
    pub error: Option<Status>,
}

/// Begins a build on the target secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCopyBody {
    pub primary_epoch: Epoch,
    pub target_replica_id: ReplicaId,
    /// The first LSN the secondary will receive on the replication stream;
    /// copy operations fill in everything below it.
    pub first_replication_lsn: Lsn,
}

/// Typed message payloads, one per action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// A batch of replication operations plus the primary's completed
    /// frontier at send time.
    ReplicationBatch {
        primary_epoch: Epoch,
        operations: Vec<WireOperation>,
        completed_lsn: Lsn,
    },

    CopyOperation {
        primary_epoch: Epoch,
        target_replica_id: ReplicaId,
        operation: WireOperation,
        is_last: bool,
    },

    CopyContextOperation {
        operation: WireOperation,
    },

    StartCopy(StartCopyBody),

    ReplicationAck(AckBody),

    CopyContextAck(CopyContextAckBody),

    RequestAck,
}

impl MessageBody {
    pub fn action(&self) -> MessageAction {
        match self {
            Self::ReplicationBatch { .. } => MessageAction::ReplicationOperation,
            Self::CopyOperation { .. } => MessageAction::CopyOperation,
            Self::CopyContextOperation { .. } => MessageAction::CopyContextOperation,
            Self::StartCopy(_) => MessageAction::StartCopy,
            Self::ReplicationAck(_) => MessageAction::ReplicationAck,
            Self::CopyContextAck(_) => MessageAction::CopyContextAck,
            Self::RequestAck => MessageAction::RequestAck,
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// A routed replication message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: FromHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(from: FromHeader, body: MessageBody) -> Self {
        Self { from, body }
    }

    pub fn action(&self) -> MessageAction {
        self.body.action()
    }

    /// Receiver-side admission filter.
    ///
    /// Drops cross-partition traffic outright, and cross-incarnation
    /// traffic when the receiver knows which incarnation it expects.
    pub fn is_from_expected_sender(
        &self,
        receiver: &ReplicationEndpointId,
        expected_sender: Option<&ReplicationEndpointId>,
    ) -> bool {
        if self.from.endpoint_id.partition_id != receiver.partition_id {
            return false;
        }
        match expected_sender {
            Some(expected) => {
                self.from.endpoint_id.replica_id == expected.replica_id
                    && self.from.endpoint_id.incarnation_id == expected.incarnation_id
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_types::{IncarnationId, PartitionId};

    fn endpoint(partition: PartitionId, replica: i64) -> ReplicationEndpointId {
        ReplicationEndpointId::generate(partition, ReplicaId::new(replica))
    }

    #[test]
    fn action_names_are_stable() {
        assert_eq!(
            MessageAction::ReplicationOperation.as_str(),
            "ReplicationOperation"
        );
        assert_eq!(MessageAction::RequestAck.as_str(), "RequestAck");
        assert_eq!(
            MessageBody::RequestAck.action(),
            MessageAction::RequestAck
        );
    }

    #[test]
    fn sender_filter_drops_cross_partition() {
        let partition = PartitionId::generate();
        let other_partition = PartitionId::generate();
        let sender = endpoint(other_partition, 2);
        let receiver = endpoint(partition, 1);

        let message = Message::new(
            FromHeader::new("net:1", sender),
            MessageBody::RequestAck,
        );
        assert!(!message.is_from_expected_sender(&receiver, None));
    }

    #[test]
    fn sender_filter_drops_unexpected_incarnation() {
        let partition = PartitionId::generate();
        let receiver = endpoint(partition, 1);
        let sender = endpoint(partition, 2);

        let message = Message::new(
            FromHeader::new("net:2", sender),
            MessageBody::RequestAck,
        );
        // No expectation: same partition passes.
        assert!(message.is_from_expected_sender(&receiver, None));
        // Expectation matches.
        assert!(message.is_from_expected_sender(&receiver, Some(&sender)));

        // Same replica id, different incarnation: rebuilt sender.
        let mut stale = sender;
        stale.incarnation_id = IncarnationId::generate();
        assert!(!message.is_from_expected_sender(&receiver, Some(&stale)));
    }
}
