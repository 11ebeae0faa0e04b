//! # stratum-wire: replication messages and the transport contract
//!
//! The replication core talks to its peers through exactly seven message
//! actions:
//!
//! - [`MessageAction::StartCopy`] - primary → secondary: begin a build
//! - [`MessageAction::CopyOperation`] - primary → secondary: one copy item
//! - [`MessageAction::CopyContextOperation`] - secondary → primary: one
//!   copy-context item
//! - [`MessageAction::ReplicationOperation`] - primary → secondary: a batch
//!   of replication operations
//! - [`MessageAction::ReplicationAck`] - secondary → primary: the four-LSN
//!   acknowledgement
//! - [`MessageAction::CopyContextAck`] - primary → secondary: copy-context
//!   progress
//! - [`MessageAction::RequestAck`] - primary → secondary: elicit an
//!   immediate acknowledgement
//!
//! Every message carries a [`FromHeader`]; receivers drop messages whose
//! sender partition does not match their own or whose incarnation is not
//! the expected one.
//!
//! The codec is `postcard` behind a length prefix; a single frame may carry
//! a batch of operations which the receiver reconstructs in order.

pub mod codec;
pub mod message;
pub mod transport;

pub use codec::{MAX_FRAME_SIZE, decode_message, encode_message, encode_message_limited};
pub use message::{
    AckBody, CopyContextAckBody, FromHeader, Message, MessageAction, MessageBody, StartCopyBody,
    WireOperation,
};
pub use transport::{InMemoryTransport, MessageProcessor, Transport};

use thiserror::Error;

/// Wire-layer failures.
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame shorter than its declared length.
    #[error("truncated frame: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    /// Frame exceeds the configured maximum message size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization failure.
    #[error("encode failed: {0}")]
    Encode(postcard::Error),

    /// Deserialization failure.
    #[error("decode failed: {0}")]
    Decode(postcard::Error),
}

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;
