//! Length-prefixed postcard framing.
//!
//! A frame is a little-endian `u32` length followed by the postcard
//! serialization of a [`Message`]. Batched replication rides in a single
//! frame; decoding yields the operations in their original order.

use crate::message::Message;
use crate::{Result, WireError};

/// Hard ceiling a decoder enforces regardless of configuration, to bound a
/// hostile length prefix.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encodes a message into a length-prefixed frame bounded by the hard
/// ceiling. Transports with a configured message-size limit use
/// [`encode_message_limited`].
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    encode_message_limited(message, MAX_FRAME_SIZE)
}

/// Encodes a message into a length-prefixed frame, rejecting bodies larger
/// than `max_frame_size` (clamped to the hard ceiling). This is where a
/// replicator's configured maximum message size is enforced on the wire.
pub fn encode_message_limited(message: &Message, max_frame_size: usize) -> Result<Vec<u8>> {
    let max = max_frame_size.min(MAX_FRAME_SIZE);
    let body = postcard::to_allocvec(message).map_err(WireError::Encode)?;
    if body.len() > max {
        return Err(WireError::FrameTooLarge {
            size: body.len(),
            max,
        });
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&u32::try_from(body.len()).expect("bounded above").to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes one frame from the front of `input`; returns the message and the
/// number of bytes consumed.
pub fn decode_message(input: &[u8]) -> Result<(Message, usize)> {
    if input.len() < LEN_PREFIX {
        return Err(WireError::Truncated {
            needed: LEN_PREFIX,
            available: input.len(),
        });
    }
    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&input[..LEN_PREFIX]);
    let body_len = u32::from_le_bytes(len_bytes) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    let total = LEN_PREFIX + body_len;
    if input.len() < total {
        return Err(WireError::Truncated {
            needed: total,
            available: input.len(),
        });
    }
    let message =
        postcard::from_bytes(&input[LEN_PREFIX..total]).map_err(WireError::Decode)?;
    Ok((message, total))
}
