//! Batch representation: one framed group of messages plus the raw bytes
//! that produced it.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Compression algorithm applied to a batch payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Payload is transmitted uncompressed.
    None,
    /// Payload is zlib-deflated.
    Zlib,
}

impl Compression {
    /// Frame tag byte for this algorithm.
    pub fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 1,
        }
    }

    /// Resolves a frame tag byte, if known.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            _ => None,
        }
    }
}

/// An ephemeral ordered sequence of messages decoded from one wire frame.
///
/// The batch keeps the exact frame bytes it was decoded from so that a
/// bridge which mutates nothing can forward those bytes untouched instead
/// of re-encoding. A batch is not retained beyond one handling call; its
/// messages are either forwarded (ownership transferred to the peer),
/// queued (ownership transferred to a transfer queue), or dropped.
#[derive(Debug)]
pub struct Batch {
    messages: Vec<Message>,
    raw: Vec<u8>,
    compression: Compression,
}

impl Batch {
    /// Assembles a batch from decoded parts. Used by the codec.
    pub(crate) fn from_parts(
        messages: Vec<Message>,
        raw: Vec<u8>,
        compression: Compression,
    ) -> Self {
        Self {
            messages,
            raw,
            compression,
        }
    }

    /// The messages in arrival order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The original frame bytes, compression tag included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The compression algorithm the frame arrived with.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if the batch decoded to no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Consumes the batch, yielding owned messages and the raw frame.
    pub fn into_parts(self) -> (Vec<Message>, Vec<u8>, Compression) {
        (self.messages, self.raw, self.compression)
    }
}
