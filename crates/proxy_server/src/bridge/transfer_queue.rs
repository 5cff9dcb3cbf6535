//! Quarantine queue for a pending backend's traffic.
//!
//! While a transfer handshake is in flight the new backend already streams
//! world state, but the client still belongs to the old world. Nothing from
//! the pending backend may reach the client until the handshake's final ack,
//! so its messages are held here and replayed in order at release.

use std::collections::VecDeque;

use proxy_protocol::{Message, MessageKind};
use tracing::trace;

use crate::error::TransferError;

/// Bounded FIFO holding a pending backend's messages during a transfer.
///
/// Transient kinds that are worthless after a delay (particles, ambient
/// sounds) are dropped on arrival instead of queued; the denylist comes
/// from configuration.
#[derive(Debug)]
pub struct TransferQueue {
    queued: VecDeque<Message>,
    capacity: usize,
    denylist: Vec<MessageKind>,
    dropped_transient: u64,
}

impl TransferQueue {
    /// Creates an empty queue with the given capacity and transient denylist.
    pub fn new(capacity: usize, denylist: Vec<MessageKind>) -> Self {
        Self {
            queued: VecDeque::new(),
            capacity,
            denylist,
            dropped_transient: 0,
        }
    }

    /// Number of messages currently held.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// True if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Transient messages discarded instead of queued.
    pub fn dropped_transient(&self) -> u64 {
        self.dropped_transient
    }

    /// Holds one message for later release.
    ///
    /// Denylisted transient kinds are discarded and count as success. A
    /// full queue refuses the message; the caller must fail the transfer,
    /// because silently dropping arbitrary world state would corrupt the
    /// client's view of the new world.
    pub fn enqueue(&mut self, message: Message) -> Result<(), TransferError> {
        if self.denylist.contains(&message.kind) {
            self.dropped_transient += 1;
            trace!(kind = ?message.kind, "transient message dropped during quarantine");
            return Ok(());
        }
        if self.queued.len() >= self.capacity {
            return Err(TransferError::QueueOverflow {
                queued: self.queued.len(),
                capacity: self.capacity,
            });
        }
        self.queued.push_back(message);
        Ok(())
    }

    /// Releases every held message in arrival order.
    pub fn release(&mut self) -> Vec<Message> {
        self.queued.drain(..).collect()
    }

    /// Discards every held message, freeing their buffers.
    pub fn discard(&mut self) {
        self.queued.clear();
    }
}
