//! Reply correlation.
//!
//! Replies carry no identifiers; correlation is positional. Every submitted
//! command occupies one slot in a FIFO queue and the driver matches each
//! decoded reply against the queue head. Cancellation marks the slot but
//! keeps it queued, so the reply that eventually arrives for it is consumed
//! and discarded without shifting alignment for later commands.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::errors::{Error, ErrorKind, RespResult};
use crate::output::ReplyBuilder;
use crate::value::Value;

/// Lifecycle of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Queued locally, bytes not confirmed written.
    Pending,
    /// Bytes handed to the transport.
    Sent,
    /// Part of the reply has been decoded.
    Completing,
    /// Resolved with a result.
    Done,
    /// Cancelled locally; the reply slot is still owed a wire reply.
    Cancelled,
}

fn cancelled_error() -> Error {
    Error::from((ErrorKind::Cancelled, "command was cancelled"))
}

/// Cancellation flag shared between a command handle and its queue slot.
#[derive(Debug, Default)]
pub(crate) struct CommandCell {
    cancelled: AtomicBool,
}

impl CommandCell {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Driver-side completion slot.
///
/// Resolution is take-once: whoever resolves first wins and every later
/// attempt reports `false` so the caller can discard the late result. The
/// sender travels with the queue entry, never with the handle, so dropping
/// an unresolved entry wakes the waiting handle instead of stranding it.
#[derive(Debug)]
pub(crate) struct ReplySlot {
    sender: Option<oneshot::Sender<RespResult<Value>>>,
}

impl ReplySlot {
    /// Resolves the command. Returns false if it was already resolved or the
    /// handle is gone.
    pub(crate) fn resolve(&mut self, result: RespResult<Value>) -> bool {
        match self.sender.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&mut self) -> bool {
        self.resolve(Err(cancelled_error()))
    }
}

/// Creates the three parts of a submission: the driver-held completion slot,
/// the shared cancellation flag and the caller's handle.
pub(crate) fn new_command() -> (ReplySlot, Arc<CommandCell>, CommandHandle) {
    let (tx, rx) = oneshot::channel();
    let cell = Arc::new(CommandCell::default());
    let slot = ReplySlot { sender: Some(tx) };
    let handle = CommandHandle {
        cell: cell.clone(),
        receiver: rx,
    };
    (slot, cell, handle)
}

/// The caller's side of a submitted command.
#[derive(Debug)]
pub struct CommandHandle {
    cell: Arc<CommandCell>,
    receiver: oneshot::Receiver<RespResult<Value>>,
}

impl CommandHandle {
    /// Cancels the command. [`wait`](Self::wait) reports
    /// [`ErrorKind::Cancelled`] right away; on the wire the command may
    /// still execute, only its reply is discarded.
    pub fn cancel(&self) {
        self.cell.cancel();
    }

    pub(crate) fn cell(&self) -> Arc<CommandCell> {
        self.cell.clone()
    }

    /// Waits for the command to resolve.
    pub async fn wait(self) -> RespResult<Value> {
        if self.cell.is_cancelled() {
            return Err(cancelled_error());
        }
        match self.receiver.await {
            Ok(result) => result,
            Err(_) if self.cell.is_cancelled() => Err(cancelled_error()),
            Err(_) => Err(Error::from(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "the connection driver was dropped",
            ))),
        }
    }
}

/// One occupied reply slot.
pub(crate) struct InFlight {
    pub(crate) bytes: Vec<u8>,
    pub(crate) builder: ReplyBuilder,
    pub(crate) slot: ReplySlot,
    pub(crate) cell: Arc<CommandCell>,
    pub(crate) state: CommandState,
    pub(crate) _permit: Option<OwnedSemaphorePermit>,
}

/// FIFO of occupied reply slots, oldest first.
#[derive(Default)]
pub(crate) struct DispatchQueue {
    entries: VecDeque<InFlight>,
}

impl DispatchQueue {
    pub(crate) fn push_back(&mut self, entry: InFlight) {
        self.entries.push_back(entry);
    }

    /// Marks the most recently queued slot as written to the transport.
    pub(crate) fn mark_sent_back(&mut self) {
        if let Some(entry) = self.entries.back_mut() {
            entry.state = CommandState::Sent;
        }
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut InFlight> {
        self.entries.front_mut()
    }

    pub(crate) fn pop_head(&mut self) -> Option<InFlight> {
        self.entries.pop_front()
    }

    /// Cancels every queued command without removing the slots. Streaming
    /// builders are muted so a cancelled command stops observing elements
    /// while its reply is still consumed.
    pub(crate) fn cancel_all(&mut self) {
        for entry in &mut self.entries {
            entry.cell.cancel();
            entry.slot.cancel();
            entry.builder.mute();
            entry.state = CommandState::Cancelled;
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<InFlight> {
        self.entries.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ReplyShape;

    fn entry() -> (InFlight, CommandHandle) {
        let (slot, cell, handle) = new_command();
        (
            InFlight {
                bytes: Vec::new(),
                builder: ReplyBuilder::new(ReplyShape::Value),
                slot,
                cell,
                state: CommandState::Pending,
                _permit: None,
            },
            handle,
        )
    }

    #[tokio::test]
    async fn resolve_is_take_once() {
        let (mut entry, handle) = entry();
        assert!(entry.slot.resolve(Ok(Value::Okay)));
        assert!(!entry.slot.resolve(Ok(Value::Nil)));
        assert_eq!(handle.wait().await.unwrap(), Value::Okay);
    }

    #[tokio::test]
    async fn cancel_resolves_the_handle_immediately() {
        let (mut entry, handle) = entry();
        handle.cancel();
        assert!(entry.cell.is_cancelled());
        assert!(handle.wait().await.unwrap_err().is_cancelled());
        // the receiver is gone, the late reply has nowhere to go
        assert!(!entry.slot.resolve(Ok(Value::Okay)));
    }

    #[tokio::test]
    async fn cancel_all_keeps_slots_queued() {
        let mut queue = DispatchQueue::default();
        let (slot_a, handle_a) = entry();
        let (slot_b, handle_b) = entry();
        queue.push_back(slot_a);
        queue.push_back(slot_b);

        queue.cancel_all();

        assert!(handle_a.wait().await.unwrap_err().is_cancelled());
        assert!(handle_b.wait().await.unwrap_err().is_cancelled());
        assert_eq!(queue.head_mut().unwrap().state, CommandState::Cancelled);
        assert_eq!(queue.drain().len(), 2);
    }

    #[tokio::test]
    async fn dropped_driver_surfaces_as_connection_error() {
        let (entry, handle) = entry();
        drop(entry);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn cancelled_entry_dropped_without_a_reply_stays_cancelled() {
        let (entry, handle) = entry();
        handle.cancel();
        drop(entry);
        assert!(handle.wait().await.unwrap_err().is_cancelled());
    }
}
