//! Inter-task messaging: handles, messages, and the per-task mailbox.
//!
//! Every task owns one mailbox with a single message slot. A send blocks
//! until the destination is ready to receive; a receive blocks until the
//! slot holds a message or a notification bit is posted. The rendezvous
//! itself is driven by the scheduler's wake pass.

use alloc::vec::Vec;
use bitflags::bitflags;

/// Identifies a task as an IPC endpoint. Handles are picked by the creator
/// of the task and are independent from pids.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle(pub u32);

impl Handle {
    /// Placeholder handle for tasks that never participate in IPC.
    pub const NONE: Handle = Handle(0);
}

/// Source filter installed by a receive: accept anyone, or one peer only.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SourceFilter {
    #[default]
    Any,
    Exactly(Handle),
}

impl SourceFilter {
    pub fn admits(self, sender: Handle) -> bool {
        match self {
            SourceFilter::Any => true,
            SourceFilter::Exactly(handle) => handle == sender,
        }
    }
}

bitflags! {
    /// Kernel-side notification sources that can wake a receiver without a
    /// full message.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Notify: u32 {
        const TIMER = 1 << 0;
        const KEYBOARD = 1 << 1;
    }
}

impl Default for Notify {
    fn default() -> Self {
        Notify::empty()
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub kind: u32,
    pub sender: Handle,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: u32, sender: Handle, data: Vec<u8>) -> Self {
        Message { kind, sender, data }
    }
}

/// Per-task IPC state.
///
/// `slot` doubles as the outgoing buffer of a blocked sender and the inbox
/// of a receiver: a sender parks its message here while blocked, then moves
/// it into the peer's slot once the rendezvous completes.
#[derive(Default, Debug)]
pub struct Mailbox {
    /// Destination of an in-flight send.
    pub dst: Option<Handle>,
    /// Filter installed by the most recent receive.
    pub src: SourceFilter,
    /// The single pending message.
    pub slot: Option<Message>,
    pub notifies: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox::default()
    }

    /// Whether a message from `sender` could be delivered right now: the
    /// slot must be free and the filter must admit the sender.
    pub fn accepts_message_from(&self, sender: Handle) -> bool {
        self.slot.is_none() && self.src.admits(sender)
    }

    /// True when a blocked receive should wake up.
    pub fn has_pending_input(&self) -> bool {
        self.slot.is_some() || !self.notifies.is_empty()
    }

    /// Takes the pending message, clearing the notification bits with it.
    pub fn take_message(&mut self) -> Option<Message> {
        self.notifies = Notify::empty();
        self.slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn filter_admits_expected_senders() {
        assert!(SourceFilter::Any.admits(Handle(7)));
        assert!(SourceFilter::Exactly(Handle(7)).admits(Handle(7)));
        assert!(!SourceFilter::Exactly(Handle(7)).admits(Handle(8)));
    }

    #[test]
    fn occupied_slot_refuses_delivery() {
        let mut mailbox = Mailbox::new();
        assert!(mailbox.accepts_message_from(Handle(1)));

        mailbox.slot = Some(Message::new(1, Handle(1), vec![]));
        assert!(!mailbox.accepts_message_from(Handle(1)));
    }

    #[test]
    fn notify_bits_wake_and_clear_on_take() {
        let mut mailbox = Mailbox::new();
        assert!(!mailbox.has_pending_input());

        mailbox.notifies |= Notify::TIMER;
        assert!(mailbox.has_pending_input());

        assert!(mailbox.take_message().is_none());
        assert!(mailbox.notifies.is_empty());
    }

    #[test]
    fn take_returns_parked_message_once() {
        let mut mailbox = Mailbox::new();
        mailbox.slot = Some(Message::new(42, Handle(3), vec![1, 2, 3]));

        let msg = mailbox.take_message().unwrap();
        assert_eq!(msg.kind, 42);
        assert_eq!(msg.data, vec![1, 2, 3]);
        assert!(mailbox.take_message().is_none());
    }
}
