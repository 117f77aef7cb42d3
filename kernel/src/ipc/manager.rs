//! IPC Manager
//!
//! Owns the mailbox table, the reply-slot table and the wait table of one
//! kernel. Blocking operations never suspend anything: they register a wait
//! with a deadline, and [`IpcManager::poll_waits`] resolves waits once per
//! tick. The outcome is parked until the waiter collects it with
//! [`IpcManager::take_result`].

use core::time::Duration;

use serde::Serialize;

use super::{
    IpcError, IpcResult, MAX_REPLY_SLOTS, Mailbox, Message, MessageKind, Payload, ReplySlotId,
    ReplyTicket,
};
use crate::service::{MAX_SERVICES, ServiceId};

/// IPC statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IpcStats {
    /// Messages delivered into a mailbox or reply slot
    pub sent: u64,
    /// Messages taken out by receivers
    pub received: u64,
    /// Messages refused by a full mailbox
    pub dropped: u64,
    /// Broadcast operations
    pub broadcasts: u64,
    /// Registered mailboxes
    pub mailboxes: usize,
    /// Waits that expired
    pub timeouts: u64,
}

#[derive(Debug, Clone)]
struct ReplySlot {
    requester: ServiceId,
    sequence: u32,
    reply: Option<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Receive,
    Reply(ReplySlotId),
}

#[derive(Debug, Clone, Copy)]
struct Wait {
    kind: WaitKind,
    deadline: Duration,
}

/// IPC manager
#[derive(Debug)]
pub struct IpcManager {
    mailboxes: [Option<Mailbox>; MAX_SERVICES],
    slots: [Option<ReplySlot>; MAX_REPLY_SLOTS],
    waits: [Option<Wait>; MAX_SERVICES],
    results: [Option<IpcResult<Message>>; MAX_SERVICES],
    timeout: Duration,
    sequence: u32,
    sent: u64,
    received: u64,
    dropped: u64,
    broadcasts: u64,
    timeouts: u64,
}

impl IpcManager {
    /// Manager whose blocking calls time out after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            mailboxes: core::array::from_fn(|_| None),
            slots: core::array::from_fn(|_| None),
            waits: [None; MAX_SERVICES],
            results: core::array::from_fn(|_| None),
            timeout,
            sequence: 0,
            sent: 0,
            received: 0,
            dropped: 0,
            broadcasts: 0,
            timeouts: 0,
        }
    }

    /// Blocking-call timeout
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create (or replace) the mailbox of `id`
    pub fn register(&mut self, id: ServiceId, capacity: usize) -> IpcResult<()> {
        let mailbox = Mailbox::new(capacity)?;
        let slot = self.mailboxes.get_mut(id.index()).ok_or(IpcError::NotRegistered)?;
        *slot = Some(mailbox);
        Ok(())
    }

    /// Remove the mailbox of `id`, discarding its messages
    pub fn unregister(&mut self, id: ServiceId) {
        self.cancel_wait(id);
        if let Some(slot) = self.mailboxes.get_mut(id.index()) {
            *slot = None;
        }
    }

    /// Open or close the mailbox of `id`
    pub fn set_open(&mut self, id: ServiceId, open: bool) {
        if let Some(mailbox) = self.mailbox_mut(id) {
            mailbox.set_open(open);
        }
    }

    /// Mailbox of `id`
    pub fn mailbox(&self, id: ServiceId) -> Option<&Mailbox> {
        self.mailboxes.get(id.index())?.as_ref()
    }

    fn mailbox_mut(&mut self, id: ServiceId) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(id.index())?.as_mut()
    }

    /// `id` has an open mailbox
    pub fn is_registered(&self, id: ServiceId) -> bool {
        self.mailbox(id).is_some_and(Mailbox::is_open)
    }

    const fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    /// Non-blocking send; returns the stamped sequence number
    pub fn send(&mut self, mut message: Message, now: Duration) -> IpcResult<u32> {
        if !self.is_registered(message.receiver) {
            return Err(IpcError::NotRegistered);
        }
        message.timestamp = now;
        message.sequence = self.next_sequence();
        let sequence = message.sequence;

        let mailbox = self.mailbox_mut(message.receiver).ok_or(IpcError::NotRegistered)?;
        match mailbox.push(message) {
            Ok(()) => {
                self.sent += 1;
                Ok(sequence)
            }
            Err(err) => {
                if err == IpcError::QueueFull {
                    self.dropped += 1;
                }
                Err(err)
            }
        }
    }

    /// Send a `Request` and register a reply wait for the sender.
    ///
    /// The wait is resolved by [`Self::poll_waits`]; collect the response (or
    /// `Timeout`) with [`Self::take_result`].
    pub fn send_sync(&mut self, mut message: Message, now: Duration) -> IpcResult<ReplyTicket> {
        let requester = message.sender;
        if requester.index() >= MAX_SERVICES {
            return Err(IpcError::NotRegistered);
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(IpcError::NoReplySlot)?;
        let slot = ReplySlotId(u8::try_from(index).map_err(|_| IpcError::NoReplySlot)?);

        message.kind = MessageKind::Request;
        message.reply_to = Some(slot);
        let sequence = self.send(message, now)?;

        if let Some(entry) = self.slots.get_mut(index) {
            *entry = Some(ReplySlot {
                requester,
                sequence,
                reply: None,
            });
        }
        self.cancel_wait(requester);
        self.set_wait(
            requester,
            Wait {
                kind: WaitKind::Reply(slot),
                deadline: now + self.timeout,
            },
        );
        klog!(trace, requester, "request #{} waiting on slot {}", sequence, index);
        Ok(ReplyTicket { slot, sequence })
    }

    /// Deliver a `Response` into the reply slot of `original`
    pub fn reply(&mut self, original: &Message, payload: Payload, now: Duration) -> IpcResult<()> {
        let slot_id = original.reply_to.ok_or(IpcError::NoReplySlot)?;
        let slot = self
            .slots
            .get_mut(slot_id.index())
            .and_then(Option::as_mut)
            .filter(|slot| slot.sequence == original.sequence && slot.reply.is_none())
            .ok_or(IpcError::NoReplySlot)?;

        let mut response = Message::new(MessageKind::Response, original.receiver, original.sender, payload);
        response.timestamp = now;
        response.sequence = original.sequence;
        slot.reply = Some(response);
        self.sent += 1;
        Ok(())
    }

    /// Deliver a `Broadcast` copy to every open mailbox except the sender's.
    ///
    /// Returns the number of mailboxes reached; refusals are counted as drops.
    pub fn broadcast(&mut self, mut message: Message, now: Duration) -> usize {
        message.kind = MessageKind::Broadcast;
        message.timestamp = now;
        message.sequence = self.next_sequence();
        self.broadcasts += 1;

        let sender = message.sender;
        let mut delivered = 0;
        for (index, entry) in self.mailboxes.iter_mut().enumerate() {
            let Some(mailbox) = entry.as_mut() else {
                continue;
            };
            if index == sender.index() || !mailbox.is_open() {
                continue;
            }
            let mut copy = message.clone();
            copy.receiver = ServiceId::new(u8::try_from(index).unwrap_or(u8::MAX));
            match mailbox.push(copy) {
                Ok(()) => {
                    self.sent += 1;
                    delivered += 1;
                }
                Err(_) => self.dropped += 1,
            }
        }
        delivered
    }

    /// Non-blocking receive
    pub fn receive(&mut self, id: ServiceId) -> Option<Message> {
        let message = self.mailbox_mut(id)?.pop()?;
        self.received += 1;
        Some(message)
    }

    /// Receive, or register a bounded wait when the mailbox is empty.
    ///
    /// `Ok(None)` means the caller now waits until a message arrives or
    /// `timeout` elapses.
    pub fn receive_blocking(
        &mut self,
        id: ServiceId,
        timeout: Duration,
        now: Duration,
    ) -> IpcResult<Option<Message>> {
        if self.mailbox(id).is_none() {
            return Err(IpcError::NotRegistered);
        }
        if let Some(message) = self.receive(id) {
            return Ok(Some(message));
        }
        self.cancel_wait(id);
        self.set_wait(
            id,
            Wait {
                kind: WaitKind::Receive,
                deadline: now + timeout,
            },
        );
        Ok(None)
    }

    fn set_wait(&mut self, id: ServiceId, wait: Wait) {
        if let Some(entry) = self.waits.get_mut(id.index()) {
            *entry = Some(wait);
        }
        if let Some(result) = self.results.get_mut(id.index()) {
            *result = None;
        }
    }

    /// `id` has an unresolved wait
    pub fn is_waiting(&self, id: ServiceId) -> bool {
        self.waits.get(id.index()).is_some_and(Option::is_some)
    }

    /// Resolve waits whose message arrived or whose deadline passed.
    ///
    /// Returns the services whose wait completed, in id order.
    pub fn poll_waits(&mut self, now: Duration) -> heapless::Vec<ServiceId, MAX_SERVICES> {
        let mut completed = heapless::Vec::new();
        for index in 0..MAX_SERVICES {
            let Some(wait) = self.waits.get(index).copied().flatten() else {
                continue;
            };
            let id = ServiceId::new(u8::try_from(index).unwrap_or(u8::MAX));
            let outcome = match wait.kind {
                WaitKind::Receive => self.receive(id).map(Ok),
                WaitKind::Reply(slot) => self.take_reply(slot),
            };
            let outcome = match outcome {
                Some(outcome) => outcome,
                None if now >= wait.deadline => {
                    if let WaitKind::Reply(slot) = wait.kind {
                        self.free_slot(slot);
                    }
                    self.timeouts += 1;
                    klog!(debug, id, "ipc wait timed out");
                    Err(IpcError::Timeout)
                }
                None => continue,
            };
            if let Some(entry) = self.waits.get_mut(index) {
                *entry = None;
            }
            if let Some(result) = self.results.get_mut(index) {
                *result = Some(outcome);
            }
            let _ = completed.push(id);
        }
        completed
    }

    fn take_reply(&mut self, slot: ReplySlotId) -> Option<IpcResult<Message>> {
        let entry = self.slots.get_mut(slot.index())?;
        let reply = entry.as_mut()?.reply.take()?;
        *entry = None;
        self.received += 1;
        Some(Ok(reply))
    }

    fn free_slot(&mut self, slot: ReplySlotId) {
        if let Some(entry) = self.slots.get_mut(slot.index()) {
            *entry = None;
        }
    }

    /// Collect the outcome of a completed wait
    pub fn take_result(&mut self, id: ServiceId) -> Option<IpcResult<Message>> {
        self.results.get_mut(id.index())?.take()
    }

    /// Drop the wait of `id` (and its reply slot) without an outcome
    pub fn cancel_wait(&mut self, id: ServiceId) {
        let Some(wait) = self.waits.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        if let WaitKind::Reply(slot) = wait.kind {
            self.free_slot(slot);
        }
    }

    /// Drop every wait and parked outcome
    pub fn cancel_all_waits(&mut self) {
        self.waits = [None; MAX_SERVICES];
        self.slots = core::array::from_fn(|_| None);
        self.results = core::array::from_fn(|_| None);
    }

    /// Reply slots currently held by `requester`
    pub fn reply_slots_held(&self, requester: ServiceId) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.requester == requester)
            .count()
    }

    /// Messages queued for `id`
    pub fn pending(&self, id: ServiceId) -> usize {
        self.mailbox(id).map_or(0, Mailbox::len)
    }

    /// Discard the messages queued for `id`
    pub fn flush(&mut self, id: ServiceId) -> usize {
        self.mailbox_mut(id).map_or(0, Mailbox::drain)
    }

    /// Discard every queued message
    pub fn flush_all(&mut self) -> usize {
        self.mailboxes.iter_mut().flatten().map(Mailbox::drain).sum()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> IpcStats {
        IpcStats {
            sent: self.sent,
            received: self.received,
            dropped: self.dropped,
            broadcasts: self.broadcasts,
            mailboxes: self.mailboxes.iter().flatten().count(),
            timeouts: self.timeouts,
        }
    }
}
