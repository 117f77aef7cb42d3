//! Bounded per-service mailbox

use heapless::Deque;

use super::{IpcError, IpcResult, MAX_MAILBOX_DEPTH, Message};

/// FIFO queue of one receiver.
///
/// Storage is sized for [`MAX_MAILBOX_DEPTH`]; `capacity` is the logical
/// depth fixed at registration.
#[derive(Debug)]
pub struct Mailbox {
    queue: Deque<Message, MAX_MAILBOX_DEPTH>,
    capacity: usize,
    open: bool,
    high_water: usize,
    delivered: u64,
    dropped: u64,
}

impl Mailbox {
    /// Open mailbox holding at most `capacity` messages
    pub fn new(capacity: usize) -> IpcResult<Self> {
        if capacity == 0 || capacity > MAX_MAILBOX_DEPTH {
            return Err(IpcError::InvalidCapacity);
        }
        Ok(Self {
            queue: Deque::new(),
            capacity,
            open: true,
            high_water: 0,
            delivered: 0,
            dropped: 0,
        })
    }

    /// Append a message; a full or closed mailbox drops it
    pub fn push(&mut self, message: Message) -> IpcResult<()> {
        if !self.open {
            return Err(IpcError::NotRegistered);
        }
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            return Err(IpcError::QueueFull);
        }
        self.queue.push_back(message).map_err(|_| {
            self.dropped += 1;
            IpcError::QueueFull
        })?;
        self.delivered += 1;
        self.high_water = self.high_water.max(self.queue.len());
        Ok(())
    }

    /// Take the oldest message
    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    /// Oldest message without removing it
    pub fn peek(&self) -> Option<&Message> {
        self.queue.front()
    }

    /// Discard every queued message, returning how many were dropped
    pub fn drain(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    /// Queued messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Logical depth
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Accepts messages
    pub const fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// Deepest fill level seen
    pub const fn high_water(&self) -> usize {
        self.high_water
    }

    /// Messages accepted
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Messages refused because the queue was full
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
