//! Inter-Service Communication
//!
//! Every service owns one bounded FIFO mailbox created at registration.
//! Messages carry a fixed 64-byte payload so a send never allocates; typed
//! payloads are packed into it with `postcard`.
//!
//! # Message flow
//!
//! ```text
//! send         : sender -> receiver mailbox                 (non-blocking)
//! send_sync    : Request + reply slot, caller Blocked until reply/timeout
//! reply        : Response into the request's slot (same sequence number)
//! broadcast    : copy to every open mailbox except the sender's
//! ```

use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::service::ServiceId;

pub mod mailbox;
pub mod manager;

pub use mailbox::Mailbox;
pub use manager::{IpcManager, IpcStats};

/// Fixed payload capacity in bytes
pub const MAX_PAYLOAD_SIZE: usize = 64;

/// Upper bound on any mailbox depth
pub const MAX_MAILBOX_DEPTH: usize = 32;

/// Number of concurrent request/reply exchanges
pub const MAX_REPLY_SLOTS: usize = 16;

/// IPC errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum IpcError {
    /// Unknown receiver or closed mailbox
    #[error("mailbox not registered")]
    NotRegistered,
    /// Receiver mailbox is full; the message was dropped
    #[error("mailbox full")]
    QueueFull,
    /// No reply or message arrived in time
    #[error("timed out")]
    Timeout,
    /// Reply to a request without a live reply slot
    #[error("no reply slot")]
    NoReplySlot,
    /// Payload does not fit in the fixed buffer
    #[error("payload too large")]
    PayloadTooLarge,
    /// Typed payload could not be encoded or decoded
    #[error("payload encoding failed")]
    Encoding,
    /// Mailbox depth of zero or above the maximum
    #[error("invalid mailbox capacity")]
    InvalidCapacity,
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Request expecting a response
    Request,
    /// Response to a request
    Response,
    /// One-way notification
    Notification,
    /// Copy of a broadcast
    Broadcast,
    /// Kernel or service event
    Event,
}

/// Fixed-capacity message payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(heapless::Vec<u8, MAX_PAYLOAD_SIZE>);

impl Payload {
    /// Empty payload
    pub const fn new() -> Self {
        Self(heapless::Vec::new())
    }

    /// Copy raw bytes
    pub fn from_bytes(bytes: &[u8]) -> IpcResult<Self> {
        heapless::Vec::from_slice(bytes)
            .map(Self)
            .map_err(|()| IpcError::PayloadTooLarge)
    }

    /// Serialize a value with postcard
    pub fn encode<T: Serialize>(value: &T) -> IpcResult<Self> {
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        let used = postcard::to_slice(value, &mut buf).map_err(|err| match err {
            postcard::Error::SerializeBufferFull => IpcError::PayloadTooLarge,
            _ => IpcError::Encoding,
        })?;
        Self::from_bytes(used)
    }

    /// Deserialize a value with postcard
    pub fn decode<'de, T: Deserialize<'de>>(&'de self) -> IpcResult<T> {
        postcard::from_bytes(&self.0).map_err(|_| IpcError::Encoding)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Handle of a one-shot reply slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplySlotId(pub(crate) u8);

impl ReplySlotId {
    /// Slot index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Pending request handed back by `send_sync`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTicket {
    /// Slot the response will land in
    pub slot: ReplySlotId,
    /// Sequence number of the request
    pub sequence: u32,
}

/// An IPC message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,
    /// Sending service
    pub sender: ServiceId,
    /// Receiving service
    pub receiver: ServiceId,
    /// Payload bytes
    pub payload: Payload,
    /// Simulated time of the send
    pub timestamp: Duration,
    /// Sequence number stamped by the manager
    pub sequence: u32,
    /// Reply slot of a request
    pub reply_to: Option<ReplySlotId>,
}

impl Message {
    /// Message of any kind, unstamped
    pub const fn new(kind: MessageKind, sender: ServiceId, receiver: ServiceId, payload: Payload) -> Self {
        Self {
            kind,
            sender,
            receiver,
            payload,
            timestamp: Duration::ZERO,
            sequence: 0,
            reply_to: None,
        }
    }

    /// One-way notification
    pub const fn notification(sender: ServiceId, receiver: ServiceId, payload: Payload) -> Self {
        Self::new(MessageKind::Notification, sender, receiver, payload)
    }

    /// Request (the reply slot is attached by `send_sync`)
    pub const fn request(sender: ServiceId, receiver: ServiceId, payload: Payload) -> Self {
        Self::new(MessageKind::Request, sender, receiver, payload)
    }

    /// Event addressed to every service (used with `broadcast`)
    pub const fn event(sender: ServiceId, payload: Payload) -> Self {
        Self::new(MessageKind::Event, sender, ServiceId::KERNEL, payload)
    }

    /// Typed payload
    pub fn decode<'de, T: Deserialize<'de>>(&'de self) -> IpcResult<T> {
        self.payload.decode()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:?} {} -> {} ({} bytes)",
            self.sequence,
            self.kind,
            self.sender,
            self.receiver,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Telemetry {
        temperature_mc: i32,
        fan_rpm: u16,
        derate: bool,
    }

    #[test]
    fn typed_payload_roundtrip() {
        let reading = Telemetry {
            temperature_mc: 71_250,
            fan_rpm: 3200,
            derate: true,
        };
        let payload = Payload::encode(&reading).unwrap();
        assert!(payload.len() < MAX_PAYLOAD_SIZE);
        assert_eq!(payload.decode::<Telemetry>().unwrap(), reading);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(Payload::from_bytes(&[0u8; 65]), Err(IpcError::PayloadTooLarge));
        assert_eq!(Payload::encode(&[u32::MAX; 20]), Err(IpcError::PayloadTooLarge));
        assert!(Payload::from_bytes(&[0u8; 64]).is_ok());
    }

    #[test]
    fn garbage_fails_to_decode() {
        let payload = Payload::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(payload.decode::<Telemetry>(), Err(IpcError::Encoding));
    }
}
