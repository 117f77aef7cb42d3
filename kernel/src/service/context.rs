//! Task Context
//!
//! The view of the kernel a task body gets while it executes: its own
//! service record, the IPC manager and the MPU. Every IPC call is made on
//! behalf of the executing service, and every memory check is made at its
//! privilege level.
//!
//! Blocking calls do not suspend the body. They register a wait and mark the
//! context blocked; the kernel moves the service to `Blocked` once the body
//! returns and back to `Running` when the wait resolves.

use core::time::Duration;

use super::{Service, ServiceId};
use crate::ipc::{IpcManager, IpcResult, Message, Payload, ReplyTicket};
use crate::memory::{AccessFlags, Mpu};

/// Execution context of one task body invocation
pub struct TaskContext<'a> {
    service: &'a Service,
    ipc: &'a mut IpcManager,
    mpu: &'a mut Mpu,
    now: Duration,
    mpu_enabled: bool,
    pub(crate) denied: bool,
    pub(crate) stack_used: Option<usize>,
    pub(crate) blocked: bool,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        service: &'a Service,
        ipc: &'a mut IpcManager,
        mpu: &'a mut Mpu,
        now: Duration,
        mpu_enabled: bool,
    ) -> Self {
        Self {
            service,
            ipc,
            mpu,
            now,
            mpu_enabled,
            denied: false,
            stack_used: None,
            blocked: false,
        }
    }

    /// The executing service
    pub const fn service(&self) -> &Service {
        self.service
    }

    /// Id of the executing service
    pub const fn id(&self) -> ServiceId {
        self.service.id()
    }

    /// Simulated time of this execution
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Send a notification to `to`
    pub fn send(&mut self, to: ServiceId, payload: Payload) -> IpcResult<u32> {
        self.ipc.send(Message::notification(self.id(), to, payload), self.now)
    }

    /// Send `message` as given (the sender is forced to this service)
    pub fn send_message(&mut self, mut message: Message) -> IpcResult<u32> {
        message.sender = self.id();
        self.ipc.send(message, self.now)
    }

    /// Broadcast to every other open mailbox; returns the number delivered
    pub fn broadcast(&mut self, payload: Payload) -> usize {
        let message = Message::new(crate::ipc::MessageKind::Broadcast, self.id(), self.id(), payload);
        self.ipc.broadcast(message, self.now)
    }

    /// Take the oldest message addressed to this service
    pub fn receive(&mut self) -> Option<Message> {
        self.ipc.receive(self.id())
    }

    /// Answer a request received earlier
    pub fn reply(&mut self, request: &Message, payload: Payload) -> IpcResult<()> {
        self.ipc.reply(request, payload, self.now)
    }

    /// Send a request to `to` and block until the reply or the timeout.
    ///
    /// The response is collected on a later execution with
    /// [`Self::take_wait_result`].
    pub fn call(&mut self, to: ServiceId, payload: Payload) -> IpcResult<ReplyTicket> {
        let ticket = self
            .ipc
            .send_sync(Message::request(self.id(), to, payload), self.now)?;
        self.blocked = true;
        Ok(ticket)
    }

    /// Receive, or block for at most `timeout` when nothing is queued
    pub fn receive_blocking(&mut self, timeout: Duration) -> IpcResult<Option<Message>> {
        let received = self.ipc.receive_blocking(self.id(), timeout, self.now)?;
        if received.is_none() {
            self.blocked = true;
        }
        Ok(received)
    }

    /// Outcome of the last completed blocking call
    pub fn take_wait_result(&mut self) -> Option<IpcResult<Message>> {
        self.ipc.take_result(self.id())
    }

    /// Messages waiting in this service's mailbox
    pub fn pending(&self) -> usize {
        self.ipc.pending(self.id())
    }

    /// Check an access at this service's privilege.
    ///
    /// A denial faults the service with an MPU violation once the body
    /// returns. With the MPU disabled every access passes.
    pub fn check_access(&mut self, address: u32, access: AccessFlags) -> bool {
        if !self.mpu_enabled {
            return true;
        }
        let allowed = self
            .mpu
            .check_access(address, access, self.service.privilege(), self.id());
        if !allowed {
            self.denied = true;
        }
        allowed
    }

    /// Report the stack depth reached by this execution
    pub fn report_stack_usage(&mut self, bytes: usize) {
        self.stack_used = Some(self.stack_used.map_or(bytes, |used| used.max(bytes)));
    }

    /// The body registered a wait during this execution
    pub const fn is_blocked(&self) -> bool {
        self.blocked
    }
}
