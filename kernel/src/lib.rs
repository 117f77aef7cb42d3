//! JEZGRO Kernel Library
//!
//! Simulated real-time microkernel that runs inside every EK3 power module of
//! the fleet simulation. One [`Kernel`] instance owns its services and every
//! subsystem table; hosts advance it with [`Kernel::tick`].
//!
//! # Architecture
//!
//! The kernel follows a microkernel layout:
//! - EDF scheduler over periodic and sporadic service tasks
//! - MPU policy model with per-privilege access masks and owned regions
//! - Bounded mailboxes with request/reply slots for inter-service IPC
//! - Per-service watchdogs plus one hardware watchdog
//! - Reincarnation server restarting faulted services with exponential backoff
//!
//! # Tick order
//!
//! ```text
//! ISRs -> IPC wait resolution -> EDF dispatch -> watchdog check -> reincarnation
//! ```
//!
//! The library is `no_std` + `alloc`; the `std` feature adds the hosted
//! `jezgro-sim` binary.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![warn(clippy::panic)]
#![warn(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
pub mod macros;

pub mod commands;
pub mod config;
pub mod interrupt;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod platform;
pub mod safety;
pub mod scheduler;
pub mod service;

use thiserror_no_std::Error;

pub use config::KernelConfig;
pub use ipc::{IpcError, Message, MessageKind, Payload};
pub use kernel::{Kernel, KernelStats};
pub use memory::{AccessFlags, MemoryError, MemoryRegion, Privilege};
pub use safety::{FaultKind, RestartPolicy};
pub use service::{ServiceConfig, ServiceId, ServiceState, TaskContext, TaskError};

/// Core kernel error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// No service is registered under the id
    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),
    /// A service is already registered under the id
    #[error("service {0} already registered")]
    AlreadyRegistered(ServiceId),
    /// Invalid parameter provided
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// Lifecycle transition not allowed from the current state
    #[error("service {id} cannot move from {from} to {to}")]
    InvalidState {
        /// Service that was asked to transition
        id: ServiceId,
        /// State it is currently in
        from: ServiceState,
        /// Requested state
        to: ServiceState,
    },
    /// IPC communication error
    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),
    /// Memory protection error
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),
    /// Scheduler error
    #[error("scheduler: {0}")]
    Scheduler(#[from] scheduler::SchedulerError),
    /// Interrupt table error
    #[error("interrupt: {0}")]
    Interrupt(#[from] interrupt::InterruptError),
    /// Rejected configuration
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Copies `text` into a fixed-capacity string, cutting at the last char
/// boundary that still fits.
pub(crate) fn bounded_str<const N: usize>(text: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Formats into a fixed-capacity string, silently truncating on overflow.
pub(crate) fn bounded_fmt<const N: usize>(args: core::fmt::Arguments<'_>) -> heapless::String<N> {
    use core::fmt::Write;

    let mut out = heapless::String::new();
    let _ = out.write_fmt(args);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_str_truncates_on_char_boundary() {
        let s: heapless::String<4> = bounded_str("abcdef");
        assert_eq!(s.as_str(), "abcd");

        let s: heapless::String<3> = bounded_str("aé€");
        assert_eq!(s.as_str(), "aé");
    }

    #[test]
    fn kernel_error_display_names_service() {
        let err = KernelError::ServiceNotFound(ServiceId::THERMAL);
        assert_eq!(alloc::format!("{err}"), "service thermal not found");

        let err: KernelError = IpcError::QueueFull.into();
        assert_eq!(err, KernelError::Ipc(IpcError::QueueFull));
    }
}
