//! JEZGRO Safety Systems
//!
//! Fault detection, supervision and recovery for the services of one kernel.
//!
//! # Safety Architecture
//!
//! The safety system follows a layered approach:
//! - **Detection**: task-body errors, MPU denials, stack budget, deadlines
//! - **Supervision**: per-service watchdogs plus the hardware watchdog
//! - **Recovery**: the reincarnation server restarts faulted services with
//!   exponential backoff and gives up on services that keep failing
//! - **Assessment**: health monitoring and deterministic fault injection
//!
//! # Fault Model
//!
//! Every fault moves its service to `Faulted` and is handed to the
//! reincarnation server. A fault never stops the kernel; only the faulting
//! service degrades.

use core::fmt;

use serde::{Deserialize, Serialize};

pub mod injection;
pub mod monitoring;
pub mod recovery;
pub mod watchdog;

pub use injection::FaultInjector;
pub use monitoring::{HealthMonitor, HealthReport};
pub use recovery::{FaultDecision, ReincarnationServer, RestartHistory, RestartPolicy, RestartTarget};
pub use watchdog::{WatchdogEntry, WatchdogKind, WatchdogManager, WatchdogStats};

/// Service fault kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FaultKind {
    /// Denied memory access
    MpuViolation = 0,
    /// Watchdog expiry or a kick outside the window
    Watchdog = 1,
    /// Deadline missed (when configured as a fault)
    DeadlineMiss = 2,
    /// Task body failed
    Exception = 3,
    /// Stack usage above the budget
    StackOverflow = 4,
    /// Runtime assertion failed
    Assert = 5,
    /// IPC failure the service could not absorb
    Communication = 6,
}

impl FaultKind {
    /// Every fault kind, in code order
    pub const ALL: [Self; 7] = [
        Self::MpuViolation,
        Self::Watchdog,
        Self::DeadlineMiss,
        Self::Exception,
        Self::StackOverflow,
        Self::Assert,
        Self::Communication,
    ];

    /// Stable numeric code
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Fault kind for a numeric code
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| u32::from(kind.code()) == code)
    }

    /// Snake-case name used in events and logs
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MpuViolation => "mpu_violation",
            Self::Watchdog => "watchdog",
            Self::DeadlineMiss => "deadline_miss",
            Self::Exception => "exception",
            Self::StackOverflow => "stack_overflow",
            Self::Assert => "assert",
            Self::Communication => "communication",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
