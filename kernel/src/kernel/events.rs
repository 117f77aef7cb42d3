//! Kernel event log
//!
//! Bounded ring of the notable things a kernel did: registrations, lifecycle
//! changes, faults, restarts and misses. When full, the oldest entry is
//! overwritten.

use alloc::vec::Vec;
use core::fmt;
use core::time::Duration;

use heapless::HistoryBuffer;
use serde::Serialize;

use crate::service::ServiceId;

/// Entries kept by the event log
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Maximum length of an event detail
pub const EVENT_DETAIL_LEN: usize = 48;

/// Event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// Service registered
    ServiceRegistered,
    /// Kernel started
    KernelStarted,
    /// Kernel stopped
    KernelStopped,
    /// Service suspended
    ServiceSuspended,
    /// Service resumed
    ServiceResumed,
    /// Service faulted
    ServiceFaulted,
    /// Restart scheduled by the reincarnation server
    RestartScheduled,
    /// Service restarted
    ServiceRestarted,
    /// Restart attempt failed
    RestartFailed,
    /// Automatic restarts abandoned
    PermanentFault,
    /// A critical service became permanently faulted
    CriticalServiceLost,
    /// Permanent fault cleared by an operator
    PermanentFaultCleared,
    /// Deadline missed
    DeadlineMiss,
    /// Hardware watchdog expired
    HardwareWatchdogExpired,
    /// Interrupt triggered
    InterruptTriggered,
}

impl EventKind {
    /// Snake-case name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceRegistered => "service_registered",
            Self::KernelStarted => "kernel_started",
            Self::KernelStopped => "kernel_stopped",
            Self::ServiceSuspended => "service_suspended",
            Self::ServiceResumed => "service_resumed",
            Self::ServiceFaulted => "service_faulted",
            Self::RestartScheduled => "restart_scheduled",
            Self::ServiceRestarted => "service_restarted",
            Self::RestartFailed => "restart_failed",
            Self::PermanentFault => "permanent_fault",
            Self::CriticalServiceLost => "critical_service_lost",
            Self::PermanentFaultCleared => "permanent_fault_cleared",
            Self::DeadlineMiss => "deadline_miss",
            Self::HardwareWatchdogExpired => "hardware_watchdog_expired",
            Self::InterruptTriggered => "interrupt_triggered",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelEvent {
    /// Simulated time
    pub timestamp: Duration,
    /// What happened
    pub kind: EventKind,
    /// Service concerned, if any
    pub service: Option<ServiceId>,
    /// Free-form detail
    pub detail: heapless::String<EVENT_DETAIL_LEN>,
}

/// Bounded event ring
#[derive(Debug)]
pub struct EventLog {
    ring: HistoryBuffer<KernelEvent, EVENT_LOG_CAPACITY>,
    total: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Empty log
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuffer::new(),
            total: 0,
        }
    }

    /// Append an event
    pub fn record(&mut self, event: KernelEvent) {
        self.total += 1;
        self.ring.write(event);
    }

    /// Up to `count` most recent events, oldest first
    pub fn recent(&self, count: usize) -> Vec<KernelEvent> {
        let skip = self.ring.len().saturating_sub(count);
        self.ring.oldest_ordered().skip(skip).cloned().collect()
    }

    /// Events currently held
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Nothing logged yet
    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    /// Events ever recorded
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Drop every held event
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> KernelEvent {
        KernelEvent {
            timestamp: Duration::from_micros(n),
            kind: EventKind::DeadlineMiss,
            service: Some(ServiceId::THERMAL),
            detail: heapless::String::new(),
        }
    }

    #[test]
    fn ring_drops_the_oldest() {
        let mut log = EventLog::new();
        for n in 0..(EVENT_LOG_CAPACITY as u64 + 5) {
            log.record(event(n));
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
        assert_eq!(log.total(), EVENT_LOG_CAPACITY as u64 + 5);

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, Duration::from_micros(EVENT_LOG_CAPACITY as u64 + 3));
        assert_eq!(log.recent(usize::MAX).first().map(|e| e.timestamp), Some(Duration::from_micros(5)));
    }
}
