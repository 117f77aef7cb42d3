//! Watchdog Manager
//!
//! One software watchdog per supervised service plus a single hardware
//! watchdog kicked by the supervisor. Two entry kinds:
//!
//! - **Independent**: free running; expires when not kicked within `timeout`
//! - **Window**: additionally rejects kicks earlier than `window_start` after
//!   the previous kick, the way a window watchdog catches a runaway loop
//!
//! An expiry is reported once; the entry stays expired until kicked or reset.

use core::time::Duration;

use serde::Serialize;

use crate::service::{MAX_SERVICES, ServiceId};

/// Watchdog entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchdogKind {
    /// Free-running timeout
    Independent,
    /// Timeout with an earliest-allowed kick
    Window {
        /// Earliest allowed kick after the previous one
        start: Duration,
    },
}

/// Watchdog state of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchdogEntry {
    /// Supervised service
    pub service: ServiceId,
    /// Entry kind
    pub kind: WatchdogKind,
    /// Time without a kick before expiry (window end for window entries)
    pub timeout: Duration,
    /// Time of the last accepted kick (or registration/reset)
    pub last_kick: Duration,
    /// Expiry already reported
    pub expired: bool,
    /// Accepted kicks
    pub kick_count: u64,
    /// Expiries and rejected kicks
    pub expire_count: u64,
}

impl WatchdogEntry {
    const fn new(service: ServiceId, kind: WatchdogKind, timeout: Duration, now: Duration) -> Self {
        Self {
            service,
            kind,
            timeout,
            last_kick: now,
            expired: false,
            kick_count: 0,
            expire_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HardwareWatchdog {
    enabled: bool,
    timeout: Duration,
    last_kick: Duration,
    expired: bool,
    expiries: u64,
}

/// Watchdog statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStats {
    /// Entries not currently expired
    pub active: usize,
    /// Entries currently expired
    pub expired: usize,
    /// Accepted kicks
    pub total_kicks: u64,
    /// Expiries and rejected kicks
    pub total_expiries: u64,
    /// Hardware watchdog armed
    pub hardware_enabled: bool,
    /// Hardware watchdog currently expired
    pub hardware_expired: bool,
    /// Hardware watchdog expiries
    pub hardware_expiries: u64,
}

/// Watchdog manager
#[derive(Debug)]
pub struct WatchdogManager {
    entries: [Option<WatchdogEntry>; MAX_SERVICES],
    default_timeout: Duration,
    hardware: HardwareWatchdog,
    total_kicks: u64,
    total_expiries: u64,
}

impl WatchdogManager {
    /// Manager with `default_timeout` for [`Self::register_default`]
    pub const fn new(default_timeout: Duration) -> Self {
        Self {
            entries: [None; MAX_SERVICES],
            default_timeout,
            hardware: HardwareWatchdog {
                enabled: false,
                timeout: Duration::ZERO,
                last_kick: Duration::ZERO,
                expired: false,
                expiries: 0,
            },
            total_kicks: 0,
            total_expiries: 0,
        }
    }

    /// Default timeout
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn insert(&mut self, entry: WatchdogEntry) {
        if let Some(slot) = self.entries.get_mut(entry.service.index()) {
            *slot = Some(entry);
        }
    }

    /// Supervise `id` with an independent watchdog
    pub fn register(&mut self, id: ServiceId, timeout: Duration, now: Duration) {
        self.insert(WatchdogEntry::new(id, WatchdogKind::Independent, timeout, now));
    }

    /// Supervise `id` with the default timeout
    pub fn register_default(&mut self, id: ServiceId, now: Duration) {
        self.register(id, self.default_timeout, now);
    }

    /// Supervise `id` with a window watchdog accepting kicks in `[start, end)`
    pub fn register_window(&mut self, id: ServiceId, start: Duration, end: Duration, now: Duration) {
        self.insert(WatchdogEntry::new(id, WatchdogKind::Window { start }, end, now));
    }

    /// Stop supervising `id`
    pub fn unregister(&mut self, id: ServiceId) {
        if let Some(slot) = self.entries.get_mut(id.index()) {
            *slot = None;
        }
    }

    /// `id` is supervised
    pub fn is_registered(&self, id: ServiceId) -> bool {
        self.entry(id).is_some()
    }

    /// Entry of `id`
    pub fn entry(&self, id: ServiceId) -> Option<&WatchdogEntry> {
        self.entries.get(id.index())?.as_ref()
    }

    fn entry_mut(&mut self, id: ServiceId) -> Option<&mut WatchdogEntry> {
        self.entries.get_mut(id.index())?.as_mut()
    }

    /// Kick the watchdog of `id`.
    ///
    /// Returns `false` for an unknown service or a window kick that came too
    /// early; the early kick is counted as an expiry.
    pub fn kick(&mut self, id: ServiceId, now: Duration) -> bool {
        let Some(entry) = self.entries.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        if let WatchdogKind::Window { start } = entry.kind {
            if now.saturating_sub(entry.last_kick) < start {
                entry.expire_count += 1;
                self.total_expiries += 1;
                klog!(warn, id, "watchdog kicked before window opened");
                return false;
            }
        }
        entry.last_kick = now;
        entry.expired = false;
        entry.kick_count += 1;
        self.total_kicks += 1;
        true
    }

    /// Report entries that expired since the last check, in id order
    pub fn check(&mut self, now: Duration) -> heapless::Vec<ServiceId, MAX_SERVICES> {
        let mut expired = heapless::Vec::new();
        for entry in self.entries.iter_mut().flatten() {
            if entry.expired || now.saturating_sub(entry.last_kick) < entry.timeout {
                continue;
            }
            entry.expired = true;
            entry.expire_count += 1;
            self.total_expiries += 1;
            let _ = expired.push(entry.service);
        }
        expired
    }

    /// Expiry of `id` has been reported and not cleared
    pub fn is_expired(&self, id: ServiceId) -> bool {
        self.entry(id).is_some_and(|entry| entry.expired)
    }

    /// Restart the timeout of `id` from `now`
    pub fn reset(&mut self, id: ServiceId, now: Duration) {
        if let Some(entry) = self.entry_mut(id) {
            entry.last_kick = now;
            entry.expired = false;
        }
    }

    /// Restart every entry from `now`
    pub fn reset_all(&mut self, now: Duration) {
        for entry in self.entries.iter_mut().flatten() {
            entry.last_kick = now;
            entry.expired = false;
        }
    }

    /// Change the timeout of `id`
    pub fn set_timeout(&mut self, id: ServiceId, timeout: Duration) {
        if let Some(entry) = self.entry_mut(id) {
            entry.timeout = timeout;
        }
    }

    /// Time left before `id` expires (zero once due or when unknown)
    pub fn time_remaining(&self, id: ServiceId, now: Duration) -> Duration {
        self.entry(id).map_or(Duration::ZERO, |entry| {
            entry.timeout.saturating_sub(now.saturating_sub(entry.last_kick))
        })
    }

    /// Arm the hardware watchdog
    pub const fn enable_hardware(&mut self, timeout: Duration, now: Duration) {
        self.hardware.enabled = true;
        self.hardware.timeout = timeout;
        self.hardware.last_kick = now;
        self.hardware.expired = false;
    }

    /// Kick the hardware watchdog
    pub const fn kick_hardware(&mut self, now: Duration) {
        self.hardware.last_kick = now;
        self.hardware.expired = false;
    }

    /// Returns `true` once when the hardware watchdog expires
    pub fn check_hardware(&mut self, now: Duration) -> bool {
        let hw = &mut self.hardware;
        if !hw.enabled || hw.expired || now.saturating_sub(hw.last_kick) < hw.timeout {
            return false;
        }
        hw.expired = true;
        hw.expiries += 1;
        true
    }

    /// Hardware watchdog is expired and not yet kicked
    pub const fn hardware_expired(&self) -> bool {
        self.hardware.expired
    }

    /// Statistics snapshot
    pub fn stats(&self) -> WatchdogStats {
        let expired = self.entries.iter().flatten().filter(|entry| entry.expired).count();
        let total = self.entries.iter().flatten().count();
        WatchdogStats {
            active: total - expired,
            expired,
            total_kicks: self.total_kicks,
            total_expiries: self.total_expiries,
            hardware_enabled: self.hardware.enabled,
            hardware_expired: self.hardware.expired,
            hardware_expiries: self.hardware.expiries,
        }
    }
}
