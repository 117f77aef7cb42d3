//! Interrupt Handling
//!
//! Fixed-priority interrupt table of the EK3 controller. Handlers run at the
//! start of every tick, before any service is dispatched.
//!
//! # Priority levels
//!
//! | Level | Source                      |
//! |-------|-----------------------------|
//! | 0     | Safety (OCP / OVP / OTP)    |
//! | 1     | PWM control (HRTIM)         |
//! | 2     | ADC sampling                |
//! | 3     | CAN RX                      |
//!
//! Level 0 is the highest priority.

use alloc::boxed::Box;
use core::fmt;

use serde::Serialize;
use thiserror_no_std::Error;

/// Safety interrupt (over-current, over-voltage, over-temperature)
pub const ISR_SAFETY: u8 = 0;
/// PWM control interrupt
pub const ISR_PWM: u8 = 1;
/// ADC sampling interrupt
pub const ISR_ADC: u8 = 2;
/// CAN receive interrupt
pub const ISR_CAN_RX: u8 = 3;

/// Number of interrupt priority levels
pub const ISR_LEVELS: usize = 4;

/// Interrupt handler
pub type IsrHandler = Box<dyn FnMut() + Send>;

/// Interrupt table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterruptError {
    /// Priority outside `0..=3`
    #[error("invalid interrupt priority {0}")]
    InvalidPriority(u8),
    /// No handler registered at the priority
    #[error("no handler at priority {0}")]
    NotRegistered(u8),
}

struct IsrSlot {
    name: &'static str,
    handler: IsrHandler,
    pending: bool,
    count: u64,
}

/// Snapshot of one interrupt level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IsrInfo {
    /// Priority level
    pub priority: u8,
    /// Handler name
    pub name: &'static str,
    /// Triggered and not yet dispatched
    pub pending: bool,
    /// Handler executions
    pub count: u64,
}

/// Interrupt table
pub struct IsrTable {
    slots: [Option<IsrSlot>; ISR_LEVELS],
}

impl fmt::Debug for IsrTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Default for IsrTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IsrTable {
    /// Table without handlers
    pub const fn new() -> Self {
        Self {
            slots: [None, None, None, None],
        }
    }

    fn slot_mut(&mut self, priority: u8) -> Result<&mut Option<IsrSlot>, InterruptError> {
        self.slots
            .get_mut(usize::from(priority))
            .ok_or(InterruptError::InvalidPriority(priority))
    }

    /// Install `handler` at `priority`, replacing any previous one
    pub fn register(&mut self, priority: u8, name: &'static str, handler: IsrHandler) -> Result<(), InterruptError> {
        *self.slot_mut(priority)? = Some(IsrSlot {
            name,
            handler,
            pending: false,
            count: 0,
        });
        klog!(debug, "isr", "P{} -> {}", priority, name);
        Ok(())
    }

    /// Mark `priority` pending
    pub fn trigger(&mut self, priority: u8) -> Result<(), InterruptError> {
        let slot = self
            .slot_mut(priority)?
            .as_mut()
            .ok_or(InterruptError::NotRegistered(priority))?;
        slot.pending = true;
        Ok(())
    }

    /// Run every pending handler, highest priority first
    pub fn dispatch(&mut self) -> usize {
        let mut ran = 0;
        for slot in self.slots.iter_mut().flatten() {
            if slot.pending {
                slot.pending = false;
                (slot.handler)();
                slot.count += 1;
                ran += 1;
            }
        }
        ran
    }

    /// Bit `n` set when level `n` is pending
    pub fn pending_mask(&self) -> u8 {
        self.iter()
            .filter(|info| info.pending)
            .fold(0, |mask, info| mask | (1 << info.priority))
    }

    /// Snapshot of level `priority`
    pub fn info(&self, priority: u8) -> Option<IsrInfo> {
        self.iter().find(|info| info.priority == priority)
    }

    /// Registered levels, highest priority first
    pub fn iter(&self) -> impl Iterator<Item = IsrInfo> + '_ {
        self.slots.iter().zip(0u8..).filter_map(|(slot, priority)| {
            slot.as_ref().map(|slot| IsrInfo {
                priority,
                name: slot.name,
                pending: slot.pending,
                count: slot.count,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<u8>>>, level: u8) -> IsrHandler {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(level))
    }

    #[test]
    fn dispatch_runs_highest_priority_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = IsrTable::new();
        for level in [ISR_CAN_RX, ISR_SAFETY, ISR_ADC] {
            table.register(level, "isr", recorder(&log, level)).unwrap();
        }
        table.trigger(ISR_CAN_RX).unwrap();
        table.trigger(ISR_SAFETY).unwrap();
        assert_eq!(table.pending_mask(), 0b1001);

        assert_eq!(table.dispatch(), 2);
        assert_eq!(*log.lock().unwrap(), [ISR_SAFETY, ISR_CAN_RX]);
        assert_eq!(table.pending_mask(), 0);
        assert_eq!(table.dispatch(), 0);
        assert_eq!(table.info(ISR_SAFETY).map(|info| info.count), Some(1));
        assert_eq!(table.info(ISR_ADC).map(|info| info.count), Some(0));
    }

    #[test]
    fn invalid_levels_are_rejected() {
        let mut table = IsrTable::new();
        assert_eq!(
            table.register(4, "bad", Box::new(|| {})),
            Err(InterruptError::InvalidPriority(4))
        );
        assert_eq!(table.trigger(ISR_PWM), Err(InterruptError::NotRegistered(ISR_PWM)));
        assert!(table.info(ISR_PWM).is_none());
    }
}
