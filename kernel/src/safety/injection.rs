//! Deterministic Fault Injection
//!
//! Drives the normal fault path with random faults so restart and
//! degradation behavior can be exercised. The generator is a seeded ChaCha
//! stream: the same seed against the same kernel history injects the same
//! faults.

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use super::FaultKind;
use crate::kernel::Kernel;
use crate::service::{ServiceId, ServiceState};

/// Seeded random fault injector
#[derive(Debug, Clone)]
pub struct FaultInjector {
    rng: ChaCha8Rng,
    probability: f64,
    injected: u64,
}

impl FaultInjector {
    /// Injector firing with `probability` per call (clamped to `[0, 1]`)
    pub fn new(seed: u64, probability: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            probability: probability.clamp(0.0, 1.0),
            injected: 0,
        }
    }

    /// Per-call injection probability
    pub const fn probability(&self) -> f64 {
        self.probability
    }

    /// Faults injected so far
    pub const fn injected(&self) -> u64 {
        self.injected
    }

    fn unit(&mut self) -> f64 {
        f64::from(self.rng.next_u32()) / (f64::from(u32::MAX) + 1.0)
    }

    fn pick(&mut self, len: usize) -> usize {
        (self.rng.next_u32() as usize) % len.max(1)
    }

    /// With the configured probability, fault a random running service
    pub fn maybe_inject(&mut self, kernel: &mut Kernel) -> Option<(ServiceId, FaultKind)> {
        if self.unit() >= self.probability {
            return None;
        }
        let mut running = heapless::Vec::<ServiceId, { crate::service::MAX_SERVICES }>::new();
        for service in kernel.services() {
            if service.state() == ServiceState::Running {
                let _ = running.push(service.id());
            }
        }
        if running.is_empty() {
            return None;
        }

        let id = *running.get(self.pick(running.len()))?;
        let kind = *FaultKind::ALL.get(self.pick(FaultKind::ALL.len()))?;
        kernel.inject_fault(id, kind).ok()?;
        self.injected += 1;
        Some((id, kind))
    }
}
