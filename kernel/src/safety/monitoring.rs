//! Health Monitoring
//!
//! Estimates how likely each service is to fail on its next execution from
//! its fault and deadline-miss history, and flags services above the
//! configured threshold.
//!
//! The estimate is Laplace-smoothed so that a fresh service starts at 0.5
//! and converges as evidence accumulates:
//!
//! ```text
//! p = (faults + misses + 1) / (executions + faults + misses + 2)
//! ```

use alloc::vec::Vec;

use serde::Serialize;

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::service::{Service, ServiceId};

/// Health of one service
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthReport {
    /// Service assessed
    pub id: ServiceId,
    /// Estimated fault probability
    pub fault_probability: f64,
    /// Probability above the threshold
    pub at_risk: bool,
}

/// Fault-probability gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMonitor {
    threshold: f64,
}

impl HealthMonitor {
    /// Monitor flagging services above `threshold`
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Monitor using the configured threshold
    pub const fn from_config(config: &KernelConfig) -> Self {
        Self::new(config.fault_probability_threshold)
    }

    /// Risk threshold
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Assess one service
    pub fn assess(&self, service: &Service) -> HealthReport {
        let runtime = service.runtime();
        let failures = u64::from(runtime.fault_count) + runtime.deadline_misses;
        let trials = runtime.execution_count + failures;
        let fault_probability = (failures + 1) as f64 / (trials + 2) as f64;
        HealthReport {
            id: service.id(),
            fault_probability,
            at_risk: fault_probability > self.threshold,
        }
    }

    /// Assess every service of `kernel`, in id order
    pub fn assess_all(&self, kernel: &Kernel) -> Vec<HealthReport> {
        kernel.services().map(|service| self.assess(service)).collect()
    }

    /// Services currently above the threshold
    pub fn at_risk(&self, kernel: &Kernel) -> Vec<ServiceId> {
        kernel
            .services()
            .map(|service| self.assess(service))
            .filter(|report| report.at_risk)
            .map(|report| report.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use core::time::Duration;

    use super::*;
    use crate::service::ServiceConfig;

    fn service() -> Service {
        let config = ServiceConfig::new(ServiceId::THERMAL, "thermal").sporadic(Duration::from_millis(1), Duration::ZERO);
        Service::new(config, Box::new(|_, _| Ok(())))
    }

    #[test]
    fn fresh_service_sits_at_one_half() {
        let report = HealthMonitor::new(0.95).assess(&service());
        assert!((report.fault_probability - 0.5).abs() < f64::EPSILON);
        assert!(!report.at_risk);
    }

    #[test]
    fn evidence_moves_the_estimate() {
        let monitor = HealthMonitor::new(0.6);
        let mut healthy = service();
        healthy.runtime.execution_count = 98;
        assert!((monitor.assess(&healthy).fault_probability - 0.01).abs() < 1e-12);

        let mut failing = service();
        failing.runtime.fault_count = 5;
        failing.runtime.deadline_misses = 3;
        let report = monitor.assess(&failing);
        assert!((report.fault_probability - 0.9).abs() < 1e-12);
        assert!(report.at_risk);
    }

    #[test]
    fn threshold_comes_from_config() {
        let config = KernelConfig {
            fault_probability_threshold: 0.4,
            ..KernelConfig::default()
        };
        let monitor = HealthMonitor::from_config(&config);
        assert!((monitor.threshold() - 0.4).abs() < f64::EPSILON);
        assert!(monitor.assess(&service()).at_risk);
    }
}
