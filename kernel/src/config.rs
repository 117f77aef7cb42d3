//! Kernel Configuration
//!
//! Tunables of one kernel instance. Every field has a default matching the
//! EK3 firmware, and the whole structure (de)serializes with serde so a host
//! can load it from TOML. Durations are written as integer microseconds.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::ipc::MAX_MAILBOX_DEPTH;
use crate::safety::RestartPolicy;

/// Default kernel tick (100 µs)
pub const DEFAULT_TICK_RATE: Duration = Duration::from_micros(100);

/// Default per-service watchdog timeout
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(10);

/// Default hardware watchdog timeout
pub const DEFAULT_HARDWARE_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(100);

/// Default mailbox depth
pub const DEFAULT_QUEUE_SIZE: usize = 16;

/// Default blocking IPC timeout
pub const DEFAULT_IPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Default fault probability above which a service is flagged at risk
pub const DEFAULT_FAULT_PROBABILITY_THRESHOLD: f64 = 0.95;

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Tick rate must be non-zero
    #[error("tick rate must be non-zero")]
    ZeroTickRate,
    /// Watchdog enabled with a zero timeout
    #[error("watchdog timeout must be non-zero")]
    ZeroWatchdogTimeout,
    /// Mailbox depth outside `1..=MAX_MAILBOX_DEPTH`
    #[error("default queue size {0} out of range")]
    QueueSize(usize),
    /// Backoff factor below 1.0 or not finite
    #[error("restart backoff factor must be a finite value >= 1.0")]
    BackoffFactor,
    /// Base restart delay above the cap
    #[error("restart delay exceeds max delay")]
    RestartDelay,
    /// Threshold outside `[0, 1]`
    #[error("fault probability threshold must lie in [0, 1]")]
    Threshold,
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Tick length used by [`crate::Kernel::step`]
    #[serde(with = "micros")]
    pub tick_rate: Duration,
    /// Register a watchdog entry for every service
    pub watchdog_enabled: bool,
    /// Default per-service watchdog timeout
    #[serde(with = "micros")]
    pub watchdog_timeout: Duration,
    /// Arm the hardware watchdog at start
    pub hardware_watchdog_enabled: bool,
    /// Hardware watchdog timeout
    #[serde(with = "micros")]
    pub hardware_watchdog_timeout: Duration,
    /// Default restart policy of the reincarnation server
    pub restart: RestartPolicy,
    /// Validate owned regions before each execution
    pub mpu_enabled: bool,
    /// Mailbox depth for services without an override
    pub default_queue_size: usize,
    /// Timeout of `send_sync` and `receive_blocking`
    #[serde(with = "micros")]
    pub ipc_timeout: Duration,
    /// Treat a runtime deadline miss as a fault
    pub fault_on_deadline_miss: bool,
    /// Health monitor risk threshold
    pub fault_probability_threshold: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            watchdog_enabled: true,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            hardware_watchdog_enabled: false,
            hardware_watchdog_timeout: DEFAULT_HARDWARE_WATCHDOG_TIMEOUT,
            restart: RestartPolicy::default(),
            mpu_enabled: true,
            default_queue_size: DEFAULT_QUEUE_SIZE,
            ipc_timeout: DEFAULT_IPC_TIMEOUT,
            fault_on_deadline_miss: false,
            fault_probability_threshold: DEFAULT_FAULT_PROBABILITY_THRESHOLD,
        }
    }
}

impl KernelConfig {
    /// Check the configuration for values the kernel cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate.is_zero() {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.watchdog_enabled && self.watchdog_timeout.is_zero() {
            return Err(ConfigError::ZeroWatchdogTimeout);
        }
        if self.default_queue_size == 0 || self.default_queue_size > MAX_MAILBOX_DEPTH {
            return Err(ConfigError::QueueSize(self.default_queue_size));
        }
        let factor = self.restart.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::BackoffFactor);
        }
        if self.restart.restart_delay > self.restart.max_delay {
            return Err(ConfigError::RestartDelay);
        }
        if !(0.0..=1.0).contains(&self.fault_probability_threshold) {
            return Err(ConfigError::Threshold);
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as integer microseconds
pub mod micros {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as microseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
    }

    /// Deserialize from microseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = KernelConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.tick_rate, Duration::from_micros(100));
        assert_eq!(config.restart.max_restarts, 3);
        assert!(config.watchdog_enabled);
        assert!(config.mpu_enabled);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = KernelConfig::default();
        config.default_queue_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::QueueSize(0)));

        let mut config = KernelConfig::default();
        config.restart.backoff_factor = 0.5;
        assert_eq!(config.validate(), Err(ConfigError::BackoffFactor));

        let mut config = KernelConfig::default();
        config.fault_probability_threshold = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::Threshold));

        let mut config = KernelConfig::default();
        config.restart.restart_delay = Duration::from_secs(5);
        assert_eq!(config.validate(), Err(ConfigError::RestartDelay));
    }

    #[test]
    fn durations_serialize_as_micros() {
        let config = KernelConfig::default();
        let mut buf = [0u8; 256];
        let bytes = postcard::to_slice(&config, &mut buf).unwrap();
        let back: KernelConfig = postcard::from_bytes(bytes).unwrap();
        assert_eq!(back, config);
    }
}
