//! Platform Description
//!
//! Describes the microcontroller the simulated kernel stands in for. The
//! simulation never touches hardware; the platform only supplies the memory
//! map the default MPU table is built from and the capabilities reported in
//! kernel statistics.
//!
//! # Supported Platforms
//!
//! - **STM32G474**: EK3 power module controller (default)

pub mod stm32g474;

pub use stm32g474 as target_platform;

use serde::Serialize;

/// Platform identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlatformType {
    /// STM32G474 Cortex-M4F of the EK3 module
    Stm32G474,
}

/// Hardware capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HardwareCapabilities {
    /// Number of fixed MPU regions
    pub mpu_regions: usize,
    /// Number of interrupt priority levels the kernel uses
    pub interrupt_levels: usize,
    /// Has an independent hardware watchdog
    pub has_watchdog: bool,
    /// CPU frequency in Hz
    pub cpu_frequency: u32,
    /// Flash size in bytes
    pub flash_size: u32,
    /// SRAM size in bytes
    pub ram_size: u32,
}

impl Default for HardwareCapabilities {
    fn default() -> Self {
        target_platform::CAPABILITIES
    }
}
