//! STM32G474 Platform Description
//!
//! # Memory Map
//!
//! ```text
//! 0x08000000 - 0x08003FFF : Bootloader (16KB)
//! 0x08004000 - 0x08033FFF : Application slot A (192KB)
//! 0x08034000 - 0x08063FFF : Application slot B (192KB)
//! 0x08064000 - 0x08067FFF : Configuration (16KB)
//! 0x20000000 - 0x20003FFF : DMA buffers (16KB)
//! 0x20004000 - 0x2000BFFF : Heap (32KB)
//! 0x2000C000 - 0x20017FFF : Stacks (48KB)
//! 0x40000000 - 0x4007FFFF : Peripherals (512KB)
//! ```

use super::{HardwareCapabilities, PlatformType};

/// Platform identifier
pub const PLATFORM_TYPE: PlatformType = PlatformType::Stm32G474;

/// Platform name string
pub const PLATFORM_NAME: &str = "STM32G474 (EK3)";

/// Capabilities of the EK3 controller
pub const CAPABILITIES: HardwareCapabilities = HardwareCapabilities {
    mpu_regions: 8,
    interrupt_levels: 4,
    has_watchdog: true,
    cpu_frequency: 170_000_000,
    flash_size: 512 * 1024,
    ram_size: 128 * 1024,
};

/// Memory layout constants
pub mod memory_layout {
    /// Flash start address
    pub const FLASH_BASE: u32 = 0x0800_0000;
    /// Bootloader size
    pub const BOOTLOADER_SIZE: u32 = 16 * 1024;
    /// Application slot A
    pub const APP_A_BASE: u32 = 0x0800_4000;
    /// Application slot B
    pub const APP_B_BASE: u32 = 0x0803_4000;
    /// Size of one application slot
    pub const APP_SLOT_SIZE: u32 = 192 * 1024;
    /// Configuration sector
    pub const CONFIG_BASE: u32 = 0x0806_4000;
    /// Configuration sector size
    pub const CONFIG_SIZE: u32 = 16 * 1024;

    /// SRAM start address
    pub const SRAM_BASE: u32 = 0x2000_0000;
    /// DMA buffer area size
    pub const DMA_SIZE: u32 = 16 * 1024;
    /// Heap start
    pub const HEAP_BASE: u32 = 0x2000_4000;
    /// Heap size
    pub const HEAP_SIZE: u32 = 32 * 1024;
    /// Task stacks start
    pub const STACKS_BASE: u32 = 0x2000_C000;
    /// Task stacks size
    pub const STACKS_SIZE: u32 = 48 * 1024;

    /// Peripheral block start
    pub const PERIPHERAL_BASE: u32 = 0x4000_0000;
    /// Peripheral block size
    pub const PERIPHERAL_SIZE: u32 = 512 * 1024;
}
