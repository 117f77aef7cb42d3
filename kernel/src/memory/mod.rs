//! Memory Protection Subsystem
//!
//! Policy model of the Cortex-M MPU: a fixed table of eight hardware regions
//! plus per-service owned regions, each carrying an access mask per privilege
//! level. No register set is modelled, only the decisions the hardware would
//! take.
//!
//! # Access rules
//!
//! - An address outside every enabled region is denied (fail closed)
//! - A region with an owner only admits that owner
//! - Requested bits must all be present in the caller's privilege mask
//!
//! # Default Memory Layout
//!
//! ```text
//! id  region          kernel driver service
//! 0   Bootloader      R-X    R-X    R-X
//! 1   Application_A   R-X    R-X    R-X
//! 2   Application_B   R-X    R-X    R-X
//! 3   Configuration   RW-    R--    R--
//! 4   DMA_Buffers     RW-    RW-    ---
//! 5   Heap            RW-    RW-    RW-
//! 6   Stacks          RW-    RW-    RW-
//! 7   Peripherals     RW-    RW-    ---
//! ```

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::service::ServiceId;

pub mod mpu;

pub use mpu::{Mpu, MpuStats};

/// Number of fixed hardware regions
pub const MPU_REGION_COUNT: usize = 8;

/// Capacity of the violation log
pub const MAX_VIOLATIONS: usize = 100;

/// Maximum region name length
pub const REGION_NAME_LEN: usize = 24;

/// Region identifier (0-7 fixed table, 8+ service overlay)
pub type RegionId = u8;

bitflags! {
    /// Memory access rights
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AccessFlags: u8 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Instruction fetch
        const EXECUTE = 1 << 2;
    }
}

impl AccessFlags {
    /// Read and write
    pub const RW: Self = Self::READ.union(Self::WRITE);
    /// Read and execute
    pub const RX: Self = Self::READ.union(Self::EXECUTE);
}

impl fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag, ch| if self.contains(flag) { ch } else { '-' };
        write!(
            f,
            "{}{}{}",
            bit(Self::READ, 'R'),
            bit(Self::WRITE, 'W'),
            bit(Self::EXECUTE, 'X')
        )
    }
}

/// Privilege levels, totally ordered `Service < Driver < Kernel`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Privilege {
    /// Unprivileged application service
    #[default]
    Service = 0,
    /// Device driver
    Driver = 1,
    /// Kernel itself
    Kernel = 2,
}

impl Privilege {
    /// Lower-case name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Driver => "driver",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory region kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    /// Internal flash
    Flash,
    /// Internal SRAM
    Sram,
    /// Memory-mapped peripherals
    Peripheral,
    /// External memory
    External,
}

/// Access mask per privilege level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    /// Kernel mask
    pub kernel: AccessFlags,
    /// Driver mask
    pub driver: AccessFlags,
    /// Service mask
    pub service: AccessFlags,
}

impl Permissions {
    /// Build from the three masks
    pub const fn new(kernel: AccessFlags, driver: AccessFlags, service: AccessFlags) -> Self {
        Self {
            kernel,
            driver,
            service,
        }
    }

    /// Same mask at every level
    pub const fn uniform(access: AccessFlags) -> Self {
        Self::new(access, access, access)
    }

    /// `access` at `privilege` and above, nothing below
    pub fn at_least(privilege: Privilege, access: AccessFlags) -> Self {
        let grant = |level| {
            if level >= privilege {
                access
            } else {
                AccessFlags::empty()
            }
        };
        Self::new(
            grant(Privilege::Kernel),
            grant(Privilege::Driver),
            grant(Privilege::Service),
        )
    }

    /// Mask for a privilege level
    pub const fn for_privilege(&self, privilege: Privilege) -> AccessFlags {
        match privilege {
            Privilege::Kernel => self.kernel,
            Privilege::Driver => self.driver,
            Privilege::Service => self.service,
        }
    }

    /// Masks only narrow as privilege drops
    pub const fn is_monotonic(&self) -> bool {
        self.kernel.contains(self.driver) && self.driver.contains(self.service)
    }
}

/// A protected memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    /// Region id
    pub id: RegionId,
    /// Region name
    pub name: heapless::String<REGION_NAME_LEN>,
    /// Base address
    pub base: u32,
    /// Size in bytes
    pub size: u32,
    /// Memory kind
    pub kind: RegionKind,
    /// Access masks
    pub permissions: Permissions,
    /// Owning service, if any
    pub owner: Option<ServiceId>,
    /// Region takes part in access checks
    pub enabled: bool,
}

impl MemoryRegion {
    /// Create an enabled, unowned region
    pub fn new(
        id: RegionId,
        name: &str,
        base: u32,
        size: u32,
        kind: RegionKind,
        permissions: Permissions,
    ) -> Self {
        Self {
            id,
            name: crate::bounded_str(name),
            base,
            size,
            kind,
            permissions,
            owner: None,
            enabled: true,
        }
    }

    /// Exclusive end address
    pub const fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    /// Address lies inside `[base, base + size)`
    pub const fn contains(&self, address: u32) -> bool {
        address >= self.base && (address as u64) < self.end()
    }

    /// Regions share at least one byte
    pub const fn overlaps(&self, base: u32, size: u32) -> bool {
        (self.base as u64) < base as u64 + size as u64 && (base as u64) < self.end()
    }
}

/// Why an access was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationReason {
    /// No enabled region covers the address
    NoRegion,
    /// The region belongs to another service
    NotOwner {
        /// Region that matched
        region: RegionId,
    },
    /// The privilege mask lacks a requested bit
    AccessDenied {
        /// Region that matched
        region: RegionId,
        /// What the mask allows
        allowed: AccessFlags,
    },
}

/// A denied access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Check counter value when the violation happened
    pub check: u64,
    /// Faulting address
    pub address: u32,
    /// Requested access
    pub access: AccessFlags,
    /// Offending service
    pub service: ServiceId,
    /// Privilege it ran at
    pub privilege: Privilege,
    /// Reason for the denial
    pub reason: ViolationReason,
}

/// Memory protection errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Region id outside the fixed table
    #[error("region id {0} outside the fixed table")]
    InvalidRegion(RegionId),
    /// Permission masks widen at a lower privilege
    #[error("permissions widen at a lower privilege level")]
    NonMonotonicPermissions,
    /// Zero-sized region or one that wraps the address space
    #[error("invalid region size")]
    InvalidSize,
    /// Memory region not found
    #[error("region not found")]
    NotFound,
}

/// Result type for memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_is_totally_ordered() {
        assert!(Privilege::Service < Privilege::Driver);
        assert!(Privilege::Driver < Privilege::Kernel);
    }

    #[test]
    fn at_least_grants_upward_only() {
        let perms = Permissions::at_least(Privilege::Driver, AccessFlags::RW);
        assert_eq!(perms.kernel, AccessFlags::RW);
        assert_eq!(perms.driver, AccessFlags::RW);
        assert_eq!(perms.service, AccessFlags::empty());
        assert!(perms.is_monotonic());
    }

    #[test]
    fn widening_masks_are_not_monotonic() {
        let perms = Permissions::new(AccessFlags::READ, AccessFlags::RW, AccessFlags::READ);
        assert!(!perms.is_monotonic());
    }

    #[test]
    fn region_bounds_are_half_open() {
        let region = MemoryRegion::new(0, "r", 0x100, 0x10, RegionKind::Sram, Permissions::default());
        assert!(region.contains(0x100));
        assert!(region.contains(0x10F));
        assert!(!region.contains(0x110));
        assert!(!region.contains(0xFF));

        let top = MemoryRegion::new(1, "top", 0xFFFF_FF00, 0x100, RegionKind::External, Permissions::default());
        assert!(top.contains(u32::MAX));
    }

    #[test]
    fn access_flags_display() {
        assert_eq!(alloc::format!("{}", AccessFlags::RX), "R-X");
        assert_eq!(alloc::format!("{}", AccessFlags::empty()), "---");
    }
}
