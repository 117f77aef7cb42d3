//! MPU model
//!
//! Fixed eight-slot region table plus a task-region overlay holding the
//! region each service owns. Lookups search the overlay first, the way an
//! embedded kernel reprograms its dynamic slots for the running task.

use alloc::vec::Vec;

use heapless::HistoryBuffer;
use serde::Serialize;

use super::{
    AccessFlags, MAX_VIOLATIONS, MPU_REGION_COUNT, MemoryError, MemoryRegion, MemoryResult,
    Permissions, Privilege, RegionId, RegionKind, Violation, ViolationReason,
};
use crate::platform::target_platform::memory_layout as map;
use crate::service::{MAX_SERVICES, ServiceId};

/// MPU statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MpuStats {
    /// Access checks performed
    pub checks: u64,
    /// Denied accesses
    pub violations: u64,
    /// Enabled fixed regions
    pub enabled_regions: usize,
    /// Allocated service regions
    pub service_regions: usize,
}

/// Memory protection unit
#[derive(Debug)]
pub struct Mpu {
    regions: [Option<MemoryRegion>; MPU_REGION_COUNT],
    task_regions: [Option<MemoryRegion>; MAX_SERVICES],
    violations: HistoryBuffer<Violation, MAX_VIOLATIONS>,
    check_count: u64,
    violation_count: u64,
}

impl Default for Mpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mpu {
    /// MPU loaded with the EK3 default map
    pub fn new() -> Self {
        let mut mpu = Self::empty();
        for region in default_regions() {
            let slot = usize::from(region.id);
            if let Some(entry) = mpu.regions.get_mut(slot) {
                *entry = Some(region);
            }
        }
        mpu
    }

    /// MPU with no regions; every access is denied
    pub fn empty() -> Self {
        Self {
            regions: core::array::from_fn(|_| None),
            task_regions: core::array::from_fn(|_| None),
            violations: HistoryBuffer::new(),
            check_count: 0,
            violation_count: 0,
        }
    }

    /// Install or replace a fixed region
    pub fn configure_region(&mut self, region: MemoryRegion) -> MemoryResult<()> {
        if usize::from(region.id) >= MPU_REGION_COUNT {
            return Err(MemoryError::InvalidRegion(region.id));
        }
        validate_layout(&region)?;
        let slot = self
            .regions
            .get_mut(usize::from(region.id))
            .ok_or(MemoryError::InvalidRegion(region.id))?;
        klog!(debug, "mpu", "region {} '{}' at {:#010x}+{:#x}", region.id, region.name, region.base, region.size);
        *slot = Some(region);
        Ok(())
    }

    /// Look up a region by id (fixed table or overlay)
    pub fn region(&self, id: RegionId) -> Option<&MemoryRegion> {
        let index = usize::from(id);
        if index < MPU_REGION_COUNT {
            self.regions.get(index)?.as_ref()
        } else {
            self.task_regions.get(index - MPU_REGION_COUNT)?.as_ref()
        }
    }

    fn region_mut(&mut self, id: RegionId) -> Option<&mut MemoryRegion> {
        let index = usize::from(id);
        if index < MPU_REGION_COUNT {
            self.regions.get_mut(index)?.as_mut()
        } else {
            self.task_regions.get_mut(index - MPU_REGION_COUNT)?.as_mut()
        }
    }

    /// First enabled region containing `address`
    pub fn find_region(&self, address: u32) -> Option<&MemoryRegion> {
        self.task_regions
            .iter()
            .chain(self.regions.iter())
            .flatten()
            .find(|region| region.enabled && region.contains(address))
    }

    /// Enable or disable a region
    pub fn set_region_enabled(&mut self, id: RegionId, enabled: bool) -> MemoryResult<()> {
        let region = self.region_mut(id).ok_or(MemoryError::NotFound)?;
        region.enabled = enabled;
        Ok(())
    }

    /// Decide whether `service` at `privilege` may perform `access` at `address`.
    ///
    /// Every call is counted; every denial is counted and logged.
    pub fn check_access(
        &mut self,
        address: u32,
        access: AccessFlags,
        privilege: Privilege,
        service: ServiceId,
    ) -> bool {
        self.check_count += 1;

        let reason = match self.find_region(address) {
            None => Some(ViolationReason::NoRegion),
            Some(region) if region.owner.is_some_and(|owner| owner != service) => {
                Some(ViolationReason::NotOwner { region: region.id })
            }
            Some(region) => {
                let allowed = region.permissions.for_privilege(privilege);
                if allowed.contains(access) {
                    None
                } else {
                    Some(ViolationReason::AccessDenied {
                        region: region.id,
                        allowed,
                    })
                }
            }
        };

        match reason {
            None => true,
            Some(reason) => {
                self.record_violation(Violation {
                    check: self.check_count,
                    address,
                    access,
                    service,
                    privilege,
                    reason,
                });
                false
            }
        }
    }

    fn record_violation(&mut self, violation: Violation) {
        self.violation_count += 1;
        klog!(
            warn,
            violation.service,
            "MPU violation: {} at {:#010x} ({:?})",
            violation.access,
            violation.address,
            violation.reason
        );
        self.violations.write(violation);
    }

    /// Create the owned region of `service`, RW at its privilege and above.
    ///
    /// A second allocation replaces the first.
    pub fn allocate_service_region(
        &mut self,
        service: ServiceId,
        privilege: Privilege,
        name: &str,
        base: u32,
        size: u32,
    ) -> MemoryResult<MemoryRegion> {
        let index = service.index();
        let id = RegionId::try_from(MPU_REGION_COUNT + index)
            .map_err(|_| MemoryError::InvalidRegion(u8::MAX))?;
        let mut region = MemoryRegion::new(
            id,
            name,
            base,
            size,
            kind_for(base),
            Permissions::at_least(privilege, AccessFlags::RW),
        );
        region.owner = Some(service);
        validate_layout(&region)?;

        let slot = self
            .task_regions
            .get_mut(index)
            .ok_or(MemoryError::InvalidRegion(id))?;
        *slot = Some(region.clone());
        klog!(debug, service, "owned region {:#010x}+{:#x}", base, size);
        Ok(region)
    }

    /// Drop the owned region of `service`
    pub fn release_service_region(&mut self, service: ServiceId) -> Option<MemoryRegion> {
        self.task_regions.get_mut(service.index())?.take()
    }

    /// Owned region of `service`
    pub fn service_region(&self, service: ServiceId) -> Option<&MemoryRegion> {
        self.task_regions.get(service.index())?.as_ref()
    }

    /// Validate that `service` can read and write the base of its owned region.
    ///
    /// Services without an owned region pass.
    pub fn validate_service_region(&mut self, service: ServiceId, privilege: Privilege) -> bool {
        match self.service_region(service).map(|region| region.base) {
            Some(base) => self.check_access(base, AccessFlags::RW, privilege, service),
            None => true,
        }
    }

    /// Up to `count` most recent violations, oldest first
    pub fn violations(&self, count: usize) -> Vec<Violation> {
        let skip = self.violations.len().saturating_sub(count);
        self.violations.oldest_ordered().skip(skip).copied().collect()
    }

    /// Empty the violation log (counters are kept)
    pub fn clear_violations(&mut self) {
        self.violations.clear();
    }

    /// Fixed regions in id order
    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().flatten()
    }

    /// Access checks performed
    pub const fn check_count(&self) -> u64 {
        self.check_count
    }

    /// Denied accesses
    pub const fn violation_count(&self) -> u64 {
        self.violation_count
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MpuStats {
        MpuStats {
            checks: self.check_count,
            violations: self.violation_count,
            enabled_regions: self.regions().filter(|region| region.enabled).count(),
            service_regions: self.task_regions.iter().flatten().count(),
        }
    }
}

fn validate_layout(region: &MemoryRegion) -> MemoryResult<()> {
    if region.size == 0 || region.end() > u64::from(u32::MAX) + 1 {
        return Err(MemoryError::InvalidSize);
    }
    if !region.permissions.is_monotonic() {
        return Err(MemoryError::NonMonotonicPermissions);
    }
    Ok(())
}

fn kind_for(base: u32) -> RegionKind {
    match base {
        b if b >= map::PERIPHERAL_BASE && b < map::PERIPHERAL_BASE + map::PERIPHERAL_SIZE => {
            RegionKind::Peripheral
        }
        b if b >= map::SRAM_BASE && b < map::STACKS_BASE + map::STACKS_SIZE => RegionKind::Sram,
        b if b >= map::FLASH_BASE && b < map::CONFIG_BASE + map::CONFIG_SIZE => RegionKind::Flash,
        _ => RegionKind::External,
    }
}

/// The EK3 default region table
pub fn default_regions() -> [MemoryRegion; MPU_REGION_COUNT] {
    let rx = Permissions::uniform(AccessFlags::RX);
    let rw = Permissions::uniform(AccessFlags::RW);
    let privileged_rw = Permissions::at_least(Privilege::Driver, AccessFlags::RW);
    [
        MemoryRegion::new(0, "Bootloader", map::FLASH_BASE, map::BOOTLOADER_SIZE, RegionKind::Flash, rx),
        MemoryRegion::new(1, "Application_A", map::APP_A_BASE, map::APP_SLOT_SIZE, RegionKind::Flash, rx),
        MemoryRegion::new(2, "Application_B", map::APP_B_BASE, map::APP_SLOT_SIZE, RegionKind::Flash, rx),
        MemoryRegion::new(
            3,
            "Configuration",
            map::CONFIG_BASE,
            map::CONFIG_SIZE,
            RegionKind::Flash,
            Permissions::new(AccessFlags::RW, AccessFlags::READ, AccessFlags::READ),
        ),
        MemoryRegion::new(4, "DMA_Buffers", map::SRAM_BASE, map::DMA_SIZE, RegionKind::Sram, privileged_rw),
        MemoryRegion::new(5, "Heap", map::HEAP_BASE, map::HEAP_SIZE, RegionKind::Sram, rw),
        MemoryRegion::new(6, "Stacks", map::STACKS_BASE, map::STACKS_SIZE, RegionKind::Sram, rw),
        MemoryRegion::new(
            7,
            "Peripherals",
            map::PERIPHERAL_BASE,
            map::PERIPHERAL_SIZE,
            RegionKind::Peripheral,
            privileged_rw,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SVC: ServiceId = ServiceId::THERMAL;

    #[test]
    fn default_map_is_monotonic() {
        for region in default_regions() {
            assert!(region.permissions.is_monotonic(), "{}", region.name);
        }
    }

    #[test]
    fn heap_allowed_peripherals_denied_for_services() {
        let mut mpu = Mpu::new();
        assert!(mpu.check_access(map::HEAP_BASE + 0x10, AccessFlags::RW, Privilege::Service, SVC));
        assert!(!mpu.check_access(map::PERIPHERAL_BASE + 0x10, AccessFlags::READ, Privilege::Service, SVC));
        assert!(mpu.check_access(map::PERIPHERAL_BASE + 0x10, AccessFlags::RW, Privilege::Driver, SVC));
        assert_eq!(mpu.check_count(), 3);
        assert_eq!(mpu.violation_count(), 1);
    }

    #[test]
    fn flash_is_not_writable() {
        let mut mpu = Mpu::new();
        assert!(mpu.check_access(map::APP_A_BASE, AccessFlags::RX, Privilege::Service, SVC));
        assert!(!mpu.check_access(map::APP_A_BASE, AccessFlags::WRITE, Privilege::Kernel, SVC));
        let log = mpu.violations(10);
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0].reason, ViolationReason::AccessDenied { region: 1, .. }));
    }

    #[test]
    fn unmapped_address_fails_closed() {
        let mut mpu = Mpu::new();
        assert!(!mpu.check_access(0x1000_0000, AccessFlags::READ, Privilege::Kernel, ServiceId::KERNEL));
        assert_eq!(mpu.violations(1)[0].reason, ViolationReason::NoRegion);

        let mut empty = Mpu::empty();
        assert!(!empty.check_access(map::HEAP_BASE, AccessFlags::READ, Privilege::Kernel, SVC));
    }

    #[test]
    fn disabled_region_is_skipped() {
        let mut mpu = Mpu::new();
        mpu.set_region_enabled(5, false).unwrap();
        assert!(!mpu.check_access(map::HEAP_BASE, AccessFlags::READ, Privilege::Service, SVC));
        assert_eq!(mpu.set_region_enabled(42, false), Err(MemoryError::NotFound));
    }

    #[test]
    fn configure_region_validates() {
        let mut mpu = Mpu::new();
        let bad_id = MemoryRegion::new(8, "x", 0x3000_0000, 0x100, RegionKind::External, Permissions::default());
        assert_eq!(mpu.configure_region(bad_id), Err(MemoryError::InvalidRegion(8)));

        let widening = Permissions::new(AccessFlags::READ, AccessFlags::RW, AccessFlags::empty());
        let region = MemoryRegion::new(3, "x", 0x3000_0000, 0x100, RegionKind::External, widening);
        assert_eq!(mpu.configure_region(region), Err(MemoryError::NonMonotonicPermissions));

        let region = MemoryRegion::new(3, "Scratch", 0x3000_0000, 0x100, RegionKind::External, Permissions::uniform(AccessFlags::RW));
        mpu.configure_region(region).unwrap();
        assert_eq!(mpu.region(3).map(|r| r.name.as_str()), Some("Scratch"));
    }

    #[test]
    fn owned_region_admits_only_owner() {
        let mut mpu = Mpu::new();
        let region = mpu
            .allocate_service_region(SVC, Privilege::Service, "thermal", 0x3000_0000, 0x400)
            .unwrap();
        assert_eq!(region.id, 8 + SVC.as_u8());
        assert_eq!(region.kind, RegionKind::External);

        assert!(mpu.check_access(0x3000_0010, AccessFlags::RW, Privilege::Service, SVC));
        assert!(!mpu.check_access(0x3000_0010, AccessFlags::READ, Privilege::Kernel, ServiceId::LOGGER));
        assert!(mpu.validate_service_region(SVC, Privilege::Service));

        mpu.release_service_region(SVC);
        assert!(mpu.service_region(SVC).is_none());
        assert!(!mpu.check_access(0x3000_0010, AccessFlags::READ, Privilege::Service, SVC));
    }

    #[test]
    fn owned_regions_are_classified_by_the_memory_map() {
        let mut mpu = Mpu::new();
        let kind = |mpu: &mut Mpu, id: ServiceId, base: u32| {
            mpu.allocate_service_region(id, Privilege::Service, "r", base, 0x100)
                .unwrap()
                .kind
        };
        assert_eq!(kind(&mut mpu, ServiceId::THERMAL, map::HEAP_BASE), RegionKind::Sram);
        assert_eq!(kind(&mut mpu, ServiceId::LOGGER, map::STACKS_BASE + map::STACKS_SIZE), RegionKind::External);
        assert_eq!(kind(&mut mpu, ServiceId::SWARM, map::CONFIG_BASE), RegionKind::Flash);
        assert_eq!(kind(&mut mpu, ServiceId::HEARTBEAT, map::CONFIG_BASE + map::CONFIG_SIZE), RegionKind::External);
        assert_eq!(kind(&mut mpu, ServiceId::CAN, map::PERIPHERAL_BASE), RegionKind::Peripheral);
    }

    #[test]
    fn overlay_shadows_fixed_table() {
        let mut mpu = Mpu::new();
        mpu.allocate_service_region(SVC, Privilege::Service, "thermal", map::HEAP_BASE, 0x100)
            .unwrap();
        assert!(!mpu.check_access(map::HEAP_BASE, AccessFlags::READ, Privilege::Service, ServiceId::LOGGER));
        assert!(mpu.check_access(map::HEAP_BASE + 0x100, AccessFlags::READ, Privilege::Service, ServiceId::LOGGER));
    }

    #[test]
    fn violation_log_is_bounded() {
        let mut mpu = Mpu::new();
        for _ in 0..(MAX_VIOLATIONS + 20) {
            mpu.check_access(0, AccessFlags::READ, Privilege::Service, SVC);
        }
        assert_eq!(mpu.violation_count(), (MAX_VIOLATIONS + 20) as u64);
        let log = mpu.violations(usize::MAX);
        assert_eq!(log.len(), MAX_VIOLATIONS);
        assert_eq!(log[0].check, 21);

        mpu.clear_violations();
        assert!(mpu.violations(10).is_empty());
        assert_eq!(mpu.stats().violations, (MAX_VIOLATIONS + 20) as u64);
    }
}
