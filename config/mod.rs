//! Configuration constants
//!
//! Interrupt priorities used by the hypervisor itself and the guest
//! physical memory layout of the emulated interrupt controller.

/// Lowest priority the hypervisor programs
pub const GIC_PRI_LOWEST: u8 = 0xf0;
/// Default priority of device interrupts
pub const GIC_PRI_IRQ: u8 = 0xa0;
/// Priority of inter-processor signals, above devices
pub const GIC_PRI_IPI: u8 = 0x90;
/// Highest priority the hypervisor programs
pub const GIC_PRI_HIGHEST: u8 = 0x80;

/// Convert an 8-bit distributor priority to the 5-bit list-register field
#[inline]
pub const fn gic_pri_to_guest(priority: u8) -> u8 {
    priority >> 3
}

/// Stage-2 page size
pub const PAGE_SIZE: u64 = 0x1000;

/// Guest distributor base (GICv2 layout)
pub const GUEST_GICD_BASE: u64 = 0x0300_1000;
/// Guest distributor size (GICv2 layout)
pub const GUEST_GICD_SIZE: u64 = 0x0000_1000;
/// Guest CPU interface base (GICv2 layout)
pub const GUEST_GICC_BASE: u64 = 0x0300_2000;
/// Guest CPU interface size: two pages
pub const GUEST_GICC_SIZE: u64 = 0x0000_2000;

/// Guest distributor base (GICv3 layout)
pub const GUEST_GICV3_GICD_BASE: u64 = 0x0300_1000;
/// Guest distributor size (GICv3 layout)
pub const GUEST_GICV3_GICD_SIZE: u64 = 0x0001_0000;
/// First redistributor frame (GICv3 layout)
pub const GUEST_GICV3_GICR0_BASE: u64 = 0x0302_0000;
/// Distance between two redistributor frames: RD_base + SGI_base
pub const GUEST_GICV3_RDIST_STRIDE: u64 = 0x0002_0000;

/// Size of the hardware distributor register frame
pub const GICD_FRAME_SIZE: u64 = 0x1000;

/// Number of VMIDs (8-bit VMID)
pub const MAX_VMID: usize = 256;

/// Maximum number of physical CPUs
pub const NR_CPUS: usize = 64;
