//! GIC (Generic Interrupt Controller) hardware abstraction
//!
//! Register offsets shared by the physical driver and the MMIO emulation,
//! the hardware-operations contract every physical controller driver
//! implements, and the process-wide [`GicContext`] that owns the per-CPU
//! list-register occupancy masks.
//!
//! Reference: ARM IHI 0048B (GICv2), ARM IHI 0069 (GICv3)

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::arm64::cpu::{dsb, isb, local_irq_is_enabled, CpuId, CpuMask};
use crate::arch::arm64::interrupt::routing::{GuestIrqType, HostIrqType, IrqTrigger};
use crate::arch::arm64::interrupt::vgic::VgicHwState;
use crate::utils::bitmap::{find_next_bit, low_mask};
use crate::vmm::{P2mMapper, Vcpu, Vm};
use crate::Result;

/// Maximum number of list registers tracked per CPU
pub const VGIC_MAX_LRS: usize = 64;

/// Number of SGIs
pub const NR_GIC_SGI: u32 = 16;

/// First SPI
pub const GIC_SPI_BASE: u32 = 32;

/// Largest number of interrupt lines a GICv2 distributor can expose
pub const GIC_MAX_LINES: u32 = 1020;

/// First special interrupt ID (1020..=1023)
pub const GIC_SPECIAL_IRQ: u32 = 1020;

/// Spurious interrupt ID read from IAR
pub const GIC_SPURIOUS_IRQ: u32 = 1023;

/// GIC version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    /// GICv2
    V2,
    /// GICv3
    V3,
}

/// GIC Distributor register offsets
pub mod gicd {
    /// GICD_CTLR - Distributor Control Register
    pub const CTLR: u32 = 0x000;
    /// GICD_TYPER - Distributor Type Register
    pub const TYPER: u32 = 0x004;
    /// GICD_IIDR - Distributor Implementer ID Register
    pub const IIDR: u32 = 0x008;
    /// GICD_STATUSR - Error Reporting Status Register (GICv3)
    pub const STATUSR: u32 = 0x010;
    /// GICD_SETSPI_NSR - Set SPI Register (GICv3)
    pub const SETSPI_NSR: u32 = 0x040;
    /// GICD_CLRSPI_SR - Clear SPI Secure Register (GICv3)
    pub const CLRSPI_SR: u32 = 0x058;
    /// GICD_IGROUPR - Interrupt Group Registers
    pub const IGROUPR: u32 = 0x080;
    pub const IGROUPRN: u32 = 0x0FC;
    /// GICD_ISENABLER - Interrupt Set-Enable Registers
    pub const ISENABLER: u32 = 0x100;
    pub const ISENABLERN: u32 = 0x17C;
    /// GICD_ICENABLER - Interrupt Clear-Enable Registers
    pub const ICENABLER: u32 = 0x180;
    pub const ICENABLERN: u32 = 0x1FC;
    /// GICD_ISPENDR - Interrupt Set-Pending Registers
    pub const ISPENDR: u32 = 0x200;
    pub const ISPENDRN: u32 = 0x27C;
    /// GICD_ICPENDR - Interrupt Clear-Pending Registers
    pub const ICPENDR: u32 = 0x280;
    pub const ICPENDRN: u32 = 0x2FC;
    /// GICD_ISACTIVER - Interrupt Set-Active Registers
    pub const ISACTIVER: u32 = 0x300;
    pub const ISACTIVERN: u32 = 0x37C;
    /// GICD_ICACTIVER - Interrupt Clear-Active Registers
    pub const ICACTIVER: u32 = 0x380;
    pub const ICACTIVERN: u32 = 0x3FC;
    /// GICD_IPRIORITYR - Interrupt Priority Registers
    pub const IPRIORITYR: u32 = 0x400;
    pub const IPRIORITYRN: u32 = 0x7F8;
    /// GICD_ITARGETSR - Interrupt Processor Targets Registers
    pub const ITARGETSR: u32 = 0x800;
    /// Last banked (SGI/PPI) target register
    pub const ITARGETSR7: u32 = 0x81C;
    pub const ITARGETSR8: u32 = 0x820;
    pub const ITARGETSRN: u32 = 0xBF8;
    /// GICD_ICFGR - Interrupt Configuration Registers
    pub const ICFGR: u32 = 0xC00;
    pub const ICFGR1: u32 = 0xC04;
    pub const ICFGR2: u32 = 0xC08;
    pub const ICFGRN: u32 = 0xCFC;
    /// GICD_IGRPMODR - Interrupt Group Modifier Registers (GICv3)
    pub const IGRPMODR: u32 = 0xD00;
    pub const IGRPMODRN: u32 = 0xD7C;
    /// GICD_NSACR - Non-secure Access Control Registers
    pub const NSACR: u32 = 0xE00;
    pub const NSACRN: u32 = 0xEFC;
    /// GICD_SGIR - Software Generated Interrupt Register
    pub const SGIR: u32 = 0xF00;
    /// GICD_CPENDSGIR - SGI Clear-Pending Registers
    pub const CPENDSGIR: u32 = 0xF10;
    pub const CPENDSGIRN: u32 = 0xF1C;
    /// GICD_SPENDSGIR - SGI Set-Pending Registers
    pub const SPENDSGIR: u32 = 0xF20;
    pub const SPENDSGIRN: u32 = 0xF2C;
    /// GICD_ICPIDR2 - Peripheral ID2 Register (GICv2)
    pub const ICPIDR2: u32 = 0xFE8;
    /// GICD_IROUTER - Interrupt Routing Registers (GICv3)
    pub const IROUTER: u32 = 0x6000;
    pub const IROUTER31: u32 = 0x60F8;
    pub const IROUTER32: u32 = 0x6100;
    pub const IROUTERN: u32 = 0x7FD8;
    /// GICD_PIDR4 - Peripheral ID4 Register (GICv3 layout)
    pub const V3_PIDR4: u32 = 0xFFD0;
    pub const V3_PIDR7: u32 = 0xFFDC;
    pub const V3_PIDR0: u32 = 0xFFE0;
    pub const V3_PIDR1: u32 = 0xFFE4;
    pub const V3_PIDR2: u32 = 0xFFE8;
    pub const V3_PIDR3: u32 = 0xFFEC;
    pub const V3_CIDR3: u32 = 0xFFFC;

    /// GICD_CTLR bit definitions
    /// Enable distributor
    pub const CTLR_ENABLE: u32 = 1 << 0;
    /// Affinity routing enable, non-secure state (GICv3)
    pub const CTLR_ARE_NS: u32 = 1 << 4;

    /// GICD_TYPER ITLinesNumber field
    pub const TYPER_LINES: u32 = 0x1f;
    /// GICD_TYPER CPUNumber shift
    pub const TYPER_CPUS_SHIFT: u32 = 5;
    /// GICD_TYPER IDbits shift (GICv3)
    pub const TYPER_ID_BITS_SHIFT: u32 = 19;

    /// GICD_SGIR TargetListFilter values
    pub const SGI_TARGET_LIST: u32 = 0 << 24;
    pub const SGI_TARGET_OTHERS: u32 = 1 << 24;
    pub const SGI_TARGET_SELF: u32 = 2 << 24;
    pub const SGI_TARGET_SHIFT: u32 = 16;

    /// GICD_ICFGR edge-triggered bit for interrupt `irq`
    #[inline]
    pub const fn icfgr_edge_bit(irq: u32) -> u32 {
        2 << ((irq % 16) * 2)
    }
}

/// GIC CPU Interface register offsets (GICv2)
pub mod gicc {
    /// GICC_CTLR - CPU Interface Control Register
    pub const CTLR: u32 = 0x00;
    /// GICC_PMR - Interrupt Priority Mask Register
    pub const PMR: u32 = 0x04;
    /// GICC_BPR - Binary Point Register
    pub const BPR: u32 = 0x08;
    /// GICC_IAR - Interrupt Acknowledge Register
    pub const IAR: u32 = 0x0C;
    /// GICC_EOIR - End of Interrupt Register
    pub const EOIR: u32 = 0x10;
    /// GICC_DIR - Deactivate Interrupt Register (second page)
    pub const DIR: u32 = 0x1000;

    /// Enable signalling of group 1 interrupts
    pub const CTL_ENABLE: u32 = 1 << 0;
    /// EOImodeNS: EOIR only drops priority, DIR deactivates
    pub const CTL_EOI: u32 = 1 << 9;
    /// IAR interrupt ID field
    pub const IA_IRQ: u32 = 0x3ff;
}

/// GIC Hypervisor Interface register offsets (GICv2)
pub mod gich {
    /// GICH_HCR - Hypervisor Control Register
    pub const HCR: u32 = 0x00;
    /// GICH_VTR - VGIC Type Register
    pub const VTR: u32 = 0x04;
    /// GICH_VMCR - Virtual Machine Control Register
    pub const VMCR: u32 = 0x08;
    /// GICH_MISR - Maintenance Interrupt Status Register
    pub const MISR: u32 = 0x10;
    /// GICH_EISR0 - End of Interrupt Status Register 0
    pub const EISR0: u32 = 0x20;
    /// GICH_ELRSR0 - Empty List Register Status Register 0
    pub const ELRSR0: u32 = 0x30;
    /// GICH_APR - Active Priorities Register
    pub const APR: u32 = 0xF0;
    /// GICH_LR0 - List Register 0
    pub const LR0: u32 = 0x100;
}

/// GIC Redistributor register offsets (GICv3)
pub mod gicr {
    /// Size of each of the two redistributor frames
    pub const FRAME_SIZE: u64 = 0x10000;
    /// Offset of the SGI_base frame from RD_base
    pub const SGI_BASE: u64 = 0x10000;

    /// GICR_CTLR - Redistributor Control Register
    pub const CTLR: u32 = 0x0000;
    /// GICR_IIDR - Implementer Identification Register
    pub const IIDR: u32 = 0x0004;
    /// GICR_TYPER - Redistributor Type Register
    pub const TYPER: u32 = 0x0008;
    /// GICR_STATUSR - Error Reporting Status Register
    pub const STATUSR: u32 = 0x0010;
    /// GICR_WAKER - Redistributor Wake Register
    pub const WAKER: u32 = 0x0014;
    /// GICR_SETLPIR - Set LPI Pending Register
    pub const SETLPIR: u32 = 0x0040;
    /// GICR_CLRLPIR - Clear LPI Pending Register
    pub const CLRLPIR: u32 = 0x0048;
    /// GICR_PROPBASER - LPI Configuration Table Base
    pub const PROPBASER: u32 = 0x0070;
    /// GICR_PENDBASER - LPI Pending Table Base
    pub const PENDBASER: u32 = 0x0078;
    /// GICR_INVLPIR - Invalidate LPI Register
    pub const INVLPIR: u32 = 0x00A0;
    /// GICR_INVALLR - Invalidate All Register
    pub const INVALLR: u32 = 0x00B0;
    /// GICR_SYNCR - Synchronize Register
    pub const SYNCR: u32 = 0x00C0;
    /// GICR_MOVLPIR - Move LPI Register
    pub const MOVLPIR: u32 = 0x0100;
    /// GICR_MOVALLR - Move All LPIs Register
    pub const MOVALLR: u32 = 0x0110;
    pub const PIDR4: u32 = 0xFFD0;
    pub const PIDR7: u32 = 0xFFDC;
    pub const PIDR0: u32 = 0xFFE0;
    pub const PIDR1: u32 = 0xFFE4;
    pub const PIDR2: u32 = 0xFFE8;
    pub const PIDR3: u32 = 0xFFEC;
    pub const CIDR3: u32 = 0xFFFC;

    /// GICR_TYPER.Last
    pub const TYPER_LAST: u64 = 1 << 4;
    /// GICR_TYPER.Processor_Number shift
    pub const TYPER_PROC_NUM_SHIFT: u32 = 8;

    /// SGI_base frame
    pub const IGROUPR0: u32 = 0x0080;
    pub const ISENABLER0: u32 = 0x0100;
    pub const ICENABLER0: u32 = 0x0180;
    pub const ISPENDR0: u32 = 0x0200;
    pub const ICPENDR0: u32 = 0x0280;
    pub const ISACTIVER0: u32 = 0x0300;
    pub const ICACTIVER0: u32 = 0x0380;
    pub const IPRIORITYR0: u32 = 0x0400;
    pub const IPRIORITYR7: u32 = 0x041C;
    pub const ICFGR0: u32 = 0x0C00;
    pub const ICFGR1: u32 = 0x0C04;
    pub const IGRPMODR0: u32 = 0x0D00;
    pub const NSACR: u32 = 0x0E00;
}

bitflags! {
    /// List-register state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LrState: u8 {
        /// Interrupt is pending
        const PENDING = 1 << 0;
        /// Interrupt is active
        const ACTIVE = 1 << 1;
    }
}

bitflags! {
    /// Hypervisor control flags toggled at run time
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcrFlags: u32 {
        /// Virtual CPU interface enable
        const EN = 1 << 0;
        /// Underflow (list registers empty or nearly so) maintenance interrupt
        const UIE = 1 << 1;
        /// List register entry not present maintenance interrupt
        const LRENPIE = 1 << 2;
        /// No pending maintenance interrupt
        const NPIE = 1 << 3;
    }
}

/// Generation-independent view of one list register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LrEntry {
    /// Physical interrupt, meaningful when `hw_status` is set
    pub pirq: u32,
    /// Virtual interrupt presented to the guest
    pub virq: u32,
    /// Priority in list-register format (upper five bits)
    pub priority: u8,
    pub state: LrState,
    /// Deactivation by the guest also deactivates `pirq`
    pub hw_status: bool,
    pub grp1: bool,
}

/// Inter-processor signals used by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Sgi {
    /// Wake the target to re-evaluate pending work
    EventCheck = 0,
    /// Dump execution state on the target
    DumpState = 1,
    /// Run a queued cross-call on the target
    CallFunction = 2,
}

impl TryFrom<u32> for Sgi {
    type Error = u32;

    fn try_from(value: u32) -> core::result::Result<Self, u32> {
        match value {
            0 => Ok(Sgi::EventCheck),
            1 => Ok(Sgi::DumpState),
            2 => Ok(Sgi::CallFunction),
            other => Err(other),
        }
    }
}

/// Target selection of an SGI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgiTarget {
    /// Explicit set of logical CPUs
    List(CpuMask),
    /// Every CPU but the sender
    Others,
    /// The sender only
    SelfCpu,
}

/// Properties of the probed physical controller
#[derive(Debug, Clone, Copy)]
pub struct GicInfo {
    pub version: GicVersion,
    /// Number of interrupt lines, including SGIs and PPIs
    pub nr_lines: u32,
    /// Implemented list registers
    pub nr_lrs: usize,
    /// Maintenance interrupt (a PPI)
    pub maintenance_irq: u32,
    /// Physical distributor base
    pub dbase: u64,
    /// Physical CPU interface base
    pub cbase: u64,
}

/// Operations a physical GIC driver provides to the generic code
///
/// Exactly one implementation is registered at boot. Run-time operations
/// assume an initialized controller and check misuse with assertions.
pub trait GicHwOps: Send + Sync {
    /// Properties discovered at probe time
    fn info(&self) -> &GicInfo;

    /// Bring up the CPU and hypervisor interfaces of a secondary CPU
    fn secondary_init(&self, cpu: CpuId);

    /// Save the virtual CPU interface into `hw` and disable it.
    /// Local IRQs must be masked.
    fn save_state(&self, hw: &mut VgicHwState);

    /// Load `hw` into the virtual CPU interface and enable it.
    /// Local IRQs must be masked.
    fn restore_state(&self, hw: &VgicHwState);

    /// Log list registers, live ones when `saved` is `None`
    fn dump_state(&self, saved: Option<&VgicHwState>);

    /// Map the virtual CPU interface into the guest at its CPU interface base
    fn gicv_setup(&self, vm: &Vm, mapper: &dyn P2mMapper) -> Result<()>;

    /// Send SGI `sgi` to the CPUs selected by `target`
    fn send_sgi(&self, sgi: u32, target: SgiTarget);

    /// Disable the CPU interface of the calling CPU
    fn disable_interface(&self);

    /// Acknowledge the highest priority pending interrupt
    fn read_irq(&self) -> u32;

    /// Priority drop
    fn eoi_irq(&self, irq: u32);

    /// Deactivation
    fn deactivate_irq(&self, irq: u32);

    fn irq_enable(&self, irq: u32);

    fn irq_disable(&self, irq: u32);

    /// Program trigger, CPU targets and priority of a line
    fn set_irq_properties(&self, irq: u32, trigger: IrqTrigger, cpu_mask: CpuMask, priority: u8);

    fn read_lr(&self, lr: usize) -> LrEntry;

    fn write_lr(&self, lr: usize, entry: &LrEntry);

    fn clear_lr(&self, lr: usize);

    /// Set or clear one hypervisor control flag
    fn update_hcr_status(&self, flag: HcrFlags, set: bool);

    /// Guest priority mask from the virtual machine control register
    fn read_vmcr_priority(&self) -> u32;

    /// Active priorities register `reg`
    fn read_apr(&self, reg: usize) -> u32;
}

/// Per-CPU hardware bookkeeping
struct PerCpuGic {
    /// Occupied list registers
    lr_mask: AtomicU64,
}

/// Process-wide interrupt controller state
///
/// Holds the registered hardware operations, the per-CPU list-register
/// occupancy masks and the two interrupt-type tables handed to the IRQ
/// descriptor framework.
pub struct GicContext {
    ops: &'static dyn GicHwOps,
    percpu: Vec<PerCpuGic>,
    online: AtomicU64,
    pub(crate) host_irq_type: HostIrqType,
    pub(crate) guest_irq_type: GuestIrqType,
}

impl GicContext {
    /// Create the context for `nr_cpus` CPUs; CPU 0 is the boot CPU
    pub fn new(ops: &'static dyn GicHwOps, nr_cpus: usize) -> Self {
        assert!(nr_cpus > 0 && nr_cpus <= crate::config::NR_CPUS);
        assert!(ops.info().nr_lrs > 0 && ops.info().nr_lrs <= VGIC_MAX_LRS);

        let percpu = (0..nr_cpus)
            .map(|_| PerCpuGic {
                lr_mask: AtomicU64::new(0),
            })
            .collect();

        Self {
            ops,
            percpu,
            online: AtomicU64::new(CpuMask::of(0).bits()),
            host_irq_type: HostIrqType::new(ops),
            guest_irq_type: GuestIrqType::new(ops),
        }
    }

    pub fn ops(&self) -> &'static dyn GicHwOps {
        self.ops
    }

    pub fn nr_lrs(&self) -> usize {
        self.ops.info().nr_lrs
    }

    pub fn nr_lines(&self) -> u32 {
        self.ops.info().nr_lines
    }

    pub fn nr_cpus(&self) -> usize {
        self.percpu.len()
    }

    pub fn possible_cpus(&self) -> CpuMask {
        CpuMask::first(self.nr_cpus())
    }

    pub fn online_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.online.load(Ordering::Acquire))
    }

    /// Bring up the controller interfaces of secondary CPU `cpu`
    pub fn init_secondary_cpu(&self, cpu: CpuId) {
        assert!(cpu < self.nr_cpus());
        self.percpu[cpu].lr_mask.store(0, Ordering::Relaxed);
        self.ops.secondary_init(cpu);
        self.online.fetch_or(CpuMask::of(cpu).bits(), Ordering::AcqRel);
        log::info!("GIC: CPU{} interface initialized", cpu);
    }

    /// Shut down the CPU interface of the calling CPU
    pub fn disable_cpu(&self, cpu: CpuId) {
        debug_assert!(!local_irq_is_enabled());
        self.online.fetch_and(!CpuMask::of(cpu).bits(), Ordering::AcqRel);
        self.ops.disable_interface();
    }

    pub(crate) fn lr_mask(&self, cpu: CpuId) -> u64 {
        self.percpu[cpu].lr_mask.load(Ordering::Relaxed)
    }

    pub(crate) fn set_lr_mask(&self, cpu: CpuId, mask: u64) {
        self.percpu[cpu].lr_mask.store(mask, Ordering::Relaxed);
    }

    pub(crate) fn set_lr_bit(&self, cpu: CpuId, lr: usize) {
        self.percpu[cpu].lr_mask.fetch_or(1 << lr, Ordering::Relaxed);
    }

    pub(crate) fn clear_lr_bit(&self, cpu: CpuId, lr: usize) {
        self.percpu[cpu].lr_mask.fetch_and(!(1 << lr), Ordering::Relaxed);
    }

    /// Every implemented list register on `cpu` is occupied
    pub fn lr_all_full(&self, cpu: CpuId) -> bool {
        let full = low_mask(self.nr_lrs());
        self.lr_mask(cpu) & full == full
    }

    /// Number of occupied list registers on `cpu`
    pub fn lr_used(&self, cpu: CpuId) -> usize {
        self.lr_mask(cpu).count_ones() as usize
    }

    /// Send `sgi` to the online CPUs in `mask`
    pub fn send_sgi_mask(&self, mask: CpuMask, sgi: Sgi) {
        let online = mask.and(self.online_cpus());
        dsb();
        self.ops.send_sgi(sgi as u32, SgiTarget::List(online));
    }

    pub fn send_sgi_one(&self, cpu: CpuId, sgi: Sgi) {
        self.send_sgi_mask(CpuMask::of(cpu), sgi);
    }

    pub fn send_sgi_self(&self, sgi: Sgi) {
        dsb();
        self.ops.send_sgi(sgi as u32, SgiTarget::SelfCpu);
    }

    pub fn send_sgi_allbutself(&self, sgi: Sgi) {
        dsb();
        self.ops.send_sgi(sgi as u32, SgiTarget::Others);
    }

    /// Send an inter-processor signal
    ///
    /// `sgi` must be one of the reserved signal numbers below 16.
    pub fn send_signal(&self, target: SgiTarget, sgi: u32) {
        assert!(sgi < NR_GIC_SGI, "SGI {} out of range", sgi);
        dsb();
        let target = match target {
            SgiTarget::List(mask) => SgiTarget::List(mask.and(self.online_cpus())),
            other => other,
        };
        self.ops.send_sgi(sgi, target);
    }

    /// Save the hardware context of `vcpu`, descheduled from `cpu`
    pub fn save_state(&self, cpu: CpuId, vcpu: &Vcpu) {
        debug_assert!(!local_irq_is_enabled());

        let mut arch = vcpu.gic_state();
        arch.lr_mask = self.lr_mask(cpu);
        self.ops.save_state(&mut arch.hw);
        isb();
    }

    /// Restore the hardware context of `vcpu` on `cpu` and refill the
    /// list registers from its LR-pending list
    pub fn restore_state(&self, cpu: CpuId, vcpu: &Vcpu) {
        debug_assert!(!local_irq_is_enabled());

        {
            let arch = vcpu.gic_state();
            self.set_lr_mask(cpu, arch.lr_mask);
            self.ops.restore_state(&arch.hw);
        }
        isb();

        self.restore_pending_irqs(cpu, vcpu);
    }

    /// Log the list-register state of `vcpu`
    pub fn dump_state(&self, cpu: CpuId, vcpu: &Vcpu) {
        if vcpu.is_running_on(cpu) {
            self.ops.dump_state(None);
        } else {
            let arch = vcpu.gic_state();
            log::info!("    GICH_LRs (vcpu {}) mask={:#x}", vcpu.id(), arch.lr_mask);
            self.ops.dump_state(Some(&arch.hw));
        }
    }

    /// First set bit of `mask` at or after `start`, bounded by the LR count
    pub(crate) fn next_used_lr(&self, mask: u64, start: usize) -> usize {
        find_next_bit(mask, self.nr_lrs(), start)
    }
}

static GIC: spin::Once<GicContext> = spin::Once::new();

/// Register the probed hardware operations; may happen only once
pub fn register_gic_ops(ops: &'static dyn GicHwOps, nr_cpus: usize) -> &'static GicContext {
    assert!(!GIC.is_completed(), "GIC hardware operations registered twice");
    GIC.call_once(|| GicContext::new(ops, nr_cpus))
}

/// Get the global GIC context
pub fn get() -> Option<&'static GicContext> {
    GIC.get()
}

/// Get the global GIC context, panicking before boot registration
pub fn get_expect() -> &'static GicContext {
    GIC.get().expect("GIC not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::mock::MockGic;

    #[test]
    fn test_sgi_from_u32() {
        assert_eq!(Sgi::try_from(0), Ok(Sgi::EventCheck));
        assert_eq!(Sgi::try_from(2), Ok(Sgi::CallFunction));
        assert_eq!(Sgi::try_from(9), Err(9));
    }

    #[test]
    fn test_lr_mask_tracking() {
        let (_, gic) = MockGic::context(4, 64, 2);
        assert!(!gic.lr_all_full(0));
        for lr in 0..4 {
            gic.set_lr_bit(0, lr);
        }
        assert!(gic.lr_all_full(0));
        assert!(!gic.lr_all_full(1));
        gic.clear_lr_bit(0, 2);
        assert_eq!(gic.lr_used(0), 3);
        assert_eq!(gic.next_used_lr(gic.lr_mask(0), 2), 3);
    }

    #[test]
    fn test_send_signal_filters_offline_cpus() {
        let (mock, gic) = MockGic::context(4, 64, 4);
        gic.init_secondary_cpu(2);
        gic.send_signal(SgiTarget::List(CpuMask::from_bits(0b1110)), Sgi::DumpState as u32);
        gic.send_sgi_allbutself(Sgi::EventCheck);
        let sent = mock.state().sgis.clone();
        assert_eq!(
            sent,
            [
                (1, SgiTarget::List(CpuMask::from_bits(0b0100))),
                (0, SgiTarget::Others),
            ]
        );
        assert_eq!(mock.state().secondary_inits, [2]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_send_signal_rejects_high_ids() {
        let (_, gic) = MockGic::context(4, 64, 1);
        gic.send_signal(SgiTarget::SelfCpu, 16);
    }
}
