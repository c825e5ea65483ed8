//! GICv2 physical driver
//!
//! Drives the memory-mapped distributor (GICD), CPU interface (GICC) and
//! hypervisor interface (GICH) of a GICv2, and maps the virtual CPU
//! interface (GICV) into guests.
//!
//! Distributor accesses are serialized by a driver lock; CPU and
//! hypervisor interface accesses are banked per CPU and need none.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

use tock_registers::{register_bitfields, LocalRegisterCopy};
use volatile::VolatilePtr;

use crate::arch::arm64::cpu::{CpuId, CpuMask};
use crate::arch::arm64::interrupt::gic::{
    gicc, gicd, gich, GicHwOps, GicInfo, GicVersion, HcrFlags, LrEntry, LrState, SgiTarget,
    GIC_MAX_LINES, GIC_SPI_BASE,
};
use crate::arch::arm64::interrupt::routing::IrqTrigger;
use crate::arch::arm64::interrupt::vgic::VgicHwState;
use crate::config::{GIC_PRI_IPI, GIC_PRI_IRQ, PAGE_SIZE};
use crate::sync::IrqSpinLock;
use crate::vmm::{P2mMapper, Vm};
use crate::Result;

/// CPU interfaces a GICv2 distributor can address
pub const GICV2_MAX_CPUS: usize = 8;

register_bitfields! [u32,
    /// List register
    pub GICH_LR [
        VirtualID OFFSET(0) NUMBITS(10) [],
        PhysicalID OFFSET(10) NUMBITS(10) [],
        Priority OFFSET(23) NUMBITS(5) [],
        State OFFSET(28) NUMBITS(2) [
            Invalid = 0,
            Pending = 1,
            Active = 2,
            PendingActive = 3
        ],
        Grp1 OFFSET(30) NUMBITS(1) [],
        HW OFFSET(31) NUMBITS(1) []
    ],
    /// VGIC Type Register
    pub GICH_VTR [
        ListRegs OFFSET(0) NUMBITS(6) [],
        PREbits OFFSET(23) NUMBITS(3) [],
        PRIbits OFFSET(29) NUMBITS(3) []
    ],
    /// Virtual Machine Control Register
    pub GICH_VMCR [
        VMGrp0En OFFSET(0) NUMBITS(1) [],
        VEM OFFSET(9) NUMBITS(1) [],
        VMPriMask OFFSET(27) NUMBITS(5) []
    ]
];

/// Pack `entry` into the GICH_LR layout
pub fn encode_lr(entry: &LrEntry) -> u32 {
    let mut lr = LocalRegisterCopy::<u32, GICH_LR::Register>::new(0);
    lr.modify(
        GICH_LR::VirtualID.val(entry.virq)
            + GICH_LR::Priority.val(entry.priority as u32)
            + GICH_LR::State.val(entry.state.bits() as u32)
            + GICH_LR::Grp1.val(entry.grp1 as u32),
    );
    if entry.hw_status {
        lr.modify(GICH_LR::HW::SET + GICH_LR::PhysicalID.val(entry.pirq));
    }
    lr.get()
}

/// Unpack a GICH_LR value
pub fn decode_lr(value: u32) -> LrEntry {
    let lr = LocalRegisterCopy::<u32, GICH_LR::Register>::new(value);
    let hw_status = lr.is_set(GICH_LR::HW);
    LrEntry {
        pirq: if hw_status { lr.read(GICH_LR::PhysicalID) } else { 0 },
        virq: lr.read(GICH_LR::VirtualID),
        priority: lr.read(GICH_LR::Priority) as u8,
        state: LrState::from_bits_truncate(lr.read(GICH_LR::State) as u8),
        hw_status,
        grp1: lr.is_set(GICH_LR::Grp1),
    }
}

/// One mapped register frame
#[derive(Debug, Clone, Copy)]
struct MmioFrame {
    base: usize,
}

impl MmioFrame {
    const fn new(base: usize) -> Self {
        Self { base }
    }

    fn ptr<T>(&self, offset: u32) -> VolatilePtr<'static, T> {
        let addr = (self.base + offset as usize) as *mut T;
        // SAFETY: the frame was mapped as device memory for the lifetime
        // of the driver, see `GicV2::new`.
        unsafe { VolatilePtr::new(NonNull::new_unchecked(addr)) }
    }

    #[inline]
    fn read(&self, offset: u32) -> u32 {
        self.ptr::<u32>(offset).read()
    }

    #[inline]
    fn write(&self, offset: u32, value: u32) {
        self.ptr::<u32>(offset).write(value)
    }

    #[inline]
    fn write_u8(&self, offset: u32, value: u8) {
        self.ptr::<u8>(offset).write(value)
    }
}

/// Mapped virtual addresses of the hypervisor-visible frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GicV2Frames {
    pub dist: usize,
    /// Two pages: GICC_DIR lives in the second one
    pub cpu: usize,
    pub hyp: usize,
}

/// Probed GICv2 resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GicV2Config {
    pub frames: GicV2Frames,
    /// Physical distributor base
    pub dbase: u64,
    /// Physical CPU interface base
    pub cbase: u64,
    /// Physical virtual CPU interface base
    pub vbase: u64,
    pub maintenance_irq: u32,
    /// The second GICV page is aliased at 64K rather than 4K
    pub stride_64k: bool,
}

/// GICv2 driver
pub struct GicV2 {
    info: GicInfo,
    dist: MmioFrame,
    cpu: MmioFrame,
    hyp: MmioFrame,
    vbase: u64,
    stride_64k: bool,
    /// GIC CPU-interface bit of each logical CPU
    cpu_ids: [AtomicU8; GICV2_MAX_CPUS],
    lock: IrqSpinLock<()>,
}

impl GicV2 {
    /// Create the driver and read the controller geometry
    ///
    /// # Safety
    ///
    /// `config.frames` must map the GICv2 distributor, CPU interface and
    /// hypervisor interface as device memory for the rest of the program.
    pub unsafe fn new(config: &GicV2Config) -> Self {
        let dist = MmioFrame::new(config.frames.dist);
        let hyp = MmioFrame::new(config.frames.hyp);

        let typer = dist.read(gicd::TYPER);
        let nr_lines = (32 * ((typer & gicd::TYPER_LINES) + 1)).min(GIC_MAX_LINES);
        let vtr = LocalRegisterCopy::<u32, GICH_VTR::Register>::new(hyp.read(gich::VTR));
        let nr_lrs = vtr.read(GICH_VTR::ListRegs) as usize + 1;

        Self {
            info: GicInfo {
                version: GicVersion::V2,
                nr_lines,
                nr_lrs,
                maintenance_irq: config.maintenance_irq,
                dbase: config.dbase,
                cbase: config.cbase,
            },
            dist,
            cpu: MmioFrame::new(config.frames.cpu),
            hyp,
            vbase: config.vbase,
            stride_64k: config.stride_64k,
            cpu_ids: core::array::from_fn(|_| AtomicU8::new(0)),
            lock: IrqSpinLock::new(()),
        }
    }

    /// Boot-CPU initialization of all three interfaces
    pub fn init(&self) {
        log::info!(
            "GICv2: {} lines, {} LRs, dist {:#x} cpu {:#x} vcpu {:#x} maintenance IRQ{}",
            self.info.nr_lines,
            self.info.nr_lrs,
            self.info.dbase,
            self.info.cbase,
            self.vbase,
            self.info.maintenance_irq
        );

        let _guard = self.lock.lock();
        self.dist_init();
        self.cpu_init(0);
        self.hyp_init();
    }

    fn dist_init(&self) {
        let typer = self.dist.read(gicd::TYPER);
        let nr_cpus = 1 + ((typer >> gicd::TYPER_CPUS_SHIFT) & 0x7);
        let nr_lines = self.info.nr_lines;
        log::info!("GICv2: {} lines, {} cpu interfaces", nr_lines, nr_cpus);

        self.dist.write(gicd::CTLR, 0);

        let mut cpumask = self.dist.read(gicd::ITARGETSR) & 0xff;
        cpumask |= cpumask << 8;
        cpumask |= cpumask << 16;

        // SPIs start level-triggered, disabled and routed to this CPU
        for irq in (GIC_SPI_BASE..nr_lines).step_by(16) {
            self.dist.write(gicd::ICFGR + (irq / 16) * 4, 0);
        }
        for irq in (GIC_SPI_BASE..nr_lines).step_by(4) {
            self.dist.write(gicd::ITARGETSR + irq, cpumask);
            self.dist
                .write(gicd::IPRIORITYR + irq, GIC_PRI_IRQ as u32 * 0x0101_0101);
        }
        for irq in (GIC_SPI_BASE..nr_lines).step_by(32) {
            self.dist.write(gicd::ICENABLER + (irq / 32) * 4, !0);
        }

        self.dist.write(gicd::CTLR, gicd::CTLR_ENABLE);
    }

    fn cpu_init(&self, cpu: CpuId) {
        assert!(cpu < GICV2_MAX_CPUS, "GICv2 supports at most {} CPUs", GICV2_MAX_CPUS);
        let id = (self.dist.read(gicd::ITARGETSR) & 0xff) as u8;
        self.cpu_ids[cpu].store(id, Ordering::Relaxed);

        // PPIs off, SGIs on
        self.dist.write(gicd::ICENABLER, 0xffff_0000);
        self.dist.write(gicd::ISENABLER, 0x0000_ffff);

        for irq in (0..16).step_by(4) {
            self.dist
                .write(gicd::IPRIORITYR + irq, GIC_PRI_IPI as u32 * 0x0101_0101);
        }
        for irq in (16..32).step_by(4) {
            self.dist
                .write(gicd::IPRIORITYR + irq, GIC_PRI_IRQ as u32 * 0x0101_0101);
        }

        self.cpu.write(gicc::PMR, 0xff);
        self.cpu.write(gicc::BPR, 0);
        self.cpu.write(gicc::CTLR, gicc::CTL_ENABLE | gicc::CTL_EOI);
    }

    fn hyp_init(&self) {
        self.hyp.write(gich::HCR, 0);
        for lr in 0..self.info.nr_lrs {
            self.hyp.write(gich::LR0 + lr as u32 * 4, 0);
        }
    }

    /// Distributor target mask of the logical CPUs in `mask`
    fn cpu_mask(&self, mask: CpuMask) -> u32 {
        mask.iter().fold(0, |acc, cpu| {
            assert!(cpu < GICV2_MAX_CPUS, "GICv2 supports at most {} CPUs", GICV2_MAX_CPUS);
            acc | self.cpu_ids[cpu].load(Ordering::Relaxed) as u32
        })
    }

    fn lr_offset(&self, lr: usize) -> u32 {
        assert!(lr < self.info.nr_lrs, "LR{} not implemented", lr);
        gich::LR0 + lr as u32 * 4
    }
}

impl GicHwOps for GicV2 {
    fn info(&self) -> &GicInfo {
        &self.info
    }

    fn secondary_init(&self, cpu: CpuId) {
        let _guard = self.lock.lock();
        self.cpu_init(cpu);
        self.hyp_init();
    }

    fn save_state(&self, hw: &mut VgicHwState) {
        for lr in 0..self.info.nr_lrs {
            hw.v2.lr[lr] = self.hyp.read(self.lr_offset(lr));
        }
        hw.v2.apr = self.hyp.read(gich::APR);
        hw.v2.vmcr = self.hyp.read(gich::VMCR);
        self.hyp.write(gich::HCR, 0);
    }

    fn restore_state(&self, hw: &VgicHwState) {
        for lr in 0..self.info.nr_lrs {
            self.hyp.write(self.lr_offset(lr), hw.v2.lr[lr]);
        }
        self.hyp.write(gich::APR, hw.v2.apr);
        self.hyp.write(gich::VMCR, hw.v2.vmcr);
        self.hyp.write(gich::HCR, HcrFlags::EN.bits());
    }

    fn dump_state(&self, saved: Option<&VgicHwState>) {
        for lr in 0..self.info.nr_lrs {
            let value = match saved {
                Some(hw) => hw.v2.lr[lr],
                None => self.hyp.read(self.lr_offset(lr)),
            };
            log::info!("   HW_LR[{}]={:#010x}", lr, value);
        }
    }

    fn gicv_setup(&self, vm: &Vm, mapper: &dyn P2mMapper) -> Result<()> {
        let cbase = vm.vgic().cbase();
        mapper.map_mmio_regions(vm.vmid(), cbase, cbase + PAGE_SIZE, self.vbase)?;

        // The guest always sees the second page at +4K.
        let second = if self.stride_64k {
            self.vbase + 16 * PAGE_SIZE
        } else {
            self.vbase + PAGE_SIZE
        };
        mapper.map_mmio_regions(vm.vmid(), cbase + PAGE_SIZE, cbase + 2 * PAGE_SIZE, second)
    }

    fn send_sgi(&self, sgi: u32, target: SgiTarget) {
        let value = match target {
            SgiTarget::List(mask) => {
                gicd::SGI_TARGET_LIST | (self.cpu_mask(mask) << gicd::SGI_TARGET_SHIFT) | sgi
            }
            SgiTarget::Others => gicd::SGI_TARGET_OTHERS | sgi,
            SgiTarget::SelfCpu => gicd::SGI_TARGET_SELF | sgi,
        };
        self.dist.write(gicd::SGIR, value);
    }

    fn disable_interface(&self) {
        let _guard = self.lock.lock();
        self.cpu.write(gicc::CTLR, 0);
        self.hyp.write(gich::HCR, 0);
    }

    fn read_irq(&self) -> u32 {
        self.cpu.read(gicc::IAR) & gicc::IA_IRQ
    }

    fn eoi_irq(&self, irq: u32) {
        self.cpu.write(gicc::EOIR, irq);
    }

    fn deactivate_irq(&self, irq: u32) {
        self.cpu.write(gicc::DIR, irq);
    }

    fn irq_enable(&self, irq: u32) {
        let _guard = self.lock.lock();
        self.dist
            .write(gicd::ISENABLER + (irq / 32) * 4, 1 << (irq % 32));
    }

    fn irq_disable(&self, irq: u32) {
        let _guard = self.lock.lock();
        self.dist
            .write(gicd::ICENABLER + (irq / 32) * 4, 1 << (irq % 32));
    }

    fn set_irq_properties(&self, irq: u32, trigger: IrqTrigger, cpu_mask: CpuMask, priority: u8) {
        assert!(irq < self.info.nr_lines, "IRQ{} beyond distributor", irq);
        let _guard = self.lock.lock();

        let offset = gicd::ICFGR + (irq / 16) * 4;
        let cfg = self.dist.read(offset);
        let edge = gicd::icfgr_edge_bit(irq);
        let wanted = match trigger {
            IrqTrigger::Edge => cfg | edge,
            IrqTrigger::Level => cfg & !edge,
        };
        self.dist.write(offset, wanted);
        // Some lines have a fixed configuration.
        if self.dist.read(offset) != wanted {
            log::warn!("GICv2: failed to configure IRQ{} as {:?}", irq, trigger);
        }

        self.dist
            .write_u8(gicd::ITARGETSR + irq, self.cpu_mask(cpu_mask) as u8);
        self.dist.write_u8(gicd::IPRIORITYR + irq, priority);
    }

    fn read_lr(&self, lr: usize) -> LrEntry {
        decode_lr(self.hyp.read(self.lr_offset(lr)))
    }

    fn write_lr(&self, lr: usize, entry: &LrEntry) {
        self.hyp.write(self.lr_offset(lr), encode_lr(entry));
    }

    fn clear_lr(&self, lr: usize) {
        self.hyp.write(self.lr_offset(lr), 0);
    }

    fn update_hcr_status(&self, flag: HcrFlags, set: bool) {
        let hcr = self.hyp.read(gich::HCR);
        let hcr = if set { hcr | flag.bits() } else { hcr & !flag.bits() };
        self.hyp.write(gich::HCR, hcr);
    }

    fn read_vmcr_priority(&self) -> u32 {
        let vmcr = LocalRegisterCopy::<u32, GICH_VMCR::Register>::new(self.hyp.read(gich::VMCR));
        vmcr.read(GICH_VMCR::VMPriMask)
    }

    fn read_apr(&self, reg: usize) -> u32 {
        assert_eq!(reg, 0, "GICv2 has a single active priorities register");
        self.hyp.read(gich::APR)
    }
}
