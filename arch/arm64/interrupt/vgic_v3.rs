//! GICv3 distributor and redistributor emulation
//!
//! The distributor frame is 64K wide and routes SPIs by affinity. Every
//! VCPU owns one redistributor of `rdist_stride` bytes: an RD_base frame
//! followed by an SGI_base frame holding the banked SGI/PPI registers.
//! Offsets the SGI frame shares with the distributor go through one
//! common handler. LPIs are not implemented.

use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::arch::arm64::cpu::CpuId;
use crate::arch::arm64::interrupt::gic::{gicd, gicr};
use crate::arch::arm64::interrupt::mmio::{
    read_as_zero, read_as_zero_64, write_ignore, write_ignore_64, AccessSize, MmioAccess,
    MmioFault, MmioResult,
};
use crate::arch::arm64::interrupt::rank::{rank_index, IRQS_PER_RANK};
use crate::arch::arm64::interrupt::vdist;
use crate::arch::arm64::interrupt::vgic::SgiMode;
use crate::vmm::vcpu::MPIDR_AFF_MASK;
use crate::vmm::{Vcpu, Vm};

/// Implementer ARM (JEP106 0x43b)
const VGIC_V3_IIDR: u32 = 0x0000_043b;

const GICD_PIDR0: u32 = 0x92;
const GICR_PIDR0: u32 = 0x93;
const GIC_PIDR1: u32 = 0xb4;
/// Architecture revision 3
const GIC_PIDR2: u32 = 0x3b;
const GIC_PIDR4: u32 = 0x04;

/// 10 interrupt ID bits
const TYPER_ID_BITS: u32 = 9;

/// Interrupt Routing Mode: any participating PE
const IROUTER_IRM: u64 = 1 << 31;

const ISPENDR_END: u32 = gicd::ISPENDRN + 3;
const ICPENDR_END: u32 = gicd::ICPENDRN + 3;
const IPRIORITYR_END: u32 = gicd::IPRIORITYRN + 3;
const ITARGETSR_END: u32 = gicd::ITARGETSRN + 3;
const ICFGR0_END: u32 = gicd::ICFGR + 3;
const IROUTER31_END: u32 = gicd::IROUTER31 + 7;
const IROUTER_END: u32 = gicd::IROUTERN + 7;
const GICR_IPRIORITYR7_END: u32 = gicr::IPRIORITYR7 + 3;
const GICR_ICFGR1_END: u32 = gicr::ICFGR1 + 3;

register_bitfields! [u64,
    /// ICC_SGI1R_EL1, Group 1 SGI generation
    ICC_SGI1R [
        TargetList OFFSET(0) NUMBITS(16) [],
        Aff1 OFFSET(16) NUMBITS(8) [],
        INTID OFFSET(24) NUMBITS(4) [],
        Aff2 OFFSET(32) NUMBITS(8) [],
        IRM OFFSET(40) NUMBITS(1) [],
        Aff3 OFFSET(48) NUMBITS(8) []
    ]
];

fn typer(vm: &Vm) -> u32 {
    let cpus = ((vm.nr_vcpus() as u32 - 1) << gicd::TYPER_CPUS_SHIFT) & (0x7 << gicd::TYPER_CPUS_SHIFT);
    let lines = (vm.vgic().nr_lines() / 32 - 1) & gicd::TYPER_LINES;
    (TYPER_ID_BITS << gicd::TYPER_ID_BITS_SHIFT) | cpus | lines
}

/// Redistributor covering `gpa`: its VCPU and the offset within it
fn redistributor<'a>(vm: &'a Vm, gpa: u64) -> Option<(&'a Vcpu, u32)> {
    let layout = vm.vgic().layout();
    let off = gpa.checked_sub(layout.rbase)?;
    let index = off.checked_div(layout.rdist_stride)?;
    let v = vm.vcpu(index as usize)?;
    Some((v, (off % layout.rdist_stride) as u32))
}

/// Emulate a guest load from the distributor or a redistributor
pub(crate) fn mmio_read(vm: &Vm, v: &Vcpu, info: &MmioAccess) -> MmioResult<u64> {
    if vm.vgic().in_distributor(info.gpa) {
        let offset = (info.gpa - vm.vgic().dbase()) as u32;
        return dist_read(vm, v, info, offset);
    }

    let (target, offset) = redistributor(vm, info.gpa).ok_or(MmioFault::Unhandled)?;
    match offset as u64 {
        off if off < gicr::FRAME_SIZE => rd_read(vm, target, info, offset),
        off if off < gicr::SGI_BASE + gicr::FRAME_SIZE => {
            sgi_read(vm, target, info, offset - gicr::SGI_BASE as u32)
        }
        _ => {
            log::warn!("vGICR: read of unknown address {:#x}", info.gpa);
            Err(MmioFault::Unhandled)
        }
    }
}

/// Emulate a guest store to the distributor or a redistributor
pub(crate) fn mmio_write(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    value: u64,
) -> MmioResult<()> {
    if vm.vgic().in_distributor(info.gpa) {
        let offset = (info.gpa - vm.vgic().dbase()) as u32;
        return dist_write(vm, cpu, v, info, offset, value);
    }

    let (target, offset) = redistributor(vm, info.gpa).ok_or(MmioFault::Unhandled)?;
    match offset as u64 {
        off if off < gicr::FRAME_SIZE => rd_write(info, offset),
        off if off < gicr::SGI_BASE + gicr::FRAME_SIZE => {
            sgi_write(vm, cpu, target, info, offset - gicr::SGI_BASE as u32, value)
        }
        _ => {
            log::warn!("vGICR: write to unknown address {:#x}", info.gpa);
            Err(MmioFault::Unhandled)
        }
    }
}

/// Registers laid out identically in the distributor and the SGI frame
fn common_read(vm: &Vm, v: &Vcpu, info: &MmioAccess, reg: u32) -> MmioResult<u64> {
    match reg {
        // No security extensions for guests
        gicd::IGROUPR..=gicd::IGROUPRN => read_as_zero(info),
        gicd::ISENABLER..=gicd::ISENABLERN => {
            vdist::read_word(vm, v, info, 1, reg - gicd::ISENABLER, |r| r.ienable)
        }
        gicd::ICENABLER..=gicd::ICENABLERN => {
            vdist::read_word(vm, v, info, 1, reg - gicd::ICENABLER, |r| r.ienable)
        }
        gicd::ISPENDR..=ISPENDR_END => {
            vdist::read_bytes(vm, v, info, 1, reg - gicd::ISPENDR, |r| r.ipend)
        }
        gicd::ICPENDR..=ICPENDR_END => {
            vdist::read_bytes(vm, v, info, 1, reg - gicd::ICPENDR, |r| r.ipend)
        }
        gicd::ISACTIVER..=gicd::ISACTIVERN => {
            vdist::read_word(vm, v, info, 1, reg - gicd::ISACTIVER, |r| r.iactive)
        }
        gicd::ICACTIVER..=gicd::ICACTIVERN => {
            vdist::read_word(vm, v, info, 1, reg - gicd::ICACTIVER, |r| r.iactive)
        }
        gicd::IPRIORITYR..=IPRIORITYR_END => {
            let off = reg - gicd::IPRIORITYR;
            vdist::read_bytes(vm, v, info, 8, off, |r| r.ipriority[rank_index(8, off)])
        }
        gicd::ICFGR..=gicd::ICFGRN => {
            let off = reg - gicd::ICFGR;
            vdist::read_word(vm, v, info, 2, off, |r| r.icfg[rank_index(2, off)])
        }
        _ => {
            log::warn!("vGICD/vGICR: unhandled read r{} offset {:#x}", info.reg, reg);
            Err(MmioFault::Unhandled)
        }
    }
}

fn common_write(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    reg: u32,
    value: u64,
) -> MmioResult<()> {
    match reg {
        gicd::IGROUPR..=gicd::IGROUPRN => write_ignore(info),
        gicd::ISENABLER..=gicd::ISENABLERN => {
            vdist::write_set_enable(vm, cpu, v, info, reg - gicd::ISENABLER, value)
        }
        gicd::ICENABLER..=gicd::ICENABLERN => {
            vdist::write_clear_enable(vm, v, info, reg - gicd::ICENABLER, value)
        }
        gicd::ISPENDR..=ISPENDR_END => {
            vdist::write_set_pending(vm, cpu, v, info, reg - gicd::ISPENDR, value)
        }
        gicd::ICPENDR..=ICPENDR_END => {
            vdist::write_clear_pending(vm, v, info, reg - gicd::ICPENDR, value)
        }
        gicd::ISACTIVER..=gicd::ISACTIVERN => {
            vdist::write_active(vm, v, info, reg - gicd::ISACTIVER, value, true)
        }
        gicd::ICACTIVER..=gicd::ICACTIVERN => {
            vdist::write_active(vm, v, info, reg - gicd::ICACTIVER, value, false)
        }
        gicd::IPRIORITYR..=IPRIORITYR_END => {
            vdist::write_priority(vm, v, info, reg - gicd::IPRIORITYR, value)
        }
        // SGIs are always edge-triggered
        gicd::ICFGR..=ICFGR0_END => write_ignore(info),
        gicd::ICFGR1..=gicd::ICFGRN => vdist::write_config(vm, v, info, reg - gicd::ICFGR, value),
        _ => {
            log::warn!("vGICD/vGICR: unhandled write r{}={:#x} offset {:#x}", info.reg, value, reg);
            Err(MmioFault::Unhandled)
        }
    }
}

fn dist_read(vm: &Vm, v: &Vcpu, info: &MmioAccess, offset: u32) -> MmioResult<u64> {
    match offset {
        gicd::CTLR => {
            info.expect_size(AccessSize::Word)?;
            // Affinity routing is always on
            Ok((vm.vgic().ctlr() | gicd::CTLR_ARE_NS) as u64)
        }
        gicd::TYPER => {
            info.expect_size(AccessSize::Word)?;
            Ok(typer(vm) as u64)
        }
        gicd::IIDR => {
            info.expect_size(AccessSize::Word)?;
            Ok(VGIC_V3_IIDR as u64)
        }
        gicd::STATUSR => read_as_zero(info),
        // Implementation defined, message-based SPIs
        0x020..=0x03c | gicd::SETSPI_NSR..=0x05c | 0xc000..=0xffcc => read_as_zero(info),
        // Unused with affinity routing
        gicd::ITARGETSR..=ITARGETSR_END => read_as_zero(info),
        gicd::IGROUPR..=gicd::ICFGRN => common_read(vm, v, info, offset),
        gicd::IGRPMODR..=gicd::IGRPMODRN | gicd::NSACR..=gicd::NSACRN => read_as_zero(info),
        // SGIR is a system register
        gicd::SGIR => read_as_zero(info),
        gicd::CPENDSGIR..=gicd::CPENDSGIRN | gicd::SPENDSGIR..=gicd::SPENDSGIRN => read_as_zero(info),
        // Private lines have no route
        gicd::IROUTER..=IROUTER31_END => read_as_zero_64(info),
        gicd::IROUTER32..=IROUTER_END => {
            info.expect_size(AccessSize::DoubleWord)?;
            let off = offset - gicd::IROUTER;
            match vm.rank_for_offset(v, 64, off) {
                Some(rank) => Ok(rank.lock().irouter().map_or(0, |r| r[rank_index(64, off)])),
                None => read_as_zero_64(info),
            }
        }
        gicd::V3_PIDR0 => id_reg(info, GICD_PIDR0),
        gicd::V3_PIDR1 => id_reg(info, GIC_PIDR1),
        gicd::V3_PIDR2 => id_reg(info, GIC_PIDR2),
        gicd::V3_PIDR4 => id_reg(info, GIC_PIDR4),
        gicd::V3_PIDR3 | 0xffd4..=gicd::V3_PIDR7 | 0xfff0..=gicd::V3_CIDR3 => read_as_zero(info),
        0x00c | 0x060..=0x07c | 0xf30..=0x5fcc | 0x8000..=0xbfcc => {
            log::debug!("vGICD: read r{} of reserved offset {:#x}", info.reg, offset);
            read_as_zero(info)
        }
        _ => {
            log::warn!("vGICD: unhandled read r{} offset {:#x}", info.reg, offset);
            Err(MmioFault::Unhandled)
        }
    }
}

fn dist_write(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    match offset {
        gicd::CTLR => {
            info.expect_size(AccessSize::Word)?;
            vm.vgic().lock().ctlr = value as u32 & gicd::CTLR_ENABLE;
            Ok(())
        }
        gicd::TYPER | gicd::IIDR | gicd::STATUSR => write_ignore(info),
        0x020..=0x03c | gicd::SETSPI_NSR..=0x05c | 0xc000..=0xffcc => write_ignore(info),
        gicd::ITARGETSR..=ITARGETSR_END => write_ignore(info),
        gicd::IGROUPR..=gicd::ICFGRN => common_write(vm, cpu, v, info, offset, value),
        gicd::IGRPMODR..=gicd::IGRPMODRN | gicd::NSACR..=gicd::NSACRN => write_ignore(info),
        gicd::SGIR => write_ignore(info),
        // Replaced by the redistributor pending registers
        gicd::CPENDSGIR..=gicd::CPENDSGIRN | gicd::SPENDSGIR..=gicd::SPENDSGIRN => {
            info.expect_size(AccessSize::Word)?;
            Err(MmioFault::Unhandled)
        }
        gicd::IROUTER..=IROUTER31_END => write_ignore_64(info),
        gicd::IROUTER32..=IROUTER_END => {
            info.expect_size(AccessSize::DoubleWord)?;
            let off = offset - gicd::IROUTER;
            let Some(rank) = vm.rank_for_offset(v, 64, off) else {
                return write_ignore_64(info);
            };
            let vcpu0 = vm.vcpu0().vmpidr() & MPIDR_AFF_MASK;
            if value & IROUTER_IRM != 0 || value != vcpu0 {
                let irq = rank_index(64, off) as u32 + IRQS_PER_RANK * (off / 8 / IRQS_PER_RANK);
                log::error!(
                    "vGICD: IRQ{} routed to {:#x}, SPIs can only target vcpu0",
                    irq,
                    value
                );
                return Err(MmioFault::Unsupported);
            }
            if let Some(routes) = rank.lock().irouter_mut() {
                routes[rank_index(64, off)] = value;
            }
            Ok(())
        }
        gicd::V3_PIDR4..=gicd::V3_CIDR3 => write_ignore(info),
        0x00c | 0x060..=0x07c | 0xf30..=0x5fcc | 0x8000..=0xbfcc => {
            log::debug!("vGICD: write r{} to reserved offset {:#x}", info.reg, offset);
            write_ignore(info)
        }
        _ => {
            log::warn!("vGICD: unhandled write r{}={:#x} offset {:#x}", info.reg, value, offset);
            Err(MmioFault::Unhandled)
        }
    }
}

fn id_reg(info: &MmioAccess, value: u32) -> MmioResult<u64> {
    info.expect_size(AccessSize::Word)?;
    Ok(value as u64)
}

/// RD_base frame of the redistributor owned by `v`
fn rd_read(vm: &Vm, v: &Vcpu, info: &MmioAccess, reg: u32) -> MmioResult<u64> {
    match reg {
        // No LPIs
        gicr::CTLR => read_as_zero(info),
        gicr::IIDR => id_reg(info, VGIC_V3_IIDR),
        gicr::TYPER => {
            info.expect_size(AccessSize::DoubleWord)?;
            let mut typer = (v.affinity(3) as u64) << 56
                | (v.affinity(2) as u64) << 48
                | (v.affinity(1) as u64) << 40
                | (v.affinity(0) as u64) << 32
                | (v.id() as u64) << gicr::TYPER_PROC_NUM_SHIFT;
            if v.id() + 1 == vm.nr_vcpus() {
                typer |= gicr::TYPER_LAST;
            }
            Ok(typer)
        }
        gicr::STATUSR | gicr::WAKER => read_as_zero(info),
        gicr::SETLPIR
        | gicr::CLRLPIR
        | gicr::PROPBASER
        | gicr::PENDBASER
        | gicr::INVLPIR
        | gicr::INVALLR
        | gicr::MOVLPIR
        | gicr::MOVALLR => read_as_zero_64(info),
        // Never busy
        gicr::SYNCR => read_as_zero(info),
        gicr::PIDR0 => id_reg(info, GICR_PIDR0),
        gicr::PIDR1 => id_reg(info, GIC_PIDR1),
        gicr::PIDR2 => id_reg(info, GIC_PIDR2),
        gicr::PIDR4 => id_reg(info, GIC_PIDR4),
        gicr::PIDR3 | 0xffd4..=gicr::PIDR7 => read_as_zero(info),
        _ => {
            log::warn!("vGICR: unhandled read r{} offset {:#x}", info.reg, reg);
            Err(MmioFault::Unhandled)
        }
    }
}

fn rd_write(info: &MmioAccess, reg: u32) -> MmioResult<()> {
    match reg {
        gicr::CTLR | gicr::IIDR | gicr::STATUSR | gicr::WAKER | gicr::SYNCR => write_ignore(info),
        gicr::TYPER
        | gicr::SETLPIR
        | gicr::CLRLPIR
        | gicr::PROPBASER
        | gicr::PENDBASER
        | gicr::INVLPIR
        | gicr::INVALLR
        | gicr::MOVLPIR
        | gicr::MOVALLR => write_ignore_64(info),
        gicr::PIDR4..=gicr::PIDR3 => write_ignore(info),
        _ => {
            log::warn!("vGICR: unhandled write r{} offset {:#x}", info.reg, reg);
            Err(MmioFault::Unhandled)
        }
    }
}

/// SGI_base frame of the redistributor owned by `v`
fn sgi_read(vm: &Vm, v: &Vcpu, info: &MmioAccess, reg: u32) -> MmioResult<u64> {
    match reg {
        gicr::IGRPMODR0 | gicr::NSACR => read_as_zero(info),
        gicr::IGROUPR0
        | gicr::ISENABLER0
        | gicr::ICENABLER0
        | gicr::ISACTIVER0
        | gicr::ICACTIVER0
        | gicr::IPRIORITYR0..=GICR_IPRIORITYR7_END
        | gicr::ICFGR0..=GICR_ICFGR1_END => common_read(vm, v, info, reg),
        gicr::ISPENDR0 | gicr::ICPENDR0 => {
            info.expect_size(AccessSize::Word)?;
            Ok(v.vgic().private_rank().lock().ipend as u64)
        }
        _ => {
            log::warn!("vGICR: unhandled SGI frame read r{} offset {:#x}", info.reg, reg);
            Err(MmioFault::Unhandled)
        }
    }
}

fn sgi_write(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    reg: u32,
    value: u64,
) -> MmioResult<()> {
    match reg {
        gicr::IGRPMODR0 | gicr::NSACR => write_ignore(info),
        gicr::IGROUPR0
        | gicr::ISENABLER0
        | gicr::ICENABLER0
        | gicr::ISACTIVER0
        | gicr::ICACTIVER0
        | gicr::IPRIORITYR0..=GICR_IPRIORITYR7_END
        | gicr::ICFGR0..=GICR_ICFGR1_END => common_write(vm, cpu, v, info, reg, value),
        gicr::ISPENDR0 | gicr::ICPENDR0 => {
            info.expect_size(AccessSize::Word)?;
            log::warn!(
                "vGICR: vcpu{} SGI pending-state write {:#x} not supported",
                v.id(),
                value
            );
            Err(MmioFault::Unhandled)
        }
        _ => {
            log::warn!("vGICR: unhandled SGI frame write r{} offset {:#x}", info.reg, reg);
            Err(MmioFault::Unhandled)
        }
    }
}

/// Emulate a trapped ICC_SGI1R_EL1 write from `v`
///
/// VCPU `n` answers to Aff1 `n / 16`, bit `n % 16` of the target list.
pub(crate) fn emulate_sgi1r(vm: &Vm, cpu: CpuId, v: &Vcpu, value: u64) -> MmioResult<()> {
    let sgi1r = LocalRegisterCopy::<u64, ICC_SGI1R::Register>::new(value);
    let virq = sgi1r.read(ICC_SGI1R::INTID) as u32;

    if sgi1r.is_set(ICC_SGI1R::IRM) {
        vm.to_sgi(cpu, v, SgiMode::Others, virq, 0);
        return Ok(());
    }

    let base = sgi1r.read(ICC_SGI1R::Aff1) * 16;
    if sgi1r.read(ICC_SGI1R::Aff2) != 0 || sgi1r.read(ICC_SGI1R::Aff3) != 0 || base >= 64 {
        log::warn!("vcpu{}: SGI{} to absent affinity {:#x}", v.id(), virq, value);
        return Ok(());
    }

    let targets = sgi1r.read(ICC_SGI1R::TargetList) << base;
    vm.to_sgi(cpu, v, SgiMode::List, virq, targets);
    Ok(())
}
