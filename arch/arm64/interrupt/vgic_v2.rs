//! GICv2 distributor emulation
//!
//! Decodes trapped guest accesses to the virtual distributor frame and
//! applies them to the register ranks. Writes with side effects (enable,
//! pending, SGI) drop the rank lock before calling into the injection
//! engine.

use crate::arch::arm64::cpu::CpuId;
use crate::arch::arm64::interrupt::gic::gicd;
use crate::arch::arm64::interrupt::mmio::{
    read_as_zero, write_ignore, AccessSize, MmioAccess, MmioFault, MmioResult,
};
use crate::arch::arm64::interrupt::rank::rank_index;
use crate::arch::arm64::interrupt::vdist;
use crate::arch::arm64::interrupt::vgic::SgiMode;
use crate::vmm::{Vcpu, Vm};

/// Implementer ARM (JEP106 0x43b)
const VGIC_V2_IIDR: u32 = 0x0000_043b;
/// Architecture revision 2
const VGIC_V2_ICPIDR2: u32 = 0x20;

const ISPENDR_END: u32 = gicd::ISPENDRN + 3;
const ICPENDR_END: u32 = gicd::ICPENDRN + 3;
const IPRIORITYR_END: u32 = gicd::IPRIORITYRN + 3;
const ITARGETSR_BANKED_END: u32 = gicd::ITARGETSR7 + 3;
const ITARGETSR_END: u32 = gicd::ITARGETSRN + 3;
const ICFGR_BANKED_END: u32 = gicd::ICFGR1 + 3;
const CPENDSGIR_END: u32 = gicd::CPENDSGIRN + 3;
const SPENDSGIR_END: u32 = gicd::SPENDSGIRN + 3;

fn reg_offset(vm: &Vm, info: &MmioAccess) -> MmioResult<u32> {
    if vm.vgic().in_distributor(info.gpa) {
        Ok((info.gpa - vm.vgic().dbase()) as u32)
    } else {
        Err(MmioFault::Unhandled)
    }
}

fn typer(vm: &Vm) -> u32 {
    let cpus = ((vm.nr_vcpus() as u32 - 1) << gicd::TYPER_CPUS_SHIFT) & (0x7 << gicd::TYPER_CPUS_SHIFT);
    let lines = (vm.vgic().nr_lines() / 32 - 1) & gicd::TYPER_LINES;
    cpus | lines
}

/// Emulate a guest load from the distributor frame
pub(crate) fn mmio_read(vm: &Vm, v: &Vcpu, info: &MmioAccess) -> MmioResult<u64> {
    let offset = reg_offset(vm, info)?;

    match offset {
        gicd::CTLR => {
            info.expect_size(AccessSize::Word)?;
            Ok(vm.vgic().ctlr() as u64)
        }
        gicd::TYPER => {
            info.expect_size(AccessSize::Word)?;
            Ok(typer(vm) as u64)
        }
        gicd::IIDR => {
            info.expect_size(AccessSize::Word)?;
            Ok(VGIC_V2_IIDR as u64)
        }
        // Implementation defined
        0x020..=0x03c => read_as_zero(info),
        // No security extensions for guests
        gicd::IGROUPR..=gicd::IGROUPRN => read_as_zero(info),
        gicd::ISENABLER..=gicd::ISENABLERN => {
            vdist::read_word(vm, v, info, 1, offset - gicd::ISENABLER, |r| r.ienable)
        }
        gicd::ICENABLER..=gicd::ICENABLERN => {
            vdist::read_word(vm, v, info, 1, offset - gicd::ICENABLER, |r| r.ienable)
        }
        gicd::ISPENDR..=ISPENDR_END => {
            vdist::read_bytes(vm, v, info, 1, offset - gicd::ISPENDR, |r| r.ipend)
        }
        gicd::ICPENDR..=ICPENDR_END => {
            vdist::read_bytes(vm, v, info, 1, offset - gicd::ICPENDR, |r| r.ipend)
        }
        gicd::ISACTIVER..=gicd::ISACTIVERN => {
            vdist::read_word(vm, v, info, 1, offset - gicd::ISACTIVER, |r| r.iactive)
        }
        gicd::ICACTIVER..=gicd::ICACTIVERN => {
            vdist::read_word(vm, v, info, 1, offset - gicd::ICACTIVER, |r| r.iactive)
        }
        gicd::IPRIORITYR..=IPRIORITYR_END => {
            let off = offset - gicd::IPRIORITYR;
            vdist::read_bytes(vm, v, info, 8, off, |r| r.ipriority[rank_index(8, off)])
        }
        gicd::ITARGETSR..=ITARGETSR_END => {
            let off = offset - gicd::ITARGETSR;
            vdist::read_bytes(vm, v, info, 8, off, |r| {
                r.itargets().map_or(0, |t| t[rank_index(8, off)])
            })
        }
        gicd::ICFGR..=gicd::ICFGRN => {
            let off = offset - gicd::ICFGR;
            vdist::read_word(vm, v, info, 2, off, |r| r.icfg[rank_index(2, off)])
        }
        gicd::NSACR..=gicd::NSACRN => read_as_zero(info),
        // Write-only
        gicd::SGIR => read_as_zero(info),
        gicd::CPENDSGIR..=CPENDSGIR_END | gicd::SPENDSGIR..=SPENDSGIR_END => {
            info.expect_byte_or_word()?;
            Ok(0)
        }
        gicd::ICPIDR2 => {
            info.expect_size(AccessSize::Word)?;
            Ok(VGIC_V2_ICPIDR2 as u64)
        }
        // Remaining identification registers
        0xfd0..=0xfe4 | 0xfec..=0xffc => read_as_zero(info),
        0x00c..=0x01c | 0x040..=0x07c | 0x7fc | 0xbfc | 0xf04..=0xf0c | 0xf30..=0xfcc => {
            log::debug!("vGICD: read r{} of reserved offset {:#x}", info.reg, offset);
            read_as_zero(info)
        }
        _ => {
            log::warn!("vGICD: unhandled read r{} offset {:#x}", info.reg, offset);
            Err(MmioFault::Unhandled)
        }
    }
}

/// Emulate a guest store to the distributor frame
pub(crate) fn mmio_write(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    value: u64,
) -> MmioResult<()> {
    let offset = reg_offset(vm, info)?;

    match offset {
        gicd::CTLR => {
            info.expect_size(AccessSize::Word)?;
            // Only the enable bit is kept
            vm.vgic().lock().ctlr = value as u32 & gicd::CTLR_ENABLE;
            Ok(())
        }
        // Read-only
        gicd::TYPER | gicd::IIDR => write_ignore(info),
        0x020..=0x03c => write_ignore(info),
        gicd::IGROUPR..=gicd::IGROUPRN => write_ignore(info),
        gicd::ISENABLER..=gicd::ISENABLERN => {
            vdist::write_set_enable(vm, cpu, v, info, offset - gicd::ISENABLER, value)
        }
        gicd::ICENABLER..=gicd::ICENABLERN => {
            vdist::write_clear_enable(vm, v, info, offset - gicd::ICENABLER, value)
        }
        gicd::ISPENDR..=ISPENDR_END => {
            vdist::write_set_pending(vm, cpu, v, info, offset - gicd::ISPENDR, value)
        }
        gicd::ICPENDR..=ICPENDR_END => {
            vdist::write_clear_pending(vm, v, info, offset - gicd::ICPENDR, value)
        }
        gicd::ISACTIVER..=gicd::ISACTIVERN => {
            vdist::write_active(vm, v, info, offset - gicd::ISACTIVER, value, true)
        }
        gicd::ICACTIVER..=gicd::ICACTIVERN => {
            vdist::write_active(vm, v, info, offset - gicd::ICACTIVER, value, false)
        }
        gicd::IPRIORITYR..=IPRIORITYR_END => {
            vdist::write_priority(vm, v, info, offset - gicd::IPRIORITYR, value)
        }
        // SGI and PPI targets are fixed to the accessing VCPU
        gicd::ITARGETSR..=ITARGETSR_BANKED_END => write_ignore(info),
        gicd::ITARGETSR8..=ITARGETSR_END => {
            info.expect_byte_or_word()?;
            let off = offset - gicd::ITARGETSR;
            let Some(rank) = vm.rank_for_offset(v, 8, off) else {
                return write_ignore(info);
            };
            let mut regs = rank.lock();
            if let Some(targets) = regs.itargets_mut() {
                vdist::store_bytes(info, &mut targets[rank_index(8, off)], value, off);
            }
            Ok(())
        }
        // SGI and PPI configuration is fixed
        gicd::ICFGR..=ICFGR_BANKED_END => write_ignore(info),
        gicd::ICFGR2..=gicd::ICFGRN => vdist::write_config(vm, v, info, offset - gicd::ICFGR, value),
        gicd::NSACR..=gicd::NSACRN => write_ignore(info),
        gicd::SGIR => {
            info.expect_size(AccessSize::Word)?;
            send_sgi(vm, cpu, v, value as u32);
            Ok(())
        }
        gicd::CPENDSGIR..=CPENDSGIR_END | gicd::SPENDSGIR..=SPENDSGIR_END => {
            info.expect_byte_or_word()?;
            log::warn!("vGICD: SGI pending-state write r{} offset {:#x} not supported", info.reg, offset);
            Err(MmioFault::Unhandled)
        }
        gicd::ICPIDR2 | 0xfd0..=0xfe4 | 0xfec..=0xffc => write_ignore(info),
        0x00c..=0x01c | 0x040..=0x07c | 0x7fc | 0xbfc | 0xf04..=0xf0c | 0xf30..=0xfcc => {
            log::debug!("vGICD: write r{} to reserved offset {:#x}", info.reg, offset);
            write_ignore(info)
        }
        _ => {
            log::warn!("vGICD: unhandled write r{}={:#x} offset {:#x}", info.reg, value, offset);
            Err(MmioFault::Unhandled)
        }
    }
}

/// Decode a GICD_SGIR write and deliver the SGI
fn send_sgi(vm: &Vm, cpu: CpuId, v: &Vcpu, sgir: u32) {
    let virq = sgir & 0xf;
    let targets = (sgir >> gicd::SGI_TARGET_SHIFT) & 0xff;
    let mode = match sgir & (0x3 << 24) {
        gicd::SGI_TARGET_LIST => SgiMode::List,
        gicd::SGI_TARGET_OTHERS => SgiMode::Others,
        gicd::SGI_TARGET_SELF => SgiMode::SelfOnly,
        _ => {
            log::warn!("vcpu{}: reserved SGIR target filter in {:#x}", v.id(), sgir);
            return;
        }
    };
    vm.to_sgi(cpu, v, mode, virq, targets as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::mock::MockGic;
    use crate::arch::arm64::interrupt::tests::{new_vm, with_irqs_disabled};
    use crate::arch::arm64::interrupt::vgic::VgicVersion;
    use crate::config::GUEST_GICD_BASE;
    use test_case::test_case;

    fn word(offset: u32) -> MmioAccess {
        MmioAccess::new(GUEST_GICD_BASE + offset as u64, AccessSize::Word)
    }

    fn byte(offset: u32) -> MmioAccess {
        MmioAccess::new(GUEST_GICD_BASE + offset as u64, AccessSize::Byte)
    }

    #[test_case(gicd::TYPER, 0x22; "typer")]
    #[test_case(gicd::IIDR, 0x43b; "iidr")]
    #[test_case(gicd::ICPIDR2, 0x20; "icpidr2")]
    #[test_case(gicd::CTLR, 0; "ctlr starts disabled")]
    #[test_case(0x024, 0; "implementation defined")]
    #[test_case(gicd::IGROUPR, 0; "groups")]
    #[test_case(0xf30, 0; "reserved")]
    #[test_case(gicd::SGIR, 0; "sgir write only")]
    fn test_fixed_reads(offset: u32, expected: u64) {
        let (_, gic) = MockGic::context(4, 96, 3);
        let vm = new_vm(gic, VgicVersion::V2, 2, 96);
        assert_eq!(vm.mmio_read(0, vm.vcpu0(), &word(offset)), Ok(expected));
    }

    #[test]
    fn test_ctlr_keeps_enable_only() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        vm.mmio_write(0, v, &word(gicd::CTLR), 0xffff_ffff).unwrap();
        assert_eq!(vm.mmio_read(0, v, &word(gicd::CTLR)), Ok(1));
    }

    #[test]
    fn test_priority_byte_write_touches_one_byte() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        let reg = gicd::IPRIORITYR + 0x20;

        vm.mmio_write(0, v, &word(reg), 0x4433_2211).unwrap();
        vm.mmio_write(0, v, &byte(reg + 2), 0xa0).unwrap();

        assert_eq!(vm.mmio_read(0, v, &word(reg)), Ok(0x44a0_2211));
        assert_eq!(vm.mmio_read(0, v, &byte(reg + 2)), Ok(0xa0));
        assert_eq!(vm.virq_priority(v, 34), 0xa0);
    }

    #[test]
    fn test_signed_byte_read() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        vm.mmio_write(0, v, &word(gicd::IPRIORITYR), 0x0000_9000).unwrap();
        let info = byte(gicd::IPRIORITYR + 1).with_sign(true);
        assert_eq!(vm.mmio_read(0, v, &info), Ok(0xffff_ff90));
    }

    #[test]
    fn test_set_enable_raises_queued_line() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));

        with_irqs_disabled(|| vm.vcpu_inject_irq(0, v, 33));
        assert!(mock.visible().is_empty());

        vm.mmio_write(0, v, &word(gicd::ISENABLER + 4), 1 << 1).unwrap();
        assert_eq!(mock.visible(), [33]);
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ICENABLER + 4)), Ok(1 << 1));
    }

    #[test]
    fn test_clear_enable_withdraws_waiting_line() {
        let (_, gic) = MockGic::context(1, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));
        vm.mmio_write(0, v, &word(gicd::ISENABLER + 4), 0b11).unwrap();

        with_irqs_disabled(|| {
            vm.vcpu_inject_irq(0, v, 32);
            vm.vcpu_inject_irq(0, v, 33);
        });
        assert!(v.vgic().lock().is_lr_pending(33));

        vm.mmio_write(0, v, &word(gicd::ICENABLER + 4), 0b10).unwrap();
        let q = v.vgic().lock();
        assert!(!q.is_lr_pending(33));
        assert!(!q.pending(33).status.is_enabled());
        assert!(q.pending(32).status.is_enabled());
    }

    #[test]
    fn test_set_pending_injects() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();

        vm.mmio_write(0, v, &byte(gicd::ISPENDR + 5), 0x04).unwrap();

        assert!(v.vgic().lock().is_inflight(42));
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ISPENDR + 4)), Ok(1 << 10));

        vm.mmio_write(0, v, &word(gicd::ICPENDR + 4), 1 << 10).unwrap();
        assert!(!v.vgic().lock().is_inflight(42));
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ISPENDR + 4)), Ok(0));
    }

    #[test]
    fn test_active_bits() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        vm.mmio_write(0, v, &word(gicd::ISACTIVER + 4), 0xf0).unwrap();
        vm.mmio_write(0, v, &word(gicd::ICACTIVER + 4), 0x30).unwrap();
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ISACTIVER + 4)), Ok(0xc0));
    }

    #[test]
    fn test_targets() {
        let (_, gic) = MockGic::context(4, 64, 2);
        let vm = new_vm(gic, VgicVersion::V2, 2, 64);
        let v1 = vm.vcpu(1).unwrap();

        // Banked targets name the reading VCPU and ignore writes
        vm.mmio_write(0, v1, &word(gicd::ITARGETSR), 0x0101_0101).unwrap();
        assert_eq!(vm.mmio_read(0, v1, &word(gicd::ITARGETSR)), Ok(0x0202_0202));

        vm.mmio_write(0, v1, &byte(gicd::ITARGETSR8 + 1), 0x02).unwrap();
        assert_eq!(vm.mmio_read(0, v1, &word(gicd::ITARGETSR8)), Ok(0x0101_0201));
    }

    #[test]
    fn test_config_registers() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        vm.mmio_write(0, v, &word(gicd::ICFGR), 0).unwrap();
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ICFGR)), Ok(0xaaaa_aaaa));
        vm.mmio_write(0, v, &word(gicd::ICFGR2), 0x5555_0000).unwrap();
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ICFGR2)), Ok(0x5555_0000));
    }

    #[test]
    fn test_sgir_self() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        vm.mmio_write(0, v, &word(gicd::SGIR), (2 << 24) | 5).unwrap();
        assert!(v.vgic().lock().is_inflight(5));
    }

    #[test]
    fn test_sgir_list_skips_offline_vcpu() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 2, 64);
        let v0 = vm.vcpu0();
        let v1 = vm.vcpu(1).unwrap();

        vm.mmio_write(0, v0, &word(gicd::SGIR), (0b11 << 16) | 1).unwrap();
        assert!(v0.vgic().lock().is_inflight(1));
        assert!(!v1.vgic().lock().is_inflight(1));

        v1.set_online(true);
        vm.mmio_write(0, v0, &word(gicd::SGIR), (1 << 24) | 2).unwrap();
        assert!(!v0.vgic().lock().is_inflight(2));
        assert!(v1.vgic().lock().is_inflight(2));
    }

    #[test]
    fn test_sgi_pending_registers() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        assert_eq!(vm.mmio_read(0, v, &byte(gicd::SPENDSGIR + 1)), Ok(0));
        assert_eq!(
            vm.mmio_write(0, v, &word(gicd::CPENDSGIR), 1),
            Err(MmioFault::Unhandled)
        );
        assert!(!vm.is_crashed());
    }

    #[test_case(gicd::ISENABLER, AccessSize::Byte; "byte enable")]
    #[test_case(gicd::IPRIORITYR, AccessSize::HalfWord; "halfword priority")]
    #[test_case(gicd::ICFGR, AccessSize::DoubleWord; "doubleword config")]
    #[test_case(0x030, AccessSize::Byte; "byte implementation defined")]
    fn test_bad_width_crashes_guest(offset: u32, size: AccessSize) {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let info = MmioAccess::new(GUEST_GICD_BASE + offset as u64, size);
        assert_eq!(vm.mmio_write(0, vm.vcpu0(), &info, 0), Err(MmioFault::BadWidth));
        assert!(vm.is_crashed());
    }

    #[test]
    fn test_outside_frame_unhandled() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let info = word(0x1000);
        assert_eq!(vm.mmio_read(0, vm.vcpu0(), &info), Err(MmioFault::Unhandled));
    }

    #[test]
    fn test_ranks_beyond_lines_read_zero() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        vm.mmio_write(0, v, &word(gicd::ISENABLER + 0x10), u64::from(u32::MAX)).unwrap();
        assert_eq!(vm.mmio_read(0, v, &word(gicd::ISENABLER + 0x10)), Ok(0));
    }
}
