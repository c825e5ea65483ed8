//! Rank register accessors shared by the GICv2 and GICv3 emulations
//!
//! Every `offset` here is relative to the start of its register array,
//! so the same accessor serves the distributor and the GICv3 SGI frame.

use crate::arch::arm64::cpu::CpuId;
use crate::arch::arm64::interrupt::mmio::{
    read_as_zero, write_ignore, AccessSize, MmioAccess, MmioResult,
};
use crate::arch::arm64::interrupt::rank::{byte_read, byte_write, rank_index, rank_nr, RankRegs};
use crate::vmm::{Vcpu, Vm};

/// Read a word-only rank field; ranks past the last line read as zero
pub(crate) fn read_word(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    bits: u32,
    offset: u32,
    field: impl FnOnce(&RankRegs) -> u32,
) -> MmioResult<u64> {
    info.expect_size(AccessSize::Word)?;
    match vm.rank_for_offset(v, bits, offset) {
        Some(rank) => Ok(field(&rank.lock()) as u64),
        None => read_as_zero(info),
    }
}

/// Read a byte-or-word rank field, extracting the addressed byte
pub(crate) fn read_bytes(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    bits: u32,
    offset: u32,
    field: impl FnOnce(&RankRegs) -> u32,
) -> MmioResult<u64> {
    info.expect_byte_or_word()?;
    let Some(rank) = vm.rank_for_offset(v, bits, offset) else {
        return read_as_zero(info);
    };
    let value = field(&rank.lock());
    if info.is_byte() {
        Ok(byte_read(value, info.sign, offset) as u64)
    } else {
        Ok(value as u64)
    }
}

/// Store into a byte-or-word register, keeping the other bytes on a byte
/// access
pub(crate) fn store_bytes(info: &MmioAccess, reg: &mut u32, value: u64, offset: u32) {
    if info.is_byte() {
        byte_write(reg, value as u32, offset);
    } else {
        *reg = value as u32;
    }
}

/// Bits of a byte-or-word set/clear register named by the write
fn written_bits(info: &MmioAccess, offset: u32, value: u64) -> u32 {
    if info.is_byte() {
        ((value as u32) & 0xff) << (8 * (offset & 3))
    } else {
        value as u32
    }
}

/// ISENABLER: unmask, raising lines that were waiting for it
pub(crate) fn write_set_enable(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    info.expect_size(AccessSize::Word)?;
    let Some(rank) = vm.rank_for_offset(v, 1, offset) else {
        return write_ignore(info);
    };
    let r = value as u32;
    let newly = {
        let mut regs = rank.lock();
        let old = regs.ienable;
        regs.ienable |= r;
        r & !old
    };
    vm.enable_irqs(cpu, v, newly, rank_nr(1, offset));
    Ok(())
}

/// ICENABLER
pub(crate) fn write_clear_enable(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    info.expect_size(AccessSize::Word)?;
    let Some(rank) = vm.rank_for_offset(v, 1, offset) else {
        return write_ignore(info);
    };
    let r = value as u32;
    let cleared = {
        let mut regs = rank.lock();
        let old = regs.ienable;
        regs.ienable &= !r;
        r & old
    };
    vm.disable_irqs(v, cleared, rank_nr(1, offset));
    Ok(())
}

/// ISPENDR: record and inject
pub(crate) fn write_set_pending(
    vm: &Vm,
    cpu: CpuId,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    info.expect_byte_or_word()?;
    let Some(rank) = vm.rank_for_offset(v, 1, offset) else {
        return write_ignore(info);
    };
    let bits = written_bits(info, offset, value);
    rank.lock().ipend |= bits;
    vm.pend_irqs(cpu, v, bits, rank_nr(1, offset));
    Ok(())
}

/// ICPENDR: clear and withdraw what has not reached the guest yet
pub(crate) fn write_clear_pending(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    info.expect_byte_or_word()?;
    let Some(rank) = vm.rank_for_offset(v, 1, offset) else {
        return write_ignore(info);
    };
    let bits = written_bits(info, offset, value);
    rank.lock().ipend &= !bits;
    vm.unpend_irqs(v, bits, rank_nr(1, offset));
    Ok(())
}

/// ISACTIVER (`set`) or ICACTIVER
pub(crate) fn write_active(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
    set: bool,
) -> MmioResult<()> {
    info.expect_size(AccessSize::Word)?;
    if let Some(rank) = vm.rank_for_offset(v, 1, offset) {
        let mut regs = rank.lock();
        if set {
            regs.iactive |= value as u32;
        } else {
            regs.iactive &= !(value as u32);
        }
    }
    Ok(())
}

/// IPRIORITYR
pub(crate) fn write_priority(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    info.expect_byte_or_word()?;
    let Some(rank) = vm.rank_for_offset(v, 8, offset) else {
        return write_ignore(info);
    };
    let mut regs = rank.lock();
    store_bytes(info, &mut regs.ipriority[rank_index(8, offset)], value, offset);
    Ok(())
}

/// ICFGR
pub(crate) fn write_config(
    vm: &Vm,
    v: &Vcpu,
    info: &MmioAccess,
    offset: u32,
    value: u64,
) -> MmioResult<()> {
    info.expect_size(AccessSize::Word)?;
    if let Some(rank) = vm.rank_for_offset(v, 2, offset) {
        rank.lock().icfg[rank_index(2, offset)] = value as u32;
    }
    Ok(())
}
