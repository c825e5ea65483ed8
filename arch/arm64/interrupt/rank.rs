//! Register-rank store
//!
//! A rank is the distributor state of 32 consecutive virtual interrupt
//! lines. Rank 0 (SGIs and PPIs) is banked per VCPU; ranks 1.. hold the
//! SPIs and are shared by the whole VM. Each rank has its own lock so
//! accesses to different 32-line blocks never contend.

use crate::sync::SpinLock;

/// Lines per rank
pub const IRQS_PER_RANK: u32 = 32;

/// Per-line routing state, depending on the emulated generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankRouting {
    /// GICv2: one 8-bit CPU target mask per line, four per word
    Targets([u32; 8]),
    /// GICv3: one affinity route per line
    Affinity([u64; 32]),
}

/// Register contents of one rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankRegs {
    pub ienable: u32,
    pub iactive: u32,
    /// Software-tracked pending bits, best effort
    pub ipend: u32,
    /// Two configuration bits per line
    pub icfg: [u32; 2],
    /// One priority byte per line, four per word
    pub ipriority: [u32; 8],
    pub routing: RankRouting,
}

impl RankRegs {
    pub fn itargets_mut(&mut self) -> Option<&mut [u32; 8]> {
        match &mut self.routing {
            RankRouting::Targets(t) => Some(t),
            RankRouting::Affinity(_) => None,
        }
    }

    pub fn itargets(&self) -> Option<&[u32; 8]> {
        match &self.routing {
            RankRouting::Targets(t) => Some(t),
            RankRouting::Affinity(_) => None,
        }
    }

    pub fn irouter_mut(&mut self) -> Option<&mut [u64; 32]> {
        match &mut self.routing {
            RankRouting::Affinity(r) => Some(r),
            RankRouting::Targets(_) => None,
        }
    }

    pub fn irouter(&self) -> Option<&[u64; 32]> {
        match &self.routing {
            RankRouting::Affinity(r) => Some(r),
            RankRouting::Targets(_) => None,
        }
    }

    /// Priority byte of line `index` within the rank
    pub fn priority(&self, index: u32) -> u8 {
        let word = self.ipriority[(index / 4) as usize];
        byte_read(word, false, index) as u8
    }
}

/// One 32-line block with its lock
pub struct VgicIrqRank {
    regs: SpinLock<RankRegs>,
}

impl VgicIrqRank {
    /// Rank with CPU-target routing (GICv2)
    pub fn with_targets() -> Self {
        Self::new(RankRouting::Targets([0; 8]))
    }

    /// Rank with affinity routing (GICv3)
    pub fn with_affinity() -> Self {
        Self::new(RankRouting::Affinity([0; 32]))
    }

    fn new(routing: RankRouting) -> Self {
        Self {
            regs: SpinLock::new(RankRegs {
                ienable: 0,
                iactive: 0,
                ipend: 0,
                icfg: [0; 2],
                ipriority: [0; 8],
                routing,
            }),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, RankRegs> {
        self.regs.lock()
    }
}

/// Number of ranks covering `nr_lines` lines
#[inline]
pub const fn nr_ranks(nr_lines: u32) -> usize {
    ((nr_lines + IRQS_PER_RANK - 1) / IRQS_PER_RANK) as usize
}

/// Rank addressed by byte `offset` into a register array using `bits`
/// bits per line
#[inline]
pub const fn rank_nr(bits: u32, offset: u32) -> usize {
    ((offset as u64 * 8 / bits as u64) / IRQS_PER_RANK as u64) as usize
}

/// Index of the register addressed by byte `offset` within its rank's
/// array, for arrays of `bits` bits per line
///
/// 32-bit registers cover `32 / bits` lines each; 64-bit route registers
/// cover exactly one.
#[inline]
pub const fn rank_index(bits: u32, offset: u32) -> usize {
    if bits == 64 {
        ((offset >> 3) & (IRQS_PER_RANK - 1)) as usize
    } else {
        ((offset >> 2) & (bits - 1)) as usize
    }
}

/// Extract the byte at `offset & 3` of `value`, sign-extending to 32 bits
/// when `sign` is set
#[inline]
pub const fn byte_read(value: u32, sign: bool, offset: u32) -> u32 {
    let byte = (value >> (8 * (offset & 3))) & 0xff;
    if sign && byte & 0x80 != 0 {
        byte | 0xffff_ff00
    } else {
        byte
    }
}

/// Replace the byte at `offset & 3` of `reg` with the low byte of `value`
#[inline]
pub fn byte_write(reg: &mut u32, value: u32, offset: u32) {
    let shift = 8 * (offset & 3);
    *reg = (*reg & !(0xff << shift)) | ((value & 0xff) << shift);
}
