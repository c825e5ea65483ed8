//! CPU module for ARM64
//!
//! Physical CPU numbering, CPU sets, local interrupt masking and barriers.
//!
//! On AArch64 the interrupt mask is PSTATE.I (DAIF) and barriers are real
//! `dsb`/`isb` instructions. Host builds (unit tests) keep a per-thread
//! emulated mask so the "called with interrupts disabled" preconditions of
//! the interrupt code are still checked.

use crate::config::NR_CPUS;

/// Logical physical-CPU index
pub type CpuId = usize;

/// Set of logical CPUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set holding only `cpu`
    pub const fn of(cpu: CpuId) -> Self {
        Self(1 << cpu)
    }

    /// CPUs `0..nr`
    pub const fn first(nr: usize) -> Self {
        if nr >= NR_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << nr) - 1)
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu;
    }

    pub fn remove(&mut self, cpu: CpuId) {
        self.0 &= !(1 << cpu);
    }

    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < NR_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn and_not(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterate over member CPUs in ascending order
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let bits = self.0;
        (0..NR_CPUS).filter(move |cpu| bits & (1u64 << *cpu) != 0)
    }
}

/// Saved interrupt mask state returned by [`local_irq_save`]
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct IrqFlags(bool);

cfg_if::cfg_if! {
    if #[cfg(test)] {
        use core::cell::Cell;

        std::thread_local! {
            static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
        }

        pub fn local_irq_is_enabled() -> bool {
            IRQ_ENABLED.with(|e| e.get())
        }

        pub fn local_irq_disable() {
            IRQ_ENABLED.with(|e| e.set(false));
        }

        pub fn local_irq_enable() {
            IRQ_ENABLED.with(|e| e.set(true));
        }

        pub fn dsb() {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }

        pub fn isb() {
            core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        }
    } else if #[cfg(target_arch = "aarch64")] {
        use aarch64_cpu::asm::barrier;
        use aarch64_cpu::registers::DAIF;
        use tock_registers::interfaces::Readable;

        /// Are IRQs unmasked on this CPU
        #[inline]
        pub fn local_irq_is_enabled() -> bool {
            !DAIF.is_set(DAIF::I)
        }

        /// Mask IRQs on this CPU
        #[inline]
        pub fn local_irq_disable() {
            unsafe { core::arch::asm!("msr daifset, #2", options(nomem, nostack)) };
        }

        /// Unmask IRQs on this CPU
        #[inline]
        pub fn local_irq_enable() {
            unsafe { core::arch::asm!("msr daifclr, #2", options(nomem, nostack)) };
        }

        /// Data synchronization barrier
        #[inline]
        pub fn dsb() {
            barrier::dsb(barrier::SY);
        }

        /// Instruction synchronization barrier
        #[inline]
        pub fn isb() {
            barrier::isb(barrier::SY);
        }
    } else {
        pub fn local_irq_is_enabled() -> bool {
            false
        }

        pub fn local_irq_disable() {}

        pub fn local_irq_enable() {}

        pub fn dsb() {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }

        pub fn isb() {
            core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}

/// Mask IRQs and return the previous state
#[inline]
pub fn local_irq_save() -> IrqFlags {
    let flags = IrqFlags(local_irq_is_enabled());
    local_irq_disable();
    flags
}

/// Restore the state captured by [`local_irq_save`]
#[inline]
pub fn local_irq_restore(flags: IrqFlags) {
    if flags.0 {
        local_irq_enable();
    }
}
