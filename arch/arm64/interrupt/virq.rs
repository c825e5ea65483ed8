//! Pending-interrupt registry
//!
//! One [`PendingIrq`] record per virtual interrupt line of a VCPU, and the
//! two per-VCPU queues the injection engine works on:
//!
//! - the in-flight list: every line that has been asserted and not yet
//!   completed by the guest, ordered by priority (lower value first, FIFO
//!   among equal priorities)
//! - the LR-pending list: the subset of in-flight lines that wait for a
//!   free list register, ordered the same way
//!
//! Records are addressed by interrupt number; the lists hold numbers, and
//! each record carries a [`IrqLocation`] tag that mirrors its list
//! membership.

use alloc::vec::Vec;

use crate::arch::arm64::interrupt::routing::IrqDesc;

bitflags! {
    /// Injection status of a virtual interrupt
    ///
    /// The bits are independent: a level interrupt re-asserted while the
    /// guest still handles the previous instance has QUEUED and VISIBLE set
    /// at the same time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqStatus: u32 {
        /// Asserted, waiting to be presented in a list register
        const QUEUED = 1 << 0;
        /// Acknowledged by the guest and not yet completed
        const ACTIVE = 1 << 1;
        /// Currently held in a list register
        const VISIBLE = 1 << 2;
        /// Unmasked by the guest at the distributor
        const ENABLED = 1 << 3;
    }
}

impl IrqStatus {
    pub fn is_queued(self) -> bool {
        self.contains(Self::QUEUED)
    }

    pub fn is_active(self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub fn is_visible(self) -> bool {
        self.contains(Self::VISIBLE)
    }

    pub fn is_enabled(self) -> bool {
        self.contains(Self::ENABLED)
    }

    /// Clear `flag`, returning whether it was set
    pub fn test_and_clear(&mut self, flag: Self) -> bool {
        let was = self.contains(flag);
        self.remove(flag);
        was
    }
}

/// Queue membership of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqLocation {
    /// On no list
    #[default]
    NotQueued,
    /// On the in-flight list only
    InFlight,
    /// On the in-flight list and waiting on the LR-pending list
    LrPending,
}

/// Per-(VCPU, virtual interrupt) record
#[derive(Debug, Clone)]
pub struct PendingIrq {
    irq: u32,
    pub status: IrqStatus,
    /// Physical interrupt shadowed by this line, owned by the IRQ framework
    pub desc: Option<&'static IrqDesc>,
    /// List register holding the interrupt
    pub lr: Option<usize>,
    pub priority: u8,
    location: IrqLocation,
}

impl PendingIrq {
    pub fn new(irq: u32) -> Self {
        Self {
            irq,
            status: IrqStatus::empty(),
            desc: None,
            lr: None,
            priority: 0,
            location: IrqLocation::NotQueued,
        }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn location(&self) -> IrqLocation {
        self.location
    }
}

/// In-flight and LR-pending queues of one VCPU plus its records
///
/// Always accessed under the VCPU's interrupt-masking lock.
pub struct VcpuIrqQueues {
    pending: Vec<PendingIrq>,
    inflight: Vec<u32>,
    lr_pending: Vec<u32>,
}

impl VcpuIrqQueues {
    /// Records for lines `0..nr_lines`
    ///
    /// Both lists reserve room for every line so that queue operations in
    /// interrupt context never reallocate.
    pub fn new(nr_lines: u32) -> Self {
        Self {
            pending: (0..nr_lines).map(PendingIrq::new).collect(),
            inflight: Vec::with_capacity(nr_lines as usize),
            lr_pending: Vec::with_capacity(nr_lines as usize),
        }
    }

    pub fn nr_lines(&self) -> u32 {
        self.pending.len() as u32
    }

    pub fn pending(&self, irq: u32) -> &PendingIrq {
        &self.pending[irq as usize]
    }

    pub fn pending_mut(&mut self, irq: u32) -> &mut PendingIrq {
        &mut self.pending[irq as usize]
    }

    pub fn is_inflight(&self, irq: u32) -> bool {
        self.pending(irq).location != IrqLocation::NotQueued
    }

    pub fn is_lr_pending(&self, irq: u32) -> bool {
        self.pending(irq).location == IrqLocation::LrPending
    }

    /// In-flight interrupt numbers, highest priority first
    pub fn inflight(&self) -> &[u32] {
        &self.inflight
    }

    /// LR-pending interrupt numbers, highest priority first
    pub fn lr_pending(&self) -> &[u32] {
        &self.lr_pending
    }

    /// Index in `list` before which an interrupt of `priority` is inserted
    fn insert_position(&self, list: &[u32], priority: u8) -> usize {
        list.iter()
            .position(|&irq| self.pending(irq).priority > priority)
            .unwrap_or(list.len())
    }

    /// Add `irq` to the in-flight list, behind everything of equal or
    /// higher priority
    pub fn insert_inflight(&mut self, irq: u32) {
        assert_eq!(self.pending(irq).location, IrqLocation::NotQueued);
        let pos = self.insert_position(&self.inflight, self.pending(irq).priority);
        self.inflight.insert(pos, irq);
        self.pending_mut(irq).location = IrqLocation::InFlight;
    }

    /// Drop `irq` from both lists
    pub fn remove_inflight(&mut self, irq: u32) {
        if self.is_lr_pending(irq) {
            self.remove_from_lr_pending(irq);
        }
        if let Some(pos) = self.inflight.iter().position(|&i| i == irq) {
            self.inflight.remove(pos);
        }
        self.pending_mut(irq).location = IrqLocation::NotQueued;
    }

    /// Queue an in-flight `irq` for a list register; no-op if already there
    pub fn add_to_lr_pending(&mut self, irq: u32) {
        match self.pending(irq).location {
            IrqLocation::LrPending => return,
            IrqLocation::NotQueued => panic!("IRQ {} queued for an LR while not in flight", irq),
            IrqLocation::InFlight => {}
        }
        let pos = self.insert_position(&self.lr_pending, self.pending(irq).priority);
        self.lr_pending.insert(pos, irq);
        self.pending_mut(irq).location = IrqLocation::LrPending;
    }

    /// Take `irq` off the LR-pending list, keeping it in flight
    pub fn remove_from_lr_pending(&mut self, irq: u32) {
        if !self.is_lr_pending(irq) {
            return;
        }
        if let Some(pos) = self.lr_pending.iter().position(|&i| i == irq) {
            self.lr_pending.remove(pos);
        }
        self.pending_mut(irq).location = IrqLocation::InFlight;
    }

    /// Empty the LR-pending list
    pub fn clear_lr_pending(&mut self) {
        for irq in core::mem::take(&mut self.lr_pending) {
            self.pending_mut(irq).location = IrqLocation::InFlight;
        }
        self.lr_pending.reserve(self.pending.len());
    }

    /// Empty both lists
    pub fn clear_inflight(&mut self) {
        self.clear_lr_pending();
        for irq in core::mem::take(&mut self.inflight) {
            self.pending_mut(irq).location = IrqLocation::NotQueued;
        }
        self.inflight.reserve(self.pending.len());
    }

    /// Check list ordering and record/list agreement
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let ordered = |list: &[u32]| {
            list.windows(2)
                .all(|w| self.pending(w[0]).priority <= self.pending(w[1]).priority)
        };
        assert!(ordered(&self.inflight), "in-flight list out of order");
        assert!(ordered(&self.lr_pending), "LR-pending list out of order");

        for p in &self.pending {
            let in_inflight = self.inflight.contains(&p.irq);
            let in_lr_pending = self.lr_pending.contains(&p.irq);
            let expected = match (in_inflight, in_lr_pending) {
                (false, false) => IrqLocation::NotQueued,
                (true, false) => IrqLocation::InFlight,
                (true, true) => IrqLocation::LrPending,
                (false, true) => panic!("IRQ {} LR-pending but not in flight", p.irq),
            };
            assert_eq!(p.location, expected, "IRQ {} location tag", p.irq);
            if in_lr_pending {
                assert!(p.status.is_queued() && !p.status.is_visible(), "IRQ {} {:?}", p.irq, p.status);
            }
            // Masked lines wait in flight, off the LR-pending list
            let waiting = IrqStatus::QUEUED | IrqStatus::ENABLED;
            if p.status.contains(waiting) && !p.status.is_visible() {
                assert!(in_lr_pending, "enabled IRQ {} waits outside the LR-pending list", p.irq);
            }
            if !in_inflight {
                let busy = IrqStatus::QUEUED | IrqStatus::VISIBLE | IrqStatus::ACTIVE;
                assert!(!p.status.intersects(busy), "idle IRQ {} {:?}", p.irq, p.status);
            }
            if p.status.is_visible() {
                assert!(p.lr.is_some() && in_inflight, "visible IRQ {} without LR", p.irq);
            }
        }
    }
}
