//! VGIC (Virtual GIC) injection engine
//!
//! Generation-independent list-register management and the virtual
//! distributor operations shared by the GICv2 and GICv3 emulations.
//!
//! Per-CPU view: each physical CPU owns `nr_lrs` list registers and a mask
//! of the occupied ones. Whenever a VCPU is scheduled out, the mask is
//! copied into the VCPU together with the hardware registers; scheduling
//! it back in restores both and refills free slots from the VCPU's
//! LR-pending list.
//!
//! Slot pressure: new interrupts take the first free list register. When
//! none is free they wait on the LR-pending list, and the next refill pass
//! may evict a lower-priority interrupt that the guest has not started to
//! service. If interrupts are still waiting after a refill, the underflow
//! maintenance interrupt is armed so the engine runs again once the guest
//! frees a slot.
//!
//! Lock order: per-VCPU queue lock, then rank lock. The per-VM distributor
//! lock is never held together with either.

use alloc::vec::Vec;

use crate::arch::arm64::cpu::{local_irq_is_enabled, CpuId};
use crate::arch::arm64::interrupt::gic::{
    GicContext, HcrFlags, LrEntry, LrState, Sgi, VGIC_MAX_LRS,
};
use crate::arch::arm64::interrupt::rank::{nr_ranks, rank_nr, VgicIrqRank, IRQS_PER_RANK};
use crate::arch::arm64::interrupt::routing::IrqDescStatus;
use crate::arch::arm64::interrupt::virq::{IrqStatus, PendingIrq, VcpuIrqQueues};
use crate::config::gic_pri_to_guest;
use crate::sync::{IrqSpinLock, IrqSpinLockGuard};
use crate::utils::bitmap::{
    find_first_zero_bit, find_next_bit, find_next_zero_bit, iter_set_bits, low_mask,
};
use crate::vmm::{Vcpu, Vm};

/// Maximum number of VCPUs of a GICv2 guest
pub const VGIC_V2_MAX_NCPU: usize = 8;

/// Maximum number of VCPUs of a GICv3 guest
pub const VGIC_V3_MAX_NCPU: usize = 64;

/// Emulated controller generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgicVersion {
    /// GICv2
    V2,
    /// GICv3
    V3,
}

impl VgicVersion {
    pub const fn max_vcpus(self) -> usize {
        match self {
            VgicVersion::V2 => VGIC_V2_MAX_NCPU,
            VgicVersion::V3 => VGIC_V3_MAX_NCPU,
        }
    }
}

/// Target selection of a guest SGI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgiMode {
    /// VCPUs named in the target list
    List,
    /// Every VCPU but the sender
    Others,
    /// The sender only
    SelfOnly,
}

/// GICv2 virtual CPU interface registers
#[derive(Debug, Clone, Copy)]
pub struct VgicHwStateV2 {
    /// Virtual Machine Control Register
    pub vmcr: u32,
    /// Active Priorities Register
    pub apr: u32,
    /// List registers
    pub lr: [u32; VGIC_MAX_LRS],
}

impl Default for VgicHwStateV2 {
    fn default() -> Self {
        Self {
            vmcr: 0,
            apr: 0,
            lr: [0; VGIC_MAX_LRS],
        }
    }
}

/// VGIC hardware state of a descheduled VCPU
#[derive(Debug, Clone, Copy, Default)]
pub struct VgicHwState {
    /// GICv2 specific state
    pub v2: VgicHwStateV2,
}

/// Per-VCPU hardware context saved across context switches
#[derive(Debug, Clone, Copy, Default)]
pub struct VcpuGicState {
    /// List registers in use when the VCPU was descheduled
    pub lr_mask: u64,
    pub hw: VgicHwState,
}

/// Per-VCPU virtual interrupt state
pub struct VgicVcpu {
    queues: IrqSpinLock<VcpuIrqQueues>,
    /// Banked rank 0: SGIs and PPIs
    private: VgicIrqRank,
}

impl VgicVcpu {
    pub fn new(nr_lines: u32, version: VgicVersion) -> Self {
        let private = match version {
            VgicVersion::V2 => VgicIrqRank::with_targets(),
            VgicVersion::V3 => VgicIrqRank::with_affinity(),
        };
        Self {
            queues: IrqSpinLock::new(VcpuIrqQueues::new(nr_lines)),
            private,
        }
    }

    /// Take the per-VCPU queue lock, masking local IRQs
    pub fn lock(&self) -> IrqSpinLockGuard<'_, VcpuIrqQueues> {
        self.queues.lock()
    }

    pub fn private_rank(&self) -> &VgicIrqRank {
        &self.private
    }
}

/// Distributor-wide scalar state
#[derive(Debug, Default)]
pub struct VgicDist {
    pub ctlr: u32,
}

/// Guest-physical placement of the emulated controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgicLayout {
    pub dbase: u64,
    pub dbase_size: u64,
    /// GICv2 CPU interface
    pub cbase: u64,
    /// GICv3 first redistributor
    pub rbase: u64,
    pub rdist_stride: u64,
}

/// Per-VM virtual distributor
pub struct VgicDomain {
    version: VgicVersion,
    nr_lines: u32,
    layout: VgicLayout,
    dist: IrqSpinLock<VgicDist>,
    /// Ranks 1.. (SPIs)
    shared: Vec<VgicIrqRank>,
}

impl VgicDomain {
    pub fn new(version: VgicVersion, nr_lines: u32, layout: VgicLayout) -> Self {
        // SPIs start out targeting VCPU 0.
        let shared = (1..nr_ranks(nr_lines))
            .map(|_| match version {
                VgicVersion::V2 => {
                    let rank = VgicIrqRank::with_targets();
                    if let Some(targets) = rank.lock().itargets_mut() {
                        targets.fill(0x0101_0101);
                    }
                    rank
                }
                VgicVersion::V3 => VgicIrqRank::with_affinity(),
            })
            .collect();

        Self {
            version,
            nr_lines,
            layout,
            dist: IrqSpinLock::new(VgicDist::default()),
            shared,
        }
    }

    pub fn version(&self) -> VgicVersion {
        self.version
    }

    /// Interrupt lines including SGIs and PPIs
    pub fn nr_lines(&self) -> u32 {
        self.nr_lines
    }

    pub fn layout(&self) -> &VgicLayout {
        &self.layout
    }

    pub fn dbase(&self) -> u64 {
        self.layout.dbase
    }

    pub fn cbase(&self) -> u64 {
        self.layout.cbase
    }

    /// Take the per-VM distributor lock
    pub fn lock(&self) -> IrqSpinLockGuard<'_, VgicDist> {
        self.dist.lock()
    }

    pub fn ctlr(&self) -> u32 {
        self.dist.lock().ctlr
    }

    pub(crate) fn shared_rank(&self, rank: usize) -> Option<&VgicIrqRank> {
        rank.checked_sub(1).and_then(|i| self.shared.get(i))
    }

    pub fn in_distributor(&self, gpa: u64) -> bool {
        gpa >= self.layout.dbase && gpa - self.layout.dbase < self.layout.dbase_size
    }
}

impl GicContext {
    /// Program list register `lr` with `p` and mark it visible
    fn set_lr(&self, lr: usize, p: &mut PendingIrq, state: LrState) {
        debug_assert!(!local_irq_is_enabled());
        assert!(lr < self.nr_lrs(), "LR{} not implemented", lr);

        let entry = LrEntry {
            pirq: p.desc.map_or(0, |desc| desc.irq()),
            virq: p.irq(),
            priority: gic_pri_to_guest(p.priority),
            state,
            hw_status: p.desc.is_some(),
            grp1: false,
        };
        self.ops().write_lr(lr, &entry);

        p.status.insert(IrqStatus::VISIBLE);
        p.status.remove(IrqStatus::QUEUED);
        p.lr = Some(lr);
    }

    /// Present queued interrupt `virq` of `v`
    ///
    /// Takes a free list register directly when `v` runs on `cpu` and
    /// nothing is waiting ahead of it; otherwise queues it on the
    /// LR-pending list.
    pub fn raise_guest_irq(&self, cpu: CpuId, v: &Vcpu, q: &mut VcpuIrqQueues, virq: u32) {
        if v.is_running_on(cpu) && q.lr_pending().is_empty() {
            let nr_lrs = self.nr_lrs();
            let i = find_first_zero_bit(self.lr_mask(cpu), nr_lrs);
            if i < nr_lrs {
                self.set_lr_bit(cpu, i);
                self.set_lr(i, q.pending_mut(virq), LrState::PENDING);
                return;
            }
        }

        q.add_to_lr_pending(virq);
    }

    /// Re-assertion of an interrupt that is already in flight
    pub fn raise_inflight_irq(&self, cpu: CpuId, v: &Vcpu, q: &mut VcpuIrqQueues, virq: u32) {
        // Already waiting for a slot: nothing more to do.
        if q.is_lr_pending(virq) {
            return;
        }

        if v.is_running_on(cpu) {
            if let Some(lr) = q.pending(virq).lr {
                self.update_one_lr(cpu, v, q, lr);
            }
        }
    }

    /// Fold the hardware state of list register `lr` back into its record
    fn update_one_lr(&self, cpu: CpuId, v: &Vcpu, q: &mut VcpuIrqQueues, lr: usize) {
        debug_assert!(!local_irq_is_enabled());

        let entry = self.ops().read_lr(lr);
        let irq = entry.virq;
        if irq >= q.nr_lines() {
            log::error!("vcpu{}: LR{} holds unknown IRQ{}", v.id(), lr, irq);
            return;
        }

        let p = q.pending_mut(irq);
        if entry.state.contains(LrState::ACTIVE) {
            p.status.insert(IrqStatus::ACTIVE);
            if p.status.is_enabled() && p.status.test_and_clear(IrqStatus::QUEUED) {
                if p.desc.is_none() {
                    let mut rearmed = entry;
                    rearmed.state |= LrState::PENDING;
                    self.ops().write_lr(lr, &rearmed);
                } else {
                    log::warn!(
                        "vcpu{}: cannot re-inject hw IRQ{}, still active in LR{}",
                        v.id(),
                        irq,
                        lr
                    );
                }
            }
        } else if entry.state.contains(LrState::PENDING) {
            p.status.remove(IrqStatus::ACTIVE);
            if p.status.test_and_clear(IrqStatus::QUEUED) {
                log::debug!("vcpu{}: IRQ{} re-asserted while pending in LR{}", v.id(), irq, lr);
            }
        } else {
            self.ops().clear_lr(lr);
            self.clear_lr_bit(cpu, lr);

            if let Some(desc) = p.desc {
                desc.clear_status(IrqDescStatus::INPROGRESS);
            }
            p.status.remove(IrqStatus::VISIBLE | IrqStatus::ACTIVE);
            p.lr = None;

            // A masked line asserted again stays in flight until enabled
            match (p.status.is_queued(), p.status.is_enabled()) {
                (true, true) => self.raise_guest_irq(cpu, v, q, irq),
                (true, false) => {}
                (false, _) => q.remove_inflight(irq),
            }
        }
    }

    /// Reconcile every occupied list register of `cpu` with `v`'s records
    ///
    /// Runs on guest exit. Calling it again without new hardware events
    /// changes nothing.
    pub fn clear_lrs(&self, cpu: CpuId, v: &Vcpu) {
        debug_assert!(v.is_running_on(cpu));

        let mut q = v.vgic().lock();
        let nr_lrs = self.nr_lrs();
        let mut i = 0;
        loop {
            i = self.next_used_lr(self.lr_mask(cpu), i);
            if i >= nr_lrs {
                break;
            }
            self.update_one_lr(cpu, v, &mut q, i);
            i += 1;
        }
    }

    /// Move LR-pending interrupts of `v` into list registers, evicting
    /// lower-priority ones the guest has not acknowledged
    pub(crate) fn restore_pending_irqs(&self, cpu: CpuId, v: &Vcpu) {
        let mut q = v.vgic().lock();
        if q.lr_pending().is_empty() {
            return;
        }

        let nr_lrs = self.nr_lrs();
        let candidates: heapless::Vec<u32, VGIC_MAX_LRS> =
            q.lr_pending().iter().copied().take(nr_lrs).collect();

        // Victims are searched below this in-flight index, walking to the head.
        let mut cursor = q.inflight().len();
        let mut lr = 0;

        for irq in candidates {
            lr = find_next_zero_bit(self.lr_mask(cpu), nr_lrs, lr);
            if lr >= nr_lrs {
                let priority = q.pending(irq).priority;
                let mut victim = None;
                while cursor > 0 {
                    cursor -= 1;
                    let candidate = q.pending(q.inflight()[cursor]);
                    if candidate.priority <= priority {
                        break;
                    }
                    if candidate.status.is_visible() && !candidate.status.is_active() {
                        victim = Some(candidate.irq());
                        break;
                    }
                }
                let Some(victim) = victim else {
                    return;
                };

                let pv = q.pending_mut(victim);
                let Some(slot) = pv.lr.take() else {
                    panic!("vcpu{}: visible IRQ{} has no list register", v.id(), victim);
                };
                pv.status.insert(IrqStatus::QUEUED);
                pv.status.remove(IrqStatus::VISIBLE);
                q.add_to_lr_pending(victim);
                log::trace!("vcpu{}: IRQ{} evicts IRQ{} from LR{}", v.id(), irq, victim, slot);
                lr = slot;
            }

            self.set_lr(lr, q.pending_mut(irq), LrState::PENDING);
            q.remove_from_lr_pending(irq);
            self.set_lr_bit(cpu, lr);
        }
    }

    /// Forget every queued and in-flight interrupt of `v`
    pub fn clear_pending_irqs(&self, v: &Vcpu) {
        let mut q = v.vgic().lock();
        let inflight: Vec<u32> = q.inflight().to_vec();
        for irq in inflight {
            let p = q.pending_mut(irq);
            p.status.remove(IrqStatus::QUEUED | IrqStatus::VISIBLE | IrqStatus::ACTIVE);
            p.lr = None;
        }
        q.clear_inflight();
        v.gic_state().lr_mask = 0;
    }

    /// Should the guest's virtual IRQ line be asserted on resume
    ///
    /// Compares the highest-priority enabled, non-active in-flight
    /// interrupt with the guest's priority mask and running priority.
    /// Must run on the CPU `v` is loaded on.
    pub fn events_need_delivery(&self, v: &Vcpu) -> bool {
        let mask_priority = self.ops().read_vmcr_priority();
        let active_priority = find_next_bit(self.ops().read_apr(0) as u64, 32, 0) as u32;

        let q = v.vgic().lock();
        for &irq in q.inflight() {
            let p = q.pending(irq);
            if p.status.is_active() {
                continue;
            }
            let priority = gic_pri_to_guest(p.priority) as u32;
            if priority >= mask_priority || priority >= active_priority {
                return false;
            }
            if p.status.is_enabled() {
                return true;
            }
        }
        false
    }

    /// Guest entry: refill list registers and arm the underflow
    /// maintenance interrupt if interrupts are left waiting
    pub fn inject(&self, cpu: CpuId, v: &Vcpu) {
        debug_assert!(!local_irq_is_enabled());

        self.restore_pending_irqs(cpu, v);

        let waiting = !v.vgic().lock().lr_pending().is_empty();
        self.ops()
            .update_hcr_status(HcrFlags::UIE, waiting && self.lr_all_full(cpu));
    }

    /// Log the in-flight and LR-pending lists of `v`
    pub fn dump_info(&self, cpu: CpuId, v: &Vcpu) {
        self.dump_state(cpu, v);

        let q = v.vgic().lock();
        for &irq in q.inflight() {
            let p = q.pending(irq);
            log::info!(
                "Inflight irq={} lr={:?} status={:?} prio={:#x}",
                irq,
                p.lr,
                p.status,
                p.priority
            );
        }
        for &irq in q.lr_pending() {
            let p = q.pending(irq);
            log::info!("Pending irq={} status={:?} prio={:#x}", irq, p.status, p.priority);
        }
    }
}

impl Vm {
    /// Rank `n` as seen by `v`: rank 0 is `v`'s banked one
    pub fn rank<'a>(&'a self, v: &'a Vcpu, n: usize) -> Option<&'a VgicIrqRank> {
        if n == 0 {
            Some(v.vgic().private_rank())
        } else {
            self.vgic().shared_rank(n)
        }
    }

    /// Rank addressed by byte `offset` of a register array with `bits`
    /// bits per line
    pub fn rank_for_offset<'a>(
        &'a self,
        v: &'a Vcpu,
        bits: u32,
        offset: u32,
    ) -> Option<&'a VgicIrqRank> {
        self.rank(v, rank_nr(bits, offset))
    }

    /// VCPU an interrupt is delivered to
    ///
    /// Private lines belong to `v`; shared lines are delivered to VCPU 0.
    pub fn irq_target<'a>(&'a self, v: &'a Vcpu, irq: u32) -> &'a Vcpu {
        if irq < IRQS_PER_RANK {
            v
        } else {
            self.vcpu0()
        }
    }

    /// Guest-programmed priority of `irq`
    pub fn virq_priority(&self, v: &Vcpu, irq: u32) -> u8 {
        let n = (irq / IRQS_PER_RANK) as usize;
        self.rank(v, n)
            .map_or(0, |rank| rank.lock().priority(irq % IRQS_PER_RANK))
    }

    /// Assert virtual interrupt `virq` on `v`, called on `cpu`
    pub fn vcpu_inject_irq(&self, cpu: CpuId, v: &Vcpu, virq: u32) {
        assert!(virq < self.vgic().nr_lines(), "IRQ{} beyond VM lines", virq);

        let priority = self.virq_priority(v, virq);
        let gic = self.gic();
        {
            let mut q = v.vgic().lock();

            if q.is_inflight(virq) {
                q.pending_mut(virq).status.insert(IrqStatus::QUEUED);
                gic.raise_inflight_irq(cpu, v, &mut q, virq);
            } else if v.is_online() {
                let n = q.pending_mut(virq);
                n.status.insert(IrqStatus::QUEUED);
                n.priority = priority;
                let enabled = n.status.is_enabled();

                q.insert_inflight(virq);
                if enabled {
                    gic.raise_guest_irq(cpu, v, &mut q, virq);
                }
            } else {
                log::debug!("vcpu{}: IRQ{} dropped, VCPU is down", v.id(), virq);
            }
        }

        self.kick_vcpu(cpu, v);
    }

    /// Make `v` notice new work if it runs on another CPU
    fn kick_vcpu(&self, cpu: CpuId, v: &Vcpu) {
        if let Some(pcpu) = v.running_on() {
            if pcpu != cpu {
                self.gic().send_sgi_one(pcpu, Sgi::EventCheck);
            }
        }
    }

    /// Unmask the lines of rank `n` set in `r`
    pub fn enable_irqs(&self, cpu: CpuId, v: &Vcpu, r: u32, n: usize) {
        for i in iter_set_bits(r as u64, IRQS_PER_RANK as usize) {
            let irq = i as u32 + IRQS_PER_RANK * n as u32;
            if irq >= self.vgic().nr_lines() {
                break;
            }
            let target = self.irq_target(v, irq);

            let (desc, raised) = {
                let mut q = target.vgic().lock();
                q.pending_mut(irq).status.insert(IrqStatus::ENABLED);
                let raise = q.is_inflight(irq) && !q.pending(irq).status.is_visible();
                if raise {
                    self.gic().raise_guest_irq(cpu, target, &mut q, irq);
                }
                (q.pending(irq).desc, raise)
            };

            if let Some(desc) = desc {
                desc.enable();
            }
            if raised {
                self.kick_vcpu(cpu, target);
            }
        }
    }

    /// Mask the lines of rank `n` set in `r`
    pub fn disable_irqs(&self, v: &Vcpu, r: u32, n: usize) {
        for i in iter_set_bits(r as u64, IRQS_PER_RANK as usize) {
            let irq = i as u32 + IRQS_PER_RANK * n as u32;
            if irq >= self.vgic().nr_lines() {
                break;
            }
            let target = self.irq_target(v, irq);

            let desc = {
                let mut q = target.vgic().lock();
                q.pending_mut(irq).status.remove(IrqStatus::ENABLED);
                q.remove_from_lr_pending(irq);
                q.pending(irq).desc
            };

            if let Some(desc) = desc {
                desc.disable();
            }
        }
    }

    /// Software set-pending of the lines of rank `n` set in `r`
    pub fn pend_irqs(&self, cpu: CpuId, v: &Vcpu, r: u32, n: usize) {
        for i in iter_set_bits(r as u64, IRQS_PER_RANK as usize) {
            let irq = i as u32 + IRQS_PER_RANK * n as u32;
            if irq >= self.vgic().nr_lines() {
                break;
            }
            self.vcpu_inject_irq(cpu, self.irq_target(v, irq), irq);
        }
    }

    /// Software clear-pending of the lines of rank `n` set in `r`
    ///
    /// Withdraws interrupts that wait for a list register. Interrupts
    /// already presented to the guest, and lines backed by a physical
    /// interrupt, stay as they are.
    pub fn unpend_irqs(&self, v: &Vcpu, r: u32, n: usize) {
        for i in iter_set_bits(r as u64, IRQS_PER_RANK as usize) {
            let irq = i as u32 + IRQS_PER_RANK * n as u32;
            if irq >= self.vgic().nr_lines() {
                break;
            }
            let target = self.irq_target(v, irq);
            let mut q = target.vgic().lock();
            let p = q.pending(irq);
            if p.desc.is_some() {
                log::debug!("vcpu{}: clear-pending of hw IRQ{} ignored", target.id(), irq);
                continue;
            }
            if p.status.is_visible() {
                q.pending_mut(irq).status.remove(IrqStatus::QUEUED);
            } else if q.is_inflight(irq) {
                q.pending_mut(irq).status.remove(IrqStatus::QUEUED);
                q.remove_inflight(irq);
            }
        }
    }

    /// Deliver guest SGI `virq` from `v`
    ///
    /// `targets` is a bitmap of VCPU ids, used in [`SgiMode::List`] mode.
    pub fn to_sgi(&self, cpu: CpuId, v: &Vcpu, mode: SgiMode, virq: u32, targets: u64) {
        assert!(virq < 16, "SGI{} out of range", virq);

        let mask = match mode {
            SgiMode::List => targets,
            SgiMode::Others => low_mask(self.nr_vcpus()) & !(1u64 << v.id()),
            SgiMode::SelfOnly => 1u64 << v.id(),
        };

        for id in iter_set_bits(mask, 64) {
            match self.vcpu(id) {
                Some(target) if target.is_online() => self.vcpu_inject_irq(cpu, target, virq),
                _ => log::warn!(
                    "VM {}: vcpu{} sent SGI{} to offline or absent vcpu{}",
                    self.id(),
                    v.id(),
                    virq,
                    id
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::cpu::CpuMask;
    use crate::arch::arm64::interrupt::gic::SgiTarget;
    use crate::arch::arm64::interrupt::mock::MockGic;
    use crate::arch::arm64::interrupt::tests::{new_vm, with_irqs_disabled};

    #[test]
    fn test_domain_ranks() {
        let layout = VgicLayout {
            dbase: 0x1000,
            dbase_size: 0x1000,
            cbase: 0x2000,
            rbase: 0,
            rdist_stride: 0,
        };
        let d = VgicDomain::new(VgicVersion::V2, 96, layout);
        assert!(d.shared_rank(0).is_none());
        assert!(d.shared_rank(2).is_some());
        assert!(d.shared_rank(3).is_none());
        assert!(d.in_distributor(0x1ffc));
        assert!(!d.in_distributor(0x2000));
    }

    #[test]
    fn test_inject_takes_free_lr() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));
        vm.enable_irqs(0, v, 1 << 8, 1);

        with_irqs_disabled(|| vm.vcpu_inject_irq(0, v, 40));

        let q = v.vgic().lock();
        assert!(q.pending(40).status.is_visible());
        assert_eq!(q.pending(40).lr, Some(0));
        assert_eq!(gic.lr_used(0), 1);
        assert_eq!(mock.state().lrs[0].virq, 40);
        q.check_invariants();
    }

    #[test]
    fn test_disabled_line_stays_queued_until_enabled() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));

        vm.vcpu_inject_irq(0, v, 33);
        {
            let q = v.vgic().lock();
            assert!(q.is_inflight(33));
            assert!(!q.is_lr_pending(33));
            assert!(q.pending(33).status.is_queued());
        }

        vm.enable_irqs(0, v, 1 << 1, 1);
        let q = v.vgic().lock();
        assert!(q.pending(33).status.is_visible());
        q.check_invariants();
    }

    #[test]
    fn test_inject_to_remote_vcpu_kicks() {
        let (mock, gic) = MockGic::context(4, 64, 2);
        gic.init_secondary_cpu(1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(1));
        vm.enable_irqs(0, v, 1, 1);

        vm.vcpu_inject_irq(0, v, 32);

        assert!(v.vgic().lock().is_lr_pending(32));
        assert_eq!(gic.lr_used(0), 0);
        assert_eq!(mock.state().sgis, [(0, SgiTarget::List(CpuMask::of(1)))]);
    }

    #[test]
    fn test_active_lr_rearms_software_irq() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));
        vm.enable_irqs(0, v, 1 << 2, 1);

        with_irqs_disabled(|| {
            vm.vcpu_inject_irq(0, v, 34);
            mock.guest_ack(0);
            // Level re-assertion while the guest services the first one.
            vm.vcpu_inject_irq(0, v, 34);
        });

        let lr = mock.state().lrs[0];
        assert_eq!(lr.state, LrState::PENDING | LrState::ACTIVE);
        let q = v.vgic().lock();
        assert!(q.pending(34).status.is_active());
        assert!(!q.pending(34).status.is_queued());
    }

    #[test]
    fn test_completed_lr_is_released() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));
        vm.enable_irqs(0, v, 1 << 3, 1);

        with_irqs_disabled(|| {
            vm.vcpu_inject_irq(0, v, 35);
            mock.guest_ack(0);
            mock.guest_eoi(0);
            gic.clear_lrs(0, v);
        });

        assert_eq!(gic.lr_used(0), 0);
        let q = v.vgic().lock();
        assert!(!q.is_inflight(35));
        assert!(q.pending(35).status.is_enabled());
        assert_eq!(q.pending(35).lr, None);
        assert_eq!(mock.state().lrs[0], LrEntry::default());
    }

    #[test]
    fn test_events_need_delivery() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));
        vm.enable_irqs(0, v, 1 << 4, 1);
        // priority 0x40 -> guest priority 8
        vm.vgic().shared_rank(1).unwrap().lock().ipriority[1] = 0x40;

        assert!(!gic.events_need_delivery(v));
        with_irqs_disabled(|| vm.vcpu_inject_irq(0, v, 36));

        mock.state().vmcr_priority = 0x1f;
        assert!(gic.events_need_delivery(v));
        mock.state().vmcr_priority = 8;
        assert!(!gic.events_need_delivery(v));
        mock.state().vmcr_priority = 0x1f;
        mock.state().apr = 1 << 4;
        assert!(!gic.events_need_delivery(v));
    }

    #[test]
    fn test_clear_pending_irqs_empties_queues() {
        let (_, gic) = MockGic::context(1, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 1, 64);
        let v = vm.vcpu0();
        v.set_running_on(Some(0));
        vm.enable_irqs(0, v, 0b11, 1);
        with_irqs_disabled(|| {
            vm.vcpu_inject_irq(0, v, 32);
            vm.vcpu_inject_irq(0, v, 33);
        });
        assert!(v.vgic().lock().is_lr_pending(33));

        gic.clear_pending_irqs(v);

        let q = v.vgic().lock();
        assert!(q.inflight().is_empty());
        assert!(q.lr_pending().is_empty());
        assert!(q.pending(32).status.is_enabled());
        assert!(!q.pending(32).status.is_visible());
        drop(q);
        assert_eq!(v.gic_state().lr_mask, 0);
    }

    #[test]
    fn test_to_sgi_modes() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = new_vm(gic, VgicVersion::V2, 3, 64);
        for id in 0..3 {
            vm.vcpu(id).unwrap().set_online(true);
        }
        let v0 = vm.vcpu0();

        vm.to_sgi(0, v0, SgiMode::Others, 5, 0);
        assert!(!v0.vgic().lock().is_inflight(5));
        assert!(vm.vcpu(1).unwrap().vgic().lock().is_inflight(5));
        assert!(vm.vcpu(2).unwrap().vgic().lock().is_inflight(5));

        vm.to_sgi(0, v0, SgiMode::SelfOnly, 6, 0);
        assert!(v0.vgic().lock().is_inflight(6));

        vm.vcpu(2).unwrap().set_online(false);
        vm.to_sgi(0, v0, SgiMode::List, 7, 0b1100);
        assert!(!vm.vcpu(2).unwrap().vgic().lock().is_inflight(7));
    }
}
