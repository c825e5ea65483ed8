//! Recording GIC for host tests
//!
//! [`MockGic`] keeps list registers and hypervisor control state in
//! memory and records every distributor side effect, so the generic code
//! can be driven without hardware. List registers behave like the real
//! ones: the guest side is simulated with [`MockGic::guest_ack`] and
//! [`MockGic::guest_eoi`].

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::arch::arm64::cpu::{CpuId, CpuMask};
use crate::arch::arm64::interrupt::gic::{
    GicContext, GicHwOps, GicInfo, GicVersion, HcrFlags, LrEntry, LrState, SgiTarget,
    GIC_SPURIOUS_IRQ, VGIC_MAX_LRS,
};
use crate::arch::arm64::interrupt::gic_v2::{decode_lr, encode_lr};
use crate::arch::arm64::interrupt::routing::IrqTrigger;
use crate::arch::arm64::interrupt::vgic::VgicHwState;
use crate::vmm::{P2mMapper, Vm};
use crate::Result;

/// Everything the mock has observed
pub struct MockState {
    pub lrs: [LrEntry; VGIC_MAX_LRS],
    pub hcr: HcrFlags,
    /// Guest priority mask, list-register format
    pub vmcr_priority: u32,
    pub apr: u32,
    /// Interrupts returned by successive IAR reads
    pub iar: VecDeque<u32>,
    pub sgis: Vec<(u32, SgiTarget)>,
    pub secondary_inits: Vec<CpuId>,
    pub properties: Vec<(u32, IrqTrigger, CpuMask, u8)>,
    pub enabled: Vec<u32>,
    pub disabled: Vec<u32>,
    pub eoi: Vec<u32>,
    pub dir: Vec<u32>,
    pub saves: usize,
    pub restores: usize,
    pub interface_enabled: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            lrs: [LrEntry::default(); VGIC_MAX_LRS],
            hcr: HcrFlags::empty(),
            vmcr_priority: 0x1f,
            apr: 0,
            iar: VecDeque::new(),
            sgis: Vec::new(),
            secondary_inits: Vec::new(),
            properties: Vec::new(),
            enabled: Vec::new(),
            disabled: Vec::new(),
            eoi: Vec::new(),
            dir: Vec::new(),
            saves: 0,
            restores: 0,
            interface_enabled: true,
        }
    }
}

pub struct MockGic {
    pub info: GicInfo,
    state: spin::Mutex<MockState>,
}

impl MockGic {
    pub fn new(nr_lrs: usize, nr_lines: u32) -> Self {
        Self {
            info: GicInfo {
                version: GicVersion::V2,
                nr_lines,
                nr_lrs,
                maintenance_irq: 25,
                dbase: 0x0800_0000,
                cbase: 0x0801_0000,
            },
            state: spin::Mutex::new(MockState::default()),
        }
    }

    /// A leaked mock and a context driving it, independent of the global one
    pub fn context(
        nr_lrs: usize,
        nr_lines: u32,
        nr_cpus: usize,
    ) -> (&'static MockGic, &'static GicContext) {
        let mock: &'static MockGic = Box::leak(Box::new(MockGic::new(nr_lrs, nr_lines)));
        let gic: &'static GicContext = Box::leak(Box::new(GicContext::new(mock, nr_cpus)));
        (mock, gic)
    }

    pub fn state(&self) -> spin::MutexGuard<'_, MockState> {
        self.state.lock()
    }

    /// Guest reads IAR: the interrupt in `lr` becomes active
    pub fn guest_ack(&self, lr: usize) {
        let mut state = self.state();
        let entry = &mut state.lrs[lr];
        assert!(entry.state.contains(LrState::PENDING), "LR{} not pending", lr);
        entry.state.remove(LrState::PENDING);
        entry.state.insert(LrState::ACTIVE);
    }

    /// Guest writes EOIR: the interrupt in `lr` completes
    pub fn guest_eoi(&self, lr: usize) {
        let mut state = self.state();
        let entry = &mut state.lrs[lr];
        entry.state.remove(LrState::ACTIVE);
        if entry.state.is_empty() && entry.hw_status {
            let pirq = entry.pirq;
            state.dir.push(pirq);
        }
    }

    /// Queue `irq` for the next IAR read
    pub fn raise(&self, irq: u32) {
        self.state().iar.push_back(irq);
    }

    /// Virtual interrupts currently held in list registers
    pub fn visible(&self) -> Vec<u32> {
        let state = self.state();
        state.lrs[..self.info.nr_lrs]
            .iter()
            .filter(|lr| !lr.state.is_empty())
            .map(|lr| lr.virq)
            .collect()
    }
}

impl GicHwOps for MockGic {
    fn info(&self) -> &GicInfo {
        &self.info
    }

    fn secondary_init(&self, cpu: CpuId) {
        self.state().secondary_inits.push(cpu);
    }

    fn save_state(&self, hw: &mut VgicHwState) {
        let mut state = self.state();
        for lr in 0..self.info.nr_lrs {
            hw.v2.lr[lr] = encode_lr(&state.lrs[lr]);
            state.lrs[lr] = LrEntry::default();
        }
        hw.v2.apr = state.apr;
        hw.v2.vmcr = state.vmcr_priority << 27;
        state.hcr = HcrFlags::empty();
        state.saves += 1;
    }

    fn restore_state(&self, hw: &VgicHwState) {
        let mut state = self.state();
        for lr in 0..self.info.nr_lrs {
            state.lrs[lr] = decode_lr(hw.v2.lr[lr]);
        }
        state.apr = hw.v2.apr;
        state.vmcr_priority = hw.v2.vmcr >> 27;
        state.hcr = HcrFlags::EN;
        state.restores += 1;
    }

    fn dump_state(&self, saved: Option<&VgicHwState>) {
        let state = self.state();
        for lr in 0..self.info.nr_lrs {
            let value = saved.map_or_else(|| encode_lr(&state.lrs[lr]), |hw| hw.v2.lr[lr]);
            log::info!("   HW_LR[{}]={:#010x}", lr, value);
        }
    }

    fn gicv_setup(&self, _vm: &Vm, _mapper: &dyn P2mMapper) -> Result<()> {
        Ok(())
    }

    fn send_sgi(&self, sgi: u32, target: SgiTarget) {
        self.state().sgis.push((sgi, target));
    }

    fn disable_interface(&self) {
        self.state().interface_enabled = false;
    }

    fn read_irq(&self) -> u32 {
        self.state().iar.pop_front().unwrap_or(GIC_SPURIOUS_IRQ)
    }

    fn eoi_irq(&self, irq: u32) {
        self.state().eoi.push(irq);
    }

    fn deactivate_irq(&self, irq: u32) {
        self.state().dir.push(irq);
    }

    fn irq_enable(&self, irq: u32) {
        self.state().enabled.push(irq);
    }

    fn irq_disable(&self, irq: u32) {
        self.state().disabled.push(irq);
    }

    fn set_irq_properties(&self, irq: u32, trigger: IrqTrigger, cpu_mask: CpuMask, priority: u8) {
        self.state().properties.push((irq, trigger, cpu_mask, priority));
    }

    fn read_lr(&self, lr: usize) -> LrEntry {
        assert!(lr < self.info.nr_lrs);
        self.state().lrs[lr]
    }

    fn write_lr(&self, lr: usize, entry: &LrEntry) {
        assert!(lr < self.info.nr_lrs);
        self.state().lrs[lr] = *entry;
    }

    fn clear_lr(&self, lr: usize) {
        assert!(lr < self.info.nr_lrs);
        self.state().lrs[lr] = LrEntry::default();
    }

    fn update_hcr_status(&self, flag: HcrFlags, set: bool) {
        self.state().hcr.set(flag, set);
    }

    fn read_vmcr_priority(&self) -> u32 {
        self.state().vmcr_priority
    }

    fn read_apr(&self, _reg: usize) -> u32 {
        self.state().apr
    }
}
