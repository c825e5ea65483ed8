//! Virtual CPU
//!
//! Scheduling state the interrupt core needs to know about, plus the
//! per-VCPU interrupt queues and saved list-register context.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::arm64::cpu::CpuId;
use crate::arch::arm64::interrupt::rank::RankRouting;
use crate::arch::arm64::interrupt::vgic::{VcpuGicState, VgicVcpu, VgicVersion};
use crate::sync::SpinLock;

/// VCPU index within its VM
pub type VcpuId = usize;

/// MPIDR_EL1 RES1 bit
pub const MPIDR_SMP: u64 = 1 << 31;
/// Affinity fields of MPIDR_EL1
pub const MPIDR_AFF_MASK: u64 = 0xff_00ff_ffff;

/// Not loaded on any physical CPU
const NOT_RUNNING: usize = usize::MAX;

/// Virtual CPU
pub struct Vcpu {
    id: VcpuId,
    /// Virtual MPIDR presented to the guest
    vmpidr: u64,
    online: AtomicBool,
    /// Physical CPU the VCPU is loaded on
    processor: AtomicUsize,
    vgic: VgicVcpu,
    gic_state: SpinLock<VcpuGicState>,
}

impl Vcpu {
    /// Create VCPU `id` of a VM with `nr_lines` interrupt lines
    ///
    /// Only VCPU 0 starts online. Private lines are routed to the VCPU
    /// itself; SGIs are edge-triggered, PPIs level-triggered.
    pub fn new(id: VcpuId, nr_lines: u32, version: VgicVersion) -> Self {
        // 16 VCPUs per cluster
        let vmpidr = MPIDR_SMP | (((id / 16) as u64) << 8) | (id % 16) as u64;

        let vgic = VgicVcpu::new(nr_lines, version);
        {
            let mut regs = vgic.private_rank().lock();
            regs.icfg[0] = 0xaaaa_aaaa;
            match &mut regs.routing {
                RankRouting::Targets(targets) => {
                    targets.fill((1u32 << (id % 8)) * 0x0101_0101);
                }
                RankRouting::Affinity(routes) => {
                    routes.fill(vmpidr & MPIDR_AFF_MASK);
                }
            }
        }

        Self {
            id,
            vmpidr,
            online: AtomicBool::new(id == 0),
            processor: AtomicUsize::new(NOT_RUNNING),
            vgic,
            gic_state: SpinLock::new(VcpuGicState::default()),
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn vmpidr(&self) -> u64 {
        self.vmpidr
    }

    /// Affinity level `level` of the virtual MPIDR
    pub fn affinity(&self, level: u32) -> u8 {
        let shift = match level {
            0 => 0,
            1 => 8,
            2 => 16,
            _ => 32,
        };
        (self.vmpidr >> shift) as u8
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Physical CPU the VCPU is loaded on
    pub fn running_on(&self) -> Option<CpuId> {
        match self.processor.load(Ordering::Acquire) {
            NOT_RUNNING => None,
            cpu => Some(cpu),
        }
    }

    pub fn is_running_on(&self, cpu: CpuId) -> bool {
        self.running_on() == Some(cpu)
    }

    /// Record a context switch of the VCPU
    pub fn set_running_on(&self, cpu: Option<CpuId>) {
        self.processor
            .store(cpu.unwrap_or(NOT_RUNNING), Ordering::Release);
    }

    pub fn vgic(&self) -> &VgicVcpu {
        &self.vgic
    }

    /// Saved list-register context
    pub fn gic_state(&self) -> spin::MutexGuard<'_, VcpuGicState> {
        self.gic_state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0, 0; "first vcpu")]
    #[test_case(5, 0, 5; "first cluster")]
    #[test_case(17, 1, 1; "second cluster")]
    fn test_vmpidr_affinity(id: VcpuId, aff1: u8, aff0: u8) {
        let v = Vcpu::new(id, 32, VgicVersion::V3);
        assert_eq!(v.affinity(1), aff1);
        assert_eq!(v.affinity(0), aff0);
        assert_ne!(v.vmpidr() & MPIDR_SMP, 0);
    }

    #[test]
    fn test_private_rank_defaults() {
        let v = Vcpu::new(2, 32, VgicVersion::V2);
        let regs = v.vgic().private_rank().lock();
        assert_eq!(regs.icfg, [0xaaaa_aaaa, 0]);
        assert_eq!(regs.itargets().unwrap()[3], 0x0404_0404);
        drop(regs);

        let v = Vcpu::new(17, 32, VgicVersion::V3);
        assert_eq!(v.vgic().private_rank().lock().irouter().unwrap()[31], 0x101);
    }

    #[test]
    fn test_online_and_placement() {
        let v0 = Vcpu::new(0, 32, VgicVersion::V2);
        let v1 = Vcpu::new(1, 32, VgicVersion::V2);
        assert!(v0.is_online());
        assert!(!v1.is_online());

        assert_eq!(v1.running_on(), None);
        v1.set_running_on(Some(3));
        assert!(v1.is_running_on(3));
        assert!(!v1.is_running_on(0));
        v1.set_running_on(None);
        assert_eq!(v1.running_on(), None);
    }
}
