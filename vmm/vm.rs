//! Virtual machine
//!
//! A [`Vm`] owns its VCPUs, its virtual distributor and a VMID. Guest
//! accesses to the emulated interrupt controller enter through
//! [`Vm::mmio_read`] and [`Vm::mmio_write`].

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::arm64::cpu::CpuId;
use crate::arch::arm64::interrupt::gic::{GicContext, GIC_SPI_BASE};
use crate::arch::arm64::interrupt::mmio::{MmioAccess, MmioFault, MmioResult};
use crate::arch::arm64::interrupt::rank::IRQS_PER_RANK;
use crate::arch::arm64::interrupt::vgic::{VgicDomain, VgicLayout, VgicVersion};
use crate::arch::arm64::interrupt::{vgic_v2, vgic_v3};
use crate::config::{
    GICD_FRAME_SIZE, GUEST_GICC_BASE, GUEST_GICD_BASE, GUEST_GICV3_GICD_BASE,
    GUEST_GICV3_GICD_SIZE, GUEST_GICV3_GICR0_BASE, GUEST_GICV3_RDIST_STRIDE,
};
use crate::vmm::{P2mMapper, Vcpu, Vmid, VMID_ALLOCATOR};
use crate::{Error, Result};

/// VM identifier
pub type VmId = u32;

/// Lines an emulated distributor can expose
pub const VGIC_MAX_LINES: u32 = 1024;

/// VM creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub id: VmId,
    pub nr_vcpus: usize,
    /// Interrupt lines including SGIs and PPIs; rounded up to a multiple
    /// of 32. Ignored for the hardware domain, which mirrors the host.
    pub nr_lines: u32,
    pub vgic_version: VgicVersion,
    /// Owns the physical devices and sees the host controller layout
    pub hardware_domain: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            id: 0,
            nr_vcpus: 1,
            nr_lines: 64,
            vgic_version: VgicVersion::V2,
            hardware_domain: false,
        }
    }
}

/// Virtual machine
pub struct Vm {
    id: VmId,
    vmid: Vmid,
    hardware_domain: bool,
    gic: &'static GicContext,
    vcpus: Vec<Vcpu>,
    vgic: VgicDomain,
    crashed: AtomicBool,
}

impl Vm {
    /// Create a VM with its VCPUs and virtual distributor
    pub fn new(gic: &'static GicContext, config: &VmConfig) -> Result<Self> {
        let version = config.vgic_version;
        if config.nr_vcpus == 0 || config.nr_vcpus > version.max_vcpus() {
            log::warn!(
                "VM {}: {} VCPUs not supported by {:?} guests",
                config.id,
                config.nr_vcpus,
                version
            );
            return Err(Error::InvalidArgument);
        }

        let nr_lines = if config.hardware_domain {
            gic.nr_lines()
        } else {
            config.nr_lines
        };
        let nr_lines = nr_lines.div_ceil(IRQS_PER_RANK) * IRQS_PER_RANK;
        if !(GIC_SPI_BASE..=VGIC_MAX_LINES).contains(&nr_lines) {
            log::warn!("VM {}: invalid number of interrupt lines {}", config.id, nr_lines);
            return Err(Error::InvalidArgument);
        }

        let layout = match version {
            VgicVersion::V2 if config.hardware_domain => VgicLayout {
                dbase: gic.ops().info().dbase,
                dbase_size: GICD_FRAME_SIZE,
                cbase: gic.ops().info().cbase,
                rbase: 0,
                rdist_stride: 0,
            },
            VgicVersion::V2 => VgicLayout {
                dbase: GUEST_GICD_BASE,
                dbase_size: GICD_FRAME_SIZE,
                cbase: GUEST_GICC_BASE,
                rbase: 0,
                rdist_stride: 0,
            },
            VgicVersion::V3 => VgicLayout {
                dbase: GUEST_GICV3_GICD_BASE,
                dbase_size: GUEST_GICV3_GICD_SIZE,
                cbase: 0,
                rbase: GUEST_GICV3_GICR0_BASE,
                rdist_stride: GUEST_GICV3_RDIST_STRIDE,
            },
        };

        let vmid = VMID_ALLOCATOR.alloc()?;
        let vcpus = (0..config.nr_vcpus)
            .map(|id| Vcpu::new(id, nr_lines, version))
            .collect();

        log::info!(
            "VM {}: vmid {} {} VCPUs {} lines vGIC{:?} at {:#x}",
            config.id,
            vmid,
            config.nr_vcpus,
            nr_lines,
            version,
            layout.dbase
        );

        Ok(Self {
            id: config.id,
            vmid,
            hardware_domain: config.hardware_domain,
            gic,
            vcpus,
            vgic: VgicDomain::new(version, nr_lines, layout),
            crashed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn vmid(&self) -> Vmid {
        self.vmid
    }

    pub fn is_hardware_domain(&self) -> bool {
        self.hardware_domain
    }

    pub fn gic(&self) -> &'static GicContext {
        self.gic
    }

    pub fn vgic(&self) -> &VgicDomain {
        &self.vgic
    }

    pub fn nr_vcpus(&self) -> usize {
        self.vcpus.len()
    }

    pub fn vcpu(&self, id: usize) -> Option<&Vcpu> {
        self.vcpus.get(id)
    }

    pub fn vcpu0(&self) -> &Vcpu {
        &self.vcpus[0]
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    /// Terminate the VM after a fatal guest error
    pub fn crash(&self, v: &Vcpu, reason: &str) {
        if !self.crashed.swap(true, Ordering::AcqRel) {
            log::error!("VM {} vcpu{}: crashed: {}", self.id, v.id(), reason);
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Map the virtual CPU interface for guests with a memory-mapped one
    pub fn gicv_setup(&self, mapper: &dyn P2mMapper) -> Result<()> {
        match self.vgic.version() {
            VgicVersion::V2 => self.gic.ops().gicv_setup(self, mapper),
            VgicVersion::V3 => Ok(()),
        }
    }

    /// Emulate a guest load from the interrupt controller frames
    ///
    /// Guest-fatal faults crash the VM before they are returned.
    pub fn mmio_read(&self, cpu: CpuId, v: &Vcpu, info: &MmioAccess) -> MmioResult<u64> {
        let res = match self.vgic.version() {
            VgicVersion::V2 => vgic_v2::mmio_read(self, v, info),
            VgicVersion::V3 => vgic_v3::mmio_read(self, v, info),
        };
        log::trace!("VM {} vcpu{} cpu{}: read {:#x}", self.id, v.id(), cpu, info.gpa);
        self.check_mmio(v, info, "read", res)
    }

    /// Emulate a guest store to the interrupt controller frames
    pub fn mmio_write(&self, cpu: CpuId, v: &Vcpu, info: &MmioAccess, value: u64) -> MmioResult<()> {
        let res = match self.vgic.version() {
            VgicVersion::V2 => vgic_v2::mmio_write(self, cpu, v, info, value),
            VgicVersion::V3 => vgic_v3::mmio_write(self, cpu, v, info, value),
        };
        self.check_mmio(v, info, "write", res)
    }

    /// Emulate a trapped ICC_SGI1R_EL1 write
    pub fn emulate_sgi1r(&self, cpu: CpuId, v: &Vcpu, value: u64) -> MmioResult<()> {
        match self.vgic.version() {
            VgicVersion::V3 => vgic_v3::emulate_sgi1r(self, cpu, v, value),
            VgicVersion::V2 => Err(MmioFault::Unhandled),
        }
    }

    fn check_mmio<T>(
        &self,
        v: &Vcpu,
        info: &MmioAccess,
        dir: &str,
        res: MmioResult<T>,
    ) -> MmioResult<T> {
        if let Err(fault) = &res {
            if fault.is_guest_fatal() {
                log::error!(
                    "VM {} vcpu{}: vGIC {} of {:#x} r{} size {:?}: {}",
                    self.id,
                    v.id(),
                    dir,
                    info.gpa,
                    info.reg,
                    info.size,
                    fault
                );
                self.crash(v, "fatal interrupt controller access");
            } else {
                log::warn!(
                    "VM {} vcpu{}: unhandled vGIC {} of {:#x}",
                    self.id,
                    v.id(),
                    dir,
                    info.gpa
                );
            }
        }
        res
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        VMID_ALLOCATOR.free(self.vmid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::mock::MockGic;
    use crate::arch::arm64::interrupt::mmio::AccessSize;
    use test_case::test_case;

    #[test_case(0, 64, VgicVersion::V2; "no vcpus")]
    #[test_case(9, 64, VgicVersion::V2; "too many v2 vcpus")]
    #[test_case(1, 0, VgicVersion::V3; "no lines")]
    #[test_case(1, 1056, VgicVersion::V3; "too many lines")]
    fn test_invalid_config(nr_vcpus: usize, nr_lines: u32, version: VgicVersion) {
        let (_, gic) = MockGic::context(4, 256, 1);
        let config = VmConfig {
            nr_vcpus,
            nr_lines,
            vgic_version: version,
            ..VmConfig::default()
        };
        assert_eq!(Vm::new(gic, &config).err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_lines_rounded_to_ranks() {
        let (_, gic) = MockGic::context(4, 256, 1);
        let config = VmConfig {
            nr_lines: 40,
            ..VmConfig::default()
        };
        let vm = Vm::new(gic, &config).unwrap();
        assert_eq!(vm.vgic().nr_lines(), 64);
        assert_eq!(vm.vgic().dbase(), GUEST_GICD_BASE);
        assert!(vm.vcpu(1).is_none());
    }

    #[test]
    fn test_hardware_domain_mirrors_host() {
        let (mock, gic) = MockGic::context(4, 160, 1);
        let config = VmConfig {
            hardware_domain: true,
            ..VmConfig::default()
        };
        let vm = Vm::new(gic, &config).unwrap();
        assert_eq!(vm.vgic().nr_lines(), 160);
        assert_eq!(vm.vgic().dbase(), mock.info.dbase);
        assert_eq!(vm.vgic().cbase(), mock.info.cbase);
        assert!(vm.is_hardware_domain());
    }

    #[test]
    fn test_vmid_released_on_drop() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = Vm::new(gic, &VmConfig::default()).unwrap();
        let vmid = vm.vmid();
        assert_ne!(vmid, 0);
        drop(vm);
        // Another VM may have taken it meanwhile; it must at least be free
        // to allocate again.
        let vm = Vm::new(gic, &VmConfig::default()).unwrap();
        assert_ne!(vm.vmid(), 0);
    }

    #[test]
    fn test_fatal_access_crashes_vm() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = Vm::new(gic, &VmConfig::default()).unwrap();
        let v = vm.vcpu0();
        let info = MmioAccess::new(GUEST_GICD_BASE, AccessSize::HalfWord);
        assert_eq!(vm.mmio_read(0, v, &info), Err(MmioFault::BadWidth));
        assert!(vm.is_crashed());
    }

    #[test]
    fn test_unhandled_access_keeps_vm() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = Vm::new(gic, &VmConfig::default()).unwrap();
        let info = MmioAccess::new(GUEST_GICD_BASE + 0xd00, AccessSize::Word);
        assert_eq!(vm.mmio_read(0, vm.vcpu0(), &info), Err(MmioFault::Unhandled));
        assert!(!vm.is_crashed());
    }

    #[test]
    fn test_sgi1r_needs_v3() {
        let (_, gic) = MockGic::context(4, 64, 1);
        let vm = Vm::new(gic, &VmConfig::default()).unwrap();
        assert_eq!(vm.emulate_sgi1r(0, vm.vcpu0(), 0), Err(MmioFault::Unhandled));
    }
}
