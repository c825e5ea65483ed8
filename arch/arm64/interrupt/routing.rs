//! Physical interrupt routing
//!
//! Physical interrupt descriptors are owned by the generic IRQ framework.
//! This module provides the two interrupt-type tables the GIC registers
//! with that framework (host-routed and guest-routed lines) and the
//! routing entry points that bind a descriptor to one of them.
//!
//! Host-routed lines are completed with priority drop and deactivation as
//! soon as their handler returns. Guest-routed lines only get the priority
//! drop when they are injected; the guest deactivates the physical line
//! through the hardware bit of its list register.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::arm64::cpu::{dsb, CpuId, CpuMask};
use crate::arch::arm64::interrupt::gic::{GicContext, GicHwOps, GIC_SPI_BASE};
use crate::vmm::Vm;
use crate::{Error, Result};

bitflags! {
    /// Descriptor status bits shared with the IRQ framework
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqDescStatus: u32 {
        /// Line is masked at the distributor
        const DISABLED = 1 << 0;
        /// Line is routed to a guest
        const GUEST = 1 << 1;
        /// Guest has not yet deactivated the last instance
        const INPROGRESS = 1 << 2;
    }
}

/// Trigger mode of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTrigger {
    Level,
    Edge,
}

/// Guest a physical line is routed to
pub struct GuestBinding {
    pub vm: Arc<Vm>,
    pub virq: u32,
}

/// Descriptor fields protected by the descriptor lock
pub struct IrqDescInner {
    pub handler: Option<&'static dyn IrqChip>,
    pub trigger: Option<IrqTrigger>,
    pub priority: u8,
    pub guest: Option<GuestBinding>,
}

/// Physical interrupt descriptor
pub struct IrqDesc {
    irq: u32,
    status: AtomicU32,
    inner: spin::Mutex<IrqDescInner>,
}

impl IrqDesc {
    /// New disabled, unrouted descriptor
    pub const fn new(irq: u32) -> Self {
        Self {
            irq,
            status: AtomicU32::new(IrqDescStatus::DISABLED.bits()),
            inner: spin::Mutex::new(IrqDescInner {
                handler: None,
                trigger: None,
                priority: 0,
                guest: None,
            }),
        }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Take the descriptor lock
    pub fn lock(&self) -> spin::MutexGuard<'_, IrqDescInner> {
        self.inner.lock()
    }

    pub fn status(&self) -> IrqDescStatus {
        IrqDescStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, flags: IrqDescStatus) {
        self.status.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_status(&self, flags: IrqDescStatus) {
        self.status.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Unmask through the bound interrupt type
    pub fn enable(&self) {
        let inner = self.inner.lock();
        if let Some(handler) = inner.handler {
            handler.enable(self);
        }
    }

    /// Mask through the bound interrupt type
    pub fn disable(&self) {
        let inner = self.inner.lock();
        if let Some(handler) = inner.handler {
            handler.disable(self);
        }
    }
}

impl fmt::Debug for IrqDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqDesc")
            .field("irq", &self.irq)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Interrupt-type operations registered with the IRQ framework
pub trait IrqChip: Sync {
    fn name(&self) -> &'static str;
    fn startup(&self, desc: &IrqDesc) -> u32;
    fn shutdown(&self, desc: &IrqDesc);
    fn enable(&self, desc: &IrqDesc);
    fn disable(&self, desc: &IrqDesc);
    fn ack(&self, desc: &IrqDesc);
    fn end(&self, desc: &IrqDesc);
    /// Retarget the line; called with the descriptor lock held
    fn set_affinity(&self, desc: &IrqDesc, inner: &IrqDescInner, mask: CpuMask);
}

fn irq_enable(ops: &dyn GicHwOps, desc: &IrqDesc) {
    desc.clear_status(IrqDescStatus::DISABLED);
    dsb();
    ops.irq_enable(desc.irq());
}

fn irq_disable(ops: &dyn GicHwOps, desc: &IrqDesc) {
    ops.irq_disable(desc.irq());
    desc.set_status(IrqDescStatus::DISABLED);
}

/// Lines handled by the hypervisor
pub struct HostIrqType {
    ops: &'static dyn GicHwOps,
}

impl HostIrqType {
    pub(crate) fn new(ops: &'static dyn GicHwOps) -> Self {
        Self { ops }
    }
}

impl IrqChip for HostIrqType {
    fn name(&self) -> &'static str {
        "gic-host"
    }

    fn startup(&self, desc: &IrqDesc) -> u32 {
        irq_enable(self.ops, desc);
        0
    }

    fn shutdown(&self, desc: &IrqDesc) {
        irq_disable(self.ops, desc);
    }

    fn enable(&self, desc: &IrqDesc) {
        irq_enable(self.ops, desc);
    }

    fn disable(&self, desc: &IrqDesc) {
        irq_disable(self.ops, desc);
    }

    fn ack(&self, _desc: &IrqDesc) {
        // Reading IAR in the dispatch loop already acknowledged the line.
    }

    fn end(&self, desc: &IrqDesc) {
        self.ops.eoi_irq(desc.irq());
        self.ops.deactivate_irq(desc.irq());
    }

    fn set_affinity(&self, desc: &IrqDesc, inner: &IrqDescInner, mask: CpuMask) {
        let trigger = inner.trigger.unwrap_or(IrqTrigger::Level);
        self.ops
            .set_irq_properties(desc.irq(), trigger, mask, inner.priority);
    }
}

/// Lines passed through to a guest
pub struct GuestIrqType {
    ops: &'static dyn GicHwOps,
}

impl GuestIrqType {
    pub(crate) fn new(ops: &'static dyn GicHwOps) -> Self {
        Self { ops }
    }
}

impl IrqChip for GuestIrqType {
    fn name(&self) -> &'static str {
        "gic-guest"
    }

    fn startup(&self, desc: &IrqDesc) -> u32 {
        irq_enable(self.ops, desc);
        0
    }

    fn shutdown(&self, desc: &IrqDesc) {
        irq_disable(self.ops, desc);
    }

    fn enable(&self, desc: &IrqDesc) {
        irq_enable(self.ops, desc);
    }

    fn disable(&self, desc: &IrqDesc) {
        irq_disable(self.ops, desc);
    }

    fn ack(&self, _desc: &IrqDesc) {}

    /// Priority drop only; the guest deactivates
    fn end(&self, desc: &IrqDesc) {
        self.ops.eoi_irq(desc.irq());
    }

    fn set_affinity(&self, desc: &IrqDesc, _inner: &IrqDescInner, _mask: CpuMask) {
        panic!("IRQ{}: affinity of guest-routed interrupts cannot change", desc.irq());
    }
}

impl GicContext {
    /// Route a physical line to the hypervisor
    ///
    /// `inner` is the held descriptor lock; the line must be disabled.
    pub fn route_irq_to_host(
        &'static self,
        desc: &IrqDesc,
        inner: &mut IrqDescInner,
        cpu_mask: CpuMask,
        priority: u8,
    ) {
        assert!(desc.irq() < self.nr_lines(), "IRQ{} beyond distributor", desc.irq());
        assert!(desc.status().contains(IrqDescStatus::DISABLED));
        let Some(trigger) = inner.trigger else {
            panic!("IRQ{}: trigger mode not configured", desc.irq());
        };

        inner.handler = Some(&self.host_irq_type);
        inner.priority = priority;
        self.ops().set_irq_properties(desc.irq(), trigger, cpu_mask, priority);
        log::debug!("IRQ{} routed to host, cpus {:#x} prio {:#x}", desc.irq(), cpu_mask.bits(), priority);
    }

    /// Route a physical SPI to `vm`, where it appears as the same line number
    ///
    /// `inner` is the held descriptor lock; the line must be disabled.
    pub fn route_irq_to_guest(
        &'static self,
        vm: &Arc<Vm>,
        desc: &'static IrqDesc,
        inner: &mut IrqDescInner,
        cpu_mask: CpuMask,
        priority: u8,
    ) -> Result<()> {
        let irq = desc.irq();
        assert!(irq < self.nr_lines(), "IRQ{} beyond distributor", irq);
        assert!(desc.status().contains(IrqDescStatus::DISABLED));
        let Some(trigger) = inner.trigger else {
            panic!("IRQ{}: trigger mode not configured", irq);
        };

        if irq < GIC_SPI_BASE {
            log::warn!("IRQ{}: only SPIs can be routed to a guest", irq);
            return Err(Error::NotSupported);
        }
        if irq >= vm.vgic().nr_lines() {
            log::warn!("IRQ{}: VM {} only has {} lines", irq, vm.id(), vm.vgic().nr_lines());
            return Err(Error::InvalidArgument);
        }

        inner.handler = Some(&self.guest_irq_type);
        inner.priority = priority;
        inner.guest = Some(GuestBinding {
            vm: Arc::clone(vm),
            virq: irq,
        });
        desc.set_status(IrqDescStatus::GUEST);
        self.ops().set_irq_properties(irq, trigger, cpu_mask, priority);

        vm.vcpu0().vgic().lock().pending_mut(irq).desc = Some(desc);
        log::info!("IRQ{} routed to VM {}", irq, vm.id());
        Ok(())
    }

    /// Guest path of the IRQ framework for a line bound with
    /// [`route_irq_to_guest`](Self::route_irq_to_guest)
    ///
    /// Drops the running priority, marks the descriptor in progress until
    /// the guest completes it, and injects the line into VCPU 0.
    pub fn deliver_guest_irq(&self, cpu: CpuId, desc: &'static IrqDesc) {
        let (vm, virq) = {
            let inner = desc.lock();
            let Some(binding) = inner.guest.as_ref() else {
                log::warn!("IRQ{}: guest delivery without a bound VM", desc.irq());
                return;
            };
            if let Some(handler) = inner.handler {
                handler.end(desc);
            }
            (Arc::clone(&binding.vm), binding.virq)
        };

        desc.set_status(IrqDescStatus::INPROGRESS);
        vm.vcpu_inject_irq(cpu, vm.vcpu0(), virq);
    }
}
