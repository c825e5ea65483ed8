//! Physical interrupt dispatch
//!
//! Entry point of the IRQ and FIQ exception vectors. Interrupts are
//! acknowledged one at a time until the CPU interface has nothing left at
//! the running priority.
//!
//! ## Interrupt classes
//!
//! | INTID       | Handling                                             |
//! |-------------|------------------------------------------------------|
//! | 0-15        | hypervisor signal, priority drop, handle, deactivate |
//! | 16-1019     | generic IRQ framework, local IRQs unmasked           |
//! | 1020-1023   | nothing pending, leave the loop                      |

use crate::arch::arm64::cpu::{local_irq_disable, local_irq_enable, CpuId};
use crate::arch::arm64::interrupt::gic::{self, GicContext, Sgi, GIC_SPECIAL_IRQ, NR_GIC_SGI};
use crate::Result;

/// Handler registered with [`IrqFramework::request_irq`]
pub type IrqHandler = fn(CpuId, u32);

/// The generic interrupt-descriptor framework, as seen from the dispatcher
pub trait IrqFramework: Sync {
    /// Run the descriptor handler of `irq`. Called with local IRQs unmasked.
    fn do_irq(&self, cpu: CpuId, irq: u32, is_fiq: bool);

    /// Log the execution state of `cpu`
    fn dump_execstate(&self, cpu: CpuId);

    /// Run the cross-calls queued for `cpu`
    fn smp_call_function_interrupt(&self, cpu: CpuId);

    /// Install `handler` for a hypervisor-owned line
    fn request_irq(&self, irq: u32, handler: IrqHandler, name: &'static str) -> Result<()>;
}

/// Exception vector slots that carry interrupts
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptVector {
    /// IRQ taken from EL2 (SPx)
    El2Irq = 5,
    /// FIQ taken from EL2 (SPx)
    El2Fiq = 6,
    /// IRQ taken from a 64-bit guest
    GuestIrqA64 = 9,
    /// FIQ taken from a 64-bit guest
    GuestFiqA64 = 10,
    /// IRQ taken from a 32-bit guest
    GuestIrqA32 = 13,
    /// FIQ taken from a 32-bit guest
    GuestFiqA32 = 14,
}

impl InterruptVector {
    /// Vector slot index as pushed by the exception entry code
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            5 => Some(Self::El2Irq),
            6 => Some(Self::El2Fiq),
            9 => Some(Self::GuestIrqA64),
            10 => Some(Self::GuestFiqA64),
            13 => Some(Self::GuestIrqA32),
            14 => Some(Self::GuestFiqA32),
            _ => None,
        }
    }

    pub fn is_fiq(self) -> bool {
        matches!(self, Self::El2Fiq | Self::GuestFiqA64 | Self::GuestFiqA32)
    }
}

impl GicContext {
    /// Drain the interrupts pending at the running priority
    ///
    /// Entered from the exception vector with local IRQs masked; they are
    /// masked again on return.
    pub fn interrupt(&self, fw: &dyn IrqFramework, cpu: CpuId, is_fiq: bool) {
        loop {
            let irq = self.ops().read_irq();

            if irq < NR_GIC_SGI {
                self.do_sgi(fw, cpu, irq);
            } else if irq < GIC_SPECIAL_IRQ {
                local_irq_enable();
                fw.do_irq(cpu, irq, is_fiq);
                local_irq_disable();
            } else {
                local_irq_disable();
                break;
            }
        }
    }

    fn do_sgi(&self, fw: &dyn IrqFramework, cpu: CpuId, irq: u32) {
        // Lower the priority first so a signal raised by the handler can
        // be taken again.
        self.ops().eoi_irq(irq);

        match Sgi::try_from(irq) {
            Ok(Sgi::EventCheck) => log::trace!("CPU{}: event check", cpu),
            Ok(Sgi::DumpState) => fw.dump_execstate(cpu),
            Ok(Sgi::CallFunction) => fw.smp_call_function_interrupt(cpu),
            Err(sgi) => panic!("Unhandled SGI {} on CPU{}", sgi, cpu),
        }

        self.ops().deactivate_irq(irq);
    }

    /// Request the maintenance interrupt from the IRQ framework
    pub fn request_maintenance_irq(&self, fw: &dyn IrqFramework) -> Result<()> {
        let irq = self.ops().info().maintenance_irq;
        fw.request_irq(irq, maintenance_interrupt, "irq-maintenance")
    }
}

/// Maintenance interrupt handler
///
/// List registers are refilled on the next guest entry, so there is
/// nothing to do here.
pub fn maintenance_interrupt(cpu: CpuId, irq: u32) {
    log::trace!("CPU{}: maintenance interrupt {}", cpu, irq);
}

static FRAMEWORK: spin::Once<&'static dyn IrqFramework> = spin::Once::new();

/// Register the IRQ framework the exception vectors dispatch to
pub fn register_irq_framework(fw: &'static dyn IrqFramework) {
    FRAMEWORK.call_once(|| fw);
}

/// Interrupt exception entry, called from the vector table with the slot
/// index and the current CPU
#[no_mangle]
pub extern "C" fn rust_irq_exception(vector: u32, cpu: CpuId) {
    let Some(vector) = InterruptVector::from_raw(vector) else {
        panic!("CPU{}: vector {} is not an interrupt", cpu, vector);
    };
    let Some(fw) = FRAMEWORK.get() else {
        panic!("CPU{}: interrupt before IRQ framework registration", cpu);
    };
    gic::get_expect().interrupt(*fw, cpu, vector.is_fiq());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::cpu::local_irq_is_enabled;
    use crate::arch::arm64::interrupt::mock::MockGic;
    use crate::arch::arm64::interrupt::tests::with_irqs_disabled;
    use alloc::vec::Vec;
    use test_case::test_case;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Irq { irq: u32, is_fiq: bool, irqs_on: bool },
        Dump,
        CallFunction,
        Request(u32, &'static str),
    }

    #[derive(Default)]
    struct RecordingFramework {
        calls: spin::Mutex<Vec<Call>>,
    }

    impl IrqFramework for RecordingFramework {
        fn do_irq(&self, _cpu: CpuId, irq: u32, is_fiq: bool) {
            let irqs_on = local_irq_is_enabled();
            self.calls.lock().push(Call::Irq { irq, is_fiq, irqs_on });
        }

        fn dump_execstate(&self, _cpu: CpuId) {
            self.calls.lock().push(Call::Dump);
        }

        fn smp_call_function_interrupt(&self, _cpu: CpuId) {
            self.calls.lock().push(Call::CallFunction);
        }

        fn request_irq(&self, irq: u32, _handler: IrqHandler, name: &'static str) -> Result<()> {
            self.calls.lock().push(Call::Request(irq, name));
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_drains_queue() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let fw = RecordingFramework::default();
        mock.raise(40);
        mock.raise(Sgi::CallFunction as u32);
        mock.raise(27);

        with_irqs_disabled(|| {
            gic.interrupt(&fw, 0, false);
            assert!(!local_irq_is_enabled());
        });

        assert_eq!(
            *fw.calls.lock(),
            [
                Call::Irq { irq: 40, is_fiq: false, irqs_on: true },
                Call::CallFunction,
                Call::Irq { irq: 27, is_fiq: false, irqs_on: true },
            ]
        );
        let state = mock.state();
        assert!(state.iar.is_empty());
        // Device lines are completed by their descriptor, not here
        assert_eq!(state.eoi, [2]);
        assert_eq!(state.dir, [2]);
    }

    #[test]
    fn test_signals_are_completed() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let fw = RecordingFramework::default();
        mock.raise(Sgi::EventCheck as u32);
        mock.raise(Sgi::DumpState as u32);

        with_irqs_disabled(|| gic.interrupt(&fw, 0, true));

        assert_eq!(*fw.calls.lock(), [Call::Dump]);
        assert_eq!(mock.state().eoi, [0, 1]);
        assert_eq!(mock.state().dir, [0, 1]);
    }

    #[test]
    fn test_fiq_flag_forwarded() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let fw = RecordingFramework::default();
        mock.raise(33);
        with_irqs_disabled(|| gic.interrupt(&fw, 0, true));
        assert_eq!(
            *fw.calls.lock(),
            [Call::Irq { irq: 33, is_fiq: true, irqs_on: true }]
        );
    }

    #[test]
    fn test_special_id_ends_loop() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let fw = RecordingFramework::default();
        mock.raise(GIC_SPECIAL_IRQ);
        mock.raise(40);

        with_irqs_disabled(|| gic.interrupt(&fw, 0, false));

        assert!(fw.calls.lock().is_empty());
        assert_eq!(mock.state().iar.len(), 1);
    }

    #[test]
    #[should_panic(expected = "Unhandled SGI 7")]
    fn test_unknown_signal_panics() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let fw = RecordingFramework::default();
        mock.raise(7);
        with_irqs_disabled(|| gic.interrupt(&fw, 0, false));
    }

    #[test]
    fn test_maintenance_irq_request() {
        let (mock, gic) = MockGic::context(4, 64, 1);
        let fw = RecordingFramework::default();
        gic.request_maintenance_irq(&fw).unwrap();
        assert_eq!(
            *fw.calls.lock(),
            [Call::Request(mock.info.maintenance_irq, "irq-maintenance")]
        );
        maintenance_interrupt(0, mock.info.maintenance_irq);
    }

    #[test_case(5, Some(InterruptVector::El2Irq), false; "el2 irq")]
    #[test_case(10, Some(InterruptVector::GuestFiqA64), true; "guest fiq")]
    #[test_case(13, Some(InterruptVector::GuestIrqA32), false; "aarch32 guest irq")]
    #[test_case(8, None, false; "synchronous slot")]
    fn test_vector_decode(raw: u32, expected: Option<InterruptVector>, fiq: bool) {
        let vector = InterruptVector::from_raw(raw);
        assert_eq!(vector, expected);
        assert_eq!(vector.is_some_and(|v| v.is_fiq()), fiq);
    }
}
