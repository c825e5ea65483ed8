//! Synchronization primitives
//!
//! Plain spinlocks come straight from the `spin` crate. [`IrqSpinLock`]
//! additionally masks local interrupts while held, for state that is also
//! touched from interrupt context.

pub mod spinlock;

pub use spinlock::{IrqSpinLock, IrqSpinLockGuard};

/// Spinlock that leaves the interrupt mask alone
pub type SpinLock<T> = spin::Mutex<T>;
