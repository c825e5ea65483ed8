//! Ferrovisor VGIC - interrupt virtualization core
//!
//! This crate is the GIC interrupt-virtualization layer of the Ferrovisor
//! hypervisor. It drives a physical GICv2 through a hardware-operations
//! table, multiplexes guest virtual interrupts onto the hypervisor list
//! registers of each physical CPU, and emulates the GICv2 and GICv3
//! distributor (and GICv3 redistributor) MMIO interfaces for guests.
//!
//! Layout:
//! - [`arch::arm64::interrupt`]: hardware driver, injection engine, MMIO
//!   emulation and the interrupt dispatch front-end
//! - [`vmm`]: VM / VCPU containers, VMID pool, stage-2 mapping interface
//! - [`sync`]: interrupt-masking spinlock
//! - [`config`]: priorities and guest memory layout

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

// Core modules
pub mod utils;
pub mod config;
pub mod sync;

// Architecture-specific code
pub mod arch;

// VM containers
pub mod vmm;

pub use arch::arm64::interrupt::{gic, GicContext, GicHwOps};
pub use vmm::{Vcpu, Vm, VmConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument,
    /// Out of memory
    OutOfMemory,
    /// Not found
    NotFound,
    /// Resource busy
    ResourceBusy,
    /// Not initialized
    NotInitialized,
    /// Feature not supported by this implementation
    NotSupported,
    /// Invalid state
    InvalidState,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::NotFound => "not found",
            Error::ResourceBusy => "resource busy",
            Error::NotInitialized => "not initialized",
            Error::NotSupported => "not supported",
            Error::InvalidState => "invalid state",
        };
        f.write_str(msg)
    }
}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;
