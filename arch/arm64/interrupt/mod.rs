//! Interrupt virtualization for ARM64
//!
//! Physical GIC driver, virtual interrupt injection and the emulated
//! distributor and redistributor interfaces guests program.

/// Hardware abstraction and process-wide controller state
pub mod gic;

/// GICv2 physical driver
pub mod gic_v2;

/// Boot discovery of the physical controller
pub mod gic_discovery;

/// Physical interrupt dispatch
pub mod handlers;

/// MMIO access decoding shared by the emulated interfaces
pub mod mmio;

/// Per-VCPU and per-VM register ranks
pub mod rank;

/// Host and guest routing of physical lines
pub mod routing;

pub(crate) mod vdist;

/// Injection engine and list-register multiplexing
pub mod vgic;

/// Emulated GICv2 distributor
pub mod vgic_v2;

/// Emulated GICv3 distributor and redistributors
pub mod vgic_v3;

/// Pending-interrupt records
pub mod virq;

#[cfg(test)]
pub(crate) mod mock;


pub use gic::{GicContext, GicHwOps, GicVersion, Sgi, SgiTarget};
pub use handlers::IrqFramework;
pub use mmio::{MmioAccess, MmioFault, MmioResult};
pub use vgic::VgicVersion;
