//! ARM64 (AArch64) support
//!
//! CPU primitives the interrupt core relies on (local IRQ masking,
//! barriers, CPU masks) and the GIC virtualization itself.

pub mod cpu;
pub mod interrupt;
