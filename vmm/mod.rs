//! Virtual machine containers
//!
//! The parts of a VM and VCPU the interrupt-virtualization core works on:
//! the per-VM virtual distributor, the per-VCPU interrupt queues, the
//! hardware context saved across context switches and the VMID.

pub mod p2m;
pub mod vcpu;
pub mod vm;
pub mod vmid;

pub use p2m::{MemAttr, P2mMapper};
pub use vcpu::{Vcpu, VcpuId};
pub use vm::{Vm, VmConfig, VmId};
pub use vmid::{Vmid, VmidAllocator, VMID_ALLOCATOR};
