//! Stage-2 mapping interface
//!
//! The interrupt core only needs to place device frames into a guest's
//! physical address space; page-table management lives elsewhere.

use crate::vmm::Vmid;
use crate::Result;

/// Stage-2 memory attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAttr {
    /// Device-nGnRE
    Device,
    /// Normal write-back cacheable
    Normal,
}

/// Guest physical memory mapper
pub trait P2mMapper {
    /// Map guest frames `[start, end)` to machine address `maddr`
    fn map_regions(&self, vmid: Vmid, start: u64, end: u64, maddr: u64, attr: MemAttr)
        -> Result<()>;

    /// Map guest frames `[start, end)` as device memory
    fn map_mmio_regions(&self, vmid: Vmid, start: u64, end: u64, maddr: u64) -> Result<()> {
        self.map_regions(vmid, start, end, maddr, MemAttr::Device)
    }
}
