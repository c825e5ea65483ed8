//! VMID allocation
//!
//! 8-bit VMIDs tag stage-2 translations. VMID 0 is reserved for the
//! hypervisor and never handed out.

use crate::config::MAX_VMID;
use crate::sync::SpinLock;
use crate::utils::Bitmap;
use crate::{Error, Result};

/// Stage-2 translation tag
pub type Vmid = u8;

/// VTTBR_EL2.VMID shift
pub const VTTBR_VMID_SHIFT: u32 = 48;

/// Pool of free VMIDs
pub struct VmidAllocator {
    pool: SpinLock<Bitmap<{ MAX_VMID / 64 }>>,
}

impl VmidAllocator {
    pub const fn new() -> Self {
        Self {
            pool: SpinLock::new(Bitmap::new().with_bit(0)),
        }
    }

    /// Take the lowest free VMID
    pub fn alloc(&self) -> Result<Vmid> {
        let mut pool = self.pool.lock();
        match pool.find_first_zero() {
            Some(id) => {
                pool.set_bit(id);
                Ok(id as Vmid)
            }
            None => {
                log::error!("VMID pool exhausted");
                Err(Error::ResourceBusy)
            }
        }
    }

    /// Return `vmid` to the pool
    pub fn free(&self, vmid: Vmid) {
        if vmid == 0 {
            return;
        }
        let mut pool = self.pool.lock();
        debug_assert!(pool.test(vmid as usize), "VMID {} freed twice", vmid);
        pool.clear_bit(vmid as usize);
    }

    /// VMIDs currently handed out
    pub fn in_use(&self) -> usize {
        self.pool.lock().count_ones() - 1
    }
}

impl Default for VmidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global VMID pool
pub static VMID_ALLOCATOR: VmidAllocator = VmidAllocator::new();

/// VTTBR_EL2 value for stage-2 root table `root` tagged with `vmid`
#[inline]
pub const fn vttbr(vmid: Vmid, root: u64) -> u64 {
    ((vmid as u64) << VTTBR_VMID_SHIFT) | root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmid_zero_is_reserved() {
        let pool = VmidAllocator::new();
        assert_eq!(pool.alloc(), Ok(1));
        assert_eq!(pool.alloc(), Ok(2));
        pool.free(1);
        assert_eq!(pool.alloc(), Ok(1));
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_vmid_exhaustion() {
        let pool = VmidAllocator::new();
        for _ in 1..MAX_VMID {
            pool.alloc().unwrap();
        }
        assert_eq!(pool.alloc(), Err(Error::ResourceBusy));
        pool.free(7);
        assert_eq!(pool.alloc(), Ok(7));
    }

    #[test]
    fn test_vttbr_tagging() {
        assert_eq!(vttbr(3, 0x8000_0000), 0x0003_0000_8000_0000);
    }
}
