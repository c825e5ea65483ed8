//! Utility functions and data structures

pub mod bitmap;

pub use self::bitmap::Bitmap;

/// Check that `addr` is a multiple of `align` (a power of two)
#[inline]
pub const fn is_aligned(addr: u64, align: u64) -> bool {
    addr & (align - 1) == 0
}
