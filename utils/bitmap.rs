//! Fixed-size bitmaps
//!
//! [`Bitmap`] is an owned array of words used for ID pools. The free
//! functions operate on a single `u64` and back the per-CPU list-register
//! occupancy masks, which live in atomics.

/// Bitmap of `WORDS * 64` bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap<const WORDS: usize> {
    data: [u64; WORDS],
}

impl<const WORDS: usize> Bitmap<WORDS> {
    /// Create an all-clear bitmap
    pub const fn new() -> Self {
        Self { data: [0; WORDS] }
    }

    /// Get the number of bits
    pub const fn bits(&self) -> usize {
        WORDS * 64
    }

    /// Copy of the bitmap with bit `index` set
    pub const fn with_bit(mut self, index: usize) -> Self {
        assert!(index < WORDS * 64);
        self.data[index / 64] |= 1 << (index % 64);
        self
    }

    /// Test if a bit is set
    pub fn test(&self, index: usize) -> bool {
        index < self.bits() && (self.data[index / 64] >> (index % 64)) & 1 == 1
    }

    /// Set a bit to 1
    pub fn set_bit(&mut self, index: usize) {
        assert!(index < self.bits());
        self.data[index / 64] |= 1 << (index % 64);
    }

    /// Clear a bit to 0
    pub fn clear_bit(&mut self, index: usize) {
        assert!(index < self.bits());
        self.data[index / 64] &= !(1 << (index % 64));
    }

    /// Find the first zero bit
    pub fn find_first_zero(&self) -> Option<usize> {
        self.data
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(idx, word)| idx * 64 + (!word).trailing_zeros() as usize)
    }

    /// Count the number of set bits
    pub fn count_ones(&self) -> usize {
        self.data.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl<const WORDS: usize> Default for Bitmap<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask covering bits `0..nbits` of a word
#[inline]
pub const fn low_mask(nbits: usize) -> u64 {
    if nbits >= 64 {
        u64::MAX
    } else {
        (1u64 << nbits) - 1
    }
}

/// First set bit at or after `start` below `nbits`, or `nbits`
#[inline]
pub fn find_next_bit(word: u64, nbits: usize, start: usize) -> usize {
    if start >= nbits {
        return nbits;
    }
    let masked = word & low_mask(nbits) & !low_mask(start);
    if masked == 0 {
        nbits
    } else {
        masked.trailing_zeros() as usize
    }
}

/// First clear bit at or after `start` below `nbits`, or `nbits`
#[inline]
pub fn find_next_zero_bit(word: u64, nbits: usize, start: usize) -> usize {
    find_next_bit(!word, nbits, start)
}

/// First clear bit below `nbits`, or `nbits`
#[inline]
pub fn find_first_zero_bit(word: u64, nbits: usize) -> usize {
    find_next_zero_bit(word, nbits, 0)
}

/// Iterate over the set bits of `word` below `nbits`
pub fn iter_set_bits(word: u64, nbits: usize) -> impl Iterator<Item = usize> {
    let mut rest = word & low_mask(nbits);
    core::iter::from_fn(move || {
        if rest == 0 {
            return None;
        }
        let bit = rest.trailing_zeros() as usize;
        rest &= rest - 1;
        Some(bit)
    })
}
