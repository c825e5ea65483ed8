//! Trapped MMIO access description and common outcomes

use core::fmt;

/// Access width, encoded like the data-abort SAS field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AccessSize {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
    DoubleWord = 3,
}

impl AccessSize {
    pub const fn bytes(self) -> u64 {
        1 << (self as u8)
    }
}

/// One trapped guest load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    /// Faulting guest physical address
    pub gpa: u64,
    pub size: AccessSize,
    /// Loads sign-extend the value
    pub sign: bool,
    /// Transfer register, for diagnostics
    pub reg: u8,
}

impl MmioAccess {
    pub const fn new(gpa: u64, size: AccessSize) -> Self {
        Self {
            gpa,
            size,
            sign: false,
            reg: 0,
        }
    }

    pub const fn with_sign(mut self, sign: bool) -> Self {
        self.sign = sign;
        self
    }

    pub const fn with_reg(mut self, reg: u8) -> Self {
        self.reg = reg;
        self
    }

    /// Reject anything but `size`
    pub fn expect_size(&self, size: AccessSize) -> MmioResult<()> {
        if self.size == size {
            Ok(())
        } else {
            Err(MmioFault::BadWidth)
        }
    }

    /// Accept byte or word accesses
    pub fn expect_byte_or_word(&self) -> MmioResult<()> {
        match self.size {
            AccessSize::Byte | AccessSize::Word => Ok(()),
            _ => Err(MmioFault::BadWidth),
        }
    }

    pub fn is_byte(&self) -> bool {
        self.size == AccessSize::Byte
    }
}

/// Why an emulated access was not completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioFault {
    /// Access width not allowed for this register; fatal for the guest
    BadWidth,
    /// Use of an unimplemented controller feature; fatal for the guest
    Unsupported,
    /// No emulation for this offset; the guest receives a data abort
    Unhandled,
}

impl MmioFault {
    /// The offending guest is terminated
    pub const fn is_guest_fatal(self) -> bool {
        matches!(self, MmioFault::BadWidth | MmioFault::Unsupported)
    }
}

impl fmt::Display for MmioFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmioFault::BadWidth => f.write_str("bad access width"),
            MmioFault::Unsupported => f.write_str("unsupported feature"),
            MmioFault::Unhandled => f.write_str("unhandled register"),
        }
    }
}

pub type MmioResult<T> = core::result::Result<T, MmioFault>;

/// Word read-as-zero
pub fn read_as_zero(info: &MmioAccess) -> MmioResult<u64> {
    info.expect_size(AccessSize::Word)?;
    Ok(0)
}

/// Double-word read-as-zero
pub fn read_as_zero_64(info: &MmioAccess) -> MmioResult<u64> {
    info.expect_size(AccessSize::DoubleWord)?;
    Ok(0)
}

/// Word write-ignored
pub fn write_ignore(info: &MmioAccess) -> MmioResult<()> {
    info.expect_size(AccessSize::Word)
}

/// Double-word write-ignored
pub fn write_ignore_64(info: &MmioAccess) -> MmioResult<()> {
    info.expect_size(AccessSize::DoubleWord)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_checks() {
        let word = MmioAccess::new(0x1000, AccessSize::Word);
        let dword = MmioAccess::new(0x1000, AccessSize::DoubleWord);
        assert_eq!(read_as_zero(&word), Ok(0));
        assert_eq!(read_as_zero(&dword), Err(MmioFault::BadWidth));
        assert_eq!(write_ignore_64(&dword), Ok(()));
        assert_eq!(write_ignore_64(&word), Err(MmioFault::BadWidth));
        assert!(MmioAccess::new(0, AccessSize::Byte).expect_byte_or_word().is_ok());
        assert!(MmioAccess::new(0, AccessSize::HalfWord).expect_byte_or_word().is_err());
    }

    #[test]
    fn test_fault_severity() {
        assert!(MmioFault::BadWidth.is_guest_fatal());
        assert!(MmioFault::Unsupported.is_guest_fatal());
        assert!(!MmioFault::Unhandled.is_guest_fatal());
        assert_eq!(AccessSize::DoubleWord.bytes(), 8);
    }
}
