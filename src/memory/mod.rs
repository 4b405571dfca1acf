//! Guest physical address space access.
//!
//! Devices never touch guest RAM directly. Every descriptor, ring and payload
//! access goes through an [`AddressSpace`] handed to the device at
//! construction, so the backing store can be swapped for a fake in tests.

mod guest;

pub use guest::GuestMemory;

use crate::error::Result;

/// Width of a single memory or register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
    Double,
}

impl AccessSize {
    /// Decode a log2 access width (0 = 8 bits ... 3 = 64 bits).
    pub fn from_log2(size_log2: u32) -> Option<Self> {
        match size_log2 {
            0 => Some(AccessSize::Byte),
            1 => Some(AccessSize::Half),
            2 => Some(AccessSize::Word),
            3 => Some(AccessSize::Double),
            _ => None,
        }
    }

    pub fn log2(self) -> u32 {
        match self {
            AccessSize::Byte => 0,
            AccessSize::Half => 1,
            AccessSize::Word => 2,
            AccessSize::Double => 3,
        }
    }

    /// Width in bytes.
    pub fn bytes(self) -> usize {
        1 << self.log2()
    }

    /// Mask selecting the low `bytes() * 8` bits of a value.
    pub fn mask(self) -> u64 {
        match self {
            AccessSize::Double => u64::MAX,
            _ => (1u64 << (self.bytes() * 8)) - 1,
        }
    }
}

/// Flat physical address space shared with the guest.
///
/// The guest may rewrite memory at any time, so implementations take `&self`
/// for stores and callers must not assume two loads of the same address
/// return the same value.
pub trait AddressSpace: Send + Sync {
    /// Load a little-endian value of the given width.
    fn load(&self, address: u64, size: AccessSize) -> Result<u64>;

    /// Store the low bits of `value` little-endian at the given width.
    fn store(&self, address: u64, value: u64, size: AccessSize) -> Result<()>;

    /// Copy `buf.len()` bytes starting at `address` into `buf`.
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.load(address.wrapping_add(i as u64), AccessSize::Byte)? as u8;
        }
        Ok(())
    }

    /// Copy `data` into memory starting at `address`.
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        for (i, &byte) in data.iter().enumerate() {
            self.store(address.wrapping_add(i as u64), byte as u64, AccessSize::Byte)?;
        }
        Ok(())
    }
}

pub fn read_u8(mem: &dyn AddressSpace, address: u64) -> Result<u8> {
    Ok(mem.load(address, AccessSize::Byte)? as u8)
}

pub fn read_u16_le(mem: &dyn AddressSpace, address: u64) -> Result<u16> {
    Ok(mem.load(address, AccessSize::Half)? as u16)
}

pub fn read_u32_le(mem: &dyn AddressSpace, address: u64) -> Result<u32> {
    Ok(mem.load(address, AccessSize::Word)? as u32)
}

pub fn read_u64_le(mem: &dyn AddressSpace, address: u64) -> Result<u64> {
    mem.load(address, AccessSize::Double)
}

pub fn write_u8(mem: &dyn AddressSpace, address: u64, value: u8) -> Result<()> {
    mem.store(address, value as u64, AccessSize::Byte)
}

pub fn write_u16_le(mem: &dyn AddressSpace, address: u64, value: u16) -> Result<()> {
    mem.store(address, value as u64, AccessSize::Half)
}

pub fn write_u32_le(mem: &dyn AddressSpace, address: u64, value: u32) -> Result<()> {
    mem.store(address, value as u64, AccessSize::Word)
}

pub fn write_u64_le(mem: &dyn AddressSpace, address: u64, value: u64) -> Result<()> {
    mem.store(address, value, AccessSize::Double)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_size_log2() {
        for log2 in 0..4 {
            let size = AccessSize::from_log2(log2).unwrap();
            assert_eq!(size.log2(), log2);
            assert_eq!(size.bytes(), 1 << log2);
        }
        assert_eq!(AccessSize::from_log2(4), None);
    }

    #[test]
    fn test_access_size_mask() {
        assert_eq!(AccessSize::Byte.mask(), 0xFF);
        assert_eq!(AccessSize::Half.mask(), 0xFFFF);
        assert_eq!(AccessSize::Word.mask(), 0xFFFF_FFFF);
        assert_eq!(AccessSize::Double.mask(), u64::MAX);
    }
}
