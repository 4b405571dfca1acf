//! Guest RAM region backed by host memory.

use std::ops::Range;
use std::sync::RwLock;

use super::{AccessSize, AddressSpace};
use crate::error::{Error, Result};

/// A contiguous region of guest physical memory.
///
/// Accesses outside `[guest_addr, guest_addr + size)` fault. Additional
/// faulting ranges can be installed with [`GuestMemory::fail_range`] to
/// simulate holes in the physical map.
#[derive(Debug)]
pub struct GuestMemory {
    /// Guest physical address of the first byte
    guest_addr: u64,
    /// Size in bytes
    size: u64,
    /// Backing bytes
    data: RwLock<Vec<u8>>,
    /// Ranges that fault even though they are inside the region
    holes: RwLock<Vec<Range<u64>>>,
}

impl GuestMemory {
    /// Create a zero-filled region.
    pub fn new(guest_addr: u64, size: usize) -> Self {
        Self {
            guest_addr,
            size: size as u64,
            data: RwLock::new(vec![0; size]),
            holes: RwLock::new(Vec::new()),
        }
    }

    /// Guest physical address of the region start.
    pub fn guest_addr(&self) -> u64 {
        self.guest_addr
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr - self.guest_addr < self.size()
    }

    /// Make every access touching `range` fault.
    pub fn fail_range(&self, range: Range<u64>) {
        if let Ok(mut holes) = self.holes.write() {
            holes.push(range);
        }
    }

    /// Remove all installed faulting ranges.
    pub fn clear_faults(&self) {
        if let Ok(mut holes) = self.holes.write() {
            holes.clear();
        }
    }

    /// Translate a guest access to an offset into the backing vector.
    fn offset(&self, addr: u64, len: usize, size: AccessSize) -> Result<usize> {
        let fault = || Error::MemoryAccess { address: addr, size };
        let end = addr.checked_add(len as u64).ok_or_else(fault)?;
        if addr < self.guest_addr || end - self.guest_addr > self.size() {
            return Err(fault());
        }
        if let Ok(holes) = self.holes.read() {
            if holes.iter().any(|h| addr < h.end && h.start < end) {
                return Err(fault());
            }
        }
        Ok((addr - self.guest_addr) as usize)
    }
}

impl AddressSpace for GuestMemory {
    fn load(&self, address: u64, size: AccessSize) -> Result<u64> {
        let len = size.bytes();
        let offset = self.offset(address, len, size)?;
        let data = self
            .data
            .read()
            .map_err(|_| Error::MemoryAccess { address, size })?;
        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(u64::from_le_bytes(bytes))
    }

    fn store(&self, address: u64, value: u64, size: AccessSize) -> Result<()> {
        let len = size.bytes();
        let offset = self.offset(address, len, size)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| Error::MemoryAccess { address, size })?;
        data[offset..offset + len].copy_from_slice(&value.to_le_bytes()[..len]);
        Ok(())
    }

    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.offset(address, buf.len(), AccessSize::Byte)?;
        let data = self.data.read().map_err(|_| Error::MemoryAccess {
            address,
            size: AccessSize::Byte,
        })?;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_bytes(&self, address: u64, src: &[u8]) -> Result<()> {
        let offset = self.offset(address, src.len(), AccessSize::Byte)?;
        let mut data = self.data.write().map_err(|_| Error::MemoryAccess {
            address,
            size: AccessSize::Byte,
        })?;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}
