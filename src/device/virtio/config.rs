//! Device configuration space.

use crate::memory::AccessSize;

/// Fixed-size little-endian configuration buffer.
///
/// Out-of-range accesses are tolerated: loads return 0 and stores are
/// dropped, like unmapped register space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSpace {
    data: Vec<u8>,
}

impl ConfigSpace {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Zero the whole buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    fn range(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    /// Read a value of the given width.
    pub fn load(&self, offset: u64, size: AccessSize) -> u64 {
        match self.range(offset, size.bytes()) {
            Some(range) => {
                let mut bytes = [0u8; 8];
                bytes[..size.bytes()].copy_from_slice(&self.data[range]);
                u64::from_le_bytes(bytes)
            }
            None => 0,
        }
    }

    /// Write the low bits of `value` at the given width.
    pub fn store(&mut self, offset: u64, value: u64, size: AccessSize) {
        if let Some(range) = self.range(offset, size.bytes()) {
            self.data[range].copy_from_slice(&value.to_le_bytes()[..size.bytes()]);
        }
    }

    /// Copy `bytes` in at `offset`. Returns false if it does not fit.
    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> bool {
        match self.range(offset, bytes.len()) {
            Some(range) => {
                self.data[range].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Replace the whole buffer. Returns false on a length mismatch.
    pub(crate) fn restore(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() != self.data.len() {
            return false;
        }
        self.data.copy_from_slice(bytes);
        true
    }
}
