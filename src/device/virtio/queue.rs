//! Virtio queue (virtqueue) implementation.
//!
//! This implements the split virtqueue layout as described in the virtio
//! spec 2.6. All ring and descriptor fields live in guest memory and are
//! re-read on every access; nothing the driver can write is cached.

use std::sync::atomic::{fence, Ordering};

use super::chain::DescriptorChain;
use super::common::DeviceCore;
use super::common::QueueSnapshot;
use crate::error::{ProtocolViolation, Result};
use crate::memory::{self, AddressSpace};
use crate::trace_queue;

/// Virtqueue descriptor flags.
pub mod desc_flags {
    /// This marks a buffer as continuing via the next field.
    pub const NEXT: u16 = 1;
    /// This marks a buffer as device write-only (vs read-only).
    pub const WRITE: u16 = 2;
    /// This means the buffer contains a list of buffer descriptors.
    pub const INDIRECT: u16 = 4;
}

// struct virtq_desc { le64 addr; le32 len; le16 flags; le16 next; };
const DESC_STRIDE: u64 = 16;
const DESC_ADDR: u64 = 0;
const DESC_LEN: u64 = 8;
const DESC_FLAGS: u64 = 12;
const DESC_NEXT: u64 = 14;

// struct virtq_avail { le16 flags; le16 idx; le16 ring[]; le16 used_event; };
const AVAIL_FLAGS: u64 = 0;
const AVAIL_IDX: u64 = 2;
const AVAIL_RING: u64 = 4;
const AVAIL_RING_STRIDE: u64 = 2;

// struct virtq_used { le16 flags; le16 idx; struct virtq_used_elem ring[]; le16 avail_event; };
// struct virtq_used_elem { le32 id; le32 len; };
const USED_IDX: u64 = 2;
const USED_RING: u64 = 4;
const USED_RING_STRIDE: u64 = 8;
const USED_ELEM_ID: u64 = 0;
const USED_ELEM_LEN: u64 = 4;

/// A single virtqueue descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

impl Descriptor {
    /// Check if this descriptor has the NEXT flag set.
    pub fn has_next(&self) -> bool {
        self.flags & desc_flags::NEXT != 0
    }

    /// Check if this descriptor is device write-only.
    pub fn is_write_only(&self) -> bool {
        self.flags & desc_flags::WRITE != 0
    }

    /// Check if this descriptor points at an indirect table.
    pub fn is_indirect(&self) -> bool {
        self.flags & desc_flags::INDIRECT != 0
    }
}

/// Split virtqueue configuration and device-side state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitVirtqueue {
    /// Queue size (number of descriptors). Always a power of two.
    pub(crate) size: u16,
    /// Whether the queue is ready.
    pub(crate) ready: bool,
    /// Descriptor table guest physical address.
    pub(crate) desc_table: u64,
    /// Available ring guest physical address.
    pub(crate) avail_ring: u64,
    /// Used ring guest physical address.
    pub(crate) used_ring: u64,
    /// Last seen available index.
    pub(crate) last_avail_idx: u16,
    /// Next used index to write.
    pub(crate) next_used_idx: u16,
    /// Forward queue notifications to the device personality.
    pub(crate) dispatch_notifications: bool,
}

impl SplitVirtqueue {
    /// Create a new queue with the given default size.
    pub fn new(size: u16) -> Self {
        Self {
            size,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            last_avail_idx: 0,
            next_used_idx: 0,
            dispatch_notifications: true,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn desc_table(&self) -> u64 {
        self.desc_table
    }

    pub fn avail_ring(&self) -> u64 {
        self.avail_ring
    }

    pub fn used_ring(&self) -> u64 {
        self.used_ring
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn next_used_idx(&self) -> u16 {
        self.next_used_idx
    }

    pub fn dispatch_notifications(&self) -> bool {
        self.dispatch_notifications
    }

    /// Ring slot for a free-running 16-bit index.
    fn slot(&self, idx: u16) -> u64 {
        (idx & self.size.wrapping_sub(1)) as u64
    }

    /// Read a descriptor from the descriptor table.
    pub fn read_descriptor(&self, mem: &dyn AddressSpace, index: u16) -> Result<Descriptor> {
        if index >= self.size {
            return Err(ProtocolViolation::DescriptorOutOfRange {
                index,
                queue_size: self.size,
            }
            .into());
        }

        let base = self.desc_table.wrapping_add(index as u64 * DESC_STRIDE);
        Ok(Descriptor {
            addr: memory::read_u64_le(mem, base + DESC_ADDR)?,
            len: memory::read_u32_le(mem, base + DESC_LEN)?,
            flags: memory::read_u16_le(mem, base + DESC_FLAGS)?,
            next: memory::read_u16_le(mem, base + DESC_NEXT)?,
        })
    }

    /// Driver flags from the available ring.
    pub fn avail_flags(&self, mem: &dyn AddressSpace) -> Result<u16> {
        memory::read_u16_le(mem, self.avail_ring.wrapping_add(AVAIL_FLAGS))
    }

    /// Driver's available index.
    pub fn avail_idx(&self, mem: &dyn AddressSpace) -> Result<u16> {
        memory::read_u16_le(mem, self.avail_ring.wrapping_add(AVAIL_IDX))
    }

    /// `used_event`, stored just past the available ring entries.
    pub fn used_event(&self, mem: &dyn AddressSpace) -> Result<u16> {
        let offset = AVAIL_RING + self.size as u64 * AVAIL_RING_STRIDE;
        memory::read_u16_le(mem, self.avail_ring.wrapping_add(offset))
    }

    fn avail_entry(&self, mem: &dyn AddressSpace, idx: u16) -> Result<u16> {
        let offset = AVAIL_RING + self.slot(idx) * AVAIL_RING_STRIDE;
        memory::read_u16_le(mem, self.avail_ring.wrapping_add(offset))
    }

    /// Check if there are available descriptor chains to process.
    pub fn has_available(&self, mem: &dyn AddressSpace) -> Result<bool> {
        if !self.ready {
            return Ok(false);
        }
        Ok(self.avail_idx(mem)? != self.last_avail_idx)
    }

    /// Take the next head index off the available ring.
    pub(crate) fn pop_available(&mut self, mem: &dyn AddressSpace) -> Result<u16> {
        // Ensure we see the ring entry after the index
        fence(Ordering::Acquire);

        let head = self.avail_entry(mem, self.last_avail_idx)?;
        trace_queue!(
            avail_idx = self.last_avail_idx,
            head,
            "popped available descriptor"
        );
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(head)
    }

    /// Add an entry to the used ring, returning the new used index.
    pub(crate) fn add_used(&mut self, mem: &dyn AddressSpace, head: u16, len: u32) -> Result<u16> {
        let elem = self
            .used_ring
            .wrapping_add(USED_RING + self.slot(self.next_used_idx) * USED_RING_STRIDE);
        memory::write_u32_le(mem, elem + USED_ELEM_ID, head as u32)?;
        memory::write_u32_le(mem, elem + USED_ELEM_LEN, len)?;

        // The element must be visible before the index moves
        fence(Ordering::Release);

        let idx = self.next_used_idx.wrapping_add(1);
        memory::write_u16_le(mem, self.used_ring.wrapping_add(USED_IDX), idx)?;
        self.next_used_idx = idx;
        trace_queue!(head, len, used_idx = idx, "published used descriptor");
        Ok(idx)
    }

    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            size: self.size,
            ready: self.ready,
            desc_table: self.desc_table,
            avail_ring: self.avail_ring,
            used_ring: self.used_ring,
            last_avail_idx: self.last_avail_idx,
            next_used_idx: self.next_used_idx,
            dispatch_notifications: self.dispatch_notifications,
        }
    }

    pub(crate) fn from_snapshot(snapshot: &QueueSnapshot) -> Self {
        Self {
            size: snapshot.size,
            ready: snapshot.ready,
            desc_table: snapshot.desc_table,
            avail_ring: snapshot.avail_ring,
            used_ring: snapshot.used_ring,
            last_avail_idx: snapshot.last_avail_idx,
            next_used_idx: snapshot.next_used_idx,
            dispatch_notifications: snapshot.dispatch_notifications,
        }
    }
}

/// Iterator over the descriptor chains a driver has made available on one
/// queue.
///
/// Obtained from [`DeviceCore::queue`]. Every step re-reads the available
/// ring header from guest memory, so a queue that reports no more chains
/// may report more later. Errors end the iteration with the device already
/// in its error state.
pub struct Virtqueue<'a> {
    core: &'a mut DeviceCore,
    index: usize,
}

impl<'a> Virtqueue<'a> {
    pub(crate) fn new(core: &'a mut DeviceCore, index: usize) -> Self {
        Self { core, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the driver has made another chain available.
    pub fn has_next(&mut self) -> Result<bool> {
        self.core.queue_has_next(self.index)
    }
}

impl Iterator for Virtqueue<'_> {
    type Item = Result<DescriptorChain>;

    fn next(&mut self) -> Option<Self::Item> {
        self.core.next_chain(self.index).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::GuestMemory;

    const DESC: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;

    fn ready_queue(size: u16) -> SplitVirtqueue {
        let mut queue = SplitVirtqueue::new(size);
        queue.desc_table = DESC;
        queue.avail_ring = AVAIL;
        queue.used_ring = USED;
        queue.ready = true;
        queue
    }

    #[test]
    fn test_read_descriptor_layout() {
        let mem = GuestMemory::new(0, 0x4000);
        let queue = ready_queue(4);
        let base = DESC + 2 * 16;
        memory::write_u64_le(&mem, base, 0xDEAD_BEEF_0000).unwrap();
        memory::write_u32_le(&mem, base + 8, 512).unwrap();
        memory::write_u16_le(&mem, base + 12, desc_flags::NEXT | desc_flags::WRITE).unwrap();
        memory::write_u16_le(&mem, base + 14, 3).unwrap();

        let desc = queue.read_descriptor(&mem, 2).unwrap();
        assert_eq!(desc.addr, 0xDEAD_BEEF_0000);
        assert_eq!(desc.len, 512);
        assert!(desc.has_next());
        assert!(desc.is_write_only());
        assert!(!desc.is_indirect());
        assert_eq!(desc.next, 3);
    }

    #[test]
    fn test_descriptor_index_out_of_range() {
        let mem = GuestMemory::new(0, 0x4000);
        let queue = ready_queue(4);
        assert!(matches!(
            queue.read_descriptor(&mem, 4),
            Err(Error::Protocol(ProtocolViolation::DescriptorOutOfRange {
                index: 4,
                queue_size: 4
            }))
        ));
    }

    #[test]
    fn test_available_ring_wraps() {
        let mem = GuestMemory::new(0, 0x4000);
        let mut queue = ready_queue(4);
        queue.last_avail_idx = 3;
        memory::write_u16_le(&mem, AVAIL + 4 + 3 * 2, 1).unwrap();
        memory::write_u16_le(&mem, AVAIL + 4, 2).unwrap();
        memory::write_u16_le(&mem, AVAIL + 2, 5).unwrap();

        assert!(queue.has_available(&mem).unwrap());
        assert_eq!(queue.pop_available(&mem).unwrap(), 1);
        assert_eq!(queue.pop_available(&mem).unwrap(), 2);
        assert_eq!(queue.last_avail_idx(), 5);
        assert!(!queue.has_available(&mem).unwrap());
    }

    #[test]
    fn test_not_ready_has_nothing_available() {
        let mem = GuestMemory::new(0, 0x4000);
        let mut queue = ready_queue(4);
        queue.ready = false;
        memory::write_u16_le(&mem, AVAIL + 2, 1).unwrap();
        assert!(!queue.has_available(&mem).unwrap());
    }

    #[test]
    fn test_add_used_writes_element_then_index() {
        let mem = GuestMemory::new(0, 0x4000);
        let mut queue = ready_queue(4);
        queue.next_used_idx = u16::MAX;

        assert_eq!(queue.add_used(&mem, 2, 64).unwrap(), 0);
        let slot = USED + 4 + 3 * 8;
        assert_eq!(memory::read_u32_le(&mem, slot).unwrap(), 2);
        assert_eq!(memory::read_u32_le(&mem, slot + 4).unwrap(), 64);
        assert_eq!(memory::read_u16_le(&mem, USED + 2).unwrap(), 0);
    }

    #[test]
    fn test_used_event_follows_ring() {
        let mem = GuestMemory::new(0, 0x4000);
        let queue = ready_queue(8);
        memory::write_u16_le(&mem, AVAIL + 4 + 8 * 2, 7).unwrap();
        assert_eq!(queue.used_event(&mem).unwrap(), 7);
    }

    #[test]
    fn test_fault_propagates() {
        let mem = GuestMemory::new(0, 0x4000);
        let mut queue = ready_queue(4);
        queue.avail_ring = 0x8000;
        assert!(matches!(
            queue.has_available(&mem),
            Err(Error::MemoryAccess { .. })
        ));
    }
}
