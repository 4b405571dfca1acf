//! Descriptor chain cursor.
//!
//! A [`DescriptorChain`] is created when a head index is taken off the
//! available ring. Creation walks the chain once to total up the readable
//! and writable byte counts; afterwards reads and writes move a cursor
//! through the chain, re-reading each descriptor from guest memory as it
//! is reached and re-checking its flags.
//!
//! Every operation takes the owning [`DeviceCore`]. A chain is tied to the
//! queue allocation it was created from: after a reset or renegotiation it
//! reports no bytes and refuses all access.

use super::common::DeviceCore;
use super::queue::{Descriptor, SplitVirtqueue};
use crate::error::{Error, ProtocolViolation, Result};
use crate::memory::AddressSpace;
use crate::trace_queue;

/// One request popped from a virtqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    queue: usize,
    epoch: u64,
    head: u16,
    readable: u64,
    writable: u64,
    read: u64,
    written: u64,
    used: bool,
    // Cursor
    desc_index: u16,
    addr: u64,
    len: u32,
    pos: u32,
    write_flagged: bool,
    in_write_run: bool,
    chain_len: usize,
}

impl DescriptorChain {
    pub(crate) fn new(
        queue: &SplitVirtqueue,
        mem: &dyn AddressSpace,
        queue_index: usize,
        epoch: u64,
        head: u16,
        max_chain_length: usize,
    ) -> Result<Self> {
        let first = queue.read_descriptor(mem, head)?;

        let mut readable = 0u64;
        let mut writable = 0u64;
        let mut in_write_run = false;
        let mut count = 1;
        let mut desc = first;
        loop {
            if desc.is_indirect() {
                return Err(ProtocolViolation::IndirectDescriptor.into());
            }
            if desc.is_write_only() {
                in_write_run = true;
                writable += desc.len as u64;
            } else if in_write_run {
                return Err(ProtocolViolation::ReadAfterWrite.into());
            } else {
                readable += desc.len as u64;
            }

            if !desc.has_next() {
                break;
            }
            if count >= max_chain_length {
                return Err(ProtocolViolation::ChainTooLong {
                    max: max_chain_length,
                }
                .into());
            }
            desc = queue.read_descriptor(mem, desc.next)?;
            count += 1;
        }

        trace_queue!(
            queue = queue_index,
            head,
            descriptors = count,
            readable,
            writable,
            "descriptor chain"
        );

        let mut chain = Self {
            queue: queue_index,
            epoch,
            head,
            readable,
            writable,
            read: 0,
            written: 0,
            used: false,
            desc_index: head,
            addr: 0,
            len: 0,
            pos: 0,
            write_flagged: false,
            in_write_run: false,
            chain_len: 1,
        };
        chain.load(head, &first);
        chain.in_write_run = first.is_write_only();
        Ok(chain)
    }

    /// Head descriptor index; the id reported in the used ring.
    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn queue_index(&self) -> usize {
        self.queue
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Whether the chain can still be accessed through `core`.
    pub fn is_valid(&self, core: &DeviceCore) -> bool {
        !self.used && self.epoch == core.epoch() && !core.has_failed()
    }

    /// Device-readable bytes not yet consumed.
    pub fn readable_bytes(&self) -> usize {
        if self.used {
            return 0;
        }
        (self.readable - self.read) as usize
    }

    /// Device-writable bytes not yet filled.
    pub fn writable_bytes(&self) -> usize {
        if self.used {
            return 0;
        }
        (self.writable - self.written) as usize
    }

    /// Bytes written so far; reported as the used length.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn read_byte(&mut self, core: &mut DeviceCore) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(core, &mut buf)?;
        Ok(buf[0])
    }

    /// Fill `buf` from the readable part of the chain.
    pub fn read(&mut self, core: &mut DeviceCore, buf: &mut [u8]) -> Result<()> {
        self.check(core)?;
        if buf.len() > self.readable_bytes() {
            return Err(Error::ChainOverrun {
                requested: buf.len(),
                available: self.readable_bytes(),
            });
        }
        let result = self.transfer(core, buf.len(), false, |mem, addr, range| {
            mem.read_bytes(addr, &mut buf[range])
        });
        result.map_err(|err| core.fail(err))
    }

    pub fn write_byte(&mut self, core: &mut DeviceCore, value: u8) -> Result<()> {
        self.write(core, &[value])
    }

    /// Copy `data` into the writable part of the chain.
    ///
    /// All readable bytes must have been consumed first.
    pub fn write(&mut self, core: &mut DeviceCore, data: &[u8]) -> Result<()> {
        self.check(core)?;
        if self.readable_bytes() > 0 {
            return Err(Error::ReadableBytesRemaining);
        }
        if data.len() > self.writable_bytes() {
            return Err(Error::ChainOverrun {
                requested: data.len(),
                available: self.writable_bytes(),
            });
        }
        let result = self.transfer(core, data.len(), true, |mem, addr, range| {
            mem.write_bytes(addr, &data[range])
        });
        result.map_err(|err| core.fail(err))
    }

    /// Advance past `count` bytes of the current phase without touching the
    /// buffers. Skipped writable bytes count as written.
    pub fn skip(&mut self, core: &mut DeviceCore, count: usize) -> Result<()> {
        self.check(core)?;
        let writing = self.readable_bytes() == 0;
        let available = if writing {
            self.writable_bytes()
        } else {
            self.readable_bytes()
        };
        if count > available {
            return Err(Error::ChainOverrun {
                requested: count,
                available,
            });
        }
        let result = self.transfer(core, count, writing, |_, _, _| Ok(()));
        result.map_err(|err| core.fail(err))
    }

    /// Return the chain to the driver through the used ring.
    ///
    /// Idempotent. A chain from a previous queue allocation, or one whose
    /// device has failed, is retired without touching the ring.
    pub fn mark_used(&mut self, core: &mut DeviceCore) -> Result<()> {
        if self.used {
            return Ok(());
        }
        self.used = true;
        if self.epoch != core.epoch() || core.has_failed() {
            return Ok(());
        }
        let len = u32::try_from(self.written).unwrap_or(u32::MAX);
        core.publish_used(self.queue, self.head, len)
    }

    fn check(&self, core: &DeviceCore) -> Result<()> {
        if self.used {
            return Err(Error::ChainUsed);
        }
        core.chain_context(self.queue, self.epoch).map(|_| ())
    }

    fn load(&mut self, index: u16, desc: &Descriptor) {
        self.desc_index = index;
        self.addr = desc.addr;
        self.len = desc.len;
        self.pos = 0;
        self.write_flagged = desc.is_write_only();
    }

    /// Move `count` bytes in the given phase, calling `copy` once per
    /// contiguous piece with the guest address and the matching buffer range.
    fn transfer<F>(&mut self, core: &DeviceCore, count: usize, writing: bool, mut copy: F) -> Result<()>
    where
        F: FnMut(&dyn AddressSpace, u64, std::ops::Range<usize>) -> Result<()>,
    {
        let (queue, mem) = core.chain_context(self.queue, self.epoch)?;
        let max_chain_length = core.spec().max_chain_length();

        let mut done = 0;
        while done < count {
            self.seek(queue, mem, max_chain_length, writing)?;
            let n = (count - done).min((self.len - self.pos) as usize);
            copy(mem, self.addr.wrapping_add(self.pos as u64), done..done + n)?;
            self.pos += n as u32;
            if writing {
                self.written += n as u64;
            } else {
                self.read += n as u64;
            }
            done += n;
        }
        Ok(())
    }

    /// Position the cursor on a descriptor with bytes left in the given
    /// phase, following `next` links as needed.
    fn seek(
        &mut self,
        queue: &SplitVirtqueue,
        mem: &dyn AddressSpace,
        max_chain_length: usize,
        writing: bool,
    ) -> Result<()> {
        loop {
            if self.pos < self.len {
                if self.write_flagged == writing {
                    return Ok(());
                }
                if !writing {
                    // The driver rewrote the chain under us
                    return Err(ProtocolViolation::ChainTruncated.into());
                }
                // Unread device-readable bytes ahead of the write run
                self.pos = self.len;
            }

            let current = queue.read_descriptor(mem, self.desc_index)?;
            if !current.has_next() {
                return Err(ProtocolViolation::ChainTruncated.into());
            }
            if self.chain_len >= max_chain_length {
                return Err(ProtocolViolation::ChainTooLong {
                    max: max_chain_length,
                }
                .into());
            }
            let next = queue.read_descriptor(mem, current.next)?;
            if next.is_indirect() {
                return Err(ProtocolViolation::IndirectDescriptor.into());
            }
            self.chain_len += 1;
            self.load(current.next, &next);
            if next.is_write_only() {
                self.in_write_run = true;
            } else if self.in_write_run {
                return Err(ProtocolViolation::ReadAfterWrite.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builder::DeviceSpec;
    use crate::device::virtio::queue::desc_flags;
    use crate::device::virtio::{feature, interrupt, status};
    use crate::device::VirtioDevice;
    use crate::memory::{self, GuestMemory};

    const DESC: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;

    struct Null(DeviceSpec);

    impl VirtioDevice for Null {
        fn spec(&self) -> &DeviceSpec {
            &self.0
        }
    }

    fn setup(max_chain_length: usize) -> (DeviceCore, Null, Arc<GuestMemory>) {
        let spec = DeviceSpec::builder(1)
            .queue_count(1)
            .max_queue_size(8)
            .max_chain_length(max_chain_length)
            .build()
            .unwrap();
        let mem = Arc::new(GuestMemory::new(0, 0x10000));
        let mut core = DeviceCore::new(spec.clone(), mem.clone());
        let mut device = Null(spec);
        core.write_status(&mut device, status::ACKNOWLEDGE | status::DRIVER);
        core.driver_features = feature::VIRTIO_F_VERSION_1;
        core.write_status(
            &mut device,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK,
        );
        let queue = &mut core.queues[0];
        queue.desc_table = DESC;
        queue.avail_ring = AVAIL;
        queue.used_ring = USED;
        queue.ready = true;
        core.write_status(
            &mut device,
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK,
        );
        (core, device, mem)
    }

    fn set_desc(mem: &GuestMemory, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC + index as u64 * 16;
        memory::write_u64_le(mem, base, addr).unwrap();
        memory::write_u32_le(mem, base + 8, len).unwrap();
        memory::write_u16_le(mem, base + 12, flags).unwrap();
        memory::write_u16_le(mem, base + 14, next).unwrap();
    }

    fn offer(mem: &GuestMemory, slot: u16, head: u16) {
        memory::write_u16_le(mem, AVAIL + 4 + slot as u64 * 2, head).unwrap();
        memory::write_u16_le(mem, AVAIL + 2, slot + 1).unwrap();
    }

    #[test]
    fn test_read_then_write() {
        let (mut core, _device, mem) = setup(128);
        mem.write_bytes(0x4000, b"hello").unwrap();
        set_desc(&mem, 0, 0x4000, 3, desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x4003, 2, desc_flags::NEXT, 2);
        set_desc(&mem, 2, 0x5000, 4, desc_flags::WRITE, 0);
        offer(&mem, 0, 0);

        let mut chain = core.next_chain(0).unwrap().unwrap();
        assert_eq!(chain.readable_bytes(), 5);
        assert_eq!(chain.writable_bytes(), 4);
        assert!(matches!(
            chain.write(&mut core, b"x"),
            Err(Error::ReadableBytesRemaining)
        ));

        let mut buf = [0u8; 5];
        chain.read(&mut core, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(matches!(
            chain.read_byte(&mut core),
            Err(Error::ChainOverrun { .. })
        ));

        chain.write(&mut core, b"ok").unwrap();
        chain.write_byte(&mut core, b'!').unwrap();
        assert_eq!(chain.writable_bytes(), 1);
        chain.mark_used(&mut core).unwrap();
        chain.mark_used(&mut core).unwrap();

        let mut out = [0u8; 3];
        mem.read_bytes(0x5000, &mut out).unwrap();
        assert_eq!(&out, b"ok!");
        assert_eq!(memory::read_u32_le(mem.as_ref(), USED + 4).unwrap(), 0);
        assert_eq!(memory::read_u32_le(mem.as_ref(), USED + 8).unwrap(), 3);
        assert_eq!(memory::read_u16_le(mem.as_ref(), USED + 2).unwrap(), 1);
        assert_eq!(chain.readable_bytes(), 0);
        assert_eq!(chain.writable_bytes(), 0);
        assert!(matches!(chain.read_byte(&mut core), Err(Error::ChainUsed)));
        assert_ne!(core.interrupt_status() & interrupt::USED_BUFFER, 0);
    }

    #[test]
    fn test_write_skips_unread_bytes() {
        let (mut core, _device, mem) = setup(128);
        set_desc(&mem, 0, 0x4000, 8, desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x5000, 8, desc_flags::WRITE, 0);
        offer(&mem, 0, 0);

        let mut chain = core.next_chain(0).unwrap().unwrap();
        chain.skip(&mut core, 8).unwrap();
        chain.skip(&mut core, 2).unwrap();
        chain.write(&mut core, &[1, 2]).unwrap();
        assert_eq!(chain.bytes_written(), 4);
        assert_eq!(memory::read_u8(mem.as_ref(), 0x5002).unwrap(), 1);
    }

    #[test]
    fn test_read_after_write_rejected() {
        let (mut core, _device, mem) = setup(128);
        set_desc(&mem, 0, 0x5000, 4, desc_flags::WRITE | desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x4000, 4, 0, 0);
        offer(&mem, 0, 0);

        assert!(matches!(
            core.next_chain(0),
            Err(Error::Protocol(ProtocolViolation::ReadAfterWrite))
        ));
        assert_ne!(core.status() & status::DEVICE_NEEDS_RESET, 0);
        assert!(core.next_chain(0).unwrap().is_none());
    }

    #[test]
    fn test_cycle_bounded() {
        let (mut core, _device, mem) = setup(4);
        set_desc(&mem, 0, 0x4000, 1, desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x4000, 1, desc_flags::NEXT, 0);
        offer(&mem, 0, 0);

        assert!(matches!(
            core.next_chain(0),
            Err(Error::Protocol(ProtocolViolation::ChainTooLong { max: 4 }))
        ));
        assert!(core.has_failed());
    }

    #[test]
    fn test_out_of_range_next() {
        let (mut core, _device, mem) = setup(128);
        set_desc(&mem, 0, 0x4000, 1, desc_flags::NEXT, 9);
        offer(&mem, 0, 0);
        assert!(matches!(
            core.next_chain(0),
            Err(Error::Protocol(ProtocolViolation::DescriptorOutOfRange {
                index: 9,
                ..
            }))
        ));
    }

    #[test]
    fn test_indirect_rejected() {
        let (mut core, _device, mem) = setup(128);
        set_desc(&mem, 0, 0x4000, 16, desc_flags::INDIRECT, 0);
        offer(&mem, 0, 0);
        assert!(matches!(
            core.next_chain(0),
            Err(Error::Protocol(ProtocolViolation::IndirectDescriptor))
        ));
    }

    #[test]
    fn test_rewritten_chain_detected() {
        let (mut core, _device, mem) = setup(128);
        set_desc(&mem, 0, 0x4000, 2, desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x4002, 2, 0, 0);
        offer(&mem, 0, 0);

        let mut chain = core.next_chain(0).unwrap().unwrap();
        chain.skip(&mut core, 2).unwrap();
        // Driver drops the link after the chain was popped
        set_desc(&mem, 0, 0x4000, 2, 0, 0);
        assert!(matches!(
            chain.read_byte(&mut core),
            Err(Error::Protocol(ProtocolViolation::ChainTruncated))
        ));
        assert!(core.has_failed());
        assert!(matches!(
            chain.read_byte(&mut core),
            Err(Error::DeviceNeedsReset)
        ));
    }

    #[test]
    fn test_rewritten_write_run_detected() {
        let (mut core, _device, mem) = setup(128);
        set_desc(&mem, 0, 0x5000, 2, desc_flags::WRITE | desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x5002, 2, desc_flags::WRITE, 0);
        offer(&mem, 0, 0);

        let mut chain = core.next_chain(0).unwrap().unwrap();
        assert_eq!(chain.writable_bytes(), 4);
        // Second buffer turns device-readable after the chain was popped
        set_desc(&mem, 1, 0x5002, 2, 0, 0);
        assert!(matches!(
            chain.write(&mut core, &[1, 2, 3]),
            Err(Error::Protocol(ProtocolViolation::ReadAfterWrite))
        ));
        assert!(core.has_failed());
        assert_eq!(memory::read_u8(mem.as_ref(), 0x5002).unwrap(), 0);
    }

    #[test]
    fn test_reset_invalidates_chain() {
        let (mut core, mut device, mem) = setup(128);
        set_desc(&mem, 0, 0x5000, 4, desc_flags::WRITE, 0);
        offer(&mem, 0, 0);

        let mut chain = core.next_chain(0).unwrap().unwrap();
        core.write_status(&mut device, 0);
        assert!(!chain.is_valid(&core));
        assert!(matches!(
            chain.write_byte(&mut core, 1),
            Err(Error::ChainInvalidated)
        ));
        chain.mark_used(&mut core).unwrap();
        assert_eq!(memory::read_u16_le(mem.as_ref(), USED + 2).unwrap(), 0);
    }

    #[test]
    fn test_zero_length_descriptors_skipped() {
        let (mut core, _device, mem) = setup(128);
        mem.write_bytes(0x4000, &[7]).unwrap();
        set_desc(&mem, 0, 0x9000, 0, desc_flags::NEXT, 1);
        set_desc(&mem, 1, 0x4000, 1, desc_flags::NEXT, 2);
        set_desc(&mem, 2, 0x9000, 0, desc_flags::WRITE, 0);
        offer(&mem, 0, 0);

        let mut chain = core.next_chain(0).unwrap().unwrap();
        assert_eq!(chain.readable_bytes(), 1);
        assert_eq!(chain.writable_bytes(), 0);
        assert_eq!(chain.read_byte(&mut core).unwrap(), 7);
    }
}
