//! VirtIO MMIO transport layer.
//!
//! This implements the virtio-mmio transport of VirtIO 1.1, section 4.2.
//! Register decoding lives here; the negotiated state itself is kept in the
//! [`DeviceCore`] shared with the device personality.

use std::sync::Arc;

use tracing::debug;

use super::common::{DeviceCore, DeviceSnapshot};
use super::{mmio, VIRTIO_MAGIC, VIRTIO_VERSION};
use crate::builder::VIRTQ_MAX_RING_SIZE;
use crate::device::irq::InterruptController;
use crate::device::{MmioDevice, VirtioDevice};
use crate::error::Result;
use crate::memory::{AccessSize, AddressSpace};
use crate::trace_mmio;

/// Size of the register block preceding the config space.
pub const VIRTIO_MMIO_REGISTERS_SIZE: u64 = mmio::CONFIG;

/// Which queue address register pair is being written.
#[derive(Debug, Clone, Copy)]
enum QueueAddress {
    Desc,
    Driver,
    Device,
}

/// VirtIO MMIO transport state.
pub struct VirtioMmioTransport<D: VirtioDevice> {
    /// Negotiated state shared with the device.
    core: DeviceCore,
    /// The underlying virtio device.
    device: D,
    /// Base address of this device.
    base_addr: u64,
}

impl<D: VirtioDevice> VirtioMmioTransport<D> {
    /// Create a new MMIO transport for a virtio device.
    pub fn new(mut device: D, memory: Arc<dyn AddressSpace>, base_addr: u64) -> Self {
        let mut core = DeviceCore::new(device.spec().clone(), memory);
        device.initialize_config(&mut core);
        Self {
            core,
            device,
            base_addr,
        }
    }

    /// Get the base address.
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Check if an address falls within this device's MMIO region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_addr && addr - self.base_addr < self.mmio_len()
    }

    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    /// Get a reference to the underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Get a mutable reference to the underlying device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Both halves at once, for host-side calls into the personality.
    pub fn split_mut(&mut self) -> (&mut D, &mut DeviceCore) {
        (&mut self.device, &mut self.core)
    }

    /// Connect the device's interrupt line to a controller.
    pub fn mount_interrupt(&mut self, controller: Arc<dyn InterruptController>, id: u32) {
        self.core.interrupt_mut().mount(controller, id);
    }

    /// Check if device is in DRIVER_OK state.
    pub fn is_driver_ok(&self) -> bool {
        self.core.is_driver_ok()
    }

    /// Get the currently selected queue index.
    pub fn queue_sel(&self) -> u32 {
        self.core.queue_sel
    }

    /// Reset the device as if the driver wrote 0 to the status register.
    pub fn reset(&mut self) {
        self.core.reset(&mut self.device);
    }

    /// Restore the core from a snapshot and let the device resync with it.
    pub fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<()> {
        self.core.restore(snapshot)?;
        self.device.restored(&mut self.core);
        Ok(())
    }

    fn read_register(&self, offset: u64) -> u32 {
        let core = &self.core;
        let spec = core.spec();
        let queue = core.queues.get(core.queue_sel as usize);

        match offset {
            mmio::MAGIC_VALUE => VIRTIO_MAGIC,
            mmio::VERSION => VIRTIO_VERSION,
            mmio::DEVICE_ID => spec.device_id(),
            mmio::VENDOR_ID => spec.vendor_id(),
            mmio::DEVICE_FEATURES => match core.device_features_sel {
                0 => spec.features() as u32,
                1 => (spec.features() >> 32) as u32,
                _ => 0,
            },
            mmio::QUEUE_NUM_MAX => {
                if (core.queue_sel as usize) < spec.queue_count() {
                    spec.max_queue_size() as u32
                } else {
                    0
                }
            }
            mmio::QUEUE_NUM => queue.map(|q| q.size as u32).unwrap_or(0),
            mmio::QUEUE_READY => queue.map(|q| q.ready as u32).unwrap_or(0),
            mmio::QUEUE_DESC_LOW => queue.map(|q| q.desc_table as u32).unwrap_or(0),
            mmio::QUEUE_DESC_HIGH => queue.map(|q| (q.desc_table >> 32) as u32).unwrap_or(0),
            mmio::QUEUE_DRIVER_LOW => queue.map(|q| q.avail_ring as u32).unwrap_or(0),
            mmio::QUEUE_DRIVER_HIGH => queue.map(|q| (q.avail_ring >> 32) as u32).unwrap_or(0),
            mmio::QUEUE_DEVICE_LOW => queue.map(|q| q.used_ring as u32).unwrap_or(0),
            mmio::QUEUE_DEVICE_HIGH => queue.map(|q| (q.used_ring >> 32) as u32).unwrap_or(0),
            mmio::INTERRUPT_STATUS => core.interrupt_status,
            mmio::STATUS => core.status as u32,
            mmio::CONFIG_GENERATION => core.config_generation(),
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            mmio::DEVICE_FEATURES_SEL => {
                self.core.device_features_sel = value;
            }
            mmio::DRIVER_FEATURES => {
                // Only 64 feature bits
                let shift = match self.core.driver_features_sel {
                    0 => 0,
                    1 => 32,
                    _ => return,
                };
                let mask = 0xFFFF_FFFFu64 << shift;
                self.core.driver_features =
                    (self.core.driver_features & !mask) | ((value as u64) << shift);
            }
            mmio::DRIVER_FEATURES_SEL => {
                self.core.driver_features_sel = value;
            }
            mmio::QUEUE_SEL => {
                if (value as usize) < self.core.spec().queue_count() {
                    self.core.queue_sel = value;
                }
            }
            mmio::QUEUE_NUM => {
                let limit = (self.core.spec().max_queue_size() as u32).min(VIRTQ_MAX_RING_SIZE);
                if !value.is_power_of_two() || value > limit {
                    debug!(value, limit, "ignoring invalid queue size");
                    return;
                }
                let qsel = self.core.queue_sel;
                if let Some(queue) = self.current_queue_mut() {
                    if !queue.ready {
                        queue.size = value as u16;
                        debug!(queue = qsel, size = value, "queue size set");
                    }
                }
            }
            mmio::QUEUE_READY => {
                let qsel = self.core.queue_sel;
                if let Some(queue) = self.current_queue_mut() {
                    queue.ready = value & 1 != 0;
                    if queue.ready {
                        debug!(
                            queue = qsel,
                            desc = format_args!("{:#x}", queue.desc_table),
                            avail = format_args!("{:#x}", queue.avail_ring),
                            used = format_args!("{:#x}", queue.used_ring),
                            size = queue.size,
                            "queue ready"
                        );
                    }
                }
            }
            mmio::QUEUE_NOTIFY => {
                self.core.notify_queue(&mut self.device, value as usize);
            }
            mmio::INTERRUPT_ACK => {
                self.core.ack_interrupt(value);
            }
            mmio::STATUS => {
                // STATUS is 8-bit, mask to prevent garbage values
                self.core.write_status(&mut self.device, value as u8);
            }
            mmio::QUEUE_DESC_LOW => self.set_queue_address(QueueAddress::Desc, false, value),
            mmio::QUEUE_DESC_HIGH => self.set_queue_address(QueueAddress::Desc, true, value),
            mmio::QUEUE_DRIVER_LOW => self.set_queue_address(QueueAddress::Driver, false, value),
            mmio::QUEUE_DRIVER_HIGH => self.set_queue_address(QueueAddress::Driver, true, value),
            mmio::QUEUE_DEVICE_LOW => self.set_queue_address(QueueAddress::Device, false, value),
            mmio::QUEUE_DEVICE_HIGH => self.set_queue_address(QueueAddress::Device, true, value),
            _ => {}
        }
    }

    /// Get the current queue mutably.
    fn current_queue_mut(&mut self) -> Option<&mut super::SplitVirtqueue> {
        let qsel = self.core.queue_sel as usize;
        self.core.queues.get_mut(qsel)
    }

    fn set_queue_address(&mut self, which: QueueAddress, high: bool, value: u32) {
        let Some(queue) = self.current_queue_mut() else {
            return;
        };
        if queue.ready {
            return;
        }
        let addr = match which {
            QueueAddress::Desc => &mut queue.desc_table,
            QueueAddress::Driver => &mut queue.avail_ring,
            QueueAddress::Device => &mut queue.used_ring,
        };
        *addr = if high {
            (*addr & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32)
        } else {
            (*addr & 0xFFFF_FFFF_0000_0000) | value as u64
        };
    }
}

impl<D: VirtioDevice> MmioDevice for VirtioMmioTransport<D> {
    fn mmio_len(&self) -> u64 {
        VIRTIO_MMIO_REGISTERS_SIZE + self.core.config().len() as u64
    }

    fn load(&mut self, offset: u64, size: AccessSize) -> u64 {
        if offset >= mmio::CONFIG {
            let value = self
                .device
                .read_config(&mut self.core, offset - mmio::CONFIG, size);
            trace_mmio!(offset, ?size, value, "config read");
            return value & size.mask();
        }

        if size != AccessSize::Word || offset & 3 != 0 {
            return 0;
        }
        let value = self.read_register(offset);
        trace_mmio!(offset = format_args!("{:#x}", offset), value = format_args!("{:#x}", value), "register read");
        value as u64
    }

    fn store(&mut self, offset: u64, value: u64, size: AccessSize) {
        if offset >= mmio::CONFIG {
            trace_mmio!(offset, ?size, value, "config write");
            self.device
                .write_config(&mut self.core, offset - mmio::CONFIG, value & size.mask(), size);
            return;
        }

        if size != AccessSize::Word || offset & 3 != 0 {
            return;
        }
        trace_mmio!(offset = format_args!("{:#x}", offset), value = format_args!("{:#x}", value), "register write");
        self.write_register(offset, value as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DeviceSpec;
    use crate::device::virtio::{feature, interrupt, status};
    use crate::device::LevelInterruptController;
    use crate::memory::GuestMemory;

    struct Plain(DeviceSpec);

    impl VirtioDevice for Plain {
        fn spec(&self) -> &DeviceSpec {
            &self.0
        }
    }

    fn transport() -> VirtioMmioTransport<Plain> {
        let spec = DeviceSpec::builder(7)
            .vendor_id(0x1AF4)
            .features(1 << 3 | feature::VIRTIO_F_RING_EVENT_IDX)
            .queue_count(2)
            .config_space_size(8)
            .build()
            .unwrap();
        VirtioMmioTransport::new(Plain(spec), Arc::new(GuestMemory::new(0, 0x10000)), 0x1000_0000)
    }

    fn read(t: &mut VirtioMmioTransport<Plain>, offset: u64) -> u32 {
        t.load(offset, AccessSize::Word) as u32
    }

    fn write(t: &mut VirtioMmioTransport<Plain>, offset: u64, value: u32) {
        t.store(offset, value as u64, AccessSize::Word);
    }

    fn negotiate(t: &mut VirtioMmioTransport<Plain>) {
        write(t, mmio::STATUS, status::ACKNOWLEDGE as u32);
        write(t, mmio::STATUS, (status::ACKNOWLEDGE | status::DRIVER) as u32);
        write(t, mmio::DRIVER_FEATURES_SEL, 1);
        write(t, mmio::DRIVER_FEATURES, 1);
        write(
            t,
            mmio::STATUS,
            (status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK) as u32,
        );
    }

    #[test]
    fn test_identification() {
        let mut t = transport();
        assert_eq!(read(&mut t, mmio::MAGIC_VALUE), VIRTIO_MAGIC);
        assert_eq!(read(&mut t, mmio::VERSION), 2);
        assert_eq!(read(&mut t, mmio::DEVICE_ID), 7);
        assert_eq!(read(&mut t, mmio::VENDOR_ID), 0x1AF4);
        assert_eq!(t.mmio_len(), 0x108);
        assert!(t.contains(0x1000_0107));
        assert!(!t.contains(0x1000_0108));
    }

    #[test]
    fn test_non_word_register_access_ignored() {
        let mut t = transport();
        assert_eq!(t.load(mmio::MAGIC_VALUE, AccessSize::Byte), 0);
        assert_eq!(t.load(mmio::MAGIC_VALUE, AccessSize::Double), 0);
        t.store(mmio::STATUS, status::ACKNOWLEDGE as u64, AccessSize::Half);
        assert_eq!(read(&mut t, mmio::STATUS), 0);
        assert_eq!(read(&mut t, 0x0C8), 0);
    }

    #[test]
    fn test_feature_words() {
        let mut t = transport();
        assert_eq!(read(&mut t, mmio::DEVICE_FEATURES), 1 << 3 | 1 << 29);
        write(&mut t, mmio::DEVICE_FEATURES_SEL, 1);
        assert_eq!(read(&mut t, mmio::DEVICE_FEATURES), 1);
        write(&mut t, mmio::DEVICE_FEATURES_SEL, 2);
        assert_eq!(read(&mut t, mmio::DEVICE_FEATURES), 0);

        write(&mut t, mmio::DRIVER_FEATURES, 1 << 3 | 1 << 5);
        write(&mut t, mmio::DRIVER_FEATURES_SEL, 1);
        write(&mut t, mmio::DRIVER_FEATURES, 1);
        write(&mut t, mmio::DRIVER_FEATURES_SEL, 2);
        write(&mut t, mmio::DRIVER_FEATURES, 0xFFFF_FFFF);
        assert_eq!(
            t.core().negotiated_features(),
            1 << 3 | feature::VIRTIO_F_VERSION_1
        );
    }

    #[test]
    fn test_queue_registers() {
        let mut t = transport();
        // Inert before FEATURES_OK
        write(&mut t, mmio::QUEUE_NUM, 8);
        assert_eq!(read(&mut t, mmio::QUEUE_NUM), 0);
        assert_eq!(read(&mut t, mmio::QUEUE_NUM_MAX), 16);

        negotiate(&mut t);
        write(&mut t, mmio::QUEUE_SEL, 1);
        write(&mut t, mmio::QUEUE_SEL, 2);
        assert_eq!(t.queue_sel(), 1);

        write(&mut t, mmio::QUEUE_NUM, 12);
        write(&mut t, mmio::QUEUE_NUM, 32);
        assert_eq!(read(&mut t, mmio::QUEUE_NUM), 16);
        write(&mut t, mmio::QUEUE_NUM, 4);
        write(&mut t, mmio::QUEUE_DESC_LOW, 0x1000);
        write(&mut t, mmio::QUEUE_DESC_HIGH, 0x1);
        write(&mut t, mmio::QUEUE_DRIVER_LOW, 0x2000);
        write(&mut t, mmio::QUEUE_DEVICE_LOW, 0x3000);
        write(&mut t, mmio::QUEUE_READY, 1);

        // Frozen while ready
        write(&mut t, mmio::QUEUE_NUM, 8);
        write(&mut t, mmio::QUEUE_DESC_LOW, 0x5000);
        let queue = t.core().queue_state(1).unwrap();
        assert_eq!(queue.size(), 4);
        assert_eq!(queue.desc_table(), 0x1_0000_1000);
        assert_eq!(queue.avail_ring(), 0x2000);
        assert_eq!(queue.used_ring(), 0x3000);
        assert_eq!(read(&mut t, mmio::QUEUE_READY), 1);
        assert_eq!(read(&mut t, mmio::QUEUE_DESC_HIGH), 1);
    }

    #[test]
    fn test_config_access() {
        let mut t = transport();
        t.store(mmio::CONFIG + 1, 0xAB, AccessSize::Byte);
        assert_eq!(t.load(mmio::CONFIG, AccessSize::Half), 0xAB00);
        assert_eq!(t.load(mmio::CONFIG + 7, AccessSize::Word), 0);
        assert_eq!(read(&mut t, mmio::CONFIG_GENERATION), 0);
    }

    #[test]
    fn test_interrupt_ack_lowers_line() {
        let mut t = transport();
        let controller = Arc::new(LevelInterruptController::new());
        t.mount_interrupt(controller.clone(), 5);
        negotiate(&mut t);
        write(
            &mut t,
            mmio::STATUS,
            (status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK) as u32,
        );
        t.core_mut().set_config_u8(0, 1);
        assert_eq!(
            read(&mut t, mmio::INTERRUPT_STATUS),
            interrupt::CONFIGURATION_CHANGE
        );
        assert_eq!(read(&mut t, mmio::CONFIG_GENERATION), 1);
        assert!(controller.is_pending(5));

        write(&mut t, mmio::INTERRUPT_ACK, interrupt::CONFIGURATION_CHANGE);
        assert_eq!(read(&mut t, mmio::INTERRUPT_STATUS), 0);
        assert!(!controller.is_pending(5));
    }

    #[test]
    fn test_status_zero_resets() {
        let mut t = transport();
        negotiate(&mut t);
        write(&mut t, mmio::QUEUE_SEL, 1);
        write(&mut t, mmio::DEVICE_FEATURES_SEL, 1);
        write(&mut t, mmio::STATUS, 0);
        assert_eq!(read(&mut t, mmio::STATUS), 0);
        assert_eq!(t.queue_sel(), 0);
        assert_eq!(t.core().negotiated_features(), 0);
        assert!(t.core().queue_state(0).is_none());
        assert_eq!(read(&mut t, mmio::DEVICE_FEATURES), 1 << 3 | 1 << 29);
    }
}
