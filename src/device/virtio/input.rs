//! Virtio input device.
//!
//! Implements virtio-input (virtio spec 5.8). Events are pushed by the host
//! into driver-provided eventq buffers; the driver reports device state
//! changes (LEDs and the like) on the statusq.
//!
//! What the device claims to be is decided by an [`InputConfig`] provider,
//! which fills the config union on demand for each `select`/`subsel` pair
//! the driver asks about. [`VirtioKeyboard`] is the stock keyboard.

use tracing::debug;

use crate::builder::DeviceSpec;
use crate::device::virtio::{DescriptorChain, DeviceCore};
use crate::device::{device_type, VirtioDevice};
use crate::error::{ProtocolViolation, Result};
use crate::memory::AccessSize;

/// Values of the config `select` field.
pub mod config_select {
    pub const UNSET: u8 = 0x00;
    pub const ID_NAME: u8 = 0x01;
    pub const ID_SERIAL: u8 = 0x02;
    pub const ID_DEVIDS: u8 = 0x03;
    pub const PROP_BITS: u8 = 0x10;
    pub const EV_BITS: u8 = 0x11;
    pub const ABS_INFO: u8 = 0x12;
}

/// Linux evdev event types used by the stock devices.
pub mod ev {
    pub const EV_SYN: u16 = 0x00;
    pub const EV_KEY: u16 = 0x01;
    pub const EV_LED: u16 = 0x11;
    pub const EV_REP: u16 = 0x14;
}

/// eventq: device-writable buffers for input events.
pub const EVENT_QUEUE: usize = 0;
/// statusq: device-readable buffers with status updates from the driver.
pub const STATUS_QUEUE: usize = 1;

// struct virtio_input_config { u8 select; u8 subsel; u8 size; u8 reserved[5]; union u[128]; }
const CONFIG_SELECT: u64 = 0;
const CONFIG_SUBSEL: u64 = 1;
const CONFIG_SIZE_FIELD: u64 = 2;
const CONFIG_UNION: u64 = 8;
const CONFIG_UNION_SIZE: usize = 128;
const CONFIG_SPACE_SIZE: usize = 256;

/// struct virtio_input_event { le16 type; le16 code; le32 value; }
const EVENT_SIZE: usize = 8;

/// Describes an input device to the driver.
pub trait InputConfig: Send {
    /// Append the config union for `select`/`subsel` to `out`. Leaving it
    /// empty means the query is not supported. Output past 128 bytes is
    /// dropped.
    fn generate(&self, select: u8, subsel: u8, out: &mut Vec<u8>);

    /// An event the driver sent on the statusq.
    fn handle_status(&mut self, _event_type: u16, _code: u16, _value: u32) {}
}

/// Virtio input device driven by an [`InputConfig`] provider.
pub struct VirtioInput<C: InputConfig> {
    spec: DeviceSpec,
    provider: C,
    /// Cached config union for the current select/subsel
    union: Vec<u8>,
    dirty: bool,
    /// Partially consumed eventq buffer
    event: Option<DescriptorChain>,
}

impl<C: InputConfig> VirtioInput<C> {
    pub fn new(provider: C) -> Result<Self> {
        let spec = DeviceSpec::builder(device_type::INPUT)
            .queue_count(2)
            .config_space_size(CONFIG_SPACE_SIZE)
            .build()?;
        Ok(Self {
            spec,
            provider,
            union: Vec::with_capacity(CONFIG_UNION_SIZE),
            dirty: true,
            event: None,
        })
    }

    pub fn provider(&self) -> &C {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut C {
        &mut self.provider
    }

    /// Deliver one event to the driver.
    ///
    /// Returns false if the event was dropped because the driver has no
    /// eventq buffer available or the device has failed.
    pub fn put_event(&mut self, core: &mut DeviceCore, event_type: u16, code: u16, value: u32) -> bool {
        if core.has_failed() {
            return false;
        }
        match self.try_put_event(core, event_type, code, value) {
            Ok(delivered) => delivered,
            Err(err) => {
                debug!(error = %err, "dropping input event");
                false
            }
        }
    }

    fn try_put_event(&mut self, core: &mut DeviceCore, event_type: u16, code: u16, value: u32) -> Result<bool> {
        self.event = core.validate_write_only_chain(EVENT_QUEUE, self.event.take())?;
        let Some(mut chain) = self.event.take() else {
            return Ok(false);
        };
        if chain.writable_bytes() < EVENT_SIZE {
            return Err(core.fail(ProtocolViolation::MalformedRequest.into()));
        }

        let mut event = [0u8; EVENT_SIZE];
        event[0..2].copy_from_slice(&event_type.to_le_bytes());
        event[2..4].copy_from_slice(&code.to_le_bytes());
        event[4..8].copy_from_slice(&value.to_le_bytes());
        chain.write(core, &event)?;
        chain.mark_used(core)?;
        Ok(true)
    }

    /// Deliver an `EV_SYN` report separator.
    pub fn put_syn(&mut self, core: &mut DeviceCore) -> bool {
        self.put_event(core, ev::EV_SYN, 0, 0)
    }

    fn refresh_union(&mut self, core: &DeviceCore) {
        if !self.dirty {
            return;
        }
        let select = core.config().load(CONFIG_SELECT, AccessSize::Byte) as u8;
        let subsel = core.config().load(CONFIG_SUBSEL, AccessSize::Byte) as u8;
        self.union.clear();
        if select != config_select::UNSET {
            self.provider.generate(select, subsel, &mut self.union);
            self.union.truncate(CONFIG_UNION_SIZE);
        }
        self.dirty = false;
    }

    fn config_byte(&self, core: &DeviceCore, offset: u64) -> u8 {
        match offset {
            CONFIG_SELECT | CONFIG_SUBSEL => core.config().load(offset, AccessSize::Byte) as u8,
            CONFIG_SIZE_FIELD => self.union.len() as u8,
            _ if offset >= CONFIG_UNION => self
                .union
                .get((offset - CONFIG_UNION) as usize)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }
}

impl<C: InputConfig> VirtioDevice for VirtioInput<C> {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn read_config(&mut self, core: &mut DeviceCore, offset: u64, size: AccessSize) -> u64 {
        self.refresh_union(core);
        (0..size.bytes() as u64).fold(0, |value, i| {
            let byte = offset
                .checked_add(i)
                .map(|offset| self.config_byte(core, offset))
                .unwrap_or(0);
            value | (byte as u64) << (i * 8)
        })
    }

    fn write_config(&mut self, core: &mut DeviceCore, offset: u64, value: u64, size: AccessSize) {
        // Only select and subsel are writable by the driver
        if offset.saturating_add(size.bytes() as u64) > CONFIG_SUBSEL + 1 {
            return;
        }
        core.config_mut().store(offset, value, size);
        self.dirty = true;
    }

    fn features_negotiated(&mut self, core: &mut DeviceCore) {
        // Events are pushed by the host
        core.set_queue_notifications(EVENT_QUEUE, false);
    }

    fn handle_queue_notification(&mut self, core: &mut DeviceCore, queue: usize) -> Result<()> {
        if queue != STATUS_QUEUE {
            return Ok(());
        }
        while let Some(mut chain) = core.next_chain(STATUS_QUEUE)? {
            while chain.readable_bytes() >= EVENT_SIZE {
                let mut event = [0u8; EVENT_SIZE];
                chain.read(core, &mut event)?;
                let event_type = u16::from_le_bytes([event[0], event[1]]);
                let code = u16::from_le_bytes([event[2], event[3]]);
                let value = u32::from_le_bytes([event[4], event[5], event[6], event[7]]);
                self.provider.handle_status(event_type, code, value);
            }
            chain.mark_used(core)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.event = None;
        self.union.clear();
        self.dirty = true;
    }

    fn restored(&mut self, _core: &mut DeviceCore) {
        // select/subsel may have changed under the cache
        self.event = None;
        self.dirty = true;
    }
}

/// BUS_VIRTUAL from linux/input.h.
const BUS_VIRTUAL: u16 = 0x06;

/// Highest key code advertised by [`KeyboardConfig`].
pub const KEYBOARD_MAX_KEY: u16 = 0xFF;

/// Keyboard LED numbers (EV_LED codes).
pub mod led {
    pub const NUM_LOCK: u16 = 0x00;
    pub const CAPS_LOCK: u16 = 0x01;
    pub const SCROLL_LOCK: u16 = 0x02;
}

/// Config provider for a plain keyboard.
#[derive(Debug, Clone)]
pub struct KeyboardConfig {
    serial: String,
    /// LED state reported by the driver, one bit per LED code
    leds: u8,
}

impl KeyboardConfig {
    pub const NAME: &'static str = "virtio_keyboard";

    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            leds: 0,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// LED state as last reported by the driver.
    pub fn leds(&self) -> u8 {
        self.leds
    }
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self::new("0")
    }
}

fn bitmap(out: &mut Vec<u8>, bits: impl IntoIterator<Item = u16>) {
    for bit in bits {
        let index = (bit / 8) as usize;
        if out.len() <= index {
            out.resize(index + 1, 0);
        }
        out[index] |= 1 << (bit % 8);
    }
}

impl InputConfig for KeyboardConfig {
    fn generate(&self, select: u8, subsel: u8, out: &mut Vec<u8>) {
        match select {
            config_select::ID_NAME => out.extend_from_slice(Self::NAME.as_bytes()),
            config_select::ID_SERIAL => out.extend_from_slice(self.serial.as_bytes()),
            config_select::ID_DEVIDS => {
                // struct virtio_input_devids { le16 bustype; le16 vendor; le16 product; le16 version; }
                for field in [BUS_VIRTUAL, 0, 0, 1] {
                    out.extend_from_slice(&field.to_le_bytes());
                }
            }
            config_select::EV_BITS => match subsel as u16 {
                ev::EV_KEY => bitmap(out, 1..=KEYBOARD_MAX_KEY),
                ev::EV_REP => bitmap(out, [0, 1]),
                ev::EV_LED => bitmap(out, [led::NUM_LOCK, led::CAPS_LOCK, led::SCROLL_LOCK]),
                _ => {}
            },
            _ => {}
        }
    }

    fn handle_status(&mut self, event_type: u16, code: u16, value: u32) {
        if event_type != ev::EV_LED || code > led::SCROLL_LOCK {
            return;
        }
        if value != 0 {
            self.leds |= 1 << code;
        } else {
            self.leds &= !(1 << code);
        }
    }
}

/// Virtio keyboard.
pub type VirtioKeyboard = VirtioInput<KeyboardConfig>;

impl VirtioInput<KeyboardConfig> {
    pub fn keyboard() -> Result<Self> {
        Self::new(KeyboardConfig::default())
    }

    /// Report a key press or release followed by `EV_SYN`.
    ///
    /// Returns false if either event was dropped.
    pub fn key(&mut self, core: &mut DeviceCore, code: u16, pressed: bool) -> bool {
        self.put_event(core, ev::EV_KEY, code, pressed as u32) && self.put_syn(core)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::virtio::queue::desc_flags;
    use crate::device::virtio::{feature, mmio, status, VirtioMmioTransport};
    use crate::device::MmioDevice;
    use crate::memory::{self, AddressSpace, GuestMemory};

    const EVENTQ: (u64, u64, u64) = (0x1000, 0x1100, 0x1200);
    const STATUSQ: (u64, u64, u64) = (0x2000, 0x2100, 0x2200);

    type Transport = VirtioMmioTransport<VirtioKeyboard>;

    fn write(t: &mut Transport, offset: u64, value: u32) {
        t.store(offset, value as u64, AccessSize::Word);
    }

    fn setup() -> (Transport, Arc<GuestMemory>) {
        let mem = Arc::new(GuestMemory::new(0, 0x10000));
        let mut t = VirtioMmioTransport::new(VirtioKeyboard::keyboard().unwrap(), mem.clone(), 0);
        write(&mut t, mmio::STATUS, (status::ACKNOWLEDGE | status::DRIVER) as u32);
        write(&mut t, mmio::DRIVER_FEATURES_SEL, 1);
        write(&mut t, mmio::DRIVER_FEATURES, (feature::VIRTIO_F_VERSION_1 >> 32) as u32);
        write(
            &mut t,
            mmio::STATUS,
            (status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK) as u32,
        );
        for (index, (desc, avail, used)) in [(0, EVENTQ), (1, STATUSQ)] {
            write(&mut t, mmio::QUEUE_SEL, index);
            write(&mut t, mmio::QUEUE_NUM, 8);
            write(&mut t, mmio::QUEUE_DESC_LOW, desc as u32);
            write(&mut t, mmio::QUEUE_DRIVER_LOW, avail as u32);
            write(&mut t, mmio::QUEUE_DEVICE_LOW, used as u32);
            write(&mut t, mmio::QUEUE_READY, 1);
        }
        write(
            &mut t,
            mmio::STATUS,
            (status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK) as u32,
        );
        (t, mem)
    }

    fn offer(mem: &GuestMemory, queue: (u64, u64, u64), slot: u16, addr: u64, len: u32, flags: u16) {
        let desc = queue.0 + slot as u64 * 16;
        memory::write_u64_le(mem, desc, addr).unwrap();
        memory::write_u32_le(mem, desc + 8, len).unwrap();
        memory::write_u16_le(mem, desc + 12, flags).unwrap();
        memory::write_u16_le(mem, queue.1 + 4 + slot as u64 * 2, slot).unwrap();
        memory::write_u16_le(mem, queue.1 + 2, slot + 1).unwrap();
    }

    fn select(t: &mut Transport, select: u8, subsel: u8) {
        t.store(mmio::CONFIG + CONFIG_SELECT, select as u64, AccessSize::Byte);
        t.store(mmio::CONFIG + CONFIG_SUBSEL, subsel as u64, AccessSize::Byte);
    }

    fn config_bytes(t: &mut Transport) -> Vec<u8> {
        let size = t.load(mmio::CONFIG + CONFIG_SIZE_FIELD, AccessSize::Byte) as u64;
        (0..size)
            .map(|i| t.load(mmio::CONFIG + CONFIG_UNION + i, AccessSize::Byte) as u8)
            .collect()
    }

    #[test]
    fn test_config_queries() {
        let (mut t, _mem) = setup();
        assert_eq!(t.load(mmio::CONFIG + CONFIG_SIZE_FIELD, AccessSize::Byte), 0);

        select(&mut t, config_select::ID_NAME, 0);
        assert_eq!(config_bytes(&mut t), b"virtio_keyboard");

        select(&mut t, config_select::ID_DEVIDS, 0);
        assert_eq!(config_bytes(&mut t), [6, 0, 0, 0, 0, 0, 1, 0]);

        select(&mut t, config_select::EV_BITS, ev::EV_KEY as u8);
        let keys = config_bytes(&mut t);
        assert_eq!(keys.len(), 32);
        assert_eq!(keys[0], 0xFE);
        assert_eq!(keys[31], 0xFF);

        select(&mut t, config_select::EV_BITS, ev::EV_REP as u8);
        assert_eq!(config_bytes(&mut t), [0x03]);

        select(&mut t, config_select::ABS_INFO, 0);
        assert!(config_bytes(&mut t).is_empty());

        // Only select/subsel are writable
        t.store(mmio::CONFIG + CONFIG_SIZE_FIELD, 9, AccessSize::Byte);
        t.store(mmio::CONFIG + CONFIG_UNION, 9, AccessSize::Byte);
        assert_eq!(t.load(mmio::CONFIG + CONFIG_SIZE_FIELD, AccessSize::Byte), 0);
        assert_eq!(t.core().config_generation(), 0);
    }

    #[test]
    fn test_restore_refreshes_config_union() {
        let (mut t, _mem) = setup();
        select(&mut t, config_select::ID_DEVIDS, 0);
        let snapshot = t.core().snapshot();

        select(&mut t, config_select::ID_NAME, 0);
        assert_eq!(config_bytes(&mut t), b"virtio_keyboard");

        t.restore(&snapshot).unwrap();
        assert_eq!(
            t.load(mmio::CONFIG + CONFIG_SELECT, AccessSize::Byte),
            config_select::ID_DEVIDS as u64
        );
        assert_eq!(config_bytes(&mut t), [6, 0, 0, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn test_key_event() {
        let (mut t, mem) = setup();
        offer(&mem, EVENTQ, 0, 0x4000, 8, desc_flags::WRITE);
        offer(&mem, EVENTQ, 1, 0x4008, 8, desc_flags::WRITE);

        let (keyboard, core) = t.split_mut();
        assert!(keyboard.key(core, 30, true));

        let mut event = [0u8; 16];
        mem.read_bytes(0x4000, &mut event).unwrap();
        assert_eq!(event[..8], [1, 0, 30, 0, 1, 0, 0, 0]);
        assert_eq!(event[8..], [0; 8]);
        assert_eq!(memory::read_u16_le(mem.as_ref(), EVENTQ.2 + 2).unwrap(), 2);
        assert_eq!(memory::read_u32_le(mem.as_ref(), EVENTQ.2 + 8).unwrap(), 8);

        // No buffers left
        assert!(!keyboard.key(core, 30, false));
        assert!(!core.has_failed());
    }

    #[test]
    fn test_short_event_buffer_fails_device() {
        let (mut t, mem) = setup();
        offer(&mem, EVENTQ, 0, 0x4000, 4, desc_flags::WRITE);
        let (keyboard, core) = t.split_mut();
        assert!(!keyboard.put_event(core, ev::EV_KEY, 1, 1));
        assert!(core.has_failed());
    }

    #[test]
    fn test_status_queue_updates_leds() {
        let (mut t, mem) = setup();
        let mut status_event = [0u8; 8];
        status_event[0..2].copy_from_slice(&ev::EV_LED.to_le_bytes());
        status_event[2..4].copy_from_slice(&led::CAPS_LOCK.to_le_bytes());
        status_event[4..8].copy_from_slice(&1u32.to_le_bytes());
        mem.write_bytes(0x5000, &status_event).unwrap();
        offer(&mem, STATUSQ, 0, 0x5000, 8, 0);

        write(&mut t, mmio::QUEUE_NOTIFY, STATUS_QUEUE as u32);
        assert_eq!(t.device().provider().leds(), 1 << led::CAPS_LOCK);
        assert_eq!(memory::read_u16_le(mem.as_ref(), STATUSQ.2 + 2).unwrap(), 1);
    }
}
