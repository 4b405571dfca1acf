//! Virtio console device.
//!
//! A single-port console without multiport support. The host side polls:
//! bytes the guest transmits are pulled one at a time with
//! [`VirtioConsole::read_byte`], and input for the guest is pushed with
//! [`VirtioConsole::put_byte`] and handed over with [`VirtioConsole::flush`].

use tracing::debug;

use crate::builder::DeviceSpec;
use crate::device::virtio::{DescriptorChain, DeviceCore};
use crate::device::{device_type, VirtioDevice};
use crate::error::Result;
use crate::memory::AccessSize;

/// Console feature bits.
pub mod console_features {
    /// Configuration cols and rows are valid.
    pub const VIRTIO_CONSOLE_F_SIZE: u64 = 1 << 0;
}

/// receiveq (port 0): device-writable buffers carrying guest input.
pub const RECEIVE_QUEUE: usize = 0;
/// transmitq (port 0): device-readable buffers carrying guest output.
pub const TRANSMIT_QUEUE: usize = 1;

const CONFIG_COLS: u64 = 0;
const CONFIG_ROWS: u64 = 2;
const CONFIG_SIZE: usize = 4;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 25;

/// Virtio console device.
pub struct VirtioConsole {
    spec: DeviceSpec,
    cols: u16,
    rows: u16,
    /// Partially filled receive buffer
    receive: Option<DescriptorChain>,
    /// Partially drained transmit buffer
    transmit: Option<DescriptorChain>,
}

impl VirtioConsole {
    /// Create a new virtio-console device.
    pub fn new() -> Result<Self> {
        let spec = DeviceSpec::builder(device_type::CONSOLE)
            .features(console_features::VIRTIO_CONSOLE_F_SIZE)
            .queue_count(2)
            .config_space_size(CONFIG_SIZE)
            .build()?;
        Ok(Self {
            spec,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            receive: None,
            transmit: None,
        })
    }

    /// Update the terminal size reported to the guest.
    pub fn resize(&mut self, core: &mut DeviceCore, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        core.config_mut().store(CONFIG_COLS, cols as u64, AccessSize::Half);
        core.set_config_u16(CONFIG_ROWS, rows);
    }

    /// Next byte written by the guest, if any.
    pub fn read_byte(&mut self, core: &mut DeviceCore) -> Option<u8> {
        if core.has_failed() {
            return None;
        }
        self.transmit = core
            .validate_read_only_chain(TRANSMIT_QUEUE, self.transmit.take())
            .ok()?;
        let chain = self.transmit.as_mut()?;
        chain.read_byte(core).ok()
    }

    /// Whether the guest has buffer space for input.
    pub fn can_put_byte(&mut self, core: &mut DeviceCore) -> bool {
        if core.has_failed() {
            return false;
        }
        match core.validate_write_only_chain(RECEIVE_QUEUE, self.receive.take()) {
            Ok(chain) => {
                self.receive = chain;
                self.receive.is_some()
            }
            Err(_) => false,
        }
    }

    /// Queue one byte of input for the guest.
    ///
    /// Returns false if the byte was dropped because the guest has no buffer
    /// space or the device has failed.
    pub fn put_byte(&mut self, core: &mut DeviceCore, value: u8) -> bool {
        if !self.can_put_byte(core) {
            return false;
        }
        let Some(chain) = self.receive.as_mut() else {
            return false;
        };
        match chain.write_byte(core, value) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "dropping console input");
                false
            }
        }
    }

    /// Hand buffered input to the guest. Returns whether a buffer was
    /// returned through the used ring.
    pub fn flush(&mut self, core: &mut DeviceCore) -> bool {
        if !self.can_put_byte(core) {
            return false;
        }
        let Some(mut chain) = self.receive.take() else {
            return false;
        };
        match chain.mark_used(core) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "console flush failed");
                false
            }
        }
    }
}

impl VirtioDevice for VirtioConsole {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn initialize_config(&mut self, core: &mut DeviceCore) {
        let config = core.config_mut();
        config.store(CONFIG_COLS, self.cols as u64, AccessSize::Half);
        config.store(CONFIG_ROWS, self.rows as u64, AccessSize::Half);
    }

    fn write_config(&mut self, _core: &mut DeviceCore, _offset: u64, _value: u64, _size: AccessSize) {
        // Console config is read-only
    }

    fn features_negotiated(&mut self, core: &mut DeviceCore) {
        // Both queues are polled by the host
        core.set_queue_notifications(RECEIVE_QUEUE, false);
        core.set_queue_notifications(TRANSMIT_QUEUE, false);
    }

    fn reset(&mut self) {
        self.receive = None;
        self.transmit = None;
    }
}
