//! Virtual device emulation.
//!
//! This module provides the virtio device model: the [`VirtioDevice`] trait
//! implemented by device personalities, the [`MmioDevice`] register-bus
//! interface implemented by transports, and interrupt plumbing.

pub mod irq;
pub mod virtio;

pub use irq::{Interrupt, InterruptController, LevelInterruptController};

// Re-export commonly used virtio types
pub use virtio::{DeviceCore, VirtioBlk, VirtioConsole, VirtioInput, VirtioKeyboard, VirtioMmioTransport};

use crate::builder::DeviceSpec;
use crate::device::virtio::feature;
use crate::error::Result;
use crate::memory::AccessSize;

/// Trait for virtio device personalities.
///
/// A personality describes itself with a [`DeviceSpec`] and reacts to
/// lifecycle events driven by the transport. All shared state (status,
/// queues, config space, interrupt) lives in the [`DeviceCore`] passed to
/// each hook.
pub trait VirtioDevice: Send {
    /// Static description: device id, offered features, queue count.
    fn spec(&self) -> &DeviceSpec;

    /// Fill the config space. Called on creation and after every reset.
    fn initialize_config(&mut self, _core: &mut DeviceCore) {}

    /// Read from device-specific configuration space.
    fn read_config(&mut self, core: &mut DeviceCore, offset: u64, size: AccessSize) -> u64 {
        core.config().load(offset, size)
    }

    /// Write to device-specific configuration space.
    fn write_config(&mut self, core: &mut DeviceCore, offset: u64, value: u64, size: AccessSize) {
        core.config_mut().store(offset, value, size);
    }

    /// Validate the negotiated feature set. Returning false makes
    /// FEATURES_OK fail to stick.
    fn ack_features(&mut self, features: u64) -> bool {
        features & feature::VIRTIO_F_VERSION_1 != 0
    }

    /// ACKNOWLEDGE was set.
    fn acknowledged(&mut self, _core: &mut DeviceCore) {}

    /// DRIVER was set.
    fn driver_present(&mut self, _core: &mut DeviceCore) {}

    /// FEATURES_OK was accepted and the queues exist.
    fn features_negotiated(&mut self, _core: &mut DeviceCore) {}

    /// DRIVER_OK was set. An error puts the device into DEVICE_NEEDS_RESET.
    fn activate(&mut self, _core: &mut DeviceCore) -> Result<()> {
        Ok(())
    }

    /// The driver set FAILED.
    fn setup_failed(&mut self, _core: &mut DeviceCore) {}

    /// The driver notified `queue` and chains are available on it.
    fn handle_queue_notification(&mut self, _core: &mut DeviceCore, _queue: usize) -> Result<()> {
        Ok(())
    }

    /// Drop device-private state. The core has already been reset.
    fn reset(&mut self) {}

    /// The core was restored from a snapshot. Chains held from before are
    /// stale and state derived from the config space must be rebuilt.
    fn restored(&mut self, _core: &mut DeviceCore) {}
}

/// A device on the guest's MMIO bus.
///
/// Offsets are relative to the device's base address.
pub trait MmioDevice {
    /// Length of the register window in bytes.
    fn mmio_len(&self) -> u64;

    /// Handle a guest load.
    fn load(&mut self, offset: u64, size: AccessSize) -> u64;

    /// Handle a guest store.
    fn store(&mut self, offset: u64, value: u64, size: AccessSize);
}

/// Device type IDs (virtio spec).
pub mod device_type {
    pub const NET: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const CONSOLE: u32 = 3;
    pub const RNG: u32 = 4;
    pub const BALLOON: u32 = 5;
    pub const SCSI: u32 = 8;
    pub const P9: u32 = 9;
    pub const GPU: u32 = 16;
    pub const INPUT: u32 = 18;
    pub const VSOCK: u32 = 19;
    pub const CRYPTO: u32 = 20;
    pub const FS: u32 = 26;
}
