//! Device spec builder for configuring virtio device personalities.

use crate::device::virtio::feature;
use crate::error::{Error, Result};

/// Largest config space a device may declare.
pub const MAX_CONFIG_SPACE_SIZE: usize = 256;

/// Largest number of virtqueues a device may declare.
pub const MAX_QUEUE_COUNT: usize = 16;

/// Largest queue size the split ring layout allows.
pub const VIRTQ_MAX_RING_SIZE: u32 = 1 << 15;

/// Default cap on driver-chosen queue sizes.
pub const DEFAULT_MAX_QUEUE_SIZE: u16 = 16;

/// Default cap on descriptor chain length. Drivers are untrusted, so this
/// bounds the work done for a cyclic chain.
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 128;

/// Generic/experimental vendor ID.
pub const VIRTIO_VENDOR_ID_GENERIC: u32 = 0xFFFF;

/// Static description of a virtio device personality.
///
/// Create instances with [`DeviceSpec::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub(crate) device_id: u32,
    pub(crate) vendor_id: u32,
    pub(crate) features: u64,
    pub(crate) config_space_size: usize,
    pub(crate) queue_count: usize,
    pub(crate) max_queue_size: u16,
    pub(crate) max_chain_length: usize,
}

impl DeviceSpec {
    /// Start building a spec for the given device type ID.
    pub fn builder(device_id: u32) -> DeviceSpecBuilder {
        DeviceSpecBuilder::new(device_id)
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    /// Offered feature bits. Always contains `VIRTIO_F_VERSION_1`.
    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn config_space_size(&self) -> usize {
        self.config_space_size
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count
    }

    /// Upper bound on queue sizes accepted from the driver (`QueueNumMax`).
    pub fn max_queue_size(&self) -> u16 {
        self.max_queue_size
    }

    pub fn max_chain_length(&self) -> usize {
        self.max_chain_length
    }
}

/// Builder for [`DeviceSpec`].
///
/// # Example
///
/// ```rust
/// use virtio_mmio_emu::DeviceSpec;
///
/// let spec = DeviceSpec::builder(3)
///     .features(1 << 0)
///     .queue_count(2)
///     .config_space_size(4)
///     .build()?;
/// assert_eq!(spec.queue_count(), 2);
/// # Ok::<(), virtio_mmio_emu::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct DeviceSpecBuilder {
    device_id: u32,
    vendor_id: Option<u32>,
    features: u64,
    config_space_size: usize,
    queue_count: usize,
    max_queue_size: Option<u16>,
    max_chain_length: Option<usize>,
}

impl DeviceSpecBuilder {
    fn new(device_id: u32) -> Self {
        Self {
            device_id,
            vendor_id: None,
            features: 0,
            config_space_size: 0,
            queue_count: 0,
            max_queue_size: None,
            max_chain_length: None,
        }
    }

    /// Set the vendor ID.
    ///
    /// Default: 0xFFFF (generic)
    pub fn vendor_id(mut self, vendor_id: u32) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    /// Set the device-specific feature bits offered to the driver.
    pub fn features(mut self, features: u64) -> Self {
        self.features = features;
        self
    }

    /// Set the size of the device config space in bytes.
    ///
    /// Default: 0
    pub fn config_space_size(mut self, size: usize) -> Self {
        self.config_space_size = size;
        self
    }

    /// Set the number of virtqueues.
    ///
    /// Default: 0
    pub fn queue_count(mut self, count: usize) -> Self {
        self.queue_count = count;
        self
    }

    /// Set the largest queue size the driver may configure.
    ///
    /// Default: 16
    pub fn max_queue_size(mut self, size: u16) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Set the longest descriptor chain the device will follow.
    ///
    /// Default: 128
    pub fn max_chain_length(mut self, length: usize) -> Self {
        self.max_chain_length = Some(length);
        self
    }

    /// Validate the configuration and build the spec.
    pub fn build(self) -> Result<DeviceSpec> {
        if self.config_space_size > MAX_CONFIG_SPACE_SIZE {
            return Err(Error::InvalidConfigSpaceSize(self.config_space_size));
        }

        if self.queue_count > MAX_QUEUE_COUNT {
            return Err(Error::InvalidQueueCount(self.queue_count));
        }

        let max_queue_size = self.max_queue_size.unwrap_or(DEFAULT_MAX_QUEUE_SIZE);
        if !max_queue_size.is_power_of_two() || max_queue_size as u32 > VIRTQ_MAX_RING_SIZE {
            return Err(Error::InvalidQueueSize(max_queue_size as u32));
        }

        let max_chain_length = self.max_chain_length.unwrap_or(DEFAULT_MAX_CHAIN_LENGTH);
        if max_chain_length == 0 {
            return Err(Error::InvalidChainLength(max_chain_length));
        }

        Ok(DeviceSpec {
            device_id: self.device_id,
            vendor_id: self.vendor_id.unwrap_or(VIRTIO_VENDOR_ID_GENERIC),
            features: self.features | feature::VIRTIO_F_VERSION_1,
            config_space_size: self.config_space_size,
            queue_count: self.queue_count,
            max_queue_size,
            max_chain_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = DeviceSpec::builder(2).build().unwrap();
        assert_eq!(spec.device_id(), 2);
        assert_eq!(spec.vendor_id(), VIRTIO_VENDOR_ID_GENERIC);
        assert_eq!(spec.features(), feature::VIRTIO_F_VERSION_1);
        assert_eq!(spec.config_space_size(), 0);
        assert_eq!(spec.queue_count(), 0);
        assert_eq!(spec.max_queue_size(), DEFAULT_MAX_QUEUE_SIZE);
        assert_eq!(spec.max_chain_length(), DEFAULT_MAX_CHAIN_LENGTH);
    }

    #[test]
    fn test_version_1_always_offered() {
        let spec = DeviceSpec::builder(3).features(1 << 0).build().unwrap();
        assert_eq!(spec.features(), (1 << 0) | feature::VIRTIO_F_VERSION_1);
    }

    #[test]
    fn test_limits_rejected() {
        assert!(matches!(
            DeviceSpec::builder(1).config_space_size(257).build(),
            Err(Error::InvalidConfigSpaceSize(257))
        ));
        assert!(matches!(
            DeviceSpec::builder(1).queue_count(17).build(),
            Err(Error::InvalidQueueCount(17))
        ));
        assert!(matches!(
            DeviceSpec::builder(1).max_queue_size(12).build(),
            Err(Error::InvalidQueueSize(12))
        ));
        assert!(matches!(
            DeviceSpec::builder(1).max_chain_length(0).build(),
            Err(Error::InvalidChainLength(0))
        ));
        assert!(DeviceSpec::builder(1)
            .config_space_size(256)
            .queue_count(16)
            .max_queue_size(1 << 15)
            .build()
            .is_ok());
    }
}
