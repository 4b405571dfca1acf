//! Error types for virtio device emulation.

use thiserror::Error;

use crate::memory::AccessSize;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Ways a guest driver can break the virtio protocol.
///
/// Every one of these moves the device into `DEVICE_NEEDS_RESET`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("descriptor chain exceeds {max} descriptors")]
    ChainTooLong { max: usize },

    #[error("device-readable descriptor follows a device-writable one")]
    ReadAfterWrite,

    #[error("descriptor index {index} out of range for queue of size {queue_size}")]
    DescriptorOutOfRange { index: u16, queue_size: u16 },

    #[error("descriptor chain ended before its announced length")]
    ChainTruncated,

    #[error("descriptor chain has the wrong direction for this queue")]
    WrongDirection,

    #[error("queue notification before DRIVER_OK")]
    NotifyBeforeDriverOk,

    #[error("packed virtqueues are not supported")]
    PackedRing,

    #[error("indirect descriptors are not supported")]
    IndirectDescriptor,

    #[error("malformed device request")]
    MalformedRequest,
}

/// Errors that can occur while emulating a virtio device.
#[derive(Error, Debug)]
pub enum Error {
    // Guest memory errors
    #[error("memory access fault at 0x{address:x} ({size:?})")]
    MemoryAccess { address: u64, size: AccessSize },

    // Protocol errors
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("device needs reset")]
    DeviceNeedsReset,

    // Descriptor chain misuse
    #[error("descriptor chain already marked used")]
    ChainUsed,

    #[error("descriptor chain outlived a device reset")]
    ChainInvalidated,

    #[error("cannot write while readable bytes remain in the chain")]
    ReadableBytesRemaining,

    #[error("chain overrun: requested {requested} bytes, {available} available")]
    ChainOverrun { requested: usize, available: usize },

    // Configuration errors
    #[error("invalid config space size: {0} (must be <= 256)")]
    InvalidConfigSpaceSize(usize),

    #[error("invalid queue count: {0} (must be <= 16)")]
    InvalidQueueCount(usize),

    #[error("invalid queue size limit: {0} (must be a power of two <= 32768)")]
    InvalidQueueSize(u32),

    #[error("invalid chain length limit: {0} (must be > 0)")]
    InvalidChainLength(usize),

    #[error("snapshot does not match device: {0}")]
    SnapshotMismatch(String),

    #[error("queue {0} is not available")]
    QueueUnavailable(usize),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the device has entered (or already was in)
    /// its error state.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::MemoryAccess { .. } | Error::DeviceNeedsReset
        )
    }
}
