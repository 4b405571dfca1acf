//! # virtio-mmio-emu
//!
//! VirtIO device emulation over the MMIO transport, for embedding in a
//! machine emulator.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use virtio_mmio_emu::device::virtio::{mmio, VIRTIO_MAGIC};
//! use virtio_mmio_emu::{AccessSize, GuestMemory, MmioDevice, Result, VirtioConsole, VirtioMmioTransport};
//!
//! fn main() -> Result<()> {
//!     let memory = Arc::new(GuestMemory::new(0x8000_0000, 16 << 20));
//!     let mut console = VirtioMmioTransport::new(VirtioConsole::new()?, memory, 0x1000_1000);
//!
//!     // The guest probes the device through its register window
//!     assert_eq!(console.load(mmio::MAGIC_VALUE, AccessSize::Word), VIRTIO_MAGIC as u64);
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//!
//! - [`device::virtio::DeviceCore`]: status/feature negotiation, interrupts,
//!   config space and virtqueues shared by all devices
//! - [`device::virtio::VirtioMmioTransport`]: the virtio-mmio register file
//! - [`device::virtio::SplitVirtqueue`] and [`device::virtio::DescriptorChain`]:
//!   split ring processing over an untrusted guest address space
//! - Device personalities: console, block and input (keyboard)

pub mod builder;
pub mod debug;
mod error;

pub mod device;
pub mod memory;

// Re-exports
pub use builder::{DeviceSpec, DeviceSpecBuilder};
pub use device::irq::{Interrupt, InterruptController, LevelInterruptController};
pub use device::virtio::{
    BlockBackend, DescriptorChain, DeviceCore, DeviceSnapshot, FileBackend, MemoryBackend,
    QueueSnapshot, VirtioBlk, VirtioConsole, VirtioInput, VirtioKeyboard, VirtioMmioTransport,
};
pub use device::{MmioDevice, VirtioDevice};
pub use error::{Error, ProtocolViolation, Result};
pub use memory::{AccessSize, AddressSpace, GuestMemory};
