//! Transport-independent virtio device state.
//!
//! [`DeviceCore`] holds everything the driver negotiates with a device:
//! the status byte, feature words, interrupt status, the config space and
//! the virtqueues. Device personalities receive a `&mut DeviceCore` in every
//! hook and use it to read chains, publish used buffers and raise config
//! change notifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::chain::DescriptorChain;
use super::config::ConfigSpace;
use super::queue::{SplitVirtqueue, Virtqueue};
use super::{feature, interrupt, status};
use crate::builder::DeviceSpec;
use crate::device::irq::Interrupt;
use crate::device::VirtioDevice;
use crate::error::{Error, ProtocolViolation, Result};
use crate::memory::AddressSpace;

/// Serializable state of one split virtqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub size: u16,
    pub ready: bool,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    pub last_avail_idx: u16,
    pub next_used_idx: u16,
    pub dispatch_notifications: bool,
}

/// Serializable driver-visible device state.
///
/// Guest memory is not part of the snapshot; restoring into a device that
/// sees different ring contents is the caller's problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub status: u8,
    pub interrupt_status: u32,
    pub device_features_sel: u32,
    pub driver_features: u64,
    pub driver_features_sel: u32,
    pub queue_sel: u32,
    pub config_generation: u32,
    pub config: Vec<u8>,
    pub queues: Vec<QueueSnapshot>,
}

/// Negotiated state shared by every virtio device.
pub struct DeviceCore {
    spec: DeviceSpec,
    memory: Arc<dyn AddressSpace>,
    config: ConfigSpace,
    interrupt: Interrupt,
    /// Allocated when FEATURES_OK is accepted, dropped on reset
    pub(crate) queues: Vec<SplitVirtqueue>,
    pub(crate) status: u8,
    pub(crate) interrupt_status: u32,
    pub(crate) device_features_sel: u32,
    pub(crate) driver_features: u64,
    pub(crate) driver_features_sel: u32,
    pub(crate) queue_sel: u32,
    config_generation: u32,
    /// Bumped whenever queues are (re)allocated or dropped. Chains carry the
    /// epoch they were created in.
    epoch: u64,
}

impl DeviceCore {
    pub fn new(spec: DeviceSpec, memory: Arc<dyn AddressSpace>) -> Self {
        let config = ConfigSpace::new(spec.config_space_size());
        Self {
            spec,
            memory,
            config,
            interrupt: Interrupt::new(),
            queues: Vec::new(),
            status: 0,
            interrupt_status: 0,
            device_features_sel: 0,
            driver_features: 0,
            driver_features_sel: 0,
            queue_sel: 0,
            config_generation: 0,
            epoch: 0,
        }
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn memory(&self) -> &dyn AddressSpace {
        self.memory.as_ref()
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Features both offered by the device and accepted by the driver.
    pub fn negotiated_features(&self) -> u64 {
        self.spec.features() & self.driver_features
    }

    pub fn has_feature(&self, bit: u64) -> bool {
        self.negotiated_features() & bit == bit
    }

    /// True once the device is in its error state or the driver gave up.
    pub fn has_failed(&self) -> bool {
        self.status & (status::FAILED | status::DEVICE_NEEDS_RESET) != 0
    }

    pub fn is_driver_ok(&self) -> bool {
        self.status & status::DRIVER_OK != 0
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status
    }

    pub fn config_generation(&self) -> u32 {
        self.config_generation
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn interrupt_mut(&mut self) -> &mut Interrupt {
        &mut self.interrupt
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    // Config space

    pub fn config(&self) -> &ConfigSpace {
        &self.config
    }

    /// Direct access to the config bytes. Does not notify the driver; call
    /// [`DeviceCore::notify_config_changed`] afterwards if the change must be
    /// observed.
    pub fn config_mut(&mut self) -> &mut ConfigSpace {
        &mut self.config
    }

    pub fn set_config_u8(&mut self, offset: u64, value: u8) {
        self.config.write_bytes(offset, &[value]);
        self.notify_config_changed();
    }

    pub fn set_config_u16(&mut self, offset: u64, value: u16) {
        self.config.write_bytes(offset, &value.to_le_bytes());
        self.notify_config_changed();
    }

    pub fn set_config_u32(&mut self, offset: u64, value: u32) {
        self.config.write_bytes(offset, &value.to_le_bytes());
        self.notify_config_changed();
    }

    pub fn set_config_u64(&mut self, offset: u64, value: u64) {
        self.config.write_bytes(offset, &value.to_le_bytes());
        self.notify_config_changed();
    }

    /// Tell the driver the config space changed.
    ///
    /// No-op until the driver has acknowledged the device.
    pub fn notify_config_changed(&mut self) {
        if self.status & status::ACKNOWLEDGE == 0 {
            return;
        }
        self.config_generation = self.config_generation.wrapping_add(1);
        self.interrupt_status |= interrupt::CONFIGURATION_CHANGE;
        self.update_interrupt();
    }

    // Error state

    /// Move the device into `DEVICE_NEEDS_RESET` and notify the driver.
    pub fn error(&mut self) {
        if self.status & status::DEVICE_NEEDS_RESET != 0 {
            return;
        }
        warn!(
            device_id = self.spec.device_id(),
            status = self.status,
            "virtio device needs reset"
        );
        self.status |= status::DEVICE_NEEDS_RESET;
        self.notify_config_changed();
    }

    /// Route an error through the device: protocol violations and memory
    /// faults put the device into its error state. The error is returned for
    /// propagation.
    pub fn fail(&mut self, err: Error) -> Error {
        if matches!(err, Error::Protocol(_) | Error::MemoryAccess { .. }) {
            warn!(device_id = self.spec.device_id(), error = %err, "virtio protocol error");
            self.error();
        }
        err
    }

    fn update_interrupt(&mut self) {
        let level = self.interrupt_status != 0 && self.is_driver_ok();
        self.interrupt.set(level);
    }

    pub(crate) fn ack_interrupt(&mut self, bits: u32) {
        self.interrupt_status &= !bits;
        self.update_interrupt();
    }

    // Queues

    /// Iterator over the chains available on queue `index`.
    ///
    /// Returns `None` if the queue does not exist or has not been allocated
    /// yet (queues appear once FEATURES_OK is accepted).
    pub fn queue(&mut self, index: usize) -> Option<Virtqueue<'_>> {
        if index >= self.queues.len() {
            return None;
        }
        Some(Virtqueue::new(self, index))
    }

    /// Read-only view of a queue's registers and indices.
    pub fn queue_state(&self, index: usize) -> Option<&SplitVirtqueue> {
        self.queues.get(index)
    }

    pub(crate) fn queue_has_next(&mut self, index: usize) -> Result<bool> {
        if self.has_failed() {
            return Ok(false);
        }
        let result = match self.queues.get(index) {
            Some(queue) => queue.has_available(self.memory.as_ref()),
            None => return Err(Error::QueueUnavailable(index)),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Take the next available chain off queue `index`.
    pub fn next_chain(&mut self, index: usize) -> Result<Option<DescriptorChain>> {
        if !self.queue_has_next(index)? {
            return Ok(None);
        }

        let epoch = self.epoch;
        let max_chain_length = self.spec.max_chain_length();
        let memory = self.memory.clone();
        let result = match self.queues.get_mut(index) {
            Some(queue) => queue.pop_available(memory.as_ref()).and_then(|head| {
                DescriptorChain::new(queue, memory.as_ref(), index, epoch, head, max_chain_length)
            }),
            None => Err(Error::QueueUnavailable(index)),
        };
        result.map(Some).map_err(|err| self.fail(err))
    }

    /// Borrow the queue and memory a chain walks, if the chain is still valid.
    pub(crate) fn chain_context(
        &self,
        index: usize,
        epoch: u64,
    ) -> Result<(&SplitVirtqueue, &dyn AddressSpace)> {
        if epoch != self.epoch {
            return Err(Error::ChainInvalidated);
        }
        if self.has_failed() {
            return Err(Error::DeviceNeedsReset);
        }
        let queue = self
            .queues
            .get(index)
            .ok_or(Error::QueueUnavailable(index))?;
        Ok((queue, self.memory.as_ref()))
    }

    /// Enable or disable forwarding of notifications for queue `index` to the
    /// device personality. Devices that poll a queue turn this off.
    pub fn set_queue_notifications(&mut self, index: usize, enabled: bool) {
        if let Some(queue) = self.queues.get_mut(index) {
            queue.dispatch_notifications = enabled;
        }
    }

    /// Hand back a device-readable chain with bytes left to read.
    ///
    /// `chain` is returned unchanged while it still has readable bytes. A
    /// drained chain is marked used and the next chain is taken from queue
    /// `index`; empty chains are retired along the way. A chain with
    /// writable buffers puts the device into its error state.
    pub fn validate_read_only_chain(
        &mut self,
        index: usize,
        chain: Option<DescriptorChain>,
    ) -> Result<Option<DescriptorChain>> {
        self.validate_chain(index, chain, false)
    }

    /// Hand back a device-writable chain with room left to write.
    ///
    /// The counterpart of [`DeviceCore::validate_read_only_chain`] for
    /// queues that must only carry writable buffers.
    pub fn validate_write_only_chain(
        &mut self,
        index: usize,
        chain: Option<DescriptorChain>,
    ) -> Result<Option<DescriptorChain>> {
        self.validate_chain(index, chain, true)
    }

    fn validate_chain(
        &mut self,
        index: usize,
        chain: Option<DescriptorChain>,
        write_only: bool,
    ) -> Result<Option<DescriptorChain>> {
        let remaining = |chain: &DescriptorChain| {
            if write_only {
                chain.writable_bytes()
            } else {
                chain.readable_bytes()
            }
        };

        if let Some(mut chain) = chain {
            if chain.is_valid(self) {
                if remaining(&chain) > 0 {
                    return Ok(Some(chain));
                }
                chain.mark_used(self)?;
            }
        }

        if index >= self.queues.len() {
            return Ok(None);
        }

        while let Some(mut chain) = self.next_chain(index)? {
            let wrong_direction = if write_only {
                chain.readable_bytes() > 0
            } else {
                chain.writable_bytes() > 0
            };
            if wrong_direction {
                return Err(self.fail(ProtocolViolation::WrongDirection.into()));
            }
            if remaining(&chain) > 0 {
                return Ok(Some(chain));
            }
            chain.mark_used(self)?;
        }
        Ok(None)
    }

    /// Append `head` to the used ring and interrupt the driver unless it
    /// suppressed notifications.
    pub(crate) fn publish_used(&mut self, index: usize, head: u16, len: u32) -> Result<()> {
        let event_idx = self.has_feature(feature::VIRTIO_F_RING_EVENT_IDX);
        let memory = self.memory.clone();
        let result = match self.queues.get_mut(index) {
            Some(queue) => queue.add_used(memory.as_ref(), head, len).and_then(|used_idx| {
                if event_idx {
                    Ok(queue.used_event(memory.as_ref())? == used_idx)
                } else {
                    Ok(queue.avail_flags(memory.as_ref())? == 0)
                }
            }),
            None => Err(Error::QueueUnavailable(index)),
        };

        match result {
            Ok(true) => {
                self.interrupt_status |= interrupt::USED_BUFFER;
                self.update_interrupt();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    // Status state machine

    /// Handle a driver write to the status register.
    pub fn write_status<D: VirtioDevice + ?Sized>(&mut self, device: &mut D, value: u8) {
        if value == 0 {
            self.reset(device);
            return;
        }

        // FAILED and DEVICE_NEEDS_RESET only clear on reset
        let sticky = status::FAILED | status::DEVICE_NEEDS_RESET;
        let old = self.status;
        self.status = (value & !status::DEVICE_NEEDS_RESET) | (old & sticky);
        let rising = !old & self.status;
        debug!(
            device_id = self.spec.device_id(),
            old, new = self.status, "virtio status write"
        );

        if rising & status::ACKNOWLEDGE != 0 {
            device.acknowledged(self);
        }
        if rising & status::DRIVER != 0 {
            device.driver_present(self);
        }
        if rising & status::FEATURES_OK != 0 {
            self.negotiate(device);
        }
        if rising & status::DRIVER_OK != 0 {
            info!(
                device_id = self.spec.device_id(),
                features = format_args!("{:#x}", self.negotiated_features()),
                "virtio device activated"
            );
            if let Err(err) = device.activate(self) {
                warn!(device_id = self.spec.device_id(), error = %err, "virtio device activation failed");
                self.error();
            }
        }
        if rising & status::FAILED != 0 {
            device.setup_failed(self);
        }

        self.update_interrupt();
    }

    fn negotiate<D: VirtioDevice + ?Sized>(&mut self, device: &mut D) {
        let features = self.negotiated_features();
        if !device.ack_features(features) {
            debug!(
                device_id = self.spec.device_id(),
                features = format_args!("{:#x}", features),
                "feature set rejected"
            );
            self.status &= !status::FEATURES_OK;
            return;
        }
        if features & feature::VIRTIO_F_RING_PACKED != 0 {
            self.status &= !status::FEATURES_OK;
            self.fail(ProtocolViolation::PackedRing.into());
            return;
        }

        let size = self.spec.max_queue_size();
        self.queues = (0..self.spec.queue_count())
            .map(|_| SplitVirtqueue::new(size))
            .collect();
        self.epoch += 1;
        device.features_negotiated(self);
    }

    /// Return to the power-on state.
    pub fn reset<D: VirtioDevice + ?Sized>(&mut self, device: &mut D) {
        debug!(device_id = self.spec.device_id(), "virtio device reset");
        self.status = 0;
        self.interrupt_status = 0;
        self.device_features_sel = 0;
        self.driver_features = 0;
        self.driver_features_sel = 0;
        self.queue_sel = 0;
        self.config_generation = 0;
        self.queues.clear();
        self.epoch += 1;
        self.interrupt.lower();
        self.config.clear();
        device.reset();
        device.initialize_config(self);
    }

    /// Handle a driver notification for queue `index`.
    pub fn notify_queue<D: VirtioDevice + ?Sized>(&mut self, device: &mut D, index: usize) {
        if !self.is_driver_ok() {
            self.fail(ProtocolViolation::NotifyBeforeDriverOk.into());
            return;
        }
        if self.has_failed() {
            return;
        }
        let dispatch = match self.queues.get(index) {
            Some(queue) => queue.ready && queue.dispatch_notifications,
            None => false,
        };
        if !dispatch {
            return;
        }

        match self.queue_has_next(index) {
            Ok(true) => {
                if let Err(err) = device.handle_queue_notification(self, index) {
                    debug!(queue = index, error = %err, "queue notification failed");
                    self.error();
                }
            }
            Ok(false) => {}
            Err(err) => debug!(queue = index, error = %err, "queue notification failed"),
        }
    }

    // Snapshots

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            status: self.status,
            interrupt_status: self.interrupt_status,
            device_features_sel: self.device_features_sel,
            driver_features: self.driver_features,
            driver_features_sel: self.driver_features_sel,
            queue_sel: self.queue_sel,
            config_generation: self.config_generation,
            config: self.config.as_bytes().to_vec(),
            queues: self.queues.iter().map(SplitVirtqueue::snapshot).collect(),
        }
    }

    /// Restore state captured by [`DeviceCore::snapshot`] on a device with the
    /// same spec. Outstanding chains are invalidated.
    pub fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<()> {
        if snapshot.config.len() != self.config.len() {
            return Err(Error::SnapshotMismatch(format!(
                "config space is {} bytes, snapshot has {}",
                self.config.len(),
                snapshot.config.len()
            )));
        }

        let expected_queues = if snapshot.status & status::FEATURES_OK != 0 {
            self.spec.queue_count()
        } else {
            0
        };
        if snapshot.queues.len() != expected_queues {
            return Err(Error::SnapshotMismatch(format!(
                "expected {} queues, snapshot has {}",
                expected_queues,
                snapshot.queues.len()
            )));
        }
        if let Some(queue) = snapshot.queues.iter().find(|queue| {
            !queue.size.is_power_of_two() || queue.size > self.spec.max_queue_size()
        }) {
            return Err(Error::SnapshotMismatch(format!(
                "invalid queue size {}",
                queue.size
            )));
        }

        self.config.restore(&snapshot.config);
        self.status = snapshot.status;
        self.interrupt_status = snapshot.interrupt_status;
        self.device_features_sel = snapshot.device_features_sel;
        self.driver_features = snapshot.driver_features;
        self.driver_features_sel = snapshot.driver_features_sel;
        self.queue_sel = snapshot.queue_sel;
        self.config_generation = snapshot.config_generation;
        self.queues = snapshot
            .queues
            .iter()
            .map(SplitVirtqueue::from_snapshot)
            .collect();
        self.epoch += 1;
        self.update_interrupt();
        Ok(())
    }
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("spec", &self.spec)
            .field("status", &self.status)
            .field("interrupt_status", &self.interrupt_status)
            .field("driver_features", &self.driver_features)
            .field("config_generation", &self.config_generation)
            .field("queues", &self.queues)
            .finish()
    }
}
