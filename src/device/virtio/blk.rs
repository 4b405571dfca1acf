//! Virtio block device.
//!
//! Implements virtio-blk for guest disk access per the virtio spec 5.2.
//! Requests are not processed on notification; the host drives the device
//! with [`VirtioBlk::step`], which handles requests up to a byte budget.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::builder::DeviceSpec;
use crate::device::virtio::{DescriptorChain, DeviceCore};
use crate::device::{device_type, VirtioDevice};
use crate::error::{Error, ProtocolViolation, Result};
use crate::memory::AccessSize;

/// Virtio block device feature flags.
pub mod blk_features {
    /// Maximum size of any single segment is in size_max.
    pub const SIZE_MAX: u64 = 1 << 1;
    /// Maximum number of segments in a request is in seg_max.
    pub const SEG_MAX: u64 = 1 << 2;
    /// Device is read-only.
    pub const RO: u64 = 1 << 5;
    /// Block size of disk is in blk_size.
    pub const BLK_SIZE: u64 = 1 << 6;
    /// Device supports flush command.
    pub const FLUSH: u64 = 1 << 9;
}

/// Block request types.
mod request_type {
    pub const IN: u32 = 0; // Read
    pub const OUT: u32 = 1; // Write
    pub const FLUSH: u32 = 4; // Flush
    pub const GET_ID: u32 = 8; // Get device ID
}

/// Block request status.
pub mod request_status {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
}

/// Block request header (from guest).
#[derive(Debug, Clone, Copy)]
struct BlockRequestHeader {
    /// Request type (IN, OUT, FLUSH, etc.)
    request_type: u32,
    /// Sector number for read/write.
    sector: u64,
}

impl BlockRequestHeader {
    const SIZE: usize = 16;

    fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        let mut request_type = [0u8; 4];
        let mut sector = [0u8; 8];
        request_type.copy_from_slice(&bytes[0..4]);
        sector.copy_from_slice(&bytes[8..16]);
        Self {
            request_type: u32::from_le_bytes(request_type),
            sector: u64::from_le_bytes(sector),
        }
    }
}

pub const SECTOR_SIZE: u64 = 512;

/// Request processing budget per cycle passed to [`VirtioBlk::step`].
pub const BYTES_PER_CYCLE: usize = 32;

/// Bytes moved between the backend and guest memory per copy.
const CHUNK_SIZE: usize = 4096;

/// Length of the GET_ID response.
const ID_LEN: usize = 20;

/// struct virtio_blk_config, up to and including the topology fields.
const CONFIG_SIZE: usize = 60;
const CONFIG_CAPACITY: u64 = 0;
const CONFIG_CAPACITY_HIGH: u64 = 4;

/// The request queue.
pub const REQUEST_QUEUE: usize = 0;

/// Storage behind a virtio-blk device.
pub trait BlockBackend: Send {
    /// Size in bytes.
    fn capacity(&self) -> u64;

    fn is_readonly(&self) -> bool;

    /// Fill `buf` from byte offset `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Store `data` at byte offset `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Make prior writes durable.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Serial reported for GET_ID (truncated to 20 bytes).
    fn id(&self) -> String {
        "virtio-blk".to_string()
    }
}

fn out_of_range(offset: u64, len: usize, capacity: u64) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("access of {len} bytes at {offset:#x} beyond capacity {capacity:#x}"),
    ))
}

fn read_only() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "block device is read-only",
    ))
}

/// In-memory disk image.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Vec<u8>,
    readonly: bool,
}

impl MemoryBackend {
    /// A zero-filled disk of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            readonly: false,
        }
    }

    /// Set whether the device is read-only.
    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let capacity = self.capacity();
        usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= self.data.len())
            .ok_or_else(|| out_of_range(offset, len, capacity))
    }
}

impl BlockBackend for MemoryBackend {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(read_only());
        }
        let range = self.range(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

/// Disk image file.
#[derive(Debug)]
pub struct FileBackend {
    /// Path to the disk image
    path: PathBuf,
    /// Backing file
    file: File,
    /// Disk size in bytes
    capacity: u64,
    /// Whether the disk is read-only
    readonly: bool,
}

impl FileBackend {
    /// Open a disk image for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::from_file(path, file, false)
    }

    /// Open a disk image read-only.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        Self::from_file(path, file, true)
    }

    fn from_file(path: PathBuf, file: File, readonly: bool) -> Result<Self> {
        let capacity = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            capacity,
            readonly,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(out_of_range(offset, len, self.capacity)),
        }
    }
}

impl BlockBackend for FileBackend {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(read_only());
        }
        self.check_range(offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn id(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "virtio-blk".to_string())
    }
}

/// Virtio block device.
pub struct VirtioBlk {
    spec: DeviceSpec,
    backend: Box<dyn BlockBackend>,
}

impl VirtioBlk {
    /// Create a virtio-blk device on top of `backend`.
    pub fn new(backend: impl BlockBackend + 'static) -> Result<Self> {
        let mut features = blk_features::FLUSH;
        if backend.is_readonly() {
            features |= blk_features::RO;
        }
        let spec = DeviceSpec::builder(device_type::BLOCK)
            .features(features)
            .queue_count(1)
            .config_space_size(CONFIG_SIZE)
            .build()?;
        Ok(Self {
            spec,
            backend: Box::new(backend),
        })
    }

    /// Get the disk capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.backend.capacity()
    }

    /// Capacity in whole sectors. Trailing partial sectors are not exposed.
    pub fn capacity_sectors(&self) -> u64 {
        self.backend.capacity() / SECTOR_SIZE
    }

    pub fn backend(&self) -> &dyn BlockBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn BlockBackend {
        self.backend.as_mut()
    }

    /// Process pending requests, up to `cycles * BYTES_PER_CYCLE` bytes.
    ///
    /// Returns the number of requests completed. At least one pending
    /// request is processed for a non-zero budget.
    pub fn step(&mut self, core: &mut DeviceCore, cycles: usize) -> usize {
        if core.has_failed() || core.queue_state(REQUEST_QUEUE).is_none() {
            return 0;
        }

        let mut budget = cycles.saturating_mul(BYTES_PER_CYCLE);
        let mut completed = 0;
        while budget > 0 {
            match self.process_request(core) {
                Ok(Some(bytes)) => {
                    completed += 1;
                    budget = budget.saturating_sub(bytes);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "block request failed");
                    break;
                }
            }
        }
        completed
    }

    /// Handle one request. Returns the chain's total size, or `None` if the
    /// queue is empty.
    fn process_request(&mut self, core: &mut DeviceCore) -> Result<Option<usize>> {
        let Some(mut chain) = core.next_chain(REQUEST_QUEUE)? else {
            return Ok(None);
        };
        let processed = chain.readable_bytes() + chain.writable_bytes();

        // struct virtio_blk_req { le32 type; le32 reserved; le64 sector; u8 data[]; u8 status; }
        if chain.readable_bytes() < BlockRequestHeader::SIZE || chain.writable_bytes() == 0 {
            return Err(malformed(core));
        }
        let mut header = [0u8; BlockRequestHeader::SIZE];
        chain.read(core, &mut header)?;
        let header = BlockRequestHeader::parse(&header);

        let status = match header.request_type {
            request_type::IN => self.process_read(core, &mut chain, header.sector)?,
            request_type::OUT => self.process_write(core, &mut chain, header.sector)?,
            request_type::FLUSH => {
                skip_to_status(core, &mut chain)?;
                match self.backend.flush() {
                    Ok(()) => request_status::OK,
                    Err(err) => {
                        warn!(error = %err, "block flush failed");
                        request_status::IOERR
                    }
                }
            }
            request_type::GET_ID => self.process_get_id(core, &mut chain)?,
            other => {
                debug!(request_type = other, "unsupported block request");
                skip_to_status(core, &mut chain)?;
                request_status::UNSUPP
            }
        };

        chain.write_byte(core, status)?;
        chain.mark_used(core)?;
        Ok(Some(processed))
    }

    fn process_read(
        &mut self,
        core: &mut DeviceCore,
        chain: &mut DescriptorChain,
        sector: u64,
    ) -> Result<u8> {
        // Header is the only readable part; data is a whole number of sectors
        let len = chain.writable_bytes() - 1;
        if chain.readable_bytes() > 0 || len as u64 % SECTOR_SIZE != 0 {
            return Err(malformed(core));
        }

        let offset = match self.check_range(sector, len) {
            Ok(offset) => offset,
            Err(err) => {
                warn!(sector, len, error = %err, "block read failed");
                chain.skip(core, len)?;
                return Ok(request_status::IOERR);
            }
        };

        let mut buf = [0u8; CHUNK_SIZE];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK_SIZE);
            if let Err(err) = self.backend.read_at(offset + done as u64, &mut buf[..n]) {
                warn!(sector, len, error = %err, "block read failed");
                chain.skip(core, len - done)?;
                return Ok(request_status::IOERR);
            }
            chain.write(core, &buf[..n])?;
            done += n;
        }
        Ok(request_status::OK)
    }

    fn process_write(
        &mut self,
        core: &mut DeviceCore,
        chain: &mut DescriptorChain,
        sector: u64,
    ) -> Result<u8> {
        // Only the status byte is writable
        let len = chain.readable_bytes();
        if chain.writable_bytes() != 1 || len as u64 % SECTOR_SIZE != 0 {
            return Err(malformed(core));
        }

        let offset = match self.check_range(sector, len) {
            Ok(offset) => offset,
            Err(err) => {
                warn!(sector, len, error = %err, "block write failed");
                chain.skip(core, len)?;
                return Ok(request_status::IOERR);
            }
        };

        let mut buf = [0u8; CHUNK_SIZE];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK_SIZE);
            chain.read(core, &mut buf[..n])?;
            if let Err(err) = self.backend.write_at(offset + done as u64, &buf[..n]) {
                warn!(sector, len, error = %err, "block write failed");
                chain.skip(core, len - done - n)?;
                return Ok(request_status::IOERR);
            }
            done += n;
        }
        Ok(request_status::OK)
    }

    /// Byte offset of `len` bytes at `sector`, if they fit on the disk.
    fn check_range(&self, sector: u64, len: usize) -> Result<u64> {
        let capacity = self.capacity();
        sector
            .checked_mul(SECTOR_SIZE)
            .filter(|offset| {
                offset
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= capacity)
            })
            .ok_or_else(|| out_of_range(sector, len, capacity))
    }

    fn process_get_id(&mut self, core: &mut DeviceCore, chain: &mut DescriptorChain) -> Result<u8> {
        let readable = chain.readable_bytes();
        chain.skip(core, readable)?;

        let room = chain.writable_bytes() - 1;
        let mut id = [0u8; ID_LEN];
        let serial = self.backend.id();
        let copy_len = serial.len().min(ID_LEN);
        id[..copy_len].copy_from_slice(&serial.as_bytes()[..copy_len]);

        let len = room.min(ID_LEN);
        chain.write(core, &id[..len])?;
        chain.skip(core, room - len)?;
        Ok(request_status::OK)
    }
}

/// Consume everything but the trailing status byte.
fn skip_to_status(core: &mut DeviceCore, chain: &mut DescriptorChain) -> Result<()> {
    let readable = chain.readable_bytes();
    chain.skip(core, readable)?;
    let writable = chain.writable_bytes() - 1;
    chain.skip(core, writable)
}

fn malformed(core: &mut DeviceCore) -> Error {
    core.fail(ProtocolViolation::MalformedRequest.into())
}

impl VirtioDevice for VirtioBlk {
    fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    fn read_config(&mut self, core: &mut DeviceCore, offset: u64, size: AccessSize) -> u64 {
        // Config space layout (virtio spec 5.2.4):
        // offset 0: capacity (u64) - in 512-byte sectors
        // offset 8: size_max (u32)
        // offset 12: seg_max (u32)
        // ...
        let capacity = self.capacity_sectors();
        match (offset, size) {
            (CONFIG_CAPACITY, AccessSize::Double) => capacity,
            (CONFIG_CAPACITY, AccessSize::Word) => capacity & 0xFFFF_FFFF,
            (CONFIG_CAPACITY_HIGH, AccessSize::Word) => capacity >> 32,
            _ => core.config().load(offset, size),
        }
    }

    fn write_config(&mut self, _core: &mut DeviceCore, _offset: u64, _value: u64, _size: AccessSize) {
        // Block device config is read-only
    }

    fn features_negotiated(&mut self, core: &mut DeviceCore) {
        // Requests are processed from step()
        core.set_queue_notifications(REQUEST_QUEUE, false);
    }
}
