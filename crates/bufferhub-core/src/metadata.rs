//! Shared metadata block: header atomics plus the user metadata area
//!
//! Layout of the block:
//!
//! ```text
//! +0   magic                    AtomicU32, published last on creation
//! +4   version                  u32
//! +8   buffer_state             AtomicU32
//! +12  fence_state              AtomicU32
//! +16  active_clients_bit_mask  AtomicU32
//! +20  mapping_count            AtomicU32
//! +24  queue_index              AtomicU64
//! +32  width, height, layer_count, format (u32 each)
//! +48  usage                    u64
//! +56  user_metadata_size       u64
//! +64  user metadata area
//! ```

use crate::clients::ActiveClients;
use crate::config::HubConfig;
use crate::desc::{BufferDesc, PixelFormat, UsageFlags};
use crate::id::BufferId;
use crate::shm::SharedMemory;
use crate::state::{BufferStateWord, FenceStateWord};
use crate::{Error, Result};
use std::ptr;
use crate::sync::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error};

const MAGIC: u32 = 0x4255_4648; // "BUFH"
const VERSION: u32 = 1;

/// Header at the start of every metadata block
#[repr(C)]
struct MetadataHeader {
    magic: AtomicU32,
    version: u32,
    buffer_state: AtomicU32,
    fence_state: AtomicU32,
    active_clients_bit_mask: AtomicU32,
    /// Live mappings across all processes
    mapping_count: AtomicU32,
    queue_index: AtomicU64,
    width: u32,
    height: u32,
    layer_count: u32,
    format: u32,
    usage: u64,
    user_metadata_size: u64,
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<MetadataHeader>() == 64);

/// Mapped metadata block of one buffer
pub struct MetadataBlock {
    shm: SharedMemory,
    user_metadata_size: usize,
    detached: bool,
}

impl MetadataBlock {
    /// Size of the fixed header
    pub const HEADER_SIZE: usize = std::mem::size_of::<MetadataHeader>();

    /// Create and initialize a fresh block.
    ///
    /// All state atomics start at zero: no clients, every slot released, no
    /// fences. The magic is stored last so openers never see a half-written
    /// header.
    pub fn create(name: &str, desc: &BufferDesc, user_metadata_size: usize) -> Result<Self> {
        let size = Self::HEADER_SIZE
            .checked_add(user_metadata_size)
            .ok_or(Error::UserMetadataTooLarge {
                requested: user_metadata_size,
                max: usize::MAX - Self::HEADER_SIZE,
            })?;
        let mut shm = SharedMemory::create(name, size)?;

        let header = shm.as_mut_ptr() as *mut MetadataHeader;
        // Safety: the region was just created with room for the header and
        // is not visible to openers until the magic is published.
        unsafe {
            ptr::addr_of_mut!((*header).version).write(VERSION);
            ptr::addr_of_mut!((*header).width).write(desc.width);
            ptr::addr_of_mut!((*header).height).write(desc.height);
            ptr::addr_of_mut!((*header).layer_count).write(desc.layer_count);
            ptr::addr_of_mut!((*header).format).write(desc.format as u32);
            ptr::addr_of_mut!((*header).usage).write(desc.usage.bits());
            ptr::addr_of_mut!((*header).user_metadata_size).write(user_metadata_size as u64);

            let header = &*header;
            header.buffer_state.store(0, Ordering::Relaxed);
            header.fence_state.store(0, Ordering::Relaxed);
            header.active_clients_bit_mask.store(0, Ordering::Relaxed);
            header.queue_index.store(0, Ordering::Relaxed);
            header.mapping_count.store(1, Ordering::Relaxed);
            header.magic.store(MAGIC, Ordering::Release);
        }

        // Whoever drops the last mapping unlinks the object.
        shm.set_owner(false);

        Ok(Self {
            shm,
            user_metadata_size,
            detached: false,
        })
    }

    /// Map an existing block, keeping its header state as is
    pub fn open(name: &str) -> Result<Self> {
        let shm = SharedMemory::open(name)?;
        if shm.size() < Self::HEADER_SIZE {
            return Err(Error::InvalidMetadata(format!(
                "{}: region of {} bytes is smaller than the header",
                name,
                shm.size()
            )));
        }

        // Safety: size checked above.
        let header = unsafe { &*(shm.as_ptr() as *const MetadataHeader) };
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MAGIC {
            return Err(Error::InvalidMetadata(format!(
                "{}: bad magic {:#x}",
                name, magic
            )));
        }
        if header.version != VERSION {
            return Err(Error::InvalidMetadata(format!(
                "{}: version mismatch: expected {}, got {}",
                name, VERSION, header.version
            )));
        }

        let recorded = header.user_metadata_size;
        let user_metadata_size = usize::try_from(recorded)
            .ok()
            .filter(|size| {
                Self::HEADER_SIZE
                    .checked_add(*size)
                    .is_some_and(|total| total <= shm.size())
            })
            .ok_or_else(|| {
                Error::InvalidMetadata(format!(
                    "{}: region of {} bytes cannot hold {} bytes of user metadata",
                    name,
                    shm.size(),
                    recorded
                ))
            })?;

        header
            .mapping_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .map_err(|_| Error::InvalidMetadata(format!("{}: buffer is being destroyed", name)))?;

        Ok(Self {
            shm,
            user_metadata_size,
            detached: false,
        })
    }

    fn header(&self) -> &MetadataHeader {
        // Safety: both constructors verified the mapping holds a header.
        unsafe { &*(self.shm.as_ptr() as *const MetadataHeader) }
    }

    /// Mapping is present and carries a well-formed header
    pub fn is_valid(&self) -> bool {
        !self.shm.as_ptr().is_null()
            && self.header().magic.load(Ordering::Acquire) == MAGIC
            && self.header().version == VERSION
    }

    /// Name of the underlying shared memory object
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn user_metadata_size(&self) -> usize {
        self.user_metadata_size
    }

    /// Buffer description recorded by the creator
    pub fn desc(&self) -> Result<BufferDesc> {
        let header = self.header();
        let format = PixelFormat::from_u32(header.format).ok_or_else(|| {
            Error::InvalidMetadata(format!("unknown pixel format {:#x}", header.format))
        })?;
        let desc = BufferDesc::new(
            header.width,
            header.height,
            header.layer_count,
            format,
            UsageFlags::from_bits_retain(header.usage),
        );
        desc.validate()?;
        Ok(desc)
    }

    pub fn active_clients(&self) -> ActiveClients<'_> {
        ActiveClients::new(&self.header().active_clients_bit_mask)
    }

    pub fn buffer_state(&self) -> BufferStateWord<'_> {
        BufferStateWord::new(&self.header().buffer_state)
    }

    pub fn fence_state(&self) -> FenceStateWord<'_> {
        FenceStateWord::new(&self.header().fence_state)
    }

    pub fn queue_index(&self) -> u64 {
        self.header().queue_index.load(Ordering::Acquire)
    }

    pub fn set_queue_index(&self, index: u64) {
        self.header().queue_index.store(index, Ordering::Release);
    }

    /// Number of live mappings across all processes
    pub fn mapping_count(&self) -> u32 {
        self.header().mapping_count.load(Ordering::Acquire)
    }

    /// Start of the user metadata area
    pub fn user_metadata_ptr(&self) -> *mut u8 {
        // Safety: the area lies inside the mapping, checked at construction.
        unsafe { self.shm.as_mut_ptr().add(Self::HEADER_SIZE) }
    }

    /// User metadata area.
    ///
    /// # Safety
    ///
    /// The area is not synchronized. The caller must make sure no process
    /// writes it for the lifetime of the returned slice.
    pub unsafe fn user_metadata(&self) -> &[u8] {
        std::slice::from_raw_parts(self.user_metadata_ptr(), self.user_metadata_size)
    }

    /// Mutable user metadata area.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the area across all processes
    /// for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn user_metadata_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.user_metadata_ptr(), self.user_metadata_size)
    }

    /// Give up this mapping's share of the block.
    ///
    /// Returns true when this was the last mapping anywhere; the object is
    /// then unlinked when the mapping drops. Idempotent.
    pub(crate) fn detach(&mut self) -> bool {
        if self.detached {
            return false;
        }
        self.detached = true;

        let previous = self.header().mapping_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            error!(name = self.name(), "metadata mapping count underflow");
            return false;
        }
        let last = previous == 1;
        self.shm.set_owner(last);
        debug!(name = self.name(), last, "detached metadata block");
        last
    }
}

impl Drop for MetadataBlock {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for MetadataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataBlock")
            .field("name", &self.name())
            .field("user_metadata_size", &self.user_metadata_size)
            .field("mapping_count", &self.mapping_count())
            .finish()
    }
}

/// Allocates and maps metadata blocks
pub trait MetadataProvider: Send + Sync {
    /// Create the block of a new buffer
    fn create(
        &self,
        id: BufferId,
        desc: &BufferDesc,
        user_metadata_size: usize,
    ) -> Result<MetadataBlock>;

    /// Map the block of an existing buffer
    fn open(&self, id: BufferId) -> Result<MetadataBlock>;
}

/// Metadata provider backed by named POSIX shared memory
pub struct ShmMetadataProvider {
    config: HubConfig,
}

impl ShmMetadataProvider {
    pub fn new(config: HubConfig) -> Self {
        Self { config }
    }
}

impl MetadataProvider for ShmMetadataProvider {
    fn create(
        &self,
        id: BufferId,
        desc: &BufferDesc,
        user_metadata_size: usize,
    ) -> Result<MetadataBlock> {
        if user_metadata_size > self.config.max_user_metadata_size {
            return Err(Error::UserMetadataTooLarge {
                requested: user_metadata_size,
                max: self.config.max_user_metadata_size,
            });
        }
        MetadataBlock::create(&self.config.metadata_shm_name(id), desc, user_metadata_size)
    }

    fn open(&self, id: BufferId) -> Result<MetadataBlock> {
        MetadataBlock::open(&self.config.metadata_shm_name(id))
    }
}
