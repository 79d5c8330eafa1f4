//! Native pixel buffer handles and the allocator seam

use crate::config::HubConfig;
use crate::desc::BufferDesc;
use crate::id::BufferId;
use crate::shm::SharedMemory;
use crate::{Error, Result};
use tracing::debug;

/// Handle to the pixel storage of one buffer, owned by a single node
#[derive(Debug)]
pub struct NativeHandle {
    id: BufferId,
    shm: SharedMemory,
}

impl NativeHandle {
    pub fn new(id: BufferId, shm: SharedMemory) -> Self {
        Self { id, shm }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Name of the backing shared memory object
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.shm.size()
    }

    /// Pointer to the pixel data
    pub fn as_ptr(&self) -> *const u8 {
        self.shm.as_ptr()
    }

    /// Mutable pointer to the pixel data. Writers must hold the buffer in
    /// the gained state.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.shm.as_mut_ptr()
    }

    /// Whether releasing this handle destroys the storage
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    pub fn set_owner(&mut self, owner: bool) {
        self.shm.set_owner(owner);
    }
}

/// Allocates pixel storage for buffers
pub trait NativeBufferAllocator: Send + Sync {
    /// Allocate storage for a new buffer. The returned handle owns the
    /// storage until told otherwise.
    fn allocate(&self, id: BufferId, desc: &BufferDesc) -> Result<NativeHandle>;

    /// Map the storage of an existing buffer
    fn import(&self, id: BufferId, desc: &BufferDesc) -> Result<NativeHandle>;

    /// Give a handle back; owned storage is destroyed
    fn release(&self, handle: NativeHandle);
}

/// Allocator backing pixel storage with named POSIX shared memory
pub struct ShmBufferAllocator {
    config: HubConfig,
}

impl ShmBufferAllocator {
    pub fn new(config: HubConfig) -> Self {
        Self { config }
    }
}

impl NativeBufferAllocator for ShmBufferAllocator {
    fn allocate(&self, id: BufferId, desc: &BufferDesc) -> Result<NativeHandle> {
        desc.validate()?;
        let size = desc.byte_size()?;
        let shm = SharedMemory::create(&self.config.buffer_shm_name(id), size)?;
        debug!(id = id.get(), size, "allocated pixel storage");
        Ok(NativeHandle::new(id, shm))
    }

    fn import(&self, id: BufferId, desc: &BufferDesc) -> Result<NativeHandle> {
        let expected = desc.byte_size()?;
        let shm = SharedMemory::open(&self.config.buffer_shm_name(id))?;
        if shm.size() < expected {
            return Err(Error::SharedMemory(format!(
                "{}: {} bytes mapped, descriptor needs {}",
                shm.name(),
                shm.size(),
                expected
            )));
        }
        Ok(NativeHandle::new(id, shm))
    }

    fn release(&self, handle: NativeHandle) {
        debug!(
            id = handle.id().get(),
            destroy = handle.is_owner(),
            "released pixel storage"
        );
        drop(handle);
    }
}
