//! POSIX shared memory wrapper

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};

/// Shared memory region wrapper
///
/// The owner of a region unlinks the OS object when the mapping is dropped.
/// Ownership can be moved between mappings with [`SharedMemory::set_owner`].
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// Safety: the mapping is valid process-wide for the lifetime of `inner`, and
// every shared mutation in this crate goes through atomics placed in it.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory region; the caller starts as its owner.
    ///
    /// Fails with [`Error::AlreadyExists`] when an object of that name is
    /// already present.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| match e {
                ShmemError::MappingIdExists => Error::AlreadyExists(name.to_string()),
                e => Error::SharedMemory(format!("create {}: {}", name, e)),
            })?;

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Open an existing shared memory region without taking ownership
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(format!("open {}: {}", name, e)))?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Get the name of the shared memory region
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the shared memory region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether dropping this mapping unlinks the OS object
    pub fn is_owner(&self) -> bool {
        self.inner.is_owner()
    }

    /// Change whether dropping this mapping unlinks the OS object.
    /// Returns the previous setting.
    pub fn set_owner(&mut self, owner: bool) -> bool {
        self.inner.set_owner(owner)
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.as_ptr()
    }

    /// Get a mutable raw pointer to the shared memory
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.is_owner())
            .finish()
    }
}
