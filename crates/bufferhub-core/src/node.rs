//! Buffer node: one process's attachment to a shared buffer

use crate::clients::ClientBit;
use crate::desc::BufferDesc;
use crate::guard::ClientGuard;
use crate::hub::BufferHub;
use crate::id::{BufferId, IdGenerator};
use crate::metadata::MetadataBlock;
use crate::native::{NativeBufferAllocator, NativeHandle};
use crate::state::{BufferStateWord, FenceStateWord};
use crate::{Error, Result};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Ids tried by [`BufferNode::create`] before giving up
pub(crate) const CREATE_ATTEMPTS: u32 = 16;

/// A process's handle on one shared graphics buffer
///
/// Either creates a fresh buffer or attaches to an existing one by id. The
/// descriptor and native handle are fixed for the node's lifetime; all
/// shared state lives in the metadata block and is only touched atomically.
pub struct BufferNode {
    id: BufferId,
    buffer_handle: ManuallyDrop<NativeHandle>,
    buffer_desc: BufferDesc,
    metadata: MetadataBlock,
    allocator: Arc<dyn NativeBufferAllocator>,
    /// Set when this node took its id from the generator and must return it
    id_owner: Option<Arc<dyn IdGenerator>>,
}

impl BufferNode {
    /// Allocate a new buffer with a fresh id.
    ///
    /// An id whose shared memory objects already exist belongs to a live
    /// buffer elsewhere (or to one a crashed process left behind), so the
    /// next id is tried instead.
    #[tracing::instrument(
        skip(hub, desc),
        fields(width = desc.width, height = desc.height, format = ?desc.format)
    )]
    pub fn create(hub: &BufferHub, desc: BufferDesc, user_metadata_size: usize) -> Result<Self> {
        desc.validate()?;
        let generator = hub.id_generator().clone();

        for _ in 0..CREATE_ATTEMPTS {
            let id = generator.allocate()?;
            match Self::create_with_id(hub, id, desc, user_metadata_size) {
                Ok(mut node) => {
                    node.id_owner = Some(generator);
                    info!(id = id.get(), user_metadata_size, "created buffer");
                    return Ok(node);
                }
                Err(Error::AlreadyExists(name)) => {
                    generator.free(id);
                    warn!(
                        id = id.get(),
                        name = %name,
                        "buffer id already taken, trying the next one"
                    );
                }
                Err(e) => {
                    generator.free(id);
                    return Err(e);
                }
            }
        }

        error!(attempts = CREATE_ATTEMPTS, "no free buffer id found");
        Err(Error::IdExhausted)
    }

    fn create_with_id(
        hub: &BufferHub,
        id: BufferId,
        desc: BufferDesc,
        user_metadata_size: usize,
    ) -> Result<Self> {
        let handle = hub.allocator().allocate(id, &desc)?;
        let metadata = match hub
            .metadata_provider()
            .create(id, &desc, user_metadata_size)
        {
            Ok(metadata) => metadata,
            Err(e) => {
                hub.allocator().release(handle);
                return Err(e);
            }
        };
        Ok(Self::from_parts(id, handle, desc, metadata, hub.allocator().clone()))
    }

    /// Attach to an existing buffer, keeping its id and header state
    #[tracing::instrument(skip(hub))]
    pub fn attach(hub: &BufferHub, id: BufferId) -> Result<Self> {
        if !id.is_valid() {
            return Err(Error::InvalidId(id.get()));
        }
        let metadata = hub.metadata_provider().open(id)?;
        let desc = metadata.desc()?;
        let handle = hub.allocator().import(id, &desc)?;

        let node = Self::from_parts(id, handle, desc, metadata, hub.allocator().clone());
        info!(
            id = id.get(),
            mappings = node.metadata.mapping_count(),
            "attached to buffer"
        );
        Ok(node)
    }

    fn from_parts(
        id: BufferId,
        mut handle: NativeHandle,
        buffer_desc: BufferDesc,
        metadata: MetadataBlock,
        allocator: Arc<dyn NativeBufferAllocator>,
    ) -> Self {
        // Storage lifetime follows the metadata mapping count from here on.
        handle.set_owner(false);
        Self {
            id,
            buffer_handle: ManuallyDrop::new(handle),
            buffer_desc,
            metadata,
            allocator,
            id_owner: None,
        }
    }

    /// Whether the node holds a valid metadata mapping
    pub fn is_valid(&self) -> bool {
        self.metadata.is_valid()
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn user_metadata_size(&self) -> usize {
        self.metadata.user_metadata_size()
    }

    pub fn buffer_handle(&self) -> &NativeHandle {
        &self.buffer_handle
    }

    pub fn buffer_desc(&self) -> &BufferDesc {
        &self.buffer_desc
    }

    pub fn metadata(&self) -> &MetadataBlock {
        &self.metadata
    }

    /// Current `active_clients_bit_mask`, acquire load. Every registration
    /// or removal released before this call is visible.
    pub fn active_clients_bit_mask(&self) -> u32 {
        self.metadata.active_clients().mask()
    }

    /// Register a new client on the lowest free bit.
    ///
    /// Returns `None` when the buffer already has 16 clients.
    pub fn add_new_active_clients_bit_to_mask(&self) -> Option<ClientBit> {
        match self.metadata.active_clients().add_new_client() {
            Some(bit) => {
                debug!(id = self.id.get(), client = bit.mask(), "registered client");
                Some(bit)
            }
            None => {
                warn!(id = self.id.get(), "buffer already has the maximum number of clients");
                None
            }
        }
    }

    /// Clear a client's bit with release ordering. Call at most once per
    /// successful registration.
    pub fn remove_clients_bit_from_mask(&self, bit: ClientBit) {
        self.metadata.active_clients().remove_client(bit);
        debug!(id = self.id.get(), client = bit.mask(), "removed client");
    }

    /// Register a client whose bit is removed again when the guard drops
    pub fn register_client(&self) -> Result<ClientGuard<'_>> {
        self.add_new_active_clients_bit_to_mask()
            .map(|bit| ClientGuard::new(self, bit))
            .ok_or(Error::TooManyClients)
    }

    pub fn buffer_state(&self) -> BufferStateWord<'_> {
        self.metadata.buffer_state()
    }

    pub fn fence_state(&self) -> FenceStateWord<'_> {
        self.metadata.fence_state()
    }
}

impl Drop for BufferNode {
    fn drop(&mut self) {
        let last = self.metadata.detach();

        // Safety: the handle is never touched again after this.
        let mut handle = unsafe { ManuallyDrop::take(&mut self.buffer_handle) };
        handle.set_owner(last);
        self.allocator.release(handle);

        if let Some(generator) = self.id_owner.take() {
            if !generator.free(self.id) {
                error!(id = self.id.get(), "buffer id was not in use when freed");
            }
        }
        debug!(id = self.id.get(), last, "dropped buffer node");
    }
}

impl std::fmt::Debug for BufferNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferNode")
            .field("id", &self.id)
            .field("buffer_desc", &self.buffer_desc)
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::desc::{PixelFormat, UsageFlags};
    use crate::id::BufferHubIdGenerator;
    use crate::shm::SharedMemory;
    use crate::state::BufferState;

    fn hub(tag: &str) -> BufferHub {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        BufferHub::new(HubConfig::with_prefix(&format!(
            "/bufferhub_node_{}_{}",
            tag, ts
        )))
        .unwrap()
    }

    fn vga_desc() -> BufferDesc {
        BufferDesc::new(640, 480, 1, PixelFormat::Rgba8888, UsageFlags::CPU_READ_OFTEN)
    }

    #[test]
    fn test_create_fresh_buffer() {
        let hub = hub("fresh");
        let node = BufferNode::create(&hub, vga_desc(), 0).unwrap();
        assert!(node.is_valid());
        assert!(node.id().is_valid());
        assert_eq!(node.active_clients_bit_mask(), 0);
        assert_eq!(node.buffer_state().load(), 0);
        assert_eq!(node.fence_state().load(), 0);
        assert_eq!(node.user_metadata_size(), 0);
        assert_eq!(node.buffer_desc(), &vga_desc());
        assert_eq!(node.buffer_handle().size(), 640 * 480 * 4);
    }

    #[test]
    fn test_attach_sees_existing_state() {
        let hub = hub("attach");
        let creator = BufferNode::create(&hub, vga_desc(), 32).unwrap();
        let bit = creator.add_new_active_clients_bit_to_mask().unwrap();
        creator.buffer_state().gain(bit).unwrap();

        let attached = BufferNode::attach(&hub, creator.id()).unwrap();
        assert_eq!(attached.id(), creator.id());
        assert_eq!(attached.buffer_desc(), creator.buffer_desc());
        assert_eq!(attached.user_metadata_size(), 32);
        assert_eq!(attached.active_clients_bit_mask(), bit.mask());
        assert_eq!(attached.buffer_state().client_state(bit), BufferState::Gained);
    }

    #[test]
    fn test_attach_unknown_id_fails() {
        let hub = hub("unknown");
        assert!(BufferNode::attach(&hub, BufferId::new(77).unwrap()).is_err());
        assert!(matches!(
            BufferNode::attach(&hub, BufferId::INVALID),
            Err(Error::InvalidId(0))
        ));
    }

    #[test]
    fn test_invalid_desc_does_not_consume_id() {
        let hub = hub("baddesc");
        let desc = BufferDesc::new(0, 480, 1, PixelFormat::Rgba8888, UsageFlags::CPU_READ_OFTEN);
        assert!(BufferNode::create(&hub, desc, 0).is_err());
        let node = BufferNode::create(&hub, vga_desc(), 0).unwrap();
        assert_eq!(node.id().get(), 1);
    }

    #[test]
    fn test_creator_frees_id_on_drop() {
        let config = hub("freeid").config().clone();
        let generator = Arc::new(BufferHubIdGenerator::open_or_create(&config).unwrap());
        let hub = BufferHub::with_id_generator(config, generator.clone());

        let node = BufferNode::create(&hub, vga_desc(), 0).unwrap();
        assert_eq!(generator.in_use(), 1);
        drop(node);
        assert_eq!(generator.in_use(), 0);
    }

    #[test]
    fn test_storage_outlives_creator_until_last_node() {
        let hub = hub("lifetime");
        let creator = BufferNode::create(&hub, vga_desc(), 0).unwrap();
        let id = creator.id();
        let attached = BufferNode::attach(&hub, id).unwrap();

        drop(creator);
        assert!(attached.is_valid());
        let again = BufferNode::attach(&hub, id).unwrap();
        drop(again);
        drop(attached);

        assert!(BufferNode::attach(&hub, id).is_err());
    }

    #[test]
    fn test_create_skips_id_left_behind() {
        let hub = hub("stale");
        // storage of id 1 left over from a process that never cleaned up
        let stale = BufferId::new(1).unwrap();
        let _leftover = SharedMemory::create(&hub.config().buffer_shm_name(stale), 64).unwrap();

        let node = BufferNode::create(&hub, vga_desc(), 0).unwrap();
        assert_eq!(node.id().get(), 2);
        assert!(node.is_valid());
    }

    #[test]
    fn test_create_skips_orphaned_metadata() {
        let hub = hub("orphan");
        let stale = BufferId::new(1).unwrap();
        let _leftover =
            SharedMemory::create(&hub.config().metadata_shm_name(stale), 64).unwrap();

        let node = BufferNode::create(&hub, vga_desc(), 0).unwrap();
        assert_eq!(node.id().get(), 2);
        // the pixel storage made for the rejected id was removed again
        assert!(SharedMemory::open(&hub.config().buffer_shm_name(stale)).is_err());
    }
}
