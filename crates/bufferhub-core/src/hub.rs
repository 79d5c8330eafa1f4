//! Buffer hub: configuration plus the collaborators every node needs

use crate::config::HubConfig;
use crate::desc::BufferDesc;
use crate::id::{BufferHubIdGenerator, BufferId, IdGenerator};
use crate::metadata::{MetadataProvider, ShmMetadataProvider};
use crate::native::{NativeBufferAllocator, ShmBufferAllocator};
use crate::node::BufferNode;
use crate::Result;
use std::sync::Arc;

/// Entry point for creating and attaching buffer nodes
pub struct BufferHub {
    config: HubConfig,
    id_generator: Arc<dyn IdGenerator>,
    metadata_provider: Arc<dyn MetadataProvider>,
    allocator: Arc<dyn NativeBufferAllocator>,
}

impl BufferHub {
    /// Hub backed by shared memory, drawing ids from the counter shared by
    /// every hub under the same prefix
    pub fn new(config: HubConfig) -> Result<Self> {
        let id_generator = Arc::new(BufferHubIdGenerator::open_or_create(&config)?);
        Ok(Self::with_id_generator(config, id_generator))
    }

    /// Hub configured from the environment
    pub fn from_env() -> Result<Self> {
        Self::new(HubConfig::from_env())
    }

    /// Shared memory backed hub drawing ids from `id_generator`
    pub fn with_id_generator(config: HubConfig, id_generator: Arc<dyn IdGenerator>) -> Self {
        let metadata_provider = Arc::new(ShmMetadataProvider::new(config.clone()));
        let allocator = Arc::new(ShmBufferAllocator::new(config.clone()));
        Self::with_collaborators(config, id_generator, metadata_provider, allocator)
    }

    /// Hub with every collaborator supplied by the caller
    pub fn with_collaborators(
        config: HubConfig,
        id_generator: Arc<dyn IdGenerator>,
        metadata_provider: Arc<dyn MetadataProvider>,
        allocator: Arc<dyn NativeBufferAllocator>,
    ) -> Self {
        Self {
            config,
            id_generator,
            metadata_provider,
            allocator,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.id_generator
    }

    pub fn metadata_provider(&self) -> &Arc<dyn MetadataProvider> {
        &self.metadata_provider
    }

    pub fn allocator(&self) -> &Arc<dyn NativeBufferAllocator> {
        &self.allocator
    }

    /// Allocate a new buffer
    pub fn create_buffer(&self, desc: BufferDesc, user_metadata_size: usize) -> Result<BufferNode> {
        BufferNode::create(self, desc, user_metadata_size)
    }

    /// Attach to the buffer with the given id
    pub fn attach(&self, id: BufferId) -> Result<BufferNode> {
        BufferNode::attach(self, id)
    }
}
