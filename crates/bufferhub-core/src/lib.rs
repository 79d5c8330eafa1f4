//! bufferhub - Cross-process graphics buffer sharing
//!
//! A [`BufferNode`] is one process's attachment to a shared buffer. Clients
//! register on a node to get a [`ClientBit`], then move their own slot of
//! the shared [`BufferState`] word through the gained, posted, acquired and
//! released phases. All coordination goes through atomics in the shared
//! metadata block; nothing here takes a lock or blocks.

pub mod clients;
pub mod config;
pub mod desc;
pub mod error;
pub mod guard;
pub mod hub;
pub mod id;
pub mod metadata;
pub mod native;
pub mod node;
pub mod shm;
pub mod state;
pub mod sync;


pub use clients::{ActiveClients, ClientBit, CLIENT_BITS_MASK, MAX_CLIENTS};
pub use config::HubConfig;
pub use desc::{BufferDesc, PixelFormat, UsageFlags};
pub use error::{Error, Result};
pub use guard::ClientGuard;
pub use hub::BufferHub;
pub use id::{BufferHubIdGenerator, BufferId, IdGenerator};
pub use metadata::{MetadataBlock, MetadataProvider, ShmMetadataProvider};
pub use native::{NativeBufferAllocator, NativeHandle, ShmBufferAllocator};
pub use node::BufferNode;
pub use state::{BufferState, BufferStateWord, FenceStateWord};
