//! Error types for bufferhub

use crate::state::BufferState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("shared memory object already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid metadata block: {0}")]
    InvalidMetadata(String),

    #[error("user metadata too large: requested {requested} bytes, limit is {max}")]
    UserMetadataTooLarge { requested: usize, max: usize },

    #[error("no buffer id available")]
    IdExhausted,

    #[error("invalid buffer id: {0}")]
    InvalidId(u32),

    #[error("buffer already has the maximum number of clients")]
    TooManyClients,

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: BufferState, to: BufferState },
}

pub type Result<T> = std::result::Result<T, Error>;
