pub mod core;

pub use crate::core::{
    allocator::{Chunk, MemoryDevice, MemoryError, MemoryPool, PoolId, Resource, ResourceId},
    buffer::{Buffer, PoolBinding},
    context::{Context, ContextConfig},
};
