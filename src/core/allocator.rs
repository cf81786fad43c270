mod chunks;
mod pool;
pub mod device;
pub mod host;

pub use chunks::Chunk;
pub use pool::MemoryPool;

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use vulkanalia::vk;

/// Identity of a resource that owns memory in a pool. For Vulkan
/// buffers this is the raw value of the buffer handle.
pub type ResourceId = u64;

/// Identifier of a memory pool. Resources keep this as a
/// back-reference to the pool they are bound to, instead of a
/// pointer to the pool itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl PoolId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Errors reported by memory pools.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("No memory type matches filter {filter:#b} with properties {required:?}.")]
    NoCompatibleMemoryType {
        filter: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("Cannot allocate pool memory: {0}")]
    BackingAllocationFailed(#[source] vk::ErrorCode),
    #[error("No free gap of {size} bytes (alignment {alignment}) in pool; largest gap is {largest_gap} bytes.")]
    NoFittingGapFound {
        size: u64,
        alignment: u64,
        largest_gap: u64,
    },
    #[error("Cannot bind resource memory: {0}")]
    BindFailed(#[source] vk::ErrorCode),
    #[error("Attempting to free unallocated memory of resource {0:#x}.")]
    FreeOfUnallocatedResource(ResourceId),
    #[error("Resource {0:#x} has no memory in this pool.")]
    UnallocatedResource(ResourceId),
    #[error("Resource {0:#x} already has allocated memory.")]
    AlreadyAllocated(ResourceId),
    #[error("Resource accepts memory types {type_bits:#b}, but the pool uses type {memory_type}.")]
    IncompatibleResource {
        memory_type: u32,
        type_bits: u32,
    },
    #[error("Invalid memory requirements: {0}")]
    InvalidRequirements(&'static str),
    #[error("Resource is bound to another pool.")]
    WrongPool,
    #[error("Cannot map pool memory: {0}")]
    MapFailed(#[source] vk::ErrorCode),
    #[error("Memory pool is not valid.")]
    InvalidPoolUse,
}

/// Source of device memory for a pool: memory type enumeration,
/// block allocation and host mapping.
///
/// # Safety
///
/// `map_block_range` must return a pointer that is valid for
/// reads and writes of `length` bytes until `unmap_block` or
/// `free_block` is called on the same block.
pub unsafe trait MemoryDevice {
    /// Property flags of every memory type of the device, in
    /// index order.
    fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags>;

    fn allocate_block(&mut self, size: u64, memory_type: u32) -> Result<vk::DeviceMemory, vk::ErrorCode>;

    fn free_block(&mut self, memory: vk::DeviceMemory);

    fn map_block_range(
        &mut self,
        memory: vk::DeviceMemory,
        offset: u64,
        length: u64,
    ) -> Result<*mut u8, vk::ErrorCode>;

    fn unmap_block(&mut self, memory: vk::DeviceMemory);
}

/// An allocatable unit, such as a buffer, that needs memory bound
/// to it before use. A resource never owns memory.
pub trait Resource {
    fn id(&self) -> ResourceId;

    /// Size of the resource as it was declared on creation (the
    /// memory requirements may be larger).
    fn size(&self) -> u64;

    fn memory_requirements(&self) -> vk::MemoryRequirements;

    fn bind_memory(&self, memory: vk::DeviceMemory, offset: u64) -> Result<(), vk::ErrorCode>;
}

/// Select the first memory type allowed by `filter` whose property
/// flags contain all the `required` flags.
pub fn select_memory_type(
    memory_types: &[vk::MemoryPropertyFlags],
    filter: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    // The filter (the "memory type bits" of the requirements)
    // has a bit set at the index of each suitable memory type.
    // The type properties only have to be a superset of the
    // required ones, not an exact match. There are at most 32
    // memory types, one per bit of the filter.
    memory_types
        .iter()
        .take(32)
        .enumerate()
        .find(|&(index, properties)| {
            filter & (1 << index) != 0 && properties.contains(required)
        })
        .map(|(index, _)| index as u32)
}
