//! Device and resource emulated in host memory, to run pools
//! without a GPU (tests and headless tools).

use std::cell::Cell;
use std::collections::HashMap;

use vulkanalia::vk::{self, Handle};

use super::{MemoryDevice, Resource, ResourceId};

struct HostBlock {
    bytes: Vec<u8>,
    memory_type: u32,
}

/// Memory device whose blocks are plain host allocations.
pub struct HostDevice {
    memory_types: Vec<vk::MemoryPropertyFlags>,
    blocks: HashMap<u64, HostBlock>,
    next_handle: u64,
    fail_allocations: bool,
}

impl HostDevice {
    /// A device laid out like a common discrete GPU: one
    /// device-local type, then a host-visible coherent type and a
    /// host-visible cached type.
    pub fn new() -> Self {
        Self::with_memory_types(vec![
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ])
    }

    pub fn with_memory_types(memory_types: Vec<vk::MemoryPropertyFlags>) -> Self {
        Self {
            memory_types,
            blocks: HashMap::new(),
            next_handle: 1,
            fail_allocations: false,
        }
    }

    /// Make every block allocation fail as if the device were out
    /// of memory.
    pub fn failing_allocations(mut self) -> Self {
        self.fail_allocations = true;
        self
    }

    /// Number of blocks allocated and not yet freed.
    pub fn live_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Contents of the most recently allocated live block.
    pub fn block_bytes(&self) -> &[u8] {
        self.blocks
            .iter()
            .max_by_key(|&(&handle, _)| handle)
            .map(|(_, block)| block.bytes.as_slice())
            .unwrap_or_default()
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

// Blocks are never resized, so pointers into them stay valid until
// the block is freed.
unsafe impl MemoryDevice for HostDevice {
    fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags> {
        self.memory_types.clone()
    }

    fn allocate_block(&mut self, size: u64, memory_type: u32) -> Result<vk::DeviceMemory, vk::ErrorCode> {
        if self.fail_allocations || memory_type as usize >= self.memory_types.len() {
            return Err(vk::ErrorCode::OUT_OF_DEVICE_MEMORY);
        }

        let size = usize::try_from(size).map_err(|_| vk::ErrorCode::OUT_OF_HOST_MEMORY)?;
        let handle = self.next_handle;
        self.next_handle += 1;

        self.blocks.insert(handle, HostBlock {
            bytes: vec![0; size],
            memory_type,
        });

        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn free_block(&mut self, memory: vk::DeviceMemory) {
        self.blocks.remove(&memory.as_raw());
    }

    fn map_block_range(
        &mut self,
        memory: vk::DeviceMemory,
        offset: u64,
        length: u64,
    ) -> Result<*mut u8, vk::ErrorCode> {
        let block = self
            .blocks
            .get_mut(&memory.as_raw())
            .ok_or(vk::ErrorCode::MEMORY_MAP_FAILED)?;

        // Only host-visible memory can be mapped.
        let properties = self.memory_types[block.memory_type as usize];
        if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(vk::ErrorCode::MEMORY_MAP_FAILED);
        }

        let end = offset
            .checked_add(length)
            .ok_or(vk::ErrorCode::MEMORY_MAP_FAILED)?;
        if end > block.bytes.len() as u64 {
            return Err(vk::ErrorCode::MEMORY_MAP_FAILED);
        }

        Ok(block.bytes[offset as usize..].as_mut_ptr())
    }

    fn unmap_block(&mut self, _memory: vk::DeviceMemory) {}
}

/// Resource with fixed memory requirements that records where it
/// was bound.
pub struct HostResource {
    id: ResourceId,
    requirements: vk::MemoryRequirements,
    fail_bind: bool,
    bound: Cell<Option<(vk::DeviceMemory, u64)>>,
}

impl HostResource {
    pub fn new(id: ResourceId, size: u64, alignment: u64) -> Self {
        Self {
            id,
            requirements: vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: !0,
            },
            fail_bind: false,
            bound: Cell::new(None),
        }
    }

    pub fn with_type_bits(mut self, memory_type_bits: u32) -> Self {
        self.requirements.memory_type_bits = memory_type_bits;
        self
    }

    /// Make binding fail as if the driver rejected it.
    pub fn failing_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    /// Memory block and offset the resource was last bound to.
    pub fn bound(&self) -> Option<(vk::DeviceMemory, u64)> {
        self.bound.get()
    }
}

impl Resource for HostResource {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn size(&self) -> u64 {
        self.requirements.size
    }

    fn memory_requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    fn bind_memory(&self, memory: vk::DeviceMemory, offset: u64) -> Result<(), vk::ErrorCode> {
        if self.fail_bind {
            return Err(vk::ErrorCode::OUT_OF_DEVICE_MEMORY);
        }

        self.bound.set(Some((memory, offset)));
        Ok(())
    }
}
