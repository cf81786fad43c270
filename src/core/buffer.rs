use crate::core::{
    allocator::{MemoryDevice, MemoryError, MemoryPool, PoolId, Resource, ResourceId},
    handle::Scoped,
};

use vulkanalia::{prelude::v1_0::*, vk::Handle};
use anyhow::Result;
use log::*;

/// A Vulkan buffer whose memory comes from a [`MemoryPool`].
///
/// The buffer does not own its memory: it only remembers which
/// pool it was allocated from, and that pool has to be handed back
/// for every memory operation.
pub struct Buffer {
    handle: Scoped<vk::Buffer>,
    size: u64,
    binding: PoolBinding,
}

impl Buffer {
    /// # Safety
    ///
    /// The device must outlive the buffer.
    pub unsafe fn create(
        device: &Device,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        queue_families: &[u32],
    ) -> Result<Self> {
        // Buffers are defined by their size (in bytes), their
        // usage (as vertex buffers, index buffers, transfer
        // sources, etc) and their sharing mode: either owned by
        // one queue family at a time (EXCLUSIVE), or accessed
        // concurrently by the listed queue families (CONCURRENT).
        let sharing_mode = if queue_families.is_empty() {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        };

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(queue_families);

        let buffer = device.create_buffer(&buffer_info, None)?;

        Ok(Self {
            handle: Scoped::new(device, buffer),
            size,
            binding: PoolBinding::default(),
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle.get()
    }

    /// Pool the buffer memory was allocated from, if any.
    pub fn pool(&self) -> Option<PoolId> {
        self.binding.pool()
    }

    /// Allocate the buffer memory from a pool and bind it.
    pub fn allocate_from<D: MemoryDevice>(&mut self, pool: &mut MemoryPool<D>) -> Result<(), MemoryError> {
        let mut binding = self.binding;
        let result = binding.allocate(pool, &*self);
        self.binding = binding;
        result
    }

    /// Give the buffer memory back to its pool.
    pub fn free_memory<D: MemoryDevice>(&mut self, pool: &mut MemoryPool<D>) -> Result<(), MemoryError> {
        let mut binding = self.binding;
        let result = binding.free(pool, &*self);
        self.binding = binding;
        result
    }

    /// Map the whole buffer memory.
    pub fn map<D: MemoryDevice>(&self, pool: &mut MemoryPool<D>) -> Result<*mut u8, MemoryError> {
        self.map_range(pool, 0, self.size)
    }

    /// Map `length` bytes of the buffer memory, from `offset`.
    pub fn map_range<D: MemoryDevice>(
        &self,
        pool: &mut MemoryPool<D>,
        offset: u64,
        length: u64,
    ) -> Result<*mut u8, MemoryError> {
        self.binding.check(pool, self.id())?;
        pool.map(self, offset, length)
    }

    pub fn unmap<D: MemoryDevice>(&self, pool: &mut MemoryPool<D>) -> Result<(), MemoryError> {
        self.binding.check(pool, self.id())?;
        pool.unmap()
    }

    /// Copy a slice of plain values into the buffer memory, at
    /// `offset` bytes from its start.
    pub fn write<D: MemoryDevice, T: Copy>(
        &self,
        pool: &mut MemoryPool<D>,
        offset: u64,
        data: &[T],
    ) -> Result<(), MemoryError> {
        self.binding.check(pool, self.id())?;
        pool.write_values(self, offset, data)
    }
}

/// Which pool, if any, holds the memory of a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolBinding(Option<PoolId>);

impl PoolBinding {
    pub fn pool(&self) -> Option<PoolId> {
        self.0
    }

    pub fn is_bound(&self) -> bool {
        self.0.is_some()
    }

    /// Allocate the memory of `resource` from `pool`, and remember
    /// the pool on success.
    pub fn allocate<D: MemoryDevice, R: Resource + ?Sized>(
        &mut self,
        pool: &mut MemoryPool<D>,
        resource: &R,
    ) -> Result<(), MemoryError> {
        if self.0.is_some() {
            error!("Buffer already has allocated memory.");
            return Err(MemoryError::AlreadyAllocated(resource.id()));
        }

        pool.allocate(resource)?;
        self.0 = Some(pool.id());

        Ok(())
    }

    /// Give the memory of `resource` back to its pool.
    pub fn free<D: MemoryDevice, R: Resource + ?Sized>(
        &mut self,
        pool: &mut MemoryPool<D>,
        resource: &R,
    ) -> Result<(), MemoryError> {
        match self.0 {
            None => {
                error!("Attempting to free unallocated buffer memory.");
                return Err(MemoryError::FreeOfUnallocatedResource(resource.id()));
            }
            Some(id) if id != pool.id() => return Err(MemoryError::WrongPool),
            Some(_) => (),
        }

        match pool.free(resource) {
            Ok(_) => {
                self.0 = None;
                Ok(())
            }
            // Destroying the pool already released every chunk.
            Err(MemoryError::InvalidPoolUse) => {
                self.0 = None;
                Err(MemoryError::InvalidPoolUse)
            }
            Err(e) => Err(e),
        }
    }

    pub fn check<D: MemoryDevice>(&self, pool: &MemoryPool<D>, owner: ResourceId) -> Result<(), MemoryError> {
        match self.0 {
            Some(id) if id == pool.id() => Ok(()),
            Some(_) => Err(MemoryError::WrongPool),
            None => Err(MemoryError::UnallocatedResource(owner)),
        }
    }
}

impl Resource for Buffer {
    fn id(&self) -> ResourceId {
        self.handle.get().as_raw()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn memory_requirements(&self) -> vk::MemoryRequirements {
        // The requirements give the size of the memory to
        // allocate (which may be larger than the buffer size), the
        // alignment of the buffer offset within the memory, and a
        // bit field of the memory types that are suitable.
        unsafe {
            self.handle
                .device()
                .get_buffer_memory_requirements(self.handle.get())
        }
    }

    fn bind_memory(&self, memory: vk::DeviceMemory, offset: u64) -> Result<(), vk::ErrorCode> {
        unsafe {
            self.handle
                .device()
                .bind_buffer_memory(self.handle.get(), memory, offset)
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.binding.is_bound() {
            warn!("Buffer destroyed while its memory is still allocated in a pool.");
        }
    }
}
