use vulkanalia::vk;
use log::*;

use super::{
    chunks::{Chunk, ChunkList},
    select_memory_type,
    MemoryDevice,
    MemoryError,
    PoolId,
    Resource,
    ResourceId,
};

/// A single block of device memory of fixed capacity, carved into
/// chunks bound to resources.
///
/// Chunks are placed first-fit: the pool is meant to hold a small
/// and fairly static set of long-lived buffers, so fragmentation
/// is accepted and nothing is ever compacted. A pool is not meant
/// to be shared between threads; only one mapping of its memory
/// may be active at a time.
pub struct MemoryPool<D: MemoryDevice> {
    id: PoolId,
    device: D,
    /// Backing memory block; `None` once the pool is destroyed.
    memory: Option<vk::DeviceMemory>,
    memory_type: u32,
    capacity: u64,
    chunks: ChunkList,
    mapped: bool,
}

impl<D: MemoryDevice> MemoryPool<D> {
    /// Create a pool of `capacity` bytes, from the first memory
    /// type allowed by `type_filter` that has the `required`
    /// properties.
    pub fn create(
        mut device: D,
        capacity: u64,
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<Self, MemoryError> {
        if capacity == 0 {
            return Err(MemoryError::InvalidRequirements("pool capacity must be non-zero"));
        }

        // The memory type is chosen once and for all: the whole
        // block comes from it, so every resource allocated from
        // the pool must accept it.
        let memory_type = select_memory_type(&device.memory_types(), type_filter, required)
            .ok_or_else(|| {
                error!("Cannot find suitable memory type.");
                MemoryError::NoCompatibleMemoryType {
                    filter: type_filter,
                    required,
                }
            })?;

        // Then, the single backing block is allocated with the
        // exact capacity of the pool; it is never grown.
        let memory = device
            .allocate_block(capacity, memory_type)
            .map_err(|e| {
                error!("Cannot allocate pool memory: {e}");
                MemoryError::BackingAllocationFailed(e)
            })?;

        debug!("Created memory pool of {capacity} bytes with memory type {memory_type}.");
        Ok(Self {
            id: PoolId::next(),
            device,
            memory: Some(memory),
            memory_type,
            capacity,
            chunks: ChunkList::new(),
            mapped: false,
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.memory.is_some()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Number of bytes currently bound to resources.
    pub fn allocated(&self) -> u64 {
        self.chunks.allocated()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Live chunks, in ascending offset order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn chunk_of(&self, resource: ResourceId) -> Option<&Chunk> {
        self.chunks.get(resource)
    }

    /// Size of the largest free range of the pool, alignment aside.
    pub fn largest_free_gap(&self) -> u64 {
        self.chunks.largest_gap(self.capacity)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Allocate memory for a resource and bind it, returning the
    /// chunk the resource now owns.
    ///
    /// On failure, the pool is left unchanged.
    pub fn allocate<R: Resource + ?Sized>(&mut self, resource: &R) -> Result<Chunk, MemoryError> {
        let memory = self.memory()?;
        let owner = resource.id();

        if self.chunks.contains(owner) {
            error!("Buffer already has allocated memory.");
            return Err(MemoryError::AlreadyAllocated(owner));
        }

        // The requirements tell us the size of the memory to
        // reserve, the alignment of its offset within the block,
        // and which memory types the resource can be bound to;
        // the type of the pool has to be one of them.
        let requirements = resource.memory_requirements();
        if requirements.memory_type_bits & (1 << self.memory_type) == 0 {
            return Err(MemoryError::IncompatibleResource {
                memory_type: self.memory_type,
                type_bits: requirements.memory_type_bits,
            });
        }

        let size = requirements.size;
        if size == 0 {
            return Err(MemoryError::InvalidRequirements("resource size must be non-zero"));
        }
        let alignment = requirements.alignment.max(1);

        // Find the first gap where the resource fits, walking the
        // chunks in offset order.
        let offset = self
            .chunks
            .find_fit(size, alignment, self.capacity)
            .ok_or_else(|| {
                let largest_gap = self.chunks.largest_gap(self.capacity);
                error!("Cannot allocate buffer memory in pool.");
                MemoryError::NoFittingGapFound { size, alignment, largest_gap }
            })?;

        // The chunk is only recorded once the resource is
        // actually bound to the memory.
        resource
            .bind_memory(memory, offset)
            .map_err(MemoryError::BindFailed)?;

        let chunk = Chunk { offset, size, owner };
        self.chunks.insert(chunk);

        debug!("Allocated {size} bytes at offset {offset} for resource {owner:#x}.");
        Ok(chunk)
    }

    /// Release the chunk owned by a resource.
    pub fn free<R: Resource + ?Sized>(&mut self, resource: &R) -> Result<Chunk, MemoryError> {
        self.free_id(resource.id())
    }

    /// Release the chunk owned by the resource with the given id.
    ///
    /// Freeing a resource that has no memory in the pool is a
    /// programming error, but teardown order sometimes makes it
    /// unavoidable, so it is only reported.
    pub fn free_id(&mut self, owner: ResourceId) -> Result<Chunk, MemoryError> {
        self.memory()?;

        let chunk = self.chunks.remove(owner).ok_or_else(|| {
            error!("Attempting to free unallocated buffer memory.");
            MemoryError::FreeOfUnallocatedResource(owner)
        })?;

        debug!("Freed {} bytes at offset {} of resource {owner:#x}.", chunk.size, chunk.offset);
        Ok(chunk)
    }

    /// Map `length` bytes of the memory of a resource, starting
    /// `offset` bytes into its chunk.
    ///
    /// The memory type of the pool must be host-visible. Only one
    /// range of the pool may be mapped at a time: it is up to the
    /// caller to call [`MemoryPool::unmap`] before mapping again.
    pub fn map<R: Resource + ?Sized>(
        &mut self,
        resource: &R,
        offset: u64,
        length: u64,
    ) -> Result<*mut u8, MemoryError> {
        let memory = self.memory()?;
        let owner = resource.id();

        let chunk = *self
            .chunks
            .get(owner)
            .ok_or(MemoryError::UnallocatedResource(owner))?;

        if cfg!(debug_assertions) && offset.saturating_add(length) > resource.size() {
            warn!("Buffer memory map region exceeds buffer size.");
        }
        if self.mapped {
            warn!("Mapping pool memory while another range is still mapped.");
        }

        // An offset that overflows cannot name any part of the block.
        let start = chunk.offset.checked_add(offset).ok_or_else(|| {
            error!("Cannot map buffer memory: offset {offset} is out of range.");
            MemoryError::MapFailed(vk::ErrorCode::MEMORY_MAP_FAILED)
        })?;

        let ptr = self
            .device
            .map_block_range(memory, start, length)
            .map_err(|e| {
                error!("Cannot map buffer memory: {e}");
                MemoryError::MapFailed(e)
            })?;

        self.mapped = true;
        Ok(ptr)
    }

    /// Release the active mapping of the pool memory.
    pub fn unmap(&mut self) -> Result<(), MemoryError> {
        let memory = self.memory()?;

        if !self.mapped {
            warn!("Unmapping pool memory that is not mapped.");
            return Ok(());
        }

        self.device.unmap_block(memory);
        self.mapped = false;
        Ok(())
    }

    /// Copy bytes into the memory of a resource, starting `offset`
    /// bytes into its chunk.
    pub fn write<R: Resource + ?Sized>(
        &mut self,
        resource: &R,
        offset: u64,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let ptr = self.map(resource, offset, data.len() as u64)?;

        // The device guarantees that the mapped pointer is valid
        // for the whole requested length.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }

        self.unmap()
    }

    /// Copy a slice of plain values into the memory of a resource,
    /// starting `offset` bytes into its chunk. Padding bytes of `T`
    /// are copied as they are.
    pub fn write_values<R: Resource + ?Sized, T: Copy>(
        &mut self,
        resource: &R,
        offset: u64,
        data: &[T],
    ) -> Result<(), MemoryError> {
        let length = std::mem::size_of_val(data);
        let ptr = self.map(resource, offset, length as u64)?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr().cast::<u8>(), ptr, length);
        }

        self.unmap()
    }

    /// Copy bytes out of the memory of a resource, starting
    /// `offset` bytes into its chunk.
    pub fn read<R: Resource + ?Sized>(
        &mut self,
        resource: &R,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), MemoryError> {
        let ptr = self.map(resource, offset, data.len() as u64)?;

        unsafe {
            std::ptr::copy_nonoverlapping(ptr.cast_const(), data.as_mut_ptr(), data.len());
        }

        self.unmap()
    }

    /// Free the backing memory. All chunks are invalidated, and
    /// the pool cannot be used anymore.
    pub fn destroy(&mut self) {
        let Some(memory) = self.memory.take() else {
            return;
        };

        if self.mapped {
            self.device.unmap_block(memory);
            self.mapped = false;
        }

        if !self.chunks.is_empty() {
            warn!(
                "Destroying memory pool with {} live allocations ({} bytes).",
                self.chunks.len(),
                self.chunks.allocated()
            );
        }
        self.chunks.clear();

        self.device.free_block(memory);
        debug!("Destroyed memory pool of {} bytes.", self.capacity);
    }

    fn memory(&self) -> Result<vk::DeviceMemory, MemoryError> {
        self.memory.ok_or_else(|| {
            error!("Using a memory pool that is not valid.");
            MemoryError::InvalidPoolUse
        })
    }
}

impl<D: MemoryDevice> Drop for MemoryPool<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::allocator::host::{HostDevice, HostResource};

    fn host_pool(capacity: u64) -> MemoryPool<HostDevice> {
        MemoryPool::create(
            HostDevice::new(),
            capacity,
            !0,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap()
    }

    fn offsets(pool: &MemoryPool<HostDevice>) -> Vec<u64> {
        pool.chunks().map(|c| c.offset).collect()
    }

    #[test]
    fn create_selects_memory_type_and_allocates_block() {
        let pool = host_pool(1024);

        assert!(pool.is_valid());
        assert_eq!(pool.memory_type(), 1);
        assert_eq!(pool.capacity(), 1024);
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.device().live_blocks(), 1);
    }

    #[test]
    fn create_without_compatible_type_fails() {
        let result = MemoryPool::create(
            HostDevice::new(),
            1024,
            0b001,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        );

        assert!(matches!(result, Err(MemoryError::NoCompatibleMemoryType { .. })));
    }

    #[test]
    fn create_with_failing_backing_allocation_fails() {
        let device = HostDevice::new().failing_allocations();
        let result = MemoryPool::create(device, 1024, !0, vk::MemoryPropertyFlags::DEVICE_LOCAL);

        assert!(matches!(
            result,
            Err(MemoryError::BackingAllocationFailed(vk::ErrorCode::OUT_OF_DEVICE_MEMORY))
        ));
    }

    #[test]
    fn create_with_zero_capacity_fails() {
        let result = MemoryPool::create(HostDevice::new(), 0, !0, vk::MemoryPropertyFlags::empty());

        assert!(matches!(result, Err(MemoryError::InvalidRequirements(_))));
    }

    #[test]
    fn reference_scenario() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 300, 16);
        let b = HostResource::new(2, 300, 16);
        let c = HostResource::new(3, 250, 16);
        let d = HostResource::new(4, 500, 16);

        assert_eq!(pool.allocate(&a).unwrap().offset, 0);
        assert_eq!(pool.allocate(&b).unwrap().offset, 304);

        pool.free(&a).unwrap();
        assert_eq!(pool.allocate(&c).unwrap().offset, 0);

        let before = offsets(&pool);
        assert!(matches!(
            pool.allocate(&d),
            Err(MemoryError::NoFittingGapFound { size: 500, alignment: 16, .. })
        ));
        assert_eq!(offsets(&pool), before);
        assert!(pool.chunk_of(d.id()).is_none());
    }

    #[test]
    fn allocation_binds_resource_at_chunk_offset() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 64);
        let b = HostResource::new(2, 100, 64);

        pool.allocate(&a).unwrap();
        pool.allocate(&b).unwrap();

        assert_eq!(a.bound().map(|(_, offset)| offset), Some(0));
        assert_eq!(b.bound().map(|(_, offset)| offset), Some(128));
        assert_eq!(pool.allocated(), 200);
    }

    #[test]
    fn failed_bind_leaves_pool_unchanged() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16).failing_bind();

        assert!(matches!(pool.allocate(&a), Err(MemoryError::BindFailed(_))));
        assert_eq!(pool.chunk_count(), 0);
        assert!(pool.chunk_of(1).is_none());
        assert!(a.bound().is_none());
    }

    #[test]
    fn incompatible_resource_is_rejected() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16).with_type_bits(0b001);

        assert!(matches!(
            pool.allocate(&a),
            Err(MemoryError::IncompatibleResource { memory_type: 1, type_bits: 0b001 })
        ));
        assert_eq!(pool.chunk_count(), 0);
    }

    #[test]
    fn zero_sized_resource_is_rejected() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 0, 16);

        assert!(matches!(pool.allocate(&a), Err(MemoryError::InvalidRequirements(_))));
    }

    #[test]
    fn zero_alignment_is_treated_as_one() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 3, 0);
        let b = HostResource::new(2, 3, 0);

        pool.allocate(&a).unwrap();
        assert_eq!(pool.allocate(&b).unwrap().offset, 3);
    }

    #[test]
    fn allocating_twice_is_rejected() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);

        pool.allocate(&a).unwrap();
        assert!(matches!(pool.allocate(&a), Err(MemoryError::AlreadyAllocated(1))));
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn free_of_unallocated_resource_is_reported() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);

        assert!(matches!(pool.free(&a), Err(MemoryError::FreeOfUnallocatedResource(1))));

        pool.allocate(&a).unwrap();
        pool.free(&a).unwrap();
        assert!(matches!(pool.free(&a), Err(MemoryError::FreeOfUnallocatedResource(1))));
    }

    #[test]
    fn map_round_trip() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);
        let b = HostResource::new(2, 64, 16);
        pool.allocate(&a).unwrap();
        pool.allocate(&b).unwrap();

        let data: Vec<u8> = (0..64).collect();
        pool.write(&b, 0, &data).unwrap();

        let mut read_back = vec![0; 64];
        pool.read(&b, 0, &mut read_back).unwrap();
        assert_eq!(read_back, data);

        // The data landed in the chunk of `b`, not at the start
        // of the block.
        let mut first = vec![0xff; 16];
        pool.read(&a, 0, &mut first).unwrap();
        assert!(first.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn map_offsets_into_chunk() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);
        let b = HostResource::new(2, 100, 16);
        pool.allocate(&a).unwrap();
        pool.allocate(&b).unwrap();

        pool.write(&b, 10, &[1, 2, 3]).unwrap();

        let mut whole = vec![0; 16];
        pool.read(&b, 0, &mut whole).unwrap();
        assert_eq!(&whole[10..13], &[1, 2, 3]);
        assert_eq!(pool.device().block_bytes()[112 + 10], 1);
    }

    #[test]
    fn write_values_copies_padded_structs() {
        #[repr(C)]
        #[derive(Clone, Copy)]
        struct Padded {
            tag: u8,
            value: u32,
        }

        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 64, 16);
        pool.allocate(&a).unwrap();

        let data = [Padded { tag: 7, value: 0x0102_0304 }, Padded { tag: 9, value: 5 }];
        pool.write_values(&a, 0, &data).unwrap();

        // Only the fields are read back, never the padding.
        let mut tag = [0; 1];
        let mut value = [0; 4];
        pool.read(&a, 0, &mut tag).unwrap();
        pool.read(&a, 4, &mut value).unwrap();
        assert_eq!((tag[0], u32::from_ne_bytes(value)), (7, 0x0102_0304));

        pool.read(&a, 8, &mut tag).unwrap();
        pool.read(&a, 12, &mut value).unwrap();
        assert_eq!((tag[0], u32::from_ne_bytes(value)), (9, 5));
    }

    #[test]
    fn map_beyond_resource_size_still_maps() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);
        pool.allocate(&a).unwrap();

        assert!(pool.map(&a, 50, 100).is_ok());
        pool.unmap().unwrap();
    }

    #[test]
    fn map_with_overflowing_offset_fails() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);
        let b = HostResource::new(2, 100, 16);
        pool.allocate(&a).unwrap();
        pool.allocate(&b).unwrap();

        assert!(matches!(
            pool.map(&b, u64::MAX, 1),
            Err(MemoryError::MapFailed(vk::ErrorCode::MEMORY_MAP_FAILED))
        ));

        // Nothing was mapped, so a later mapping works as usual.
        assert!(pool.map(&b, 0, 100).is_ok());
        pool.unmap().unwrap();
    }

    #[test]
    fn map_of_unallocated_resource_fails() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);

        assert!(matches!(pool.map(&a, 0, 100), Err(MemoryError::UnallocatedResource(1))));
    }

    #[test]
    fn map_of_device_local_pool_fails() {
        let mut pool = MemoryPool::create(
            HostDevice::new(),
            1024,
            !0,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();
        let a = HostResource::new(1, 100, 16);
        pool.allocate(&a).unwrap();

        assert!(matches!(
            pool.map(&a, 0, 100),
            Err(MemoryError::MapFailed(vk::ErrorCode::MEMORY_MAP_FAILED))
        ));
    }

    #[test]
    fn destroyed_pool_fails_fast() {
        let mut pool = host_pool(1024);
        let a = HostResource::new(1, 100, 16);
        pool.allocate(&a).unwrap();

        pool.destroy();

        assert!(!pool.is_valid());
        assert_eq!(pool.chunk_count(), 0);
        assert_eq!(pool.device().live_blocks(), 0);
        assert!(matches!(pool.allocate(&a), Err(MemoryError::InvalidPoolUse)));
        assert!(matches!(pool.free(&a), Err(MemoryError::InvalidPoolUse)));
        assert!(matches!(pool.map(&a, 0, 1), Err(MemoryError::InvalidPoolUse)));
        assert!(matches!(pool.unmap(), Err(MemoryError::InvalidPoolUse)));

        // Destroying again is a no-op.
        pool.destroy();
    }
}
