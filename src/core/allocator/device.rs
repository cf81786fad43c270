use vulkanalia::prelude::v1_0::*;

use super::MemoryDevice;

/// Memory device backed by a Vulkan logical device.
#[derive(Clone)]
pub struct VulkanMemory {
    device: Device,
    properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanMemory {
    /// # Safety
    ///
    /// The device must have been created from `physical_device`
    /// and must outlive every pool using this memory device.
    pub unsafe fn new(
        instance: &Instance,
        device: &Device,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        // The memory properties of the physical device list both
        // the memory heaps (the distinct memory resources, like
        // VRAM and system RAM) and the memory types that live in
        // these heaps, each with its own property flags.
        let properties = instance.get_physical_device_memory_properties(physical_device);

        Self {
            device: device.clone(),
            properties,
        }
    }
}

unsafe impl MemoryDevice for VulkanMemory {
    fn memory_types(&self) -> Vec<vk::MemoryPropertyFlags> {
        // Only the first `memory_type_count` entries of the array
        // are meaningful.
        self.properties.memory_types
            .iter()
            .take(self.properties.memory_type_count as usize)
            .map(|memory_type| memory_type.property_flags)
            .collect()
    }

    fn allocate_block(&mut self, size: u64, memory_type: u32) -> Result<vk::DeviceMemory, vk::ErrorCode> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);

        unsafe { self.device.allocate_memory(&info, None) }
    }

    fn free_block(&mut self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn map_block_range(
        &mut self,
        memory: vk::DeviceMemory,
        offset: u64,
        length: u64,
    ) -> Result<*mut u8, vk::ErrorCode> {
        let ptr = unsafe {
            self.device.map_memory(
                memory,
                offset,
                length,
                vk::MemoryMapFlags::empty(),
            )?
        };

        Ok(ptr.cast())
    }

    fn unmap_block(&mut self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }
}
