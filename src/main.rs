mod vertex;

use vkpool::core::{
    allocator::{device::VulkanMemory, MemoryPool, Resource},
    buffer::Buffer,
    commands::TransferCommands,
    context::{Context, ContextConfig},
};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

use vertex::{INDICES, VERTICES};

/// Size of the host-visible pool the staging buffer is allocated
/// from.
const HOST_POOL_SIZE: u64 = 1024;
/// Size of the device-local pool for geometry buffers.
const DEVICE_POOL_SIZE: u64 = 64 * 1024;

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let mut context = unsafe { Context::create(&ContextConfig::default())? };
    let result = unsafe { upload_geometry(&context) };

    // Everything created from the device has been dropped at the
    // end of the upload, so the context can go.
    context.destroy();
    result
}

unsafe fn upload_geometry(context: &Context) -> Result<()> {
    let vertex_size = std::mem::size_of_val(VERTICES.as_slice()) as u64;
    let index_size = std::mem::size_of_val(INDICES) as u64;
    let size = vertex_size + index_size;

    // The geometry is first written to a staging buffer in
    // host-visible memory, then copied to a buffer in
    // device-local memory, which is faster to read for the GPU.
    let mut staging = Buffer::create(
        context.device(),
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        &[],
    )?;
    let mut geometry = Buffer::create(
        context.device(),
        size,
        vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER,
        &[],
    )?;

    // Each pool gets a single block of memory whose type suits
    // the buffers it will hold.
    let memory = VulkanMemory::new(context.instance(), context.device(), context.physical_device());
    let mut host_pool = MemoryPool::create(
        memory.clone(),
        HOST_POOL_SIZE,
        staging.memory_requirements().memory_type_bits,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    let mut device_pool = MemoryPool::create(
        memory,
        DEVICE_POOL_SIZE,
        geometry.memory_requirements().memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    staging.allocate_from(&mut host_pool)?;
    geometry.allocate_from(&mut device_pool)?;

    // The host pool memory is coherent, so the writes are visible
    // to the device as soon as the memory is unmapped.
    staging.write(&mut host_pool, 0, VERTICES.as_slice())?;
    staging.write(&mut host_pool, vertex_size, INDICES)?;

    let transfer = TransferCommands::create(context)?;
    transfer.copy_buffer(&staging, &geometry, size)?;

    info!(
        "Uploaded {} vertices and {} indices ({size} bytes).",
        VERTICES.len(),
        INDICES.len()
    );
    info!(
        "Host pool: {}/{} bytes in {} chunks; device pool: {}/{} bytes in {} chunks.",
        host_pool.allocated(),
        host_pool.capacity(),
        host_pool.chunk_count(),
        device_pool.allocated(),
        device_pool.capacity(),
        device_pool.chunk_count(),
    );

    staging.free_memory(&mut host_pool)?;
    geometry.free_memory(&mut device_pool)?;

    Ok(())
}
