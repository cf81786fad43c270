use crate::core::{
    buffer::Buffer,
    context::Context,
    handle::{Rollback, Scoped},
};

use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

/// Command pool on the graphics queue family, for one-time
/// transfer operations.
pub struct TransferCommands {
    pool: Scoped<vk::CommandPool>,
    queue: vk::Queue,
}

impl TransferCommands {
    /// # Safety
    ///
    /// The context must outlive the returned command pool.
    pub unsafe fn create(context: &Context) -> Result<Self> {
        // Command buffers are not allocated directly, but from a
        // command pool tied to a queue family. The TRANSIENT flag
        // hints that the buffers are short-lived: each one is
        // recorded, submitted once and freed.
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(context.graphics_queue_family());

        let pool = context.device().create_command_pool(&info, None)?;

        Ok(Self {
            pool: Scoped::new(context.device(), pool),
            queue: context.graphics_queue(),
        })
    }

    /// Copy `size` bytes from the start of `source` to the start of
    /// `destination`, and wait for the copy to complete.
    ///
    /// # Safety
    ///
    /// Both buffers must have memory bound, with TRANSFER_SRC and
    /// TRANSFER_DST usages respectively.
    pub unsafe fn copy_buffer(
        &self,
        source: &Buffer,
        destination: &Buffer,
        size: vk::DeviceSize,
    ) -> Result<()> {
        let command_buffer = self.begin_single_command()?;

        // A copy can have several regions, each made of a source
        // offset, a destination offset and a size.
        let regions = vk::BufferCopy::builder().size(size);
        self.pool.device().cmd_copy_buffer(
            command_buffer,
            source.handle(),
            destination.handle(),
            &[regions],
        );

        self.end_single_command(command_buffer)?;

        debug!("Copied {size} bytes between buffers.");
        Ok(())
    }

    unsafe fn begin_single_command(&self) -> Result<vk::CommandBuffer> {
        let device = self.pool.device();

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool.get())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = device.allocate_command_buffers(&allocate_info)?[0];
        let rollback = Rollback::new(|| device.free_command_buffers(self.pool.get(), &[command_buffer]));

        // The command buffer is only submitted once, then freed.
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        device.begin_command_buffer(command_buffer, &info)?;
        rollback.commit();

        Ok(command_buffer)
    }

    unsafe fn end_single_command(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let device = self.pool.device();

        // Submit the command buffer and wait for the queue to be
        // idle, which is simpler than a fence for a one-off
        // operation. The command buffer is freed whatever the
        // outcome.
        let command_buffers = &[command_buffer];
        let info = vk::SubmitInfo::builder()
            .command_buffers(command_buffers);

        let result = device
            .end_command_buffer(command_buffer)
            .and_then(|_| device.queue_submit(self.queue, &[info], vk::Fence::null()))
            .and_then(|_| device.queue_wait_idle(self.queue));

        device.free_command_buffers(self.pool.get(), command_buffers);
        result?;

        Ok(())
    }
}
