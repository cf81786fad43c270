use vulkanalia::prelude::v1_0::*;

/// Vulkan handle that is destroyed through the logical device it
/// was created from.
pub trait Destroy: Copy {
    /// # Safety
    ///
    /// The handle must have been created from `device` and must no
    /// longer be in use by the GPU.
    unsafe fn destroy(self, device: &Device);
}

impl Destroy for vk::Buffer {
    unsafe fn destroy(self, device: &Device) {
        device.destroy_buffer(self, None);
    }
}

impl Destroy for vk::CommandPool {
    unsafe fn destroy(self, device: &Device) {
        device.destroy_command_pool(self, None);
    }
}

/// Owner of a Vulkan handle, which is destroyed when the owner is
/// dropped.
pub struct Scoped<T: Destroy> {
    device: Device,
    handle: T,
}

impl<T: Destroy> Scoped<T> {
    /// # Safety
    ///
    /// The handle must have been created from `device`, and the
    /// device must outlive the returned owner.
    pub unsafe fn new(device: &Device, handle: T) -> Self {
        Self {
            device: device.clone(),
            handle,
        }
    }

    pub fn get(&self) -> T {
        self.handle
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl<T: Destroy> Drop for Scoped<T> {
    fn drop(&mut self) {
        unsafe { self.handle.destroy(&self.device) }
    }
}

/// Cleanup that runs when dropped, unless it was committed first.
/// Guards objects created early in a constructor against a later
/// step failing.
pub struct Rollback<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> Rollback<F> {
    pub fn new(cleanup: F) -> Self {
        Self { cleanup: Some(cleanup) }
    }

    /// Keep what was created: the cleanup never runs.
    pub fn commit(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for Rollback<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn build(fail: bool, cleanups: &Cell<u32>) -> Result<(), &'static str> {
        let rollback = Rollback::new(|| cleanups.set(cleanups.get() + 1));
        if fail {
            return Err("later step failed");
        }
        rollback.commit();
        Ok(())
    }

    #[test]
    fn rollback_runs_on_early_return() {
        let cleanups = Cell::new(0);
        assert!(build(true, &cleanups).is_err());
        assert_eq!(cleanups.get(), 1);
    }

    #[test]
    fn committed_rollback_does_nothing() {
        let cleanups = Cell::new(0);
        assert!(build(false, &cleanups).is_ok());
        assert_eq!(cleanups.get(), 0);
    }
}
