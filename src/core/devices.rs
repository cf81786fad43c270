use std::ffi::c_char;

use thiserror::Error;
use vulkanalia::prelude::v1_0::*;
use anyhow::{anyhow, Result};
use log::*;

use crate::core::context::PORTABILITY_MACOS_VERSION;

/// Name of `VK_KHR_portability_subset`, which vulkanalia only
/// exposes with its provisional extensions.
pub const PORTABILITY_SUBSET_EXTENSION: &[u8] = b"VK_KHR_portability_subset\0";

// The macro will create an error type with a Display impl that
// prints the given string.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SuitabilityError(pub &'static str);

pub fn get_graphics_family_index(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    // Almost every operation in Vulkan requires commands to be
    // submitted to a queue, and each queue family only allows a
    // subset of commands. We want a family that supports
    // graphics operations, which also implies support for
    // transfer operations such as buffer copies.
    let queues = unsafe {
        instance.get_physical_device_queue_family_properties(physical_device)
    };

    queues
        .iter()
        .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
        .ok_or_else(|| anyhow!(SuitabilityError("Missing graphics queue family.")))
}

pub fn pick_physical_device(instance: &Instance) -> Result<(vk::PhysicalDevice, u32)> {
    // There can be more than one graphics device on the system
    // (one dedicated and one integrated graphics card at the
    // same time, for example); we pick the first one that has a
    // graphics queue family.
    for device in unsafe { instance.enumerate_physical_devices()? } {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        match get_graphics_family_index(instance, device) {
            Ok(family) => {
                info!("Selected physical device: {}", properties.device_name);
                return Ok((device, family));
            }
            Err(error) => {
                warn!("Skipping physical device ({}): {}", properties.device_name, error);
            }
        }
    }

    Err(anyhow!(SuitabilityError("Failed to find suitable physical device.")))
}

pub fn create_logical_device(
    entry: &Entry,
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    layers: &[*const c_char],
) -> Result<(Device, vk::Queue)> {
    // The logical device is the interface between the physical
    // device and the application. We only need one queue from
    // the graphics family; its priority has to be given anyway.
    let priorities = &[1.0];
    let queue_infos = &[
        vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(priorities)
            .build()
    ];

    // Some implementations are not fully conformant, and need
    // the portability subset extension to be enabled.
    let mut extensions = Vec::new();
    if cfg!(target_os = "macos") && entry.version()? >= PORTABILITY_MACOS_VERSION {
        extensions.push(PORTABILITY_SUBSET_EXTENSION.as_ptr().cast::<c_char>());
    }

    // Device-specific layers are deprecated, but setting them
    // keeps older implementations happy.
    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(queue_infos)
        .enabled_layer_names(layers)
        .enabled_extension_names(&extensions);

    let device = unsafe { instance.create_device(physical_device, &info, None)? };
    let queue = unsafe { device.get_device_queue(graphics_family, 0) };

    info!("Logical device created.");
    Ok((device, queue))
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;

    #[test]
    fn portability_subset_name_is_nul_terminated() {
        let name = CStr::from_bytes_with_nul(PORTABILITY_SUBSET_EXTENSION).unwrap();
        assert_eq!(name.to_str().unwrap(), "VK_KHR_portability_subset");
    }
}
