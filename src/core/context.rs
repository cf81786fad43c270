use std::collections::HashSet;
use std::ffi::CString;

use vulkanalia::{
    prelude::v1_0::*,
    loader::{LibloadingLoader, LIBRARY},
    Version,
    vk::{ExtDebugUtilsExtension, Handle},
};
use anyhow::{anyhow, Result};
use log::*;

use crate::core::{
    devices::{create_logical_device, pick_physical_device},
    handle::Rollback,
};

pub const VALIDATION_ENABLED: bool = cfg!(debug_assertions);
pub const VALIDATION_LAYER: vk::ExtensionName = vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");
pub const PORTABILITY_MACOS_VERSION: Version = Version::new(1, 3, 216);

/// Environment variable that disables the validation layers even
/// in debug builds.
pub const NO_VALIDATION_VAR: &str = "VKPOOL_NO_VALIDATION";

/// Settings used to create a [`Context`].
#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub application_name: String,
    /// Enable the Khronos validation layers, if they are installed.
    pub validation: bool,
    /// Vulkan API version, as given by `vk::make_version`.
    pub api_version: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            application_name: String::from("vkpool"),
            validation: VALIDATION_ENABLED && std::env::var_os(NO_VALIDATION_VAR).is_none(),
            api_version: vk::make_version(1, 0, 0),
        }
    }
}

/// Vulkan instance, device and queue, created and destroyed
/// explicitly. Everything created from the device (buffers, memory
/// pools, command pools) must be dropped before the context is
/// destroyed.
pub struct Context {
    // - Entry: the Vulkan entry point, loaded from the Vulkan
    //   library
    // - Instance: the handle to the Vulkan library
    // - Debug messenger: forwards validation layer messages to
    //   the log (null if validation is disabled)
    // - Physical device: the graphics card in use
    // - Device: the logical device, to create other objects
    // - Graphics queue: where commands are submitted, along with
    //   the index of its family
    entry: Entry,
    instance: Instance,
    debug_messenger: vk::DebugUtilsMessengerEXT,
    physical_device: vk::PhysicalDevice,
    device: Device,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    destroyed: bool,
}

impl Context {
    /// # Safety
    ///
    /// Loads and calls into the system Vulkan library.
    pub unsafe fn create(config: &ContextConfig) -> Result<Self> {
        // To create a Vulkan instance, we first need a loader
        // for the initial commands of the Vulkan library, from
        // which we get the entry point.
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;

        let (instance, debug_messenger, layers) = create_instance(&entry, config)?;
        let rollback = Rollback::new(|| destroy_instance(&instance, debug_messenger));

        // Then, we pick a physical device and create the logical
        // device that interfaces it with the application.
        let (physical_device, graphics_queue_family) = pick_physical_device(&instance)?;
        let layer_names = layers.iter().map(|l| l.as_ptr()).collect::<Vec<_>>();
        let (device, graphics_queue) = create_logical_device(
            &entry,
            &instance,
            physical_device,
            graphics_queue_family,
            &layer_names,
        )?;
        rollback.commit();

        Ok(Self {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            destroyed: false,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Wait for the device to be idle, then destroy the device and
    /// the instance. Calling it again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("Failed to wait for device idle: {e}");
            }
            self.device.destroy_device(None);
            destroy_instance(&self.instance, self.debug_messenger);
        }
        info!("Destroyed the Vulkan instance.");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

unsafe fn create_instance(
    entry: &Entry,
    config: &ContextConfig,
) -> Result<(Instance, vk::DebugUtilsMessengerEXT, Vec<vk::ExtensionName>)> {
    // Validation layers hook into Vulkan calls to check for
    // misuse of the API; they are only available if they are
    // installed on the system, so we check for them first.
    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();

    let validation = if config.validation && !available_layers.contains(&VALIDATION_LAYER) {
        warn!("Validation layer not available, continuing without it.");
        false
    } else {
        config.validation
    };

    let layers = if validation {
        vec![VALIDATION_LAYER]
    } else {
        Vec::new()
    };
    let layer_names = layers.iter().map(|l| l.as_ptr()).collect::<Vec<_>>();

    let application_name = CString::new(config.application_name.as_str())?;
    let application_info = vk::ApplicationInfo::builder()
        .application_name(application_name.as_bytes_with_nul())
        .application_version(vk::make_version(0, 1, 0))
        .engine_name(b"vkpool\0")
        .engine_version(vk::make_version(0, 1, 0))
        .api_version(config.api_version);

    // No surface is ever created, so the only extension we may
    // need is the debug utils one, for the validation messages.
    let mut extensions = Vec::new();
    if validation {
        extensions.push(vk::EXT_DEBUG_UTILS_EXTENSION.name.as_ptr());
    }

    // Some platforms do not have a fully compliant Vulkan
    // implementation and need the portability extensions since
    // v1.3.216 of the API (macOS, notably).
    let flags = if
        cfg!(target_os = "macos") &&
        entry.version()? >= PORTABILITY_MACOS_VERSION
    {
        info!("Enabling extensions for macOS portability.");
        extensions.push(vk::KHR_GET_PHYSICAL_DEVICE_PROPERTIES2_EXTENSION.name.as_ptr());
        extensions.push(vk::KHR_PORTABILITY_ENUMERATION_EXTENSION.name.as_ptr());

        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    let mut info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&layer_names)
        .enabled_extension_names(&extensions)
        .flags(flags);

    // The debug info is chained to the instance info as well, so
    // that instance creation and destruction are also reported.
    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::all())
        .message_type(vk::DebugUtilsMessageTypeFlagsEXT::all())
        .user_callback(Some(debug_callback));

    if validation {
        info = info.push_next(&mut debug_info);
    }

    let instance = entry.create_instance(&info, None)?;

    let debug_messenger = if validation {
        match instance.create_debug_utils_messenger_ext(&debug_info, None) {
            Ok(messenger) => messenger,
            Err(e) => {
                instance.destroy_instance(None);
                return Err(e.into());
            }
        }
    } else {
        vk::DebugUtilsMessengerEXT::null()
    };

    info!("Vulkan instance created.");
    Ok((instance, debug_messenger, layers))
}

/// Destroy the debug messenger, if any, then the instance.
unsafe fn destroy_instance(instance: &Instance, debug_messenger: vk::DebugUtilsMessengerEXT) {
    if !debug_messenger.is_null() {
        instance.destroy_debug_utils_messenger_ext(debug_messenger, None);
    }

    instance.destroy_instance(None);
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // Route the validation messages to our log, mapping Vulkan
    // severities to log levels.
    let data = unsafe { *data };
    let message = unsafe { std::ffi::CStr::from_ptr(data.message) }.to_string_lossy();

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        error!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        warn!("({type_:?}) {message}");
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        debug!("({type_:?}) {message}");
    } else {
        trace!("({type_:?}) {message}");
    }

    // Returning true would abort the call that triggered the
    // message.
    vk::FALSE
}
