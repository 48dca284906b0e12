//! Vulkan instance creation.

use ash::vk;

use crate::error::GpuError;

/// Create the Vulkan entry and instance.
pub fn create_instance() -> Result<(ash::Entry, ash::Instance), GpuError> {
    let entry = unsafe { ash::Entry::load() }.map_err(|e| {
        GpuError::InitializationFailed(format!("failed to load Vulkan library: {e}"))
    })?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"amaranth")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"amaranth")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::make_api_version(0, 1, 3, 0));

    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GpuError::InitializationFailed(format!("failed to create Vulkan instance: {e:?}"))
    })?;

    Ok((entry, instance))
}
