//! Vulkan physical and logical device selection.

use std::collections::HashMap;
use std::ffi::CStr;

use ash::vk;

use crate::error::GpuError;
use crate::types::{QueueId, QueueKind};

/// Queue family indices selected for the device.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    /// Number of queues available on the transfer family.
    pub transfer_count: u32,
}

/// Select the best physical device.
///
/// Prefers discrete GPUs, then integrated; devices without a graphics queue
/// are skipped.
pub fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, QueueFamilies, bool), GpuError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GpuError::InitializationFailed(format!("failed to enumerate physical devices: {e:?}"))
    })?;

    if devices.is_empty() {
        return Err(GpuError::InitializationFailed(
            "no Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(vk::PhysicalDevice, QueueFamilies, bool, u32)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if vk::api_version_major(properties.api_version) < 1
            || (vk::api_version_major(properties.api_version) == 1
                && vk::api_version_minor(properties.api_version) < 3)
        {
            continue;
        }
        let Some(families) = find_queue_families(instance, device) else {
            continue;
        };

        let mut score = 0u32;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }
        let ray_tracing = supports_ray_tracing(instance, device);
        if ray_tracing {
            score += 500;
        }

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, ray tracing: {}, score: {})",
            device_name,
            properties.device_type,
            ray_tracing,
            score
        );

        if best.as_ref().is_none_or(|(_, _, _, s)| score > *s) {
            best = Some((device, families, ray_tracing, score));
        }
    }

    best.map(|(device, families, ray_tracing, _)| (device, families, ray_tracing))
        .ok_or_else(|| GpuError::InitializationFailed("no suitable GPU found".to_string()))
}

fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Option<QueueFamilies> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let graphics = families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))? as u32;

    // Prefer a dedicated compute family, fall back to the graphics family.
    let compute = families
        .iter()
        .enumerate()
        .find(|(i, f)| {
            *i as u32 != graphics && f.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|(i, _)| i as u32)
        .unwrap_or(graphics);

    // Prefer a transfer-only family for copy queues.
    let transfer = families
        .iter()
        .enumerate()
        .find(|(_, f)| {
            f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|(i, _)| i as u32)
        .unwrap_or(graphics);

    let transfer_count = families[transfer as usize].queue_count;

    Some(QueueFamilies {
        graphics,
        compute,
        transfer,
        transfer_count,
    })
}

fn supports_ray_tracing(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) })
    else {
        return false;
    };
    let has = |name: &CStr| {
        extensions
            .iter()
            .any(|e| e.extension_name_as_c_str() == Ok(name))
    };
    has(ash::khr::acceleration_structure::NAME)
        && has(ash::khr::ray_tracing_pipeline::NAME)
        && has(ash::khr::deferred_host_operations::NAME)
}

/// Create the logical device and resolve the queue map.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    ray_tracing: bool,
) -> Result<(ash::Device, HashMap<QueueId, (u32, vk::Queue)>), GpuError> {
    let priorities = [1.0f32, 1.0f32];

    // One create info per distinct family; a dedicated transfer family gets
    // two queues when it has them (bulk + streaming copy).
    let transfer_distinct =
        families.transfer != families.graphics && families.transfer != families.compute;
    let transfer_queues = if transfer_distinct {
        families.transfer_count.clamp(1, 2)
    } else {
        1
    };
    let mut queue_infos: Vec<vk::DeviceQueueCreateInfo> = Vec::new();
    let mut push_family = |family: u32, count: u32| {
        if !queue_infos.iter().any(|info| info.queue_family_index == family) {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..count as usize]),
            );
        }
    };
    push_family(families.graphics, 1);
    push_family(families.compute, 1);
    push_family(families.transfer, transfer_queues);

    let mut extensions = Vec::new();
    if ray_tracing {
        extensions.push(ash::khr::acceleration_structure::NAME.as_ptr());
        extensions.push(ash::khr::ray_tracing_pipeline::NAME.as_ptr());
        extensions.push(ash::khr::deferred_host_operations::NAME.as_ptr());
    }

    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true);
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .dynamic_rendering(true);
    let mut accel_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
        .ray_tracing_pipeline(true);

    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .push_next(&mut vulkan_12)
        .push_next(&mut vulkan_13);
    if ray_tracing {
        create_info = create_info
            .push_next(&mut accel_features)
            .push_next(&mut ray_features);
    }

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(|e| {
            GpuError::InitializationFailed(format!("failed to create logical device: {e:?}"))
        })?;

    let mut queues = HashMap::new();
    let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
    let compute_queue = unsafe { device.get_device_queue(families.compute, 0) };
    let copy0 = unsafe { device.get_device_queue(families.transfer, 0) };
    let copy1 = if transfer_queues >= 2 {
        unsafe { device.get_device_queue(families.transfer, 1) }
    } else {
        // Copy queues alias one hardware queue; the backend's submission
        // lock keeps that safe.
        copy0
    };
    queues.insert(
        QueueId::new(QueueKind::Graphics, 0),
        (families.graphics, graphics_queue),
    );
    queues.insert(
        QueueId::new(QueueKind::Compute, 0),
        (families.compute, compute_queue),
    );
    queues.insert(QueueId::new(QueueKind::Copy, 0), (families.transfer, copy0));
    queues.insert(QueueId::new(QueueKind::Copy, 1), (families.transfer, copy1));

    Ok((device, queues))
}
