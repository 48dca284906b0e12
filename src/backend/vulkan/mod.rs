//! Native Vulkan backend (ash + gpu-allocator).
//!
//! Translates the policy layer's recorded command lists into Vulkan 1.3
//! commands: synchronization2 barriers, dynamic rendering, timeline
//! semaphore queue fencing, and KHR ray tracing when the driver exposes it.
//!
//! Resource lifetime contract: all buffers, textures, pipelines and
//! acceleration structures created through this backend must be dropped
//! before the backend itself (the device context enforces this by dropping
//! the backend last, after `wait_idle`).

mod allocator;
mod command;
mod conversion;
mod device;
mod instance;
mod pipeline;
mod raytracing;

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::command::CommandList;
use crate::error::GpuError;
use crate::pipeline::PipelineDesc;
use crate::raytracing::{AccelBuildInputs, AccelKind, AccelSizes};
use crate::types::{BufferDescriptor, BufferUsage, QueueId, TextureDescriptor};

use super::{
    GpuAccelStruct, GpuBackend, GpuBuffer, GpuCommandAllocator, GpuPipeline, GpuTexture,
    GpuTimeline,
};

/// Native Vulkan backend.
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    allocator: Option<Arc<Mutex<Allocator>>>,
    /// Queue map; `vk::Queue` access is externally synchronized, and copy
    /// queues may alias one hardware queue, so one submission lock covers
    /// them all.
    queues: HashMap<QueueId, (u32, vk::Queue)>,
    submit_lock: Mutex<()>,
    accel_fns: Option<ash::khr::acceleration_structure::Device>,
    rt_fns: Option<ash::khr::ray_tracing_pipeline::Device>,
    rt_handle_size: u32,
    /// Query pools created during translation, destroyed once their
    /// submission's fence value completes.
    pending_pools: Mutex<Vec<(vk::Semaphore, u64, vk::QueryPool)>>,
}

impl VulkanBackend {
    /// Probe the driver and create the backend.
    pub fn new() -> Result<Self, GpuError> {
        let (entry, instance) = instance::create_instance()?;
        let (physical_device, families, ray_tracing) =
            match device::select_physical_device(&instance) {
                Ok(selection) => selection,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };
        let (logical_device, queues) =
            match device::create_logical_device(&instance, physical_device, families, ray_tracing)
            {
                Ok(created) => created,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        let allocator =
            allocator::create_allocator(&instance, physical_device, logical_device.clone())?;

        let (accel_fns, rt_fns, rt_handle_size) = if ray_tracing {
            let accel_fns = ash::khr::acceleration_structure::Device::new(&instance, &logical_device);
            let rt_fns = ash::khr::ray_tracing_pipeline::Device::new(&instance, &logical_device);

            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut props) };

            (
                Some(accel_fns),
                Some(rt_fns),
                rt_props.shader_group_handle_size,
            )
        } else {
            (None, None, 0)
        };

        log::info!("Vulkan backend ready (ray tracing: {})", ray_tracing);
        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device: logical_device,
            allocator: Some(Arc::new(Mutex::new(allocator))),
            queues,
            submit_lock: Mutex::new(()),
            accel_fns,
            rt_fns,
            rt_handle_size,
            pending_pools: Mutex::new(Vec::new()),
        })
    }

    /// The selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    fn allocator(&self) -> &Arc<Mutex<Allocator>> {
        self.allocator.as_ref().unwrap()
    }

    fn queue(&self, id: QueueId) -> (u32, vk::Queue) {
        *self
            .queues
            .get(&id)
            .unwrap_or_else(|| panic!("unknown queue {id}"))
    }

    fn timeline_semaphore(timeline: &GpuTimeline) -> vk::Semaphore {
        match timeline {
            GpuTimeline::Vulkan { semaphore, .. } => *semaphore,
            GpuTimeline::Dummy { .. } => {
                panic!("dummy timeline handle submitted to the Vulkan backend")
            }
        }
    }

    /// Destroy transient query pools whose submission retired.
    fn reclaim_query_pools(&self) {
        let mut pending = self.pending_pools.lock();
        pending.retain(|(semaphore, value, pool)| {
            let completed =
                unsafe { self.device.get_semaphore_counter_value(*semaphore) }.unwrap_or(0);
            if completed >= *value {
                unsafe { self.device.destroy_query_pool(*pool, None) };
                false
            } else {
                true
            }
        });
    }

    fn with_mapped<R>(
        buffer: &GpuBuffer,
        f: impl FnOnce(&Mutex<Option<Allocation>>) -> R,
    ) -> R {
        match buffer {
            GpuBuffer::Vulkan { allocation, .. } => f(allocation),
            GpuBuffer::Dummy { .. } => {
                panic!("dummy buffer handle passed to the Vulkan backend")
            }
        }
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GpuError> {
        if descriptor.size == 0 {
            return Err(GpuError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        let usage = conversion::buffer_usage(descriptor.usage);
        let create_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer =
            unsafe { self.device.create_buffer(&create_info, None) }.map_err(GpuError::from)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if descriptor.usage.contains(BufferUsage::MAP_READ) {
            MemoryLocation::GpuToCpu
        } else if descriptor.usage.contains(BufferUsage::MAP_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = self
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("buffer"),
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                GpuError::ResourceCreationFailed(format!("buffer allocation failed: {e}"))
            })?;
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(GpuError::from)?;

        let address = unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            allocator: Arc::downgrade(self.allocator()),
            address,
            size: descriptor.size,
        })
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, GpuError> {
        let format = conversion::texture_format(descriptor.format);
        let aspect = conversion::aspect_mask(descriptor.format);
        let extent = vk::Extent3D {
            width: descriptor.size.width,
            height: descriptor.size.height,
            depth: descriptor.size.depth,
        };
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(descriptor.mip_level_count)
            .array_layers(descriptor.array_layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conversion::texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image =
            unsafe { self.device.create_image(&create_info, None) }.map_err(GpuError::from)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator()
            .lock()
            .allocate(&AllocationCreateDesc {
                name: descriptor.label.as_deref().unwrap_or("texture"),
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_image(image, None) };
                GpuError::ResourceCreationFailed(format!("texture allocation failed: {e}"))
            })?;
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(GpuError::from)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(if descriptor.array_layer_count > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });
        let view =
            unsafe { self.device.create_image_view(&view_info, None) }.map_err(GpuError::from)?;

        Ok(GpuTexture::Vulkan {
            device: self.device.clone(),
            image,
            view,
            allocation: Mutex::new(Some(allocation)),
            allocator: Arc::downgrade(self.allocator()),
            format,
            extent,
            aspect,
            mip_levels: descriptor.mip_level_count,
            array_layers: descriptor.array_layer_count,
        })
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        Self::with_mapped(buffer, |allocation| {
            let mut allocation = allocation.lock();
            let allocation = allocation.as_mut().expect("buffer already freed");
            let mapped = allocation
                .mapped_slice_mut()
                .expect("writing to a buffer that is not CPU-visible");
            mapped[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        });
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Vec<u8> {
        Self::with_mapped(buffer, |allocation| {
            let allocation = allocation.lock();
            let allocation = allocation.as_ref().expect("buffer already freed");
            let mapped = allocation
                .mapped_slice()
                .expect("reading from a buffer that is not CPU-visible");
            mapped[offset as usize..(offset + size) as usize].to_vec()
        })
    }

    fn create_timeline(&self, queue: QueueId) -> Result<GpuTimeline, GpuError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }
            .map_err(GpuError::from)?;
        log::trace!("created timeline semaphore for {queue}");
        Ok(GpuTimeline::Vulkan {
            device: self.device.clone(),
            semaphore,
        })
    }

    fn query_completed_value(&self, timeline: &GpuTimeline) -> u64 {
        let semaphore = Self::timeline_semaphore(timeline);
        unsafe { self.device.get_semaphore_counter_value(semaphore) }.unwrap_or(0)
    }

    fn wait_timeline(&self, timeline: &GpuTimeline, value: u64) {
        let semaphore = Self::timeline_semaphore(timeline);
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        if let Err(e) = unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) } {
            log::error!("timeline wait failed: {e:?}");
        }
    }

    fn create_command_allocator(&self, queue: QueueId) -> Result<GpuCommandAllocator, GpuError> {
        let (family, _) = self.queue(queue);
        let create_info = vk::CommandPoolCreateInfo::default().queue_family_index(family);
        let pool = unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(GpuError::from)?;
        Ok(GpuCommandAllocator::Vulkan {
            device: self.device.clone(),
            pool,
        })
    }

    fn reset_command_allocator(&self, allocator: &GpuCommandAllocator) {
        let GpuCommandAllocator::Vulkan { pool, .. } = allocator else {
            panic!("dummy command allocator passed to the Vulkan backend");
        };
        unsafe {
            if let Err(e) = self
                .device
                .reset_command_pool(*pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
            {
                log::error!("command pool reset failed: {e:?}");
            }
        }
    }

    fn submit(
        &self,
        queue: QueueId,
        lists: &[CommandList],
        allocator: &GpuCommandAllocator,
        waits: &[(&GpuTimeline, u64)],
        timeline: &GpuTimeline,
        signal_value: u64,
    ) -> Result<(), GpuError> {
        self.reclaim_query_pools();

        let (_, vk_queue) = self.queue(queue);
        let signal_semaphore = Self::timeline_semaphore(timeline);

        let mut command_buffers = Vec::with_capacity(lists.len());
        if !lists.is_empty() {
            // Work-free signal submissions never reach this branch, so only
            // they may pass a placeholder allocator.
            let GpuCommandAllocator::Vulkan { pool, .. } = allocator else {
                panic!("dummy command allocator passed to the Vulkan backend");
            };
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(*pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(lists.len() as u32);
            command_buffers =
                unsafe { self.device.allocate_command_buffers(&alloc_info) }
                    .map_err(GpuError::from)?;

            for (list, cmd) in lists.iter().zip(&command_buffers) {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe { self.device.begin_command_buffer(*cmd, &begin_info) }
                    .map_err(GpuError::from)?;

                let mut translator = command::CommandTranslator::new(
                    &self.device,
                    self.accel_fns.as_ref(),
                    self.rt_fns.as_ref(),
                    *cmd,
                );
                translator.translate(list)?;
                for transient in translator.transient_pools {
                    self.pending_pools.lock().push((
                        signal_semaphore,
                        signal_value,
                        transient.pool,
                    ));
                }

                unsafe { self.device.end_command_buffer(*cmd) }.map_err(GpuError::from)?;
            }
        }

        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = waits
            .iter()
            .map(|(wait_timeline, value)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(Self::timeline_semaphore(wait_timeline))
                    .value(*value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(signal_semaphore)
            .value(signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let cmd_infos: Vec<vk::CommandBufferSubmitInfo> = command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cmd_infos)
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));

        let _guard = self.submit_lock.lock();
        unsafe {
            self.device
                .queue_submit2(vk_queue, std::slice::from_ref(&submit_info), vk::Fence::null())
        }
        .map_err(GpuError::from)
    }

    fn signal(&self, queue: QueueId, timeline: &GpuTimeline, value: u64) -> Result<(), GpuError> {
        self.submit(queue, &[], &GpuCommandAllocator::Dummy, &[], timeline, value)
    }

    fn accel_build_sizes(&self, inputs: &AccelBuildInputs) -> AccelSizes {
        match &self.accel_fns {
            Some(accel_fns) => raytracing::query_build_sizes(accel_fns, inputs),
            None => {
                log::error!("acceleration structure sizes queried without ray tracing support");
                AccelSizes {
                    result_size: 256,
                    scratch_size: 256,
                    update_scratch_size: 256,
                }
            }
        }
    }

    fn create_acceleration_structure(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
        kind: AccelKind,
    ) -> Result<GpuAccelStruct, GpuError> {
        let accel_fns = self.accel_fns.as_ref().ok_or_else(|| {
            GpuError::FeatureNotSupported("acceleration structures".to_string())
        })?;
        let GpuBuffer::Vulkan {
            buffer: vk_buffer, ..
        } = buffer
        else {
            panic!("dummy buffer handle passed to the Vulkan backend");
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(*vk_buffer)
            .offset(offset)
            .size(size)
            .ty(raytracing::accel_type(kind));
        let accel = unsafe { accel_fns.create_acceleration_structure(&create_info, None) }
            .map_err(GpuError::from)?;
        let address = unsafe {
            accel_fns.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(accel),
            )
        };

        Ok(GpuAccelStruct::Vulkan {
            accel_fns: accel_fns.clone(),
            accel,
            address,
            size,
        })
    }

    fn compile_pipeline(&self, desc: &PipelineDesc) -> Result<GpuPipeline, GpuError> {
        let created = pipeline::create_pipeline(
            &self.device,
            self.rt_fns.as_ref(),
            self.rt_handle_size,
            desc,
        )?;
        log::debug!("compiled {} pipeline", desc.kind_name());
        Ok(GpuPipeline::Vulkan {
            device: self.device.clone(),
            pipeline: created.pipeline,
            layout: created.layout,
            set_layouts: created.set_layouts,
            bind_point: created.bind_point,
            identifiers: created.identifiers,
        })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, _, pool) in self.pending_pools.lock().drain(..) {
                self.device.destroy_query_pool(pool, None);
            }
            // The allocator must go before the device it allocates from.
            self.allocator.take();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}
