//! GPU backend abstraction layer.
//!
//! The submission core is written against a small backend surface so the
//! policy layer (state tracking, pooling, sync-point recycling) is testable
//! without GPU hardware.
//!
//! # Available Backends
//!
//! - `dummy` (always available): CPU-simulated queues and buffer memory
//! - `vulkan-backend`: native Vulkan backend using ash + gpu-allocator
//!
//! # Architecture
//!
//! Resource handles are enums with one variant per backend. The policy layer
//! holds them behind `Arc` and never matches on them; only backends do. Each
//! backend implements [`GpuBackend`]: resource creation, buffer read/write,
//! queue timelines (monotonic fence values), command-allocator management and
//! command-list submission.

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod dummy;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "vulkan-backend")]
use gpu_allocator::vulkan::Allocation;

use crate::command::CommandList;
use crate::error::GpuError;
use crate::pipeline::PipelineDesc;
use crate::raytracing::{AccelBuildInputs, AccelKind, AccelSizes};
use crate::types::{BufferDescriptor, QueueId, TextureDescriptor};

/// Size in bytes of a ray-tracing shader group identifier.
pub const SHADER_IDENTIFIER_SIZE: usize = 32;

/// Handle to a GPU buffer resource.
pub enum GpuBuffer {
    /// Dummy backend: CPU byte storage standing in for GPU memory, so copy
    /// and readback paths round-trip real data in tests.
    Dummy {
        /// Simulated memory contents.
        storage: Mutex<Vec<u8>>,
        /// Simulated GPU virtual address.
        address: u64,
    },
    /// Vulkan backend buffer.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        buffer: vk::Buffer,
        allocation: Mutex<Option<Allocation>>,
        allocator: std::sync::Weak<Mutex<gpu_allocator::vulkan::Allocator>>,
        address: u64,
        size: u64,
    },
}

impl GpuBuffer {
    /// Create a dummy buffer with zeroed storage.
    pub fn new_dummy(size: u64, address: u64) -> Self {
        Self::Dummy {
            storage: Mutex::new(vec![0; size as usize]),
            address,
        }
    }

    /// GPU virtual address of the buffer start.
    pub fn gpu_address(&self) -> u64 {
        match self {
            Self::Dummy { address, .. } => *address,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { address, .. } => *address,
        }
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Dummy { storage, .. } => storage.lock().len() as u64,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { address, .. } => f
                .debug_struct("GpuBuffer::Dummy")
                .field("address", &format_args!("{address:#x}"))
                .finish_non_exhaustive(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, size, .. } => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", buffer)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let GpuBuffer::Vulkan {
            device,
            buffer,
            allocation,
            allocator,
            ..
        } = self
        {
            if let Some(allocation) = allocation.lock().take() {
                match allocator.upgrade() {
                    Some(allocator) => {
                        if let Err(e) = allocator.lock().free(allocation) {
                            log::error!("Failed to free buffer allocation: {}", e);
                        }
                    }
                    // Allocator already gone (device teardown); memory is
                    // released with it.
                    None => drop(allocation),
                }
            }
            unsafe { device.destroy_buffer(*buffer, None) };
        }
    }
}

/// Handle to a GPU texture resource.
pub enum GpuTexture {
    /// Dummy backend (no storage; uploads are traced, not retained).
    Dummy,
    /// Vulkan backend texture.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        image: vk::Image,
        view: vk::ImageView,
        allocation: Mutex<Option<Allocation>>,
        allocator: std::sync::Weak<Mutex<gpu_allocator::vulkan::Allocator>>,
        format: vk::Format,
        extent: vk::Extent3D,
        aspect: vk::ImageAspectFlags,
        mip_levels: u32,
        array_layers: u32,
    },
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy => write!(f, "GpuTexture::Dummy"),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                image,
                format,
                extent,
                ..
            } => f
                .debug_struct("GpuTexture::Vulkan")
                .field("image", image)
                .field("format", format)
                .field("extent", extent)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let GpuTexture::Vulkan {
            device,
            image,
            view,
            allocation,
            allocator,
            ..
        } = self
        {
            if let Some(allocation) = allocation.lock().take() {
                match allocator.upgrade() {
                    Some(allocator) => {
                        if let Err(e) = allocator.lock().free(allocation) {
                            log::error!("Failed to free texture allocation: {}", e);
                        }
                    }
                    None => drop(allocation),
                }
            }
            unsafe {
                device.destroy_image_view(*view, None);
                device.destroy_image(*image, None);
            }
        }
    }
}

/// Per-queue monotonic fence timeline.
///
/// Every submission on a queue signals the next value; a value is "complete"
/// once the GPU retired all work submitted up to and including it.
pub enum GpuTimeline {
    /// Dummy backend: completion is advanced by the backend (auto mode) or
    /// by tests.
    Dummy {
        /// Last completed fence value.
        completed: AtomicU64,
    },
    /// Vulkan backend: a timeline semaphore.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        semaphore: vk::Semaphore,
    },
}

impl std::fmt::Debug for GpuTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { completed } => f
                .debug_struct("GpuTimeline::Dummy")
                .field("completed", completed)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { semaphore, .. } => f
                .debug_struct("GpuTimeline::Vulkan")
                .field("semaphore", semaphore)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuTimeline {
    fn drop(&mut self) {
        if let GpuTimeline::Vulkan { device, semaphore } = self {
            unsafe { device.destroy_semaphore(*semaphore, None) };
        }
    }
}

/// Handle to a command-recording allocator.
///
/// Backs the recording of one command list at a time; reset reclaims all of
/// its memory at once, which is only safe once the GPU retired the last list
/// recorded from it.
pub enum GpuCommandAllocator {
    /// Dummy backend (recording is CPU-side, nothing to allocate).
    Dummy,
    /// Vulkan backend: a command pool reset as a whole.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pool: vk::CommandPool,
    },
}

impl std::fmt::Debug for GpuCommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy => write!(f, "GpuCommandAllocator::Dummy"),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pool, .. } => f
                .debug_struct("GpuCommandAllocator::Vulkan")
                .field("pool", pool)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuCommandAllocator {
    fn drop(&mut self) {
        if let GpuCommandAllocator::Vulkan { device, pool } = self {
            unsafe { device.destroy_command_pool(*pool, None) };
        }
    }
}

/// Handle to an acceleration structure living inside a memory page.
pub enum GpuAccelStruct {
    /// Dummy backend.
    Dummy {
        /// Simulated GPU virtual address.
        address: u64,
        /// Structure size in bytes.
        size: u64,
    },
    /// Vulkan backend acceleration structure.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        accel_fns: ash::khr::acceleration_structure::Device,
        accel: vk::AccelerationStructureKHR,
        address: u64,
        size: u64,
    },
}

impl GpuAccelStruct {
    /// GPU virtual address used to reference the structure in shaders.
    pub fn gpu_address(&self) -> u64 {
        match self {
            Self::Dummy { address, .. } => *address,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { address, .. } => *address,
        }
    }

    /// Structure size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Dummy { size, .. } => *size,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuAccelStruct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { address, size } => f
                .debug_struct("GpuAccelStruct::Dummy")
                .field("address", &format_args!("{address:#x}"))
                .field("size", size)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { accel, size, .. } => f
                .debug_struct("GpuAccelStruct::Vulkan")
                .field("accel", accel)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuAccelStruct {
    fn drop(&mut self) {
        if let GpuAccelStruct::Vulkan {
            accel_fns, accel, ..
        } = self
        {
            unsafe { accel_fns.destroy_acceleration_structure(*accel, None) };
        }
    }
}

/// Handle to a compiled pipeline.
pub enum GpuPipeline {
    /// Dummy backend: carries fabricated shader-group identifiers so shader
    /// table construction works without a driver.
    Dummy {
        /// Export name → shader group identifier.
        identifiers: HashMap<String, [u8; SHADER_IDENTIFIER_SIZE]>,
    },
    /// Vulkan backend pipeline.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        set_layouts: Vec<vk::DescriptorSetLayout>,
        bind_point: vk::PipelineBindPoint,
        identifiers: HashMap<String, [u8; SHADER_IDENTIFIER_SIZE]>,
    },
}

impl GpuPipeline {
    /// Shader group identifier for a ray-tracing export, if it exists.
    pub fn shader_identifier(&self, name: &str) -> Option<[u8; SHADER_IDENTIFIER_SIZE]> {
        match self {
            Self::Dummy { identifiers } => identifiers.get(name).copied(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { identifiers, .. } => identifiers.get(name).copied(),
        }
    }
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { identifiers } => f
                .debug_struct("GpuPipeline::Dummy")
                .field("exports", &identifiers.len())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pipeline, .. } => f
                .debug_struct("GpuPipeline::Vulkan")
                .field("pipeline", pipeline)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuPipeline {
    fn drop(&mut self) {
        if let GpuPipeline::Vulkan {
            device,
            pipeline,
            layout,
            set_layouts,
            ..
        } = self
        {
            unsafe {
                device.destroy_pipeline(*pipeline, None);
                device.destroy_pipeline_layout(*layout, None);
                for set_layout in set_layouts.drain(..) {
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
            }
        }
    }
}

/// GPU backend trait for abstracting the underlying graphics API.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GpuError>;

    /// Create a texture resource.
    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, GpuError>;

    /// Write data into a CPU-visible buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]);

    /// Read data back from a CPU-visible buffer.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Vec<u8>;

    /// Create the fence timeline for a queue.
    fn create_timeline(&self, queue: QueueId) -> Result<GpuTimeline, GpuError>;

    /// Last completed fence value on a timeline (never blocks).
    fn query_completed_value(&self, timeline: &GpuTimeline) -> u64;

    /// Block the calling thread until `value` completes on the timeline.
    fn wait_timeline(&self, timeline: &GpuTimeline, value: u64);

    /// Create a command allocator for a queue.
    fn create_command_allocator(&self, queue: QueueId) -> Result<GpuCommandAllocator, GpuError>;

    /// Reset a command allocator, reclaiming all recording memory.
    ///
    /// Only legal once every list recorded from it has retired.
    fn reset_command_allocator(&self, allocator: &GpuCommandAllocator);

    /// Submit recorded command lists to a queue.
    ///
    /// Lists execute in order and are recorded through `allocator`. The
    /// submission waits GPU-side for every `(timeline, value)` pair in
    /// `waits` before starting, and signals `signal_value` on `timeline`
    /// when all lists retire.
    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        queue: QueueId,
        lists: &[CommandList],
        allocator: &GpuCommandAllocator,
        waits: &[(&GpuTimeline, u64)],
        timeline: &GpuTimeline,
        signal_value: u64,
    ) -> Result<(), GpuError>;

    /// Signal a fence value on a queue without submitting work.
    fn signal(
        &self,
        queue: QueueId,
        timeline: &GpuTimeline,
        value: u64,
    ) -> Result<(), GpuError>;

    /// Memory requirements for building an acceleration structure.
    fn accel_build_sizes(&self, inputs: &AccelBuildInputs) -> AccelSizes;

    /// Create an acceleration structure over a region of a page buffer.
    fn create_acceleration_structure(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
        kind: AccelKind,
    ) -> Result<GpuAccelStruct, GpuError>;

    /// Compile a pipeline description into an API pipeline.
    fn compile_pipeline(&self, desc: &PipelineDesc) -> Result<GpuPipeline, GpuError>;
}

/// Select and create the best available backend.
///
/// Tries Vulkan first when compiled in, then falls back to the dummy
/// backend.
pub fn create_backend() -> Arc<dyn GpuBackend> {
    #[cfg(feature = "vulkan-backend")]
    {
        match vulkan::VulkanBackend::new() {
            Ok(backend) => {
                log::info!("Using Vulkan backend (ash)");
                return Arc::new(backend);
            }
            Err(e) => {
                log::warn!("Failed to create Vulkan backend: {}", e);
            }
        }
    }

    log::info!("Using dummy backend");
    Arc::new(dummy::DummyBackend::new())
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "vulkan-backend")
}
