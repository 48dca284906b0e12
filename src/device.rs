//! The graphics device: the explicitly constructed context object that owns
//! every piece of the submission core.
//!
//! There are no process-wide singletons here — everything that needs the
//! device receives it by reference (or `Arc`), and teardown is explicit:
//! [`GraphicsDevice::wait_idle`] drains every queue, after which dropping
//! the device releases all GPU objects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::backend::GpuBackend;
use crate::command::CommandQueue;
use crate::deferred::{DeferredReleaseQueue, DeferredResource};
use crate::error::GpuError;
use crate::pipeline::{
    resolve_stream, PipelineCompiler, PipelineDesc, PipelineHandle, PipelineStream,
    RaytracingPipelineDesc,
};
use crate::raytracing::{AccelStructManager, DEFAULT_ACCEL_PAGE_SIZE};
use crate::resources::{Buffer, Texture, TrackedResource};
use crate::shader::{CrashHandler, ShaderDatabase};
use crate::state::{GlobalStateTracker, ResourceId, SharedStateTracker};
use crate::sync::SyncPoint;
use crate::types::{
    BufferDescriptor, QueueId, QueueKind, TextureDescriptor,
};
use crate::upload::{LinearAllocator, SubresourceData, DEFAULT_UPLOAD_PAGE_SIZE};

/// Tunables fixed at device creation.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Page size of the upload allocators.
    pub upload_page_size: u64,
    /// Page size of the acceleration structure memory pool.
    pub accel_page_size: u64,
    /// Worker threads for asynchronous pipeline compilation.
    pub compiler_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            upload_page_size: DEFAULT_UPLOAD_PAGE_SIZE,
            accel_page_size: DEFAULT_ACCEL_PAGE_SIZE,
            compiler_threads: 2,
        }
    }
}

impl DeviceConfig {
    /// Set the upload page size.
    pub fn with_upload_page_size(mut self, size: u64) -> Self {
        self.upload_page_size = size;
        self
    }

    /// Set the acceleration structure page size.
    pub fn with_accel_page_size(mut self, size: u64) -> Self {
        self.accel_page_size = size;
        self
    }

    /// Set the pipeline compiler thread count.
    pub fn with_compiler_threads(mut self, threads: usize) -> Self {
        self.compiler_threads = threads;
        self
    }
}

/// The device context object.
///
/// Field order matters: the backend is declared last so every component
/// holding GPU objects drops before it.
pub struct GraphicsDevice {
    global_tracker: SharedStateTracker,
    graphics_queue: CommandQueue,
    compute_queue: CommandQueue,
    copy_queues: [CommandQueue; 2],
    /// Per-frame transient allocations (constants, dynamic geometry),
    /// bracketed by `begin_frame`/`end_frame` on the graphics queue.
    frame_allocator: LinearAllocator,
    /// Staging for `upload_*`, bracketed internally per call on the first
    /// copy queue.
    staging_allocator: LinearAllocator,
    accel_manager: Mutex<AccelStructManager>,
    pipeline_compiler: PipelineCompiler,
    shader_database: Arc<ShaderDatabase>,
    deferred: DeferredReleaseQueue,
    next_resource_id: AtomicU64,
    config: DeviceConfig,
    backend: Arc<dyn GpuBackend>,
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GraphicsDevice {
    pub(crate) fn new(
        backend: Arc<dyn GpuBackend>,
        config: DeviceConfig,
        crash_handler: Option<Arc<dyn CrashHandler>>,
    ) -> Result<Arc<Self>, GpuError> {
        let global_tracker: SharedStateTracker = Arc::new(GlobalStateTracker::new());

        let graphics_queue = CommandQueue::new(
            backend.clone(),
            QueueId::new(QueueKind::Graphics, 0),
            global_tracker.clone(),
        )?;
        let compute_queue = CommandQueue::new(
            backend.clone(),
            QueueId::new(QueueKind::Compute, 0),
            global_tracker.clone(),
        )?;
        let copy_queues = [
            CommandQueue::new(
                backend.clone(),
                QueueId::new(QueueKind::Copy, 0),
                global_tracker.clone(),
            )?,
            CommandQueue::new(
                backend.clone(),
                QueueId::new(QueueKind::Copy, 1),
                global_tracker.clone(),
            )?,
        ];

        let shader_database = Arc::new(ShaderDatabase::new());
        if let Some(handler) = &crash_handler {
            handler.on_device_created(&shader_database);
            log::info!("GPU crash handler registered");
        }

        let device = Arc::new(Self {
            frame_allocator: LinearAllocator::new(backend.clone(), config.upload_page_size),
            staging_allocator: LinearAllocator::new(backend.clone(), config.upload_page_size),
            accel_manager: Mutex::new(AccelStructManager::new(
                backend.clone(),
                config.accel_page_size,
            )),
            pipeline_compiler: PipelineCompiler::new(backend.clone(), config.compiler_threads),
            shader_database,
            global_tracker,
            graphics_queue,
            compute_queue,
            copy_queues,
            deferred: DeferredReleaseQueue::new(),
            next_resource_id: AtomicU64::new(1),
            backend,
            config,
        });
        log::info!("graphics device created ({})", device.backend.name());
        Ok(device)
    }

    /// The active backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The process-wide resource state tracker.
    pub fn global_tracker(&self) -> &SharedStateTracker {
        &self.global_tracker
    }

    /// The graphics queue.
    pub fn graphics_queue(&self) -> &CommandQueue {
        &self.graphics_queue
    }

    /// The async compute queue.
    pub fn compute_queue(&self) -> &CommandQueue {
        &self.compute_queue
    }

    /// One of the two copy queues (0: bulk uploads, 1: background
    /// streaming).
    pub fn copy_queue(&self, index: usize) -> &CommandQueue {
        &self.copy_queues[index]
    }

    /// The per-frame transient allocator.
    pub fn frame_allocator(&self) -> &LinearAllocator {
        &self.frame_allocator
    }

    /// The acceleration structure manager.
    pub fn accel_structs(&self) -> MutexGuard<'_, AccelStructManager> {
        self.accel_manager.lock()
    }

    /// The shader database backing crash-handler lookups.
    pub fn shader_database(&self) -> &Arc<ShaderDatabase> {
        &self.shader_database
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    fn next_id(&self) -> ResourceId {
        ResourceId::from_raw(self.next_resource_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a buffer.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<Buffer, GpuError> {
        let raw = self.backend.create_buffer(descriptor)?;
        Ok(Buffer::new(self.next_id(), raw, descriptor.clone()))
    }

    /// Create a texture.
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture, GpuError> {
        let raw = self.backend.create_texture(descriptor)?;
        Ok(Texture::new(self.next_id(), raw, descriptor.clone()))
    }

    /// Destroy a buffer once `last_use` completes.
    pub fn destroy_buffer(&self, buffer: Buffer, last_use: SyncPoint) {
        self.global_tracker.forget_resource(buffer.id());
        self.deferred
            .defer(last_use, DeferredResource::Buffer(buffer.into_raw()));
    }

    /// Destroy a texture once `last_use` completes.
    pub fn destroy_texture(&self, texture: Texture, last_use: SyncPoint) {
        self.global_tracker.forget_resource(texture.id());
        self.deferred
            .defer(last_use, DeferredResource::Texture(texture.into_raw()));
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Resolve a pipeline stream and queue it for asynchronous compilation.
    pub fn create_pipeline(&self, stream: PipelineStream) -> Result<PipelineHandle, GpuError> {
        let desc = resolve_stream(stream)?;
        Ok(self.compile_desc(desc))
    }

    /// Queue a ray-tracing pipeline for asynchronous compilation.
    pub fn create_raytracing_pipeline(&self, desc: RaytracingPipelineDesc) -> PipelineHandle {
        self.compile_desc(PipelineDesc::Raytracing(desc))
    }

    fn compile_desc(&self, desc: PipelineDesc) -> PipelineHandle {
        for shader in desc.shaders() {
            self.shader_database.register(&shader);
        }
        self.pipeline_compiler.compile(desc)
    }

    // ------------------------------------------------------------------
    // Uploads (the asset loader's surface)
    // ------------------------------------------------------------------

    /// Stage `data` and copy it into `dst` on the bulk copy queue.
    ///
    /// Data larger than one staging page is chunked automatically. Returns
    /// the sync point of the copy submission; the destination is safe to
    /// read on other queues after a GPU-side wait on it.
    pub fn upload_buffer(&self, data: &[u8], dst: &Buffer) -> Result<SyncPoint, GpuError> {
        assert!(
            data.len() as u64 <= dst.size(),
            "uploading {} bytes into a buffer of {} bytes",
            data.len(),
            dst.size()
        );
        let queue = &self.copy_queues[0];
        self.staging_allocator.begin(queue.completed_value());

        let mut ctx = queue.create_context("upload_buffer")?;
        let chunk_size = self.staging_allocator.page_size() as usize;
        let mut offset = 0usize;
        for chunk in data.chunks(chunk_size) {
            let allocation = self.staging_allocator.allocate(chunk.len() as u64)?;
            allocation.write(chunk);
            ctx.copy_upload_to_buffer(&allocation, dst, offset as u64);
            offset += chunk.len();
        }

        let sync_point = queue.execute(vec![ctx])?;
        self.staging_allocator.end(&sync_point);
        Ok(sync_point)
    }

    /// Stage subresource data and copy it into `dst`, one copy per
    /// subresource, on the bulk copy queue.
    ///
    /// `subresources` are ordered mip-major per array layer, matching
    /// [`Texture::subresource_index`].
    pub fn upload_texture(
        &self,
        subresources: &[SubresourceData<'_>],
        dst: &Texture,
    ) -> Result<SyncPoint, GpuError> {
        assert!(
            subresources.len() as u32 <= dst.subresource_count(),
            "uploading {} subresources into a texture with {}",
            subresources.len(),
            dst.subresource_count()
        );
        let queue = &self.copy_queues[0];
        self.staging_allocator.begin(queue.completed_value());

        let mut ctx = queue.create_context("upload_texture")?;
        for (index, subresource) in subresources.iter().enumerate() {
            let allocation = self
                .staging_allocator
                .allocate(subresource.data.len() as u64)?;
            allocation.write(subresource.data);
            ctx.copy_buffer_to_texture(
                allocation.buffer.clone(),
                allocation.offset,
                subresource.bytes_per_row,
                dst,
                index as u32,
            );
        }

        let sync_point = queue.execute(vec![ctx])?;
        self.staging_allocator.end(&sync_point);
        Ok(sync_point)
    }

    // ------------------------------------------------------------------
    // Frame lifecycle
    // ------------------------------------------------------------------

    /// Start a frame: reclaim deferred resources and prime the frame
    /// allocator against the graphics queue's completed fence value.
    pub fn begin_frame(&self) {
        self.deferred.reclaim();
        self.graphics_queue.release_retired();
        self.frame_allocator
            .begin(self.graphics_queue.completed_value());
    }

    /// End a frame: retire the frame allocator's pages at the frame's sync
    /// point.
    pub fn end_frame(&self, frame_sync: &SyncPoint) {
        self.frame_allocator.end(frame_sync);
    }

    /// Queue a resource for destruction once `last_use` completes.
    pub fn defer_release(&self, resource: DeferredResource, last_use: SyncPoint) {
        self.deferred.defer(last_use, resource);
    }

    /// Resources awaiting deferred destruction.
    pub fn deferred_pending(&self) -> usize {
        self.deferred.pending_count()
    }

    /// Drain every queue, then destroy everything still deferred.
    ///
    /// The shutdown path: after this returns, dropping the device is safe
    /// no matter what the GPU was doing.
    pub fn wait_idle(&self) {
        self.graphics_queue.wait_idle();
        self.compute_queue.wait_idle();
        for queue in &self.copy_queues {
            queue.wait_idle();
        }
        self.deferred.reclaim();
        self.deferred.flush_all();
        log::info!("graphics device idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::BufferUsage;

    fn test_device() -> Arc<GraphicsDevice> {
        GraphicsDevice::new(
            Arc::new(DummyBackend::new()),
            DeviceConfig::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_resource_ids_are_unique() {
        let device = test_device();
        let a = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        let b = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_upload_buffer_round_trip() {
        let device = test_device();
        let dst = device
            .create_buffer(&BufferDescriptor::new(
                1024,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            ))
            .unwrap();

        let data: Vec<u8> = (0..=255).cycle().take(1024).map(|v| v as u8).collect();
        let sync_point = device.upload_buffer(&data, &dst).unwrap();
        assert!(sync_point.is_complete());

        let read = device.backend().read_buffer(dst.raw(), 0, 1024);
        assert_eq!(read, data);
    }

    #[test]
    fn test_upload_chunks_large_data() {
        let device = GraphicsDevice::new(
            Arc::new(DummyBackend::new()),
            DeviceConfig::default().with_upload_page_size(256),
            None,
        )
        .unwrap();

        let dst = device
            .create_buffer(&BufferDescriptor::new(
                1024,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            ))
            .unwrap();
        let data = vec![0xabu8; 1000];
        device.upload_buffer(&data, &dst).unwrap();

        let read = device.backend().read_buffer(dst.raw(), 0, 1000);
        assert_eq!(read, data);
    }

    #[test]
    fn test_destroy_buffer_defers_until_sync() {
        let backend = Arc::new(DummyBackend::new());
        backend.set_auto_complete(false);
        let device =
            GraphicsDevice::new(backend.clone(), DeviceConfig::default(), None).unwrap();

        let buffer = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        let ctx = device.graphics_queue().create_context("frame").unwrap();
        let sync_point = device.graphics_queue().execute(vec![ctx]).unwrap();

        device.destroy_buffer(buffer, sync_point.clone());
        device.begin_frame();
        assert_eq!(device.deferred_pending(), 1);

        device.graphics_queue().wait_for_sync_point(&sync_point);
        device.begin_frame();
        assert_eq!(device.deferred_pending(), 0);
    }

    #[test]
    fn test_wait_idle_flushes_everything() {
        let device = test_device();
        let buffer = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::STORAGE))
            .unwrap();
        device.destroy_buffer(buffer, SyncPoint::invalid());
        device.wait_idle();
        assert_eq!(device.deferred_pending(), 0);
    }
}
