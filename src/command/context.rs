//! Command recording context with automatic state tracking.
//!
//! A context records into one command list. Barrier handling follows three
//! rules:
//!
//! 1. Transitions for resources the context has already touched are resolved
//!    immediately and batched; the batch is flushed as a single barrier
//!    command right before any operation that reads or writes GPU memory.
//! 2. The *first* touch of a resource can't know the correct before-state
//!    (another thread may still be recording the list that precedes this one
//!    in submission order), so it becomes a pending barrier resolved at
//!    submission time against the global tracker.
//! 3. Aliasing and UAV barriers are declarative and skip state lookup
//!    entirely.
//!
//! Contexts may be recorded on worker threads; nothing here takes the global
//! tracker's lock. The owning [`CommandQueue`](super::CommandQueue) performs
//! the pending-barrier reconciliation in submission order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{GpuAccelStruct, GpuBuffer};
use crate::pipeline::{CompiledPipeline, ShaderTableRegions};
use crate::raytracing::AccelBuildInputs;
use crate::resources::{Buffer, Texture, TrackedResource};
use crate::state::{
    Barrier, PendingBarrier, ResourceAccess, ResourceId, ResourceRef, ALL_SUBRESOURCES,
};
use crate::types::QueueKind;

use super::allocator_pool::CommandAllocator;
use super::{CommandList, IndexFormat, RecordedCommand};

/// States this context knows a resource's subresources to be in.
struct LocalResourceState {
    resource: ResourceRef,
    /// Per-subresource state as left by this list; `None` = untouched here.
    states: Vec<Option<ResourceAccess>>,
}

/// A context after recording ends, ready for submission-time reconciliation.
pub(crate) struct FinishedContext {
    pub allocator: CommandAllocator,
    pub pending: Vec<PendingBarrier>,
    pub final_states: Vec<(ResourceRef, u32, ResourceAccess)>,
    pub main: CommandList,
}

/// Recording surface for one command list.
pub struct CommandContext {
    name: String,
    queue_kind: QueueKind,
    allocator: CommandAllocator,
    commands: Vec<RecordedCommand>,
    barrier_batch: Vec<Barrier>,
    local_states: HashMap<ResourceId, LocalResourceState>,
    pending: Vec<PendingBarrier>,
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("name", &self.name)
            .field("queue_kind", &self.queue_kind)
            .field("commands", &self.commands.len())
            .field("batched_barriers", &self.barrier_batch.len())
            .field("pending_barriers", &self.pending.len())
            .finish()
    }
}

impl CommandContext {
    pub(crate) fn new(
        name: impl Into<String>,
        queue_kind: QueueKind,
        allocator: CommandAllocator,
    ) -> Self {
        Self {
            name: name.into(),
            queue_kind,
            allocator,
            commands: Vec::new(),
            barrier_batch: Vec::new(),
            local_states: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Debug name of the list being recorded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue category the context records for.
    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    // ------------------------------------------------------------------
    // Barriers
    // ------------------------------------------------------------------

    /// Require `subresource` of `resource` to be in `after` before the next
    /// flushed operation.
    ///
    /// Known-state transitions are batched immediately; first touches become
    /// pending barriers resolved at submission.
    pub fn transition_resource(
        &mut self,
        resource: &dyn TrackedResource,
        subresource: u32,
        after: ResourceAccess,
    ) {
        let resource_ref = resource.resource_ref();
        let subresource_count = resource_ref.subresource_count;
        let entry = self
            .local_states
            .entry(resource_ref.id)
            .or_insert_with(|| LocalResourceState {
                resource: resource_ref.clone(),
                states: vec![None; subresource_count as usize],
            });

        if subresource == ALL_SUBRESOURCES {
            if entry.states.iter().all(Option::is_none) {
                // First touch of the whole resource: defer as one pending
                // barrier and claim every subresource.
                self.pending.push(PendingBarrier {
                    resource: resource_ref,
                    subresource: ALL_SUBRESOURCES,
                    after,
                });
                entry.states.fill(Some(after));
                return;
            }
            for index in 0..subresource_count {
                Self::transition_one(
                    &mut self.barrier_batch,
                    &mut self.pending,
                    entry,
                    index,
                    after,
                );
            }
        } else {
            assert!(
                subresource < subresource_count,
                "subresource {subresource} out of range ({subresource_count} subresources)"
            );
            Self::transition_one(
                &mut self.barrier_batch,
                &mut self.pending,
                entry,
                subresource,
                after,
            );
        }
    }

    fn transition_one(
        batch: &mut Vec<Barrier>,
        pending: &mut Vec<PendingBarrier>,
        entry: &mut LocalResourceState,
        subresource: u32,
        after: ResourceAccess,
    ) {
        match entry.states[subresource as usize] {
            Some(before) => {
                if before != after {
                    batch.push(Barrier::Transition {
                        resource: entry.resource.clone(),
                        subresource,
                        before,
                        after,
                    });
                }
            }
            None => pending.push(PendingBarrier {
                resource: entry.resource.clone(),
                subresource,
                after,
            }),
        }
        entry.states[subresource as usize] = Some(after);
    }

    /// Insert a read/write hazard barrier for unordered access.
    ///
    /// `None` fences all outstanding UAV work.
    pub fn insert_uav_barrier(&mut self, resource: Option<&dyn TrackedResource>) {
        self.barrier_batch.push(Barrier::Uav {
            resource: resource.map(TrackedResource::resource_ref),
        });
    }

    /// Insert an aliasing barrier between two placed resources.
    pub fn insert_aliasing_barrier(
        &mut self,
        before: Option<&dyn TrackedResource>,
        after: Option<&dyn TrackedResource>,
    ) {
        self.barrier_batch.push(Barrier::Aliasing {
            before: before.map(TrackedResource::resource_ref),
            after: after.map(TrackedResource::resource_ref),
        });
    }

    /// Flush all batched barriers as a single barrier command.
    ///
    /// Called automatically before every operation that reads or writes GPU
    /// memory; explicit calls are only needed around raw backend work.
    pub fn flush_barriers(&mut self) {
        if self.barrier_batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.barrier_batch);
        log::trace!("{}: flushing {} barriers", self.name, batch.len());
        self.commands.push(RecordedCommand::Barriers(batch));
    }

    // ------------------------------------------------------------------
    // Copies
    // ------------------------------------------------------------------

    /// Copy a region between tracked buffers.
    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.transition_resource(src, ALL_SUBRESOURCES, ResourceAccess::CopySource);
        self.transition_resource(dst, ALL_SUBRESOURCES, ResourceAccess::CopyDest);
        self.flush_barriers();
        self.commands.push(RecordedCommand::CopyBuffer {
            src: src.raw().clone(),
            src_offset,
            dst: dst.raw().clone(),
            dst_offset,
            size,
        });
    }

    /// Copy staged rows from an (untracked) upload buffer into one texture
    /// subresource.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: Arc<GpuBuffer>,
        src_offset: u64,
        bytes_per_row: u32,
        dst: &Texture,
        subresource: u32,
    ) {
        self.transition_resource(dst, subresource, ResourceAccess::CopyDest);
        self.flush_barriers();
        self.commands.push(RecordedCommand::CopyBufferToTexture {
            src,
            src_offset,
            bytes_per_row,
            dst: dst.raw().clone(),
            subresource,
        });
    }

    /// Copy a staged upload allocation into a tracked buffer.
    pub fn copy_upload_to_buffer(
        &mut self,
        src: &crate::upload::UploadAllocation,
        dst: &Buffer,
        dst_offset: u64,
    ) {
        self.transition_resource(dst, ALL_SUBRESOURCES, ResourceAccess::CopyDest);
        self.flush_barriers();
        self.commands.push(RecordedCommand::CopyBuffer {
            src: src.buffer.clone(),
            src_offset: src.offset,
            dst: dst.raw().clone(),
            dst_offset,
            size: src.size,
        });
    }

    /// Copy between raw backend buffers that sit outside state tracking
    /// (upload pages, readback twins, internal bookkeeping buffers).
    pub(crate) fn copy_buffer_raw(
        &mut self,
        src: Arc<GpuBuffer>,
        src_offset: u64,
        dst: Arc<GpuBuffer>,
        dst_offset: u64,
        size: u64,
    ) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    // ------------------------------------------------------------------
    // Draw / dispatch
    // ------------------------------------------------------------------

    /// Bind a compiled pipeline.
    pub fn set_pipeline(&mut self, pipeline: &Arc<CompiledPipeline>) {
        self.commands
            .push(RecordedCommand::SetPipeline(pipeline.clone()));
    }

    /// Begin rendering to the given color targets (and optional depth
    /// target), transitioning them as needed.
    pub fn begin_rendering(&mut self, color_targets: &[&Texture], depth_target: Option<&Texture>) {
        for target in color_targets {
            self.transition_resource(*target, ALL_SUBRESOURCES, ResourceAccess::RenderTarget);
        }
        if let Some(depth) = depth_target {
            self.transition_resource(depth, ALL_SUBRESOURCES, ResourceAccess::DepthWrite);
        }
        self.flush_barriers();
        self.commands.push(RecordedCommand::BeginRendering {
            color_targets: color_targets.iter().map(|t| t.raw().clone()).collect(),
            depth_target: depth_target.map(|t| t.raw().clone()),
        });
    }

    /// End the current rendering scope.
    pub fn end_rendering(&mut self) {
        self.commands.push(RecordedCommand::EndRendering);
    }

    /// Bind a vertex buffer to slot 0.
    pub fn bind_vertex_buffer(&mut self, buffer: &Buffer, offset: u64) {
        self.transition_resource(
            buffer,
            ALL_SUBRESOURCES,
            ResourceAccess::VertexAndConstantBuffer,
        );
        self.commands.push(RecordedCommand::BindVertexBuffer {
            buffer: buffer.raw().clone(),
            offset,
        });
    }

    /// Bind an index buffer.
    pub fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, format: IndexFormat) {
        self.transition_resource(buffer, ALL_SUBRESOURCES, ResourceAccess::IndexBuffer);
        self.commands.push(RecordedCommand::BindIndexBuffer {
            buffer: buffer.raw().clone(),
            offset,
            format,
        });
    }

    /// Non-indexed draw.
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
    }

    /// Indexed draw.
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, base_vertex: i32) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            base_vertex,
            first_instance: 0,
        });
    }

    /// Indirect draw consuming argument records from `buffer`.
    pub fn draw_indirect(&mut self, buffer: &Buffer, offset: u64, draw_count: u32, stride: u32) {
        self.transition_resource(buffer, ALL_SUBRESOURCES, ResourceAccess::IndirectArgument);
        self.flush_barriers();
        self.commands.push(RecordedCommand::DrawIndirect {
            buffer: buffer.raw().clone(),
            offset,
            draw_count,
            stride,
        });
    }

    /// Compute dispatch.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::Dispatch { x, y, z });
    }

    /// Ray dispatch over a shader binding table.
    pub fn dispatch_rays(&mut self, table: &ShaderTableRegions, width: u32, height: u32, depth: u32) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::DispatchRays {
            table: table.clone(),
            width,
            height,
            depth,
        });
    }

    // ------------------------------------------------------------------
    // Ray-tracing acceleration structures
    // ------------------------------------------------------------------

    /// Record an acceleration structure build.
    pub(crate) fn build_acceleration_structure(
        &mut self,
        inputs: AccelBuildInputs,
        dst: Arc<GpuAccelStruct>,
        scratch_address: u64,
    ) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::BuildAccelStruct {
            inputs,
            dst,
            scratch_address,
        });
    }

    /// Record a compacting acceleration structure copy.
    pub(crate) fn copy_acceleration_structure_compact(
        &mut self,
        src: Arc<GpuAccelStruct>,
        dst: Arc<GpuAccelStruct>,
    ) {
        self.flush_barriers();
        self.commands
            .push(RecordedCommand::CopyAccelStructCompact { src, dst });
    }

    /// Record a post-build compacted-size write into a buffer.
    pub(crate) fn write_compacted_size(
        &mut self,
        accel: Arc<GpuAccelStruct>,
        dst: Arc<GpuBuffer>,
        dst_offset: u64,
    ) {
        self.flush_barriers();
        self.commands.push(RecordedCommand::WriteCompactedSize {
            accel,
            dst,
            dst_offset,
        });
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Number of commands recorded so far (barrier flushes included).
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Pending (unresolved) barrier count; exposed for tests and debugging.
    pub fn pending_barrier_count(&self) -> usize {
        self.pending.len()
    }

    /// End recording: flush leftovers and export everything the queue needs
    /// to reconcile and submit.
    pub(crate) fn finish(mut self) -> FinishedContext {
        self.flush_barriers();

        let mut final_states = Vec::with_capacity(self.local_states.len());
        for (_, entry) in self.local_states {
            let first = entry.states.first().copied().flatten();
            let uniform = first
                .filter(|_| entry.states.iter().all(|state| *state == entry.states[0]));
            if let Some(access) = uniform {
                final_states.push((entry.resource, ALL_SUBRESOURCES, access));
            } else {
                for (index, state) in entry.states.iter().enumerate() {
                    if let Some(access) = state {
                        final_states.push((entry.resource.clone(), index as u32, *access));
                    }
                }
            }
        }

        FinishedContext {
            allocator: self.allocator,
            pending: self.pending,
            final_states,
            main: CommandList {
                name: self.name,
                queue: self.queue_kind,
                commands: self.commands,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::GpuBackend;
    use crate::command::CommandAllocatorPool;
    use crate::state::RawResource;
    use crate::types::{BufferDescriptor, QueueId};

    struct TestResource {
        resource_ref: ResourceRef,
    }

    impl TestResource {
        fn new(backend: &DummyBackend, id: u64, subresources: u32) -> Self {
            let raw = backend
                .create_buffer(&BufferDescriptor::new(256, Default::default()))
                .unwrap();
            Self {
                resource_ref: ResourceRef {
                    id: ResourceId::from_raw(id),
                    raw: RawResource::Buffer(Arc::new(raw)),
                    subresource_count: subresources,
                },
            }
        }
    }

    impl TrackedResource for TestResource {
        fn resource_ref(&self) -> ResourceRef {
            self.resource_ref.clone()
        }
    }

    fn test_context() -> (Arc<DummyBackend>, CommandContext) {
        let backend = Arc::new(DummyBackend::new());
        let pool = CommandAllocatorPool::new(
            backend.clone() as Arc<dyn GpuBackend>,
            QueueId::new(QueueKind::Graphics, 0),
        );
        let allocator = pool.request_allocator(0).unwrap();
        let context = CommandContext::new("test", QueueKind::Graphics, allocator);
        (backend, context)
    }

    #[test]
    fn test_first_touch_defers_barrier() {
        let (backend, mut ctx) = test_context();
        let resource = TestResource::new(&backend, 1, 1);

        ctx.transition_resource(&resource, ALL_SUBRESOURCES, ResourceAccess::CopyDest);
        // No local record existed: nothing is emitted yet, the transition
        // waits for submission-time resolution.
        assert_eq!(ctx.pending_barrier_count(), 1);
        assert_eq!(ctx.command_count(), 0);
    }

    #[test]
    fn test_known_state_transition_is_batched_and_flushed() {
        let (backend, mut ctx) = test_context();
        let resource = TestResource::new(&backend, 2, 1);

        ctx.transition_resource(&resource, ALL_SUBRESOURCES, ResourceAccess::CopyDest);
        ctx.transition_resource(&resource, ALL_SUBRESOURCES, ResourceAccess::CopySource);
        // The second transition has a known before-state; it batches rather
        // than recording a command on the spot.
        assert_eq!(ctx.pending_barrier_count(), 1);
        assert_eq!(ctx.command_count(), 0);

        // The flush before a dispatch emits the batch as one command.
        ctx.dispatch(8, 8, 1);
        assert_eq!(ctx.command_count(), 2);

        let finished = ctx.finish();
        match &finished.main.commands[0] {
            RecordedCommand::Barriers(barriers) => {
                assert_eq!(barriers.len(), 1);
                match &barriers[0] {
                    Barrier::Transition { before, after, .. } => {
                        assert_eq!(*before, ResourceAccess::CopyDest);
                        assert_eq!(*after, ResourceAccess::CopySource);
                    }
                    other => panic!("unexpected barrier {other:?}"),
                }
            }
            other => panic!("expected a barrier flush, got {other:?}"),
        }
    }

    #[test]
    fn test_same_state_transition_is_elided() {
        let (backend, mut ctx) = test_context();
        let resource = TestResource::new(&backend, 3, 1);

        ctx.transition_resource(&resource, ALL_SUBRESOURCES, ResourceAccess::ShaderResource);
        ctx.transition_resource(&resource, ALL_SUBRESOURCES, ResourceAccess::ShaderResource);
        ctx.flush_barriers();
        // Redundant transition: only the initial pending entry exists.
        assert_eq!(ctx.pending_barrier_count(), 1);
        assert_eq!(ctx.command_count(), 0);
    }

    #[test]
    fn test_final_states_collapse_to_uniform() {
        let (backend, mut ctx) = test_context();
        let resource = TestResource::new(&backend, 4, 4);

        ctx.transition_resource(&resource, 1, ResourceAccess::CopyDest);
        ctx.transition_resource(&resource, ALL_SUBRESOURCES, ResourceAccess::ShaderResource);
        let finished = ctx.finish();

        assert_eq!(finished.final_states.len(), 1);
        let (_, subresource, access) = &finished.final_states[0];
        assert_eq!(*subresource, ALL_SUBRESOURCES);
        assert_eq!(*access, ResourceAccess::ShaderResource);
    }

    #[test]
    fn test_uav_barrier_is_declarative() {
        let (backend, mut ctx) = test_context();
        let resource = TestResource::new(&backend, 5, 1);

        ctx.insert_uav_barrier(Some(&resource));
        // No state lookup, no pending entry.
        assert_eq!(ctx.pending_barrier_count(), 0);
        ctx.dispatch(1, 1, 1);
        assert_eq!(ctx.command_count(), 2);
    }
}
