//! Command recording and submission.
//!
//! Recording happens CPU-side into [`CommandList`]s — a flat sequence of
//! [`RecordedCommand`]s holding strong references to every resource they
//! touch. Backends translate a list at submission time; until its fence value
//! retires, the owning queue keeps the list (and therefore its resources)
//! alive.

mod allocator_pool;
mod context;
mod queue;

pub use allocator_pool::{CommandAllocator, CommandAllocatorPool};
pub use context::CommandContext;
pub use queue::CommandQueue;

use std::sync::Arc;

use crate::backend::{GpuAccelStruct, GpuBuffer, GpuTexture};
use crate::pipeline::CompiledPipeline;
use crate::pipeline::ShaderTableRegions;
use crate::raytracing::AccelBuildInputs;
use crate::state::Barrier;
use crate::types::QueueKind;

/// Index buffer element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    /// 16-bit indices.
    Uint16,
    /// 32-bit indices.
    Uint32,
}

/// One recorded GPU command.
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    /// Flush a batch of barriers as one barrier call.
    Barriers(Vec<Barrier>),
    /// Copy a buffer region.
    CopyBuffer {
        src: Arc<GpuBuffer>,
        src_offset: u64,
        dst: Arc<GpuBuffer>,
        dst_offset: u64,
        size: u64,
    },
    /// Copy tightly described buffer rows into one texture subresource.
    CopyBufferToTexture {
        src: Arc<GpuBuffer>,
        src_offset: u64,
        bytes_per_row: u32,
        dst: Arc<GpuTexture>,
        subresource: u32,
    },
    /// Bind a compiled pipeline.
    SetPipeline(Arc<CompiledPipeline>),
    /// Begin rendering to the given targets.
    BeginRendering {
        color_targets: Vec<Arc<GpuTexture>>,
        depth_target: Option<Arc<GpuTexture>>,
    },
    /// End the current rendering scope.
    EndRendering,
    /// Bind a vertex buffer to slot 0.
    BindVertexBuffer { buffer: Arc<GpuBuffer>, offset: u64 },
    /// Bind an index buffer.
    BindIndexBuffer {
        buffer: Arc<GpuBuffer>,
        offset: u64,
        format: IndexFormat,
    },
    /// Non-indexed draw.
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    /// Indexed draw.
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    /// Indirect draw reading [`DrawIndirectArgs`](crate::types::DrawIndirectArgs)
    /// records from a buffer.
    DrawIndirect {
        buffer: Arc<GpuBuffer>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    /// Compute dispatch.
    Dispatch { x: u32, y: u32, z: u32 },
    /// Ray dispatch over a shader binding table.
    DispatchRays {
        table: ShaderTableRegions,
        width: u32,
        height: u32,
        depth: u32,
    },
    /// Build an acceleration structure into `dst`.
    BuildAccelStruct {
        inputs: AccelBuildInputs,
        dst: Arc<GpuAccelStruct>,
        scratch_address: u64,
    },
    /// Compacting copy between acceleration structures.
    CopyAccelStructCompact {
        src: Arc<GpuAccelStruct>,
        dst: Arc<GpuAccelStruct>,
    },
    /// Write an acceleration structure's post-build compacted size (8 bytes)
    /// into a buffer.
    WriteCompactedSize {
        accel: Arc<GpuAccelStruct>,
        dst: Arc<GpuBuffer>,
        dst_offset: u64,
    },
}

/// A closed, submittable sequence of commands.
#[derive(Debug)]
pub struct CommandList {
    /// Debug name (shows up in captures and logs).
    pub name: String,
    /// Queue category the list was recorded for.
    pub queue: QueueKind,
    /// The recorded commands, in order.
    pub commands: Vec<RecordedCommand>,
}

impl CommandList {
    /// Create an empty list.
    pub fn new(name: impl Into<String>, queue: QueueKind) -> Self {
        Self {
            name: name.into(),
            queue,
            commands: Vec::new(),
        }
    }

    /// Whether the list records no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
