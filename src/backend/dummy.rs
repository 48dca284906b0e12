//! Dummy GPU backend for testing and development.
//!
//! No GPU is involved: buffers are plain byte vectors, queue timelines are
//! atomics, and submitted command lists are interpreted on the CPU. Copies
//! and compacted-size writes actually move bytes, so readback-dependent flows
//! behave like they do on hardware.
//!
//! Completion is simulated. By default a submission completes the moment it
//! is "submitted"; tests that exercise fence-gated recycling call
//! [`DummyBackend::set_auto_complete`]`(false)` and retire work explicitly
//! with [`DummyBackend::complete_up_to`] (a CPU-side wait also forces
//! completion, mirroring a real fence wait).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::command::{CommandList, RecordedCommand};
use crate::error::GpuError;
use crate::pipeline::PipelineDesc;
use crate::raytracing::{AccelBuildInputs, AccelKind, AccelSizes};
use crate::types::{align_up, BufferDescriptor, QueueId, TextureDescriptor};

use super::{
    GpuAccelStruct, GpuBackend, GpuBuffer, GpuCommandAllocator, GpuPipeline, GpuTexture,
    GpuTimeline, SHADER_IDENTIFIER_SIZE,
};

/// Acceleration structure alignment the dummy backend pretends the API
/// requires (matches the common hardware requirement).
const ACCEL_ALIGNMENT: u64 = 256;

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    next_address: AtomicU64,
    auto_complete: AtomicBool,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self {
            // Fabricated GPU virtual address space starts well away from 0 so
            // address arithmetic bugs surface as obviously-wrong values.
            next_address: AtomicU64::new(0x1_0000_0000),
            auto_complete: AtomicBool::new(true),
        }
    }

    /// Control whether submissions complete immediately.
    ///
    /// With auto-complete off, fence values only advance via
    /// [`complete_up_to`](Self::complete_up_to) or a CPU-side wait.
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.auto_complete.store(auto_complete, Ordering::Release);
    }

    /// Advance a timeline's completed value (simulating GPU progress).
    pub fn complete_up_to(&self, timeline: &GpuTimeline, value: u64) {
        match timeline {
            GpuTimeline::Dummy { completed } => {
                completed.fetch_max(value, Ordering::AcqRel);
            }
            #[cfg(feature = "vulkan-backend")]
            _ => log::error!("DummyBackend: foreign timeline handle"),
        }
    }

    fn allocate_address(&self, size: u64) -> u64 {
        self.next_address
            .fetch_add(align_up(size.max(1), ACCEL_ALIGNMENT), Ordering::Relaxed)
    }

    fn execute_list(&self, list: &CommandList) {
        log::trace!(
            "DummyBackend: executing list '{}' ({} commands)",
            list.name,
            list.commands.len()
        );
        for command in &list.commands {
            match command {
                RecordedCommand::Barriers(barriers) => {
                    log::trace!("DummyBackend: barrier batch of {}", barriers.len());
                }
                RecordedCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let data = self.read_buffer(src, *src_offset, *size);
                    self.write_buffer(dst, *dst_offset, &data);
                }
                RecordedCommand::WriteCompactedSize {
                    accel,
                    dst,
                    dst_offset,
                } => {
                    // Pretend compaction recovers half the conservative
                    // build-size estimate.
                    let compacted = align_up(accel.size() / 2, ACCEL_ALIGNMENT).max(ACCEL_ALIGNMENT);
                    self.write_buffer(dst, *dst_offset, &compacted.to_le_bytes());
                }
                other => {
                    log::trace!("DummyBackend: {:?}", DummyCommandName(other));
                }
            }
        }
    }
}

/// Compact per-command debug label, avoiding the full payload dump.
struct DummyCommandName<'a>(&'a RecordedCommand);

impl std::fmt::Debug for DummyCommandName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            RecordedCommand::Barriers(_) => "Barriers",
            RecordedCommand::CopyBuffer { .. } => "CopyBuffer",
            RecordedCommand::CopyBufferToTexture { .. } => "CopyBufferToTexture",
            RecordedCommand::SetPipeline(_) => "SetPipeline",
            RecordedCommand::BeginRendering { .. } => "BeginRendering",
            RecordedCommand::EndRendering => "EndRendering",
            RecordedCommand::BindVertexBuffer { .. } => "BindVertexBuffer",
            RecordedCommand::BindIndexBuffer { .. } => "BindIndexBuffer",
            RecordedCommand::Draw { .. } => "Draw",
            RecordedCommand::DrawIndexed { .. } => "DrawIndexed",
            RecordedCommand::DrawIndirect { .. } => "DrawIndirect",
            RecordedCommand::Dispatch { .. } => "Dispatch",
            RecordedCommand::DispatchRays { .. } => "DispatchRays",
            RecordedCommand::BuildAccelStruct { .. } => "BuildAccelStruct",
            RecordedCommand::CopyAccelStructCompact { .. } => "CopyAccelStructCompact",
            RecordedCommand::WriteCompactedSize { .. } => "WriteCompactedSize",
        };
        f.write_str(name)
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GpuError> {
        if descriptor.size == 0 {
            return Err(GpuError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        Ok(GpuBuffer::new_dummy(
            descriptor.size,
            self.allocate_address(descriptor.size),
        ))
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<GpuTexture, GpuError> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{})",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.size.depth
        );
        Ok(GpuTexture::Dummy)
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) {
        match buffer {
            GpuBuffer::Dummy { storage, .. } => {
                let mut storage = storage.lock();
                let end = offset as usize + data.len();
                assert!(
                    end <= storage.len(),
                    "write of {} bytes at offset {} overruns buffer of {} bytes",
                    data.len(),
                    offset,
                    storage.len()
                );
                storage[offset as usize..end].copy_from_slice(data);
            }
            #[cfg(feature = "vulkan-backend")]
            _ => log::error!("DummyBackend: foreign buffer handle"),
        }
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, size: u64) -> Vec<u8> {
        match buffer {
            GpuBuffer::Dummy { storage, .. } => {
                let storage = storage.lock();
                let end = (offset + size) as usize;
                assert!(
                    end <= storage.len(),
                    "read of {size} bytes at offset {offset} overruns buffer of {} bytes",
                    storage.len()
                );
                storage[offset as usize..end].to_vec()
            }
            #[cfg(feature = "vulkan-backend")]
            _ => {
                log::error!("DummyBackend: foreign buffer handle");
                vec![0; size as usize]
            }
        }
    }

    fn create_timeline(&self, queue: QueueId) -> Result<GpuTimeline, GpuError> {
        log::trace!("DummyBackend: creating timeline for {queue}");
        Ok(GpuTimeline::Dummy {
            completed: AtomicU64::new(0),
        })
    }

    fn query_completed_value(&self, timeline: &GpuTimeline) -> u64 {
        match timeline {
            GpuTimeline::Dummy { completed } => completed.load(Ordering::Acquire),
            #[cfg(feature = "vulkan-backend")]
            _ => 0,
        }
    }

    fn wait_timeline(&self, timeline: &GpuTimeline, value: u64) {
        // A CPU wait on simulated hardware means "the GPU catches up now".
        self.complete_up_to(timeline, value);
    }

    fn create_command_allocator(&self, queue: QueueId) -> Result<GpuCommandAllocator, GpuError> {
        log::trace!("DummyBackend: creating command allocator for {queue}");
        Ok(GpuCommandAllocator::Dummy)
    }

    fn reset_command_allocator(&self, _allocator: &GpuCommandAllocator) {
        log::trace!("DummyBackend: resetting command allocator");
    }

    fn submit(
        &self,
        queue: QueueId,
        lists: &[CommandList],
        _allocator: &GpuCommandAllocator,
        waits: &[(&GpuTimeline, u64)],
        timeline: &GpuTimeline,
        signal_value: u64,
    ) -> Result<(), GpuError> {
        log::trace!(
            "DummyBackend: submit to {queue}: {} lists, {} waits, signal {signal_value}",
            lists.len(),
            waits.len()
        );
        // Execution is single-threaded here; GPU-side waits are trivially
        // satisfied by submission order.
        for list in lists {
            self.execute_list(list);
        }
        if self.auto_complete.load(Ordering::Acquire) {
            self.complete_up_to(timeline, signal_value);
        }
        Ok(())
    }

    fn signal(
        &self,
        queue: QueueId,
        timeline: &GpuTimeline,
        value: u64,
    ) -> Result<(), GpuError> {
        log::trace!("DummyBackend: signal {value} on {queue}");
        if self.auto_complete.load(Ordering::Acquire) {
            self.complete_up_to(timeline, value);
        }
        Ok(())
    }

    fn accel_build_sizes(&self, inputs: &AccelBuildInputs) -> AccelSizes {
        // Conservative fabricated estimates, roughly shaped like driver
        // output: linear in primitive count, generously padded.
        let primitives = inputs.primitive_count();
        let result_size = align_up(primitives * 64 + ACCEL_ALIGNMENT, ACCEL_ALIGNMENT);
        let scratch_size = align_up(primitives * 32 + ACCEL_ALIGNMENT, ACCEL_ALIGNMENT);
        AccelSizes {
            result_size,
            scratch_size,
            update_scratch_size: scratch_size,
        }
    }

    fn create_acceleration_structure(
        &self,
        buffer: &GpuBuffer,
        offset: u64,
        size: u64,
        kind: AccelKind,
    ) -> Result<GpuAccelStruct, GpuError> {
        log::trace!(
            "DummyBackend: creating {kind:?} acceleration structure ({size} bytes at +{offset})"
        );
        Ok(GpuAccelStruct::Dummy {
            address: buffer.gpu_address() + offset,
            size,
        })
    }

    fn compile_pipeline(&self, desc: &PipelineDesc) -> Result<GpuPipeline, GpuError> {
        let mut identifiers = HashMap::new();
        for export in desc.export_names() {
            identifiers.insert(export.clone(), fabricate_identifier(&export));
        }
        log::trace!(
            "DummyBackend: compiled {} pipeline ({} exports)",
            desc.kind_name(),
            identifiers.len()
        );
        Ok(GpuPipeline::Dummy { identifiers })
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a deterministic fake shader-group identifier from an export name.
fn fabricate_identifier(name: &str) -> [u8; SHADER_IDENTIFIER_SIZE] {
    use std::hash::{Hash, Hasher};
    let mut identifier = [0u8; SHADER_IDENTIFIER_SIZE];
    let mut seed = 0u64;
    for chunk in identifier.chunks_mut(8) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        seed.hash(&mut hasher);
        seed = hasher.finish();
        chunk.copy_from_slice(&seed.to_le_bytes()[..chunk.len()]);
    }
    identifier
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_round_trip() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(64, Default::default()))
            .unwrap();
        backend.write_buffer(&buffer, 8, &[1, 2, 3, 4]);
        assert_eq!(backend.read_buffer(&buffer, 8, 4), vec![1, 2, 3, 4]);
        assert_eq!(backend.read_buffer(&buffer, 0, 4), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_addresses_are_distinct() {
        let backend = DummyBackend::new();
        let a = backend
            .create_buffer(&BufferDescriptor::new(100, Default::default()))
            .unwrap();
        let b = backend
            .create_buffer(&BufferDescriptor::new(100, Default::default()))
            .unwrap();
        assert_ne!(a.gpu_address(), b.gpu_address());
    }

    #[test]
    fn test_zero_size_buffer_rejected() {
        let backend = DummyBackend::new();
        assert!(backend
            .create_buffer(&BufferDescriptor::new(0, Default::default()))
            .is_err());
    }

    #[test]
    fn test_fabricated_identifiers_deterministic() {
        let a = fabricate_identifier("raygen_main");
        let b = fabricate_identifier("raygen_main");
        let c = fabricate_identifier("miss_main");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
