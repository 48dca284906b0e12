//! Acceleration structure build and compaction workflow.
//!
//! Builds are asynchronous: `build` records the GPU work into a caller's
//! command context and returns a stable [`AccelStructIndex`] immediately.
//! Compaction is deferred twice over — the build must retire, the compacted
//! size must be copied back to CPU-visible memory, and only then does
//! `compact` sub-allocate the exact-size destination and record the
//! compacting copy. Callers poll `compact` once a frame; calling it early or
//! again after compaction is a harmless no-op.
//!
//! Indices are recycled arena-style so external code can hold a plain
//! integer across rebuilds.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::{GpuAccelStruct, GpuBackend, GpuBuffer};
use crate::command::CommandContext;
use crate::error::GpuError;
use crate::sync::SyncPoint;
use crate::types::{BufferDescriptor, BufferUsage};

use super::memory::{AccelMemoryPool, AccelSection};
use super::{AccelBuildFlags, AccelBuildInputs, AccelKind};

/// Stable handle to an acceleration structure slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelStructIndex(u32);

impl AccelStructIndex {
    /// Raw slot index.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Bookkeeping for one acceleration structure.
struct Record {
    kind: AccelKind,
    scratch: Option<AccelSection>,
    result: Option<AccelSection>,
    compacted: Option<AccelSection>,
    result_accel: Option<Arc<GpuAccelStruct>>,
    compacted_accel: Option<Arc<GpuAccelStruct>>,
    /// GPU buffer the post-build compacted size is written into.
    size_buffer: Option<Arc<GpuBuffer>>,
    /// CPU-readback twin of `size_buffer`.
    readback_buffer: Option<Arc<GpuBuffer>>,
    compaction_requested: bool,
    size_copy_recorded: bool,
    is_compacted: bool,
    build_sync: SyncPoint,
    readback_sync: SyncPoint,
}

impl Record {
    fn new(kind: AccelKind) -> Self {
        Self {
            kind,
            scratch: None,
            result: None,
            compacted: None,
            result_accel: None,
            compacted_accel: None,
            size_buffer: None,
            readback_buffer: None,
            compaction_requested: false,
            size_copy_recorded: false,
            is_compacted: false,
            build_sync: SyncPoint::invalid(),
            readback_sync: SyncPoint::invalid(),
        }
    }
}

/// Owns acceleration structure memory and the build/compaction workflow.
///
/// Not internally synchronized; the device wraps it in a mutex.
pub struct AccelStructManager {
    backend: Arc<dyn GpuBackend>,
    memory: AccelMemoryPool,
    records: Vec<Option<Record>>,
    free_indices: VecDeque<u32>,
    /// Slots built since the last submission hook.
    awaiting_build_sync: Vec<u32>,
    /// Slots whose size copy was recorded since the last submission hook.
    awaiting_readback_sync: Vec<u32>,
}

impl std::fmt::Debug for AccelStructManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelStructManager")
            .field("slots", &self.records.len())
            .field("free", &self.free_indices.len())
            .field("memory", &self.memory)
            .finish()
    }
}

impl AccelStructManager {
    /// Create a manager sub-allocating from pages of `page_size` bytes.
    pub fn new(backend: Arc<dyn GpuBackend>, page_size: u64) -> Self {
        Self {
            memory: AccelMemoryPool::new(backend.clone(), page_size),
            backend,
            records: Vec::new(),
            free_indices: VecDeque::new(),
            awaiting_build_sync: Vec::new(),
            awaiting_readback_sync: Vec::new(),
        }
    }

    /// Pop a recycled slot index or grow the arena.
    fn acquire_index(&mut self, kind: AccelKind) -> AccelStructIndex {
        if let Some(index) = self.free_indices.pop_front() {
            self.records[index as usize] = Some(Record::new(kind));
            return AccelStructIndex(index);
        }
        self.records.push(Some(Record::new(kind)));
        AccelStructIndex((self.records.len() - 1) as u32)
    }

    /// Record an acceleration structure build and return its slot.
    ///
    /// Computes memory requirements, sub-allocates scratch and result
    /// sections, and records the build into `ctx`. When
    /// [`AccelBuildFlags::ALLOW_COMPACTION`] is set, additionally allocates
    /// the small size/readback buffer pair and records the post-build
    /// compacted-size write.
    ///
    /// # Panics
    ///
    /// Panics on null inputs (no geometries, zero vertex or instance
    /// address) — those are engine bugs, not runtime conditions.
    pub fn build(
        &mut self,
        ctx: &mut CommandContext,
        inputs: AccelBuildInputs,
        flags: AccelBuildFlags,
    ) -> Result<AccelStructIndex, GpuError> {
        match &inputs {
            AccelBuildInputs::BottomLevel { geometries } => {
                assert!(
                    !geometries.is_empty(),
                    "bottom-level build with no geometries"
                );
                for geometry in geometries {
                    assert!(
                        geometry.vertex_address != 0,
                        "bottom-level build with a null vertex buffer"
                    );
                }
            }
            AccelBuildInputs::TopLevel {
                instance_address, ..
            } => {
                assert!(
                    *instance_address != 0,
                    "top-level build with a null instance buffer"
                );
            }
        }

        let sizes = self.backend.accel_build_sizes(&inputs);
        let scratch = self.memory.allocate(sizes.scratch_size)?;
        let result = self.memory.allocate(sizes.result_size)?;
        let accel = Arc::new(self.backend.create_acceleration_structure(
            result.buffer(),
            result.offset(),
            sizes.result_size,
            inputs.kind(),
        )?);

        let index = self.acquire_index(inputs.kind());
        let record = self.records[index.raw() as usize].as_mut().unwrap();
        record.scratch = Some(scratch);
        record.compaction_requested = flags.contains(AccelBuildFlags::ALLOW_COMPACTION);

        ctx.build_acceleration_structure(
            inputs,
            accel.clone(),
            record.scratch.as_ref().unwrap().gpu_address(),
        );
        // Later builds may reuse the scratch range; the consumer of this
        // structure reads what this build wrote.
        ctx.insert_uav_barrier(None);

        if record.compaction_requested {
            let size_buffer = Arc::new(self.backend.create_buffer(
                &BufferDescriptor::new(
                    std::mem::size_of::<u64>() as u64,
                    BufferUsage::STORAGE | BufferUsage::COPY_SRC,
                )
                .with_label(format!("accel_{}_size", index.raw())),
            )?);
            let readback_buffer = Arc::new(self.backend.create_buffer(
                &BufferDescriptor::new(
                    std::mem::size_of::<u64>() as u64,
                    BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                )
                .with_label(format!("accel_{}_size_readback", index.raw())),
            )?);
            ctx.write_compacted_size(accel.clone(), size_buffer.clone(), 0);
            record.size_buffer = Some(size_buffer);
            record.readback_buffer = Some(readback_buffer);
        }

        record.result = Some(result);
        record.result_accel = Some(accel);
        self.awaiting_build_sync.push(index.raw());

        log::debug!(
            "accel build recorded: slot {} (result {} bytes, scratch {} bytes)",
            index.raw(),
            sizes.result_size,
            sizes.scratch_size
        );
        Ok(index)
    }

    /// Copy every pending post-build compacted size to its CPU-readback
    /// twin in one batch.
    ///
    /// One barrier pair brackets all the copies, amortizing barrier overhead
    /// across every structure built since the last call.
    pub fn copy_compacted_sizes(&mut self, ctx: &mut CommandContext) {
        let mut copied = 0u32;
        for (index, slot) in self.records.iter_mut().enumerate() {
            let Some(record) = slot else { continue };
            if !record.compaction_requested || record.size_copy_recorded {
                continue;
            }
            let (Some(size_buffer), Some(readback_buffer)) =
                (&record.size_buffer, &record.readback_buffer)
            else {
                continue;
            };
            if copied == 0 {
                // One fence for every size write in flight.
                ctx.insert_uav_barrier(None);
            }
            ctx.copy_buffer_raw(
                size_buffer.clone(),
                0,
                readback_buffer.clone(),
                0,
                std::mem::size_of::<u64>() as u64,
            );
            record.size_copy_recorded = true;
            self.awaiting_readback_sync.push(index as u32);
            copied += 1;
        }
        if copied > 0 {
            ctx.insert_uav_barrier(None);
            ctx.flush_barriers();
            log::debug!("accel compacted-size readback: {copied} structures batched");
        }
    }

    /// Issue the compacting copy for a slot if everything it depends on has
    /// retired.
    ///
    /// Returns `Ok(true)` when the copy was recorded (or `Ok(false)` for the
    /// benign not-ready cases: build still in flight, size not read back
    /// yet, compaction never requested, or already compacted — callers poll
    /// again next frame).
    pub fn compact(
        &mut self,
        ctx: &mut CommandContext,
        index: AccelStructIndex,
    ) -> Result<bool, GpuError> {
        let record = self.records[index.raw() as usize]
            .as_mut()
            .expect("compact on a released acceleration structure slot");

        if record.is_compacted || !record.compaction_requested {
            return Ok(false);
        }
        if !record.build_sync.is_valid() || !record.build_sync.is_complete() {
            return Ok(false);
        }
        if !record.size_copy_recorded
            || !record.readback_sync.is_valid()
            || !record.readback_sync.is_complete()
        {
            return Ok(false);
        }

        let readback = record.readback_buffer.as_ref().unwrap();
        let bytes = self
            .backend
            .read_buffer(readback, 0, std::mem::size_of::<u64>() as u64);
        let compacted_size = u64::from_le_bytes(bytes.try_into().unwrap());
        if compacted_size == 0 {
            log::warn!(
                "accel slot {}: compacted size not yet written, retrying later",
                index.raw()
            );
            return Ok(false);
        }

        let kind = record.kind;
        let result_accel = record.result_accel.as_ref().unwrap().clone();
        let section = self.memory.allocate(compacted_size)?;
        // Compaction preserves the structure level.
        let compacted_accel = Arc::new(self.backend.create_acceleration_structure(
            section.buffer(),
            section.offset(),
            compacted_size,
            kind,
        )?);

        ctx.copy_acceleration_structure_compact(result_accel, compacted_accel.clone());

        let record = self.records[index.raw() as usize].as_mut().unwrap();
        record.compacted = Some(section);
        record.compacted_accel = Some(compacted_accel);
        record.is_compacted = true;
        log::debug!(
            "accel slot {}: compacting copy recorded ({} bytes)",
            index.raw(),
            compacted_size
        );
        Ok(true)
    }

    /// GPU virtual address shaders use to reference the structure.
    ///
    /// Returns the compacted structure's address once compaction was issued,
    /// else the original build result — callers never branch on compaction
    /// state.
    pub fn address(&self, index: AccelStructIndex) -> u64 {
        let record = self.records[index.raw() as usize]
            .as_ref()
            .expect("address of a released acceleration structure slot");
        let accel = if record.is_compacted {
            record.compacted_accel.as_ref().unwrap()
        } else {
            record
                .result_accel
                .as_ref()
                .expect("address of a never-built acceleration structure")
        };
        accel.gpu_address()
    }

    /// Whether the compacting copy for a slot was issued.
    pub fn is_compacted(&self, index: AccelStructIndex) -> bool {
        self.records[index.raw() as usize]
            .as_ref()
            .is_some_and(|record| record.is_compacted)
    }

    /// Release a slot: return its memory sections to the pool and recycle
    /// the index.
    pub fn release(&mut self, index: AccelStructIndex) {
        let record = self.records[index.raw() as usize]
            .take()
            .expect("double release of an acceleration structure slot");
        if let Some(section) = record.scratch {
            self.memory.release(section);
        }
        if let Some(section) = record.result {
            self.memory.release(section);
        }
        if let Some(section) = record.compacted {
            self.memory.release(section);
        }
        self.awaiting_build_sync.retain(|i| *i != index.raw());
        self.awaiting_readback_sync.retain(|i| *i != index.raw());
        self.free_indices.push_back(index.raw());
    }

    /// Attach the sync point of the submission that executed the commands
    /// recorded since the last call.
    ///
    /// Call once after executing the context(s) passed to
    /// [`build`](Self::build), [`copy_compacted_sizes`](Self::copy_compacted_sizes)
    /// and [`compact`](Self::compact).
    pub fn on_commands_submitted(&mut self, sync_point: &SyncPoint) {
        for index in self.awaiting_build_sync.drain(..) {
            if let Some(record) = &mut self.records[index as usize] {
                record.build_sync = sync_point.clone();
            }
        }
        for index in self.awaiting_readback_sync.drain(..) {
            if let Some(record) = &mut self.records[index as usize] {
                record.readback_sync = sync_point.clone();
            }
        }
    }

    /// Number of live (unreleased) slots.
    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|slot| slot.is_some()).count()
    }

    /// The backing memory pool, for diagnostics.
    pub fn memory(&self) -> &AccelMemoryPool {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::super::TriangleGeometry;
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::command::CommandQueue;
    use crate::state::GlobalStateTracker;
    use crate::types::{QueueId, QueueKind};

    fn test_setup() -> (Arc<DummyBackend>, CommandQueue, AccelStructManager) {
        let backend = Arc::new(DummyBackend::new());
        let tracker = Arc::new(GlobalStateTracker::new());
        let queue = CommandQueue::new(
            backend.clone() as Arc<dyn GpuBackend>,
            QueueId::new(QueueKind::Compute, 0),
            tracker,
        )
        .unwrap();
        let manager =
            AccelStructManager::new(backend.clone() as Arc<dyn GpuBackend>, 1024 * 1024);
        (backend, queue, manager)
    }

    fn test_blas_inputs(triangle_count: u32) -> AccelBuildInputs {
        AccelBuildInputs::BottomLevel {
            geometries: vec![TriangleGeometry {
                vertex_address: 0x10_0000,
                vertex_count: triangle_count * 3,
                vertex_stride: 12,
                index_address: None,
                triangle_count,
                opaque: true,
            }],
        }
    }

    #[test]
    fn test_build_and_compact_flow() {
        let (_backend, queue, mut manager) = test_setup();

        let mut ctx = queue.create_context("accel_build").unwrap();
        let index = manager
            .build(
                &mut ctx,
                test_blas_inputs(28),
                AccelBuildFlags::ALLOW_COMPACTION | AccelBuildFlags::PREFER_FAST_TRACE,
            )
            .unwrap();
        let build_sync = queue.execute(vec![ctx]).unwrap();
        manager.on_commands_submitted(&build_sync);

        let original_address = manager.address(index);
        assert!(!manager.is_compacted(index));

        // Compacted size has not been read back yet: compact is a no-op.
        let mut ctx = queue.create_context("early_compact").unwrap();
        assert!(!manager.compact(&mut ctx, index).unwrap());
        drop(ctx);

        let mut ctx = queue.create_context("size_readback").unwrap();
        manager.copy_compacted_sizes(&mut ctx);
        let readback_sync = queue.execute(vec![ctx]).unwrap();
        manager.on_commands_submitted(&readback_sync);

        let mut ctx = queue.create_context("compact").unwrap();
        assert!(manager.compact(&mut ctx, index).unwrap());
        queue.execute(vec![ctx]).unwrap();

        assert!(manager.is_compacted(index));
        assert_ne!(manager.address(index), original_address);
    }

    #[test]
    fn test_compact_is_idempotent() {
        let (_backend, queue, mut manager) = test_setup();

        let mut ctx = queue.create_context("build").unwrap();
        let index = manager
            .build(&mut ctx, test_blas_inputs(8), AccelBuildFlags::ALLOW_COMPACTION)
            .unwrap();
        let sync = queue.execute(vec![ctx]).unwrap();
        manager.on_commands_submitted(&sync);

        let mut ctx = queue.create_context("sizes").unwrap();
        manager.copy_compacted_sizes(&mut ctx);
        let sync = queue.execute(vec![ctx]).unwrap();
        manager.on_commands_submitted(&sync);

        let mut ctx = queue.create_context("compact").unwrap();
        assert!(manager.compact(&mut ctx, index).unwrap());
        let commands_after_first = ctx.command_count();
        let pages_after_first = manager.memory().page_count();
        let address_after_first = manager.address(index);

        // Second call: no new sub-allocation, no second copy.
        assert!(!manager.compact(&mut ctx, index).unwrap());
        assert_eq!(ctx.command_count(), commands_after_first);
        assert_eq!(manager.memory().page_count(), pages_after_first);
        assert_eq!(manager.address(index), address_after_first);
        queue.execute(vec![ctx]).unwrap();
    }

    #[test]
    fn test_compact_before_build_retires_is_noop() {
        let (backend, queue, mut manager) = test_setup();
        backend.set_auto_complete(false);

        let mut ctx = queue.create_context("build").unwrap();
        let index = manager
            .build(&mut ctx, test_blas_inputs(8), AccelBuildFlags::ALLOW_COMPACTION)
            .unwrap();
        let sync = queue.execute(vec![ctx]).unwrap();
        manager.on_commands_submitted(&sync);
        assert!(!sync.is_complete());

        let mut ctx = queue.create_context("compact").unwrap();
        assert!(!manager.compact(&mut ctx, index).unwrap());
        drop(ctx);
    }

    #[test]
    fn test_indices_are_recycled() {
        let (_backend, queue, mut manager) = test_setup();

        let mut ctx = queue.create_context("build").unwrap();
        let first = manager
            .build(&mut ctx, test_blas_inputs(4), AccelBuildFlags::default())
            .unwrap();
        let second = manager
            .build(&mut ctx, test_blas_inputs(4), AccelBuildFlags::default())
            .unwrap();
        assert_ne!(first.raw(), second.raw());

        manager.release(first);
        let third = manager
            .build(&mut ctx, test_blas_inputs(4), AccelBuildFlags::default())
            .unwrap();
        assert_eq!(third.raw(), first.raw());
        assert_eq!(manager.live_count(), 2);
        queue.execute(vec![ctx]).unwrap();
    }

    #[test]
    #[should_panic(expected = "null instance buffer")]
    fn test_null_instance_buffer_panics() {
        let (_backend, queue, mut manager) = test_setup();
        let mut ctx = queue.create_context("build").unwrap();
        let _ = manager.build(
            &mut ctx,
            AccelBuildInputs::TopLevel {
                instance_address: 0,
                instance_count: 1,
            },
            AccelBuildFlags::default(),
        );
    }

    #[test]
    fn test_compaction_not_requested_is_noop() {
        let (_backend, queue, mut manager) = test_setup();

        let mut ctx = queue.create_context("build").unwrap();
        let index = manager
            .build(&mut ctx, test_blas_inputs(8), AccelBuildFlags::PREFER_FAST_TRACE)
            .unwrap();
        let sync = queue.execute(vec![ctx]).unwrap();
        manager.on_commands_submitted(&sync);

        let mut ctx = queue.create_context("compact").unwrap();
        assert!(!manager.compact(&mut ctx, index).unwrap());
        assert!(!manager.is_compacted(index));
        drop(ctx);
    }
}
