//! Integration tests for the GPU submission core.
//!
//! Functional flows (uploads, cross-list barriers, cross-queue waits) run
//! against every available backend via `rstest`; tests that must freeze the
//! fence to observe recycling behavior drive the dummy backend's completion
//! controls directly.

mod common;

use rstest::rstest;
use std::sync::Arc;

use amaranth_graphics::backend::dummy::DummyBackend;
use amaranth_graphics::backend::GpuBackend;
use amaranth_graphics::pipeline::{
    BindingLayout, HitGroup, RaytracingPipelineDesc, RaytracingShader, ShaderTableBuilder,
};
use amaranth_graphics::raytracing::{AccelMemoryPool, TriangleGeometry};
use amaranth_graphics::shader::{Shader, ShaderStage};
use amaranth_graphics::{
    AccelBuildFlags, AccelBuildInputs, GraphicsInstance, ResourceAccess, SyncPoint,
    ALL_SUBRESOURCES,
};

use common::{generate_test_pattern, Backend, TestContext};

// ============================================================================
// Upload and copy round trips
// ============================================================================

/// Upload data to a GPU buffer, copy it to a readback buffer through a
/// graphics-queue context, and verify the bytes survive the round trip.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_upload_copy_readback(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    const SIZE: u64 = 4096;
    let pattern = generate_test_pattern(SIZE as usize);

    let gpu_buffer = ctx.create_gpu_buffer(SIZE);
    let readback = ctx.create_readback_buffer(SIZE);

    let upload_sync = ctx.device.upload_buffer(&pattern, &gpu_buffer).unwrap();

    let queue = ctx.device.graphics_queue();
    queue.gpu_wait(&upload_sync);
    let mut recording = queue.create_context("download").unwrap();
    recording.copy_buffer(&gpu_buffer, 0, &readback, 0, SIZE);
    let sync = queue.execute(vec![recording]).unwrap();
    queue.wait_for_sync_point(&sync);

    let bytes = ctx.device.backend().read_buffer(readback.raw(), 0, SIZE);
    assert_eq!(bytes, pattern);
}

/// The global tracker must hand the second list the exact state the first
/// list left a resource in.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_cross_list_state_propagation(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    let a = ctx.create_gpu_buffer(256);
    let b = ctx.create_gpu_buffer(256);
    let c = ctx.create_gpu_buffer(256);
    let queue = ctx.device.graphics_queue();
    let tracker = ctx.device.global_tracker();

    // List 1 leaves `b` as a copy destination.
    let mut first = queue.create_context("produce").unwrap();
    first.copy_buffer(&a, 0, &b, 0, 256);
    queue.execute(vec![first]).unwrap();
    assert_eq!(
        tracker.resource_state(b.id(), ALL_SUBRESOURCES),
        Some(ResourceAccess::CopyDest)
    );

    // List 2 reads `b`: its deferred barrier resolves from CopyDest, and the
    // authoritative state moves on to CopySource.
    let mut second = queue.create_context("consume").unwrap();
    second.copy_buffer(&b, 0, &c, 0, 256);
    let sync = queue.execute(vec![second]).unwrap();
    queue.wait_for_sync_point(&sync);
    assert_eq!(
        tracker.resource_state(b.id(), ALL_SUBRESOURCES),
        Some(ResourceAccess::CopySource)
    );
}

/// Cross-queue dependencies are GPU-side waits, and the consuming copy must
/// observe the produced data.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_cross_queue_dependency(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    const SIZE: u64 = 512;
    let pattern = generate_test_pattern(SIZE as usize);
    let gpu_buffer = ctx.create_gpu_buffer(SIZE);
    let readback = ctx.create_readback_buffer(SIZE);

    // Produce on the copy queue.
    let upload_sync = ctx.device.upload_buffer(&pattern, &gpu_buffer).unwrap();

    // Consume on the compute queue after a GPU-side wait.
    let queue = ctx.device.compute_queue();
    queue.gpu_wait(&upload_sync);
    let mut recording = queue.create_context("consume").unwrap();
    recording.copy_buffer(&gpu_buffer, 0, &readback, 0, SIZE);
    let sync = queue.execute(vec![recording]).unwrap();
    queue.wait_for_sync_point(&sync);

    let bytes = ctx.device.backend().read_buffer(readback.raw(), 0, SIZE);
    assert_eq!(bytes, pattern);
}

/// Record an indirect draw whose argument buffer went through the upload
/// path; the argument buffer must end the frame in the indirect-argument
/// state.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_indirect_draw_arguments(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    let args = amaranth_graphics::types::DrawIndirectArgs {
        vertex_count: 3,
        instance_count: 64,
        first_vertex: 0,
        first_instance: 0,
    };
    let arg_buffer = ctx
        .device
        .create_buffer(&amaranth_graphics::BufferDescriptor::new(
            amaranth_graphics::types::DrawIndirectArgs::SIZE,
            amaranth_graphics::BufferUsage::INDIRECT | amaranth_graphics::BufferUsage::COPY_DST,
        ))
        .unwrap();
    let upload_sync = ctx.device.upload_buffer(args.as_bytes(), &arg_buffer).unwrap();

    let queue = ctx.device.graphics_queue();
    queue.gpu_wait(&upload_sync);
    let mut recording = queue.create_context("indirect").unwrap();
    recording.draw_indirect(&arg_buffer, 0, 1, 16);
    let sync = queue.execute(vec![recording]).unwrap();
    queue.wait_for_sync_point(&sync);

    assert_eq!(
        ctx.device
            .global_tracker()
            .resource_state(arg_buffer.id(), ALL_SUBRESOURCES),
        Some(ResourceAccess::IndirectArgument)
    );
}

// ============================================================================
// Command allocator pool
// ============================================================================

/// Three requests with no prior discards construct three distinct
/// allocators.
#[test]
fn test_fresh_allocator_requests_never_alias() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();
    let queue = ctx.device.graphics_queue();

    let a = queue.create_context("a").unwrap();
    let b = queue.create_context("b").unwrap();
    let c = queue.create_context("c").unwrap();
    assert_eq!(queue.allocator_pool().created_count(), 3);
    drop((a, b, c));
}

/// An allocator never comes back from the pool while its submission's sync
/// point is incomplete.
#[test]
fn test_allocator_not_recycled_before_retirement() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();
    let dummy = ctx.dummy.as_ref().unwrap();
    dummy.set_auto_complete(false);

    let queue = ctx.device.graphics_queue();
    let recording = queue.create_context("frame_0").unwrap();
    let sync = queue.execute(vec![recording]).unwrap();
    assert!(!sync.is_complete());

    // The fence has not moved: the pool must construct a second allocator.
    let next = queue.create_context("frame_1").unwrap();
    assert_eq!(queue.allocator_pool().created_count(), 2);
    drop(next);

    // Retire frame 0, and its allocator becomes the next handout.
    queue.wait_for_sync_point(&sync);
    let recycled = queue.create_context("frame_2").unwrap();
    assert_eq!(queue.allocator_pool().created_count(), 2);
    drop(recycled);
}

// ============================================================================
// Linear allocator
// ============================================================================

/// 100 bytes then (page - 64) bytes from a 4096-byte page at 256-byte
/// alignment: the second request must roll over to a fresh page.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_upload_page_rollover(#[case] backend: Backend) {
    let Some(ctx) = TestContext::with_config(
        backend,
        amaranth_graphics::DeviceConfig::default().with_upload_page_size(4096),
    ) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    let allocator = ctx.device.frame_allocator();
    ctx.device.begin_frame();

    let first = allocator.allocate_aligned(100, 256).unwrap();
    let second = allocator.allocate_aligned(4096 - 64, 256).unwrap();

    assert_eq!(first.offset, 0);
    assert_eq!(second.offset, 0);
    assert_ne!(first.buffer.gpu_address(), second.buffer.gpu_address());

    let sync = ctx.device.graphics_queue().signal().unwrap();
    ctx.device.end_frame(&sync);
}

/// Upload pages only recycle once the frame that used them retired.
#[test]
fn test_upload_pages_gated_by_fence() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();
    let dummy = ctx.dummy.as_ref().unwrap();
    dummy.set_auto_complete(false);

    let allocator = ctx.device.frame_allocator();
    let queue = ctx.device.graphics_queue();

    ctx.device.begin_frame();
    let first = allocator.allocate(1024).unwrap();
    let first_page = first.buffer.gpu_address();
    let sync = queue.execute(vec![queue.create_context("frame_0").unwrap()]).unwrap();
    ctx.device.end_frame(&sync);

    // Frame 1 starts before frame 0 retires: it must not see frame 0's page.
    ctx.device.begin_frame();
    let second = allocator.allocate(1024).unwrap();
    assert_ne!(second.buffer.gpu_address(), first_page);
    let sync1 = queue.execute(vec![queue.create_context("frame_1").unwrap()]).unwrap();
    ctx.device.end_frame(&sync1);

    // Retire everything; the original page is recycled.
    queue.wait_idle();
    ctx.device.begin_frame();
    let third = allocator.allocate(1024).unwrap();
    assert_eq!(third.buffer.gpu_address(), first_page);
    assert_eq!(third.offset, 0);
    let sync2 = queue.signal().unwrap();
    ctx.device.end_frame(&sync2);
}

// ============================================================================
// Acceleration structure memory pool
// ============================================================================

/// Releasing the only section of a page destroys that page while another
/// page survives untouched.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_accel_page_destroyed_when_emptied(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    let mut pool = AccelMemoryPool::new(ctx.device.backend().clone(), 1024);
    // Fill page one, forcing the next allocation onto page two.
    let filler = pool.allocate(1024 - 64).unwrap();
    let lone = pool.allocate(64).unwrap();
    assert_eq!(pool.page_count(), 2);

    pool.release(lone);
    assert_eq!(pool.page_count(), 1);
    assert_eq!(pool.sub_block_count(0), 1);
    pool.release(filler);
}

/// A section spanning its whole (dedicated) page takes the page down with
/// it on release.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_accel_dedicated_page_released_whole(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    let mut pool = AccelMemoryPool::new(ctx.device.backend().clone(), 1024);
    let small = pool.allocate(128).unwrap();
    let oversized = pool.allocate(4096).unwrap();
    assert_eq!(pool.page_count(), 2);

    pool.release(oversized);
    assert_eq!(pool.page_count(), 1);
    pool.release(small);
    // Last page is kept warm even when empty.
    assert_eq!(pool.page_count(), 1);
}

// ============================================================================
// Acceleration structure build + compaction
// ============================================================================

fn blas_inputs(triangles: u32) -> AccelBuildInputs {
    AccelBuildInputs::BottomLevel {
        geometries: vec![TriangleGeometry {
            vertex_address: 0x40_0000,
            vertex_count: triangles * 3,
            vertex_stride: 12,
            index_address: None,
            triangle_count: triangles,
            opaque: true,
        }],
    }
}

/// Full compaction workflow: after `compact` succeeds, the published
/// address is the compacted structure's, not the original result's.
#[test]
fn test_compaction_switches_published_address() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();
    let queue = ctx.device.compute_queue();

    let mut manager = ctx.device.accel_structs();

    let mut build = queue.create_context("as_build").unwrap();
    let index = manager
        .build(&mut build, blas_inputs(28), AccelBuildFlags::ALLOW_COMPACTION)
        .unwrap();
    let build_sync = queue.execute(vec![build]).unwrap();
    manager.on_commands_submitted(&build_sync);

    let original = manager.address(index);

    let mut readback = queue.create_context("as_sizes").unwrap();
    manager.copy_compacted_sizes(&mut readback);
    let readback_sync = queue.execute(vec![readback]).unwrap();
    manager.on_commands_submitted(&readback_sync);

    let mut compact = queue.create_context("as_compact").unwrap();
    assert!(manager.compact(&mut compact, index).unwrap());
    queue.execute(vec![compact]).unwrap();

    assert!(manager.is_compacted(index));
    assert_ne!(manager.address(index), original);

    // Compacting again allocates nothing and records nothing.
    let mut again = queue.create_context("as_compact_again").unwrap();
    assert!(!manager.compact(&mut again, index).unwrap());
    assert_eq!(again.command_count(), 0);
    let after = manager.address(index);
    queue.execute(vec![again]).unwrap();
    assert_eq!(manager.address(index), after);

    manager.release(index);
}

/// `compact` before the build's sync point completes is a benign no-op.
#[test]
fn test_compact_polls_until_ready() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();
    let dummy = ctx.dummy.as_ref().unwrap();
    let queue = ctx.device.compute_queue();
    let mut manager = ctx.device.accel_structs();

    dummy.set_auto_complete(false);
    let mut build = queue.create_context("as_build").unwrap();
    let index = manager
        .build(&mut build, blas_inputs(8), AccelBuildFlags::ALLOW_COMPACTION)
        .unwrap();
    let build_sync = queue.execute(vec![build]).unwrap();
    manager.on_commands_submitted(&build_sync);

    let mut early = queue.create_context("as_early").unwrap();
    assert!(!manager.compact(&mut early, index).unwrap());
    assert!(!manager.is_compacted(index));
    drop(early);

    // Let the build retire, read back sizes, and the poll succeeds.
    dummy.set_auto_complete(true);
    queue.wait_for_sync_point(&build_sync);
    let mut readback = queue.create_context("as_sizes").unwrap();
    manager.copy_compacted_sizes(&mut readback);
    let readback_sync = queue.execute(vec![readback]).unwrap();
    manager.on_commands_submitted(&readback_sync);

    let mut compact = queue.create_context("as_compact").unwrap();
    assert!(manager.compact(&mut compact, index).unwrap());
    queue.execute(vec![compact]).unwrap();
    manager.release(index);
}

// ============================================================================
// Ray-tracing pipelines and shader tables
// ============================================================================

/// Build a shader table against a compiled pipeline and dispatch rays with
/// it; the table records must carry the pipeline's group identifiers.
#[test]
fn test_shader_table_dispatch() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();

    let handle = ctx.device.create_raytracing_pipeline(RaytracingPipelineDesc {
        layout: BindingLayout::builder().constants(0, 0, 4).build(),
        shaders: vec![
            RaytracingShader {
                shader: Arc::new(Shader::new(ShaderStage::RayGeneration, vec![1, 2], "rg")),
                export: "raygen_main".to_string(),
            },
            RaytracingShader {
                shader: Arc::new(Shader::new(ShaderStage::Miss, vec![3, 4], "ms")),
                export: "miss_main".to_string(),
            },
            RaytracingShader {
                shader: Arc::new(Shader::new(ShaderStage::ClosestHit, vec![5, 6], "ch")),
                export: "chs_main".to_string(),
            },
        ],
        hit_groups: vec![HitGroup {
            name: "opaque_hit".to_string(),
            closest_hit: Some("chs_main".to_string()),
            any_hit: None,
            intersection: None,
        }],
        max_recursion_depth: 2,
        max_payload_size: 32,
    });
    // Compilation happens off-thread; first use joins.
    let pipeline = handle.wait().unwrap();

    // Pipelines register their shaders for crash-handler lookups.
    assert_eq!(ctx.device.shader_database().len(), 3);

    ctx.device.begin_frame();
    let table = ShaderTableBuilder::new()
        .raygen("raygen_main", &[])
        .add_miss("miss_main", &[])
        .add_hit_group("opaque_hit", &[0u8; 16])
        .build(&pipeline, ctx.device.frame_allocator())
        .unwrap();

    let queue = ctx.device.graphics_queue();
    let mut recording = queue.create_context("trace").unwrap();
    recording.set_pipeline(&pipeline);
    recording.dispatch_rays(table.regions(), 1920, 1080, 1);
    let sync = queue.execute(vec![recording]).unwrap();
    ctx.device.end_frame(&sync);
    queue.wait_for_sync_point(&sync);
}

// ============================================================================
// Shutdown
// ============================================================================

/// Deferred resources survive until their sync point and are flushed by
/// `wait_idle` at shutdown.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_shutdown_drains_everything(#[case] backend: Backend) {
    let Some(ctx) = TestContext::new(backend) else {
        eprintln!("Backend {backend:?} not available, skipping");
        return;
    };

    let buffer = ctx.create_gpu_buffer(256);
    let queue = ctx.device.graphics_queue();
    let mut recording = queue.create_context("last_use").unwrap();
    recording.transition_resource(&buffer, ALL_SUBRESOURCES, ResourceAccess::CopySource);
    let sync = queue.execute(vec![recording]).unwrap();

    ctx.device.destroy_buffer(buffer, sync);
    ctx.device.wait_idle();
    assert_eq!(ctx.device.deferred_pending(), 0);
}

/// An invalid sync point is a no-op wait everywhere it can be passed.
#[test]
fn test_invalid_sync_point_is_noop() {
    let ctx = TestContext::new(Backend::Dummy).unwrap();
    let queue = ctx.device.graphics_queue();

    let invalid = SyncPoint::invalid();
    assert!(invalid.is_complete());
    queue.wait_for_sync_point(&invalid);
    queue.gpu_wait(&invalid);

    // And the probing constructor still yields a working device.
    let instance = GraphicsInstance::with_backend(Arc::new(DummyBackend::new()));
    assert_eq!(instance.backend_name(), "Dummy");
}
