use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;

use amaranth_graphics::backend::dummy::DummyBackend;
use amaranth_graphics::raytracing::AccelMemoryPool;
use amaranth_graphics::state::{
    GlobalStateTracker, PendingBarrier, RawResource, ResourceId, ResourceRef,
};
use amaranth_graphics::{GraphicsInstance, LinearAllocator, ResourceAccess, ALL_SUBRESOURCES};

fn dummy_device() -> Arc<amaranth_graphics::GraphicsDevice> {
    let instance = GraphicsInstance::with_backend(Arc::new(DummyBackend::new()));
    instance.create_device().unwrap()
}

// ---------------------------------------------------------------------------
// Resource state reconciliation
// ---------------------------------------------------------------------------

fn bench_reconcile_64_resources(c: &mut Criterion) {
    let tracker = GlobalStateTracker::new();
    let refs: Vec<ResourceRef> = (0..64)
        .map(|i| ResourceRef {
            id: ResourceId::from_raw(i),
            raw: RawResource::Buffer(Arc::new(
                amaranth_graphics::backend::GpuBuffer::new_dummy(256, 0x1000 * (i + 1)),
            )),
            subresource_count: 1,
        })
        .collect();

    c.bench_function("state_reconcile_64_pending", |b| {
        b.iter(|| {
            let pending: Vec<PendingBarrier> = refs
                .iter()
                .map(|resource| PendingBarrier {
                    resource: resource.clone(),
                    subresource: ALL_SUBRESOURCES,
                    after: ResourceAccess::ShaderResource,
                })
                .collect();
            let finals: Vec<_> = refs
                .iter()
                .map(|resource| {
                    (
                        resource.clone(),
                        ALL_SUBRESOURCES,
                        ResourceAccess::CopySource,
                    )
                })
                .collect();
            black_box(tracker.reconcile(&pending, &finals));
        });
    });
}

// ---------------------------------------------------------------------------
// Linear allocator
// ---------------------------------------------------------------------------

fn bench_linear_allocate(c: &mut Criterion) {
    let backend = Arc::new(DummyBackend::new());

    c.bench_function("linear_allocate_64x256b", |b| {
        b.iter_batched(
            || {
                let allocator = LinearAllocator::new(backend.clone(), 64 * 1024);
                allocator.begin(0);
                allocator
            },
            |allocator| {
                for _ in 0..64 {
                    black_box(allocator.allocate(256).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

// ---------------------------------------------------------------------------
// Acceleration structure sub-allocation
// ---------------------------------------------------------------------------

fn bench_accel_allocate_release(c: &mut Criterion) {
    let backend = Arc::new(DummyBackend::new());
    let mut pool = AccelMemoryPool::new(backend, 4 * 1024 * 1024);

    c.bench_function("accel_allocate_release_4kb", |b| {
        b.iter(|| {
            let section = pool.allocate(4096).unwrap();
            black_box(section.gpu_address());
            pool.release(section);
        });
    });
}

// ---------------------------------------------------------------------------
// Command recording
// ---------------------------------------------------------------------------

fn bench_record_and_submit(c: &mut Criterion) {
    let device = dummy_device();
    let src = device
        .create_buffer(&amaranth_graphics::BufferDescriptor::new(
            4096,
            amaranth_graphics::BufferUsage::COPY_SRC | amaranth_graphics::BufferUsage::COPY_DST,
        ))
        .unwrap();
    let dst = device
        .create_buffer(&amaranth_graphics::BufferDescriptor::new(
            4096,
            amaranth_graphics::BufferUsage::COPY_SRC | amaranth_graphics::BufferUsage::COPY_DST,
        ))
        .unwrap();

    c.bench_function("record_submit_16_copies", |b| {
        b.iter(|| {
            let queue = device.graphics_queue();
            let mut ctx = queue.create_context("bench").unwrap();
            for i in 0..16 {
                ctx.copy_buffer(&src, i * 64, &dst, i * 64, 64);
            }
            black_box(queue.execute(vec![ctx]).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_reconcile_64_resources,
    bench_linear_allocate,
    bench_accel_allocate_release,
    bench_record_and_submit,
);
criterion_main!(benches);
