//! Per-queue pooling of command-recording allocators.
//!
//! An allocator's memory can only be reclaimed wholesale, and only once the
//! GPU retired the last list recorded from it. The pool therefore never
//! hands an allocator out twice without a completed fence value in between:
//! discarded allocators sit in a retired queue tagged with the sync point of
//! the submission that last used them, and drain into the available pool as
//! those values complete.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuCommandAllocator};
use crate::error::GpuError;
use crate::sync::SyncPoint;
use crate::types::QueueId;

/// One command-recording allocator, checked out of a [`CommandAllocatorPool`].
pub struct CommandAllocator {
    id: u64,
    queue: QueueId,
    raw: GpuCommandAllocator,
    retirement: Option<SyncPoint>,
    backend: Arc<dyn GpuBackend>,
}

impl std::fmt::Debug for CommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAllocator")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field(
                "retirement",
                &self.retirement.as_ref().map(SyncPoint::value),
            )
            .finish()
    }
}

impl CommandAllocator {
    fn new(backend: Arc<dyn GpuBackend>, queue: QueueId, id: u64) -> Result<Self, GpuError> {
        let raw = backend.create_command_allocator(queue)?;
        Ok(Self {
            id,
            queue,
            raw,
            retirement: None,
            backend,
        })
    }

    /// Pool-unique identity (useful for logging and tests).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the allocator's last recorded work has provably retired.
    pub fn is_ready(&self) -> bool {
        self.retirement.as_ref().is_none_or(SyncPoint::is_complete)
    }

    /// Reclaim all recording memory. Only legal when [`is_ready`](Self::is_ready).
    pub(crate) fn reset(&mut self) {
        assert!(
            self.is_ready(),
            "resetting command allocator {} while its work is still in flight",
            self.id
        );
        self.backend.reset_command_allocator(&self.raw);
        self.retirement = None;
    }

    /// The backend allocator handle.
    pub(crate) fn raw(&self) -> &GpuCommandAllocator {
        &self.raw
    }

    /// Fence value this allocator retires at, if it has been discarded.
    pub fn retirement_value(&self) -> Option<u64> {
        self.retirement.as_ref().map(SyncPoint::value)
    }
}

#[derive(Default)]
struct PoolInner {
    /// Discarded allocators, oldest first, keyed by retirement fence value.
    retired: VecDeque<(u64, CommandAllocator)>,
    /// Allocators whose retirement value completed; ready after a reset.
    available: Vec<CommandAllocator>,
    /// Total allocators ever constructed by this pool.
    created: u64,
}

/// Pool of command allocators for one queue.
///
/// Multiple command contexts on the same queue request and discard
/// concurrently, so all pool manipulation is mutex-guarded; recording against
/// a checked-out allocator is not (it is exclusively owned).
pub struct CommandAllocatorPool {
    backend: Arc<dyn GpuBackend>,
    queue: QueueId,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for CommandAllocatorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommandAllocatorPool")
            .field("queue", &self.queue)
            .field("created", &inner.created)
            .field("retired", &inner.retired.len())
            .field("available", &inner.available.len())
            .finish()
    }
}

impl CommandAllocatorPool {
    /// Create an empty pool for a queue.
    pub fn new(backend: Arc<dyn GpuBackend>, queue: QueueId) -> Self {
        Self {
            backend,
            queue,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Check out an allocator whose prior work retired at or before
    /// `completed_value`.
    ///
    /// Retired allocators whose fence value completed are recycled (after a
    /// reset); otherwise a fresh allocator is constructed.
    pub fn request_allocator(&self, completed_value: u64) -> Result<CommandAllocator, GpuError> {
        let mut inner = self.inner.lock();

        while let Some((value, _)) = inner.retired.front() {
            if *value > completed_value {
                break;
            }
            let (_, allocator) = inner.retired.pop_front().unwrap();
            inner.available.push(allocator);
        }

        if let Some(mut allocator) = inner.available.pop() {
            allocator.reset();
            return Ok(allocator);
        }

        inner.created += 1;
        let id = inner.created;
        log::debug!(
            "command allocator pool ({}): growing to {} allocators",
            self.queue,
            inner.created
        );
        CommandAllocator::new(self.backend.clone(), self.queue, id)
    }

    /// Return an allocator, to be reused only once `sync_point` completes.
    pub fn discard_allocator(&self, sync_point: SyncPoint, mut allocator: CommandAllocator) {
        assert!(
            sync_point.is_valid(),
            "discarding a command allocator requires the sync point of its submission"
        );
        let value = sync_point.value();
        allocator.retirement = Some(sync_point);
        self.inner.lock().retired.push_back((value, allocator));
    }

    /// Total allocators constructed over the pool's lifetime.
    pub fn created_count(&self) -> u64 {
        self.inner.lock().created
    }

    /// Allocators currently waiting on their retirement value.
    pub fn retired_count(&self) -> usize {
        self.inner.lock().retired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::sync::QueueTimeline;
    use crate::types::QueueKind;

    fn test_pool() -> (Arc<DummyBackend>, Arc<QueueTimeline>, CommandAllocatorPool) {
        let backend = Arc::new(DummyBackend::new());
        backend.set_auto_complete(false);
        let queue = QueueId::new(QueueKind::Graphics, 0);
        let timeline =
            QueueTimeline::new(backend.clone() as Arc<dyn GpuBackend>, queue).unwrap();
        let pool = CommandAllocatorPool::new(backend.clone() as Arc<dyn GpuBackend>, queue);
        (backend, timeline, pool)
    }

    #[test]
    fn test_fresh_requests_construct_new_allocators() {
        let (_backend, _timeline, pool) = test_pool();

        let a = pool.request_allocator(0).unwrap();
        let b = pool.request_allocator(0).unwrap();
        let c = pool.request_allocator(0).unwrap();

        assert_eq!(pool.created_count(), 3);
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_discarded_allocator_not_reused_until_complete() {
        let (_backend, timeline, pool) = test_pool();

        let allocator = pool.request_allocator(0).unwrap();
        let first_id = allocator.id();

        let value = timeline.advance();
        pool.discard_allocator(SyncPoint::new(timeline.clone(), value), allocator);

        // The fence has not reached `value`: a new allocator is built.
        let second = pool.request_allocator(value - 1).unwrap();
        assert_ne!(second.id(), first_id);
        assert_eq!(pool.created_count(), 2);

        // Once the value completes, the retired allocator is recycled.
        let third = pool.request_allocator(value).unwrap();
        assert_eq!(third.id(), first_id);
        assert_eq!(pool.created_count(), 2);
    }

    #[test]
    fn test_retired_drain_preserves_fifo_safety() {
        let (_backend, timeline, pool) = test_pool();

        let a = pool.request_allocator(0).unwrap();
        let b = pool.request_allocator(0).unwrap();

        let v1 = timeline.advance();
        let v2 = timeline.advance();
        pool.discard_allocator(SyncPoint::new(timeline.clone(), v1), a);
        pool.discard_allocator(SyncPoint::new(timeline.clone(), v2), b);
        assert_eq!(pool.retired_count(), 2);

        // Completing only v1 frees exactly one allocator.
        let reused = pool.request_allocator(v1).unwrap();
        assert_eq!(pool.created_count(), 2);
        assert_eq!(pool.retired_count(), 1);
        drop(reused);
    }

    #[test]
    #[should_panic(expected = "requires the sync point")]
    fn test_discard_with_invalid_sync_point_panics() {
        let (_backend, _timeline, pool) = test_pool();
        let allocator = pool.request_allocator(0).unwrap();
        pool.discard_allocator(SyncPoint::invalid(), allocator);
    }
}
