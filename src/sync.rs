//! Queue fence timelines and sync points.
//!
//! Each hardware queue owns one monotonically increasing fence value. A
//! [`SyncPoint`] is a copyable handle meaning "work submitted up to value N
//! on queue Q has retired". Everything that recycles GPU-visible memory
//! (allocator pools, upload pages, deferred destruction) keys on sync points.
//!
//! Sync points from different queues are never comparable; cross-queue
//! dependencies go through GPU-side waits on the producing queue's timeline
//! (see [`CommandQueue::gpu_wait`](crate::command::CommandQueue::gpu_wait)),
//! never through CPU spins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{GpuBackend, GpuTimeline};
use crate::error::GpuError;
use crate::types::QueueId;

/// A queue's monotonic fence timeline.
///
/// Tracks the next value to signal and caches the last value observed
/// complete, so `is_complete` checks are a load in the common case and a
/// single backend query otherwise.
pub struct QueueTimeline {
    queue: QueueId,
    raw: GpuTimeline,
    backend: Arc<dyn GpuBackend>,
    /// Next value a submission will signal. Value 0 is never signaled and is
    /// treated as trivially complete.
    next_value: AtomicU64,
    completed_cache: AtomicU64,
}

impl std::fmt::Debug for QueueTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTimeline")
            .field("queue", &self.queue)
            .field("next_value", &self.next_value.load(Ordering::Relaxed))
            .field(
                "completed_cache",
                &self.completed_cache.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl QueueTimeline {
    /// Create the timeline for a queue.
    pub(crate) fn new(
        backend: Arc<dyn GpuBackend>,
        queue: QueueId,
    ) -> Result<Arc<Self>, GpuError> {
        let raw = backend.create_timeline(queue)?;
        Ok(Arc::new(Self {
            queue,
            raw,
            backend,
            next_value: AtomicU64::new(1),
            completed_cache: AtomicU64::new(0),
        }))
    }

    /// The queue this timeline belongs to.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Reserve the next fence value for a submission.
    pub(crate) fn advance(&self) -> u64 {
        self.next_value.fetch_add(1, Ordering::Relaxed)
    }

    /// The most recently reserved fence value (0 if nothing was submitted).
    pub fn last_submitted_value(&self) -> u64 {
        self.next_value.load(Ordering::Relaxed) - 1
    }

    /// Last completed value, refreshed from the backend fence.
    pub fn completed_value(&self) -> u64 {
        let queried = self.backend.query_completed_value(&self.raw);
        // The cache only moves forward; a stale query never regresses it.
        self.completed_cache.fetch_max(queried, Ordering::AcqRel);
        self.completed_cache.load(Ordering::Acquire)
    }

    /// Non-blocking completion check against the cache, refreshing it only
    /// when the cached value is insufficient.
    pub fn is_value_complete(&self, value: u64) -> bool {
        if value <= self.completed_cache.load(Ordering::Acquire) {
            return true;
        }
        value <= self.completed_value()
    }

    /// Block the calling thread until `value` completes.
    pub fn wait(&self, value: u64) {
        if self.is_value_complete(value) {
            return;
        }
        self.backend.wait_timeline(&self.raw, value);
        self.completed_cache.fetch_max(value, Ordering::AcqRel);
    }

    /// The backend timeline handle.
    pub(crate) fn raw(&self) -> &GpuTimeline {
        &self.raw
    }
}

/// Copyable handle to a point in a queue's submission order.
///
/// Carries no ownership: dropping a sync point never releases GPU work or
/// memory. A default-constructed point is invalid and behaves as already
/// complete, so waiting on one is a no-op.
#[derive(Debug, Clone, Default)]
pub struct SyncPoint {
    timeline: Option<Arc<QueueTimeline>>,
    value: u64,
}

impl SyncPoint {
    pub(crate) fn new(timeline: Arc<QueueTimeline>, value: u64) -> Self {
        Self {
            timeline: Some(timeline),
            value,
        }
    }

    /// An invalid (never-issued) sync point.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Whether this point was issued by a queue.
    pub fn is_valid(&self) -> bool {
        self.timeline.is_some()
    }

    /// Whether the GPU retired all work up to this point. Never blocks.
    /// Invalid points report complete.
    pub fn is_complete(&self) -> bool {
        match &self.timeline {
            Some(timeline) => timeline.is_value_complete(self.value),
            None => true,
        }
    }

    /// Block the calling thread until this point completes. No-op for
    /// invalid or already-complete points.
    pub fn wait(&self) {
        if let Some(timeline) = &self.timeline {
            timeline.wait(self.value);
        }
    }

    /// The fence value this point targets.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The queue that issued this point, if valid.
    pub fn queue(&self) -> Option<QueueId> {
        self.timeline.as_ref().map(|t| t.queue())
    }

    pub(crate) fn timeline(&self) -> Option<&Arc<QueueTimeline>> {
        self.timeline.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::QueueKind;

    fn test_timeline() -> (Arc<DummyBackend>, Arc<QueueTimeline>) {
        let backend = Arc::new(DummyBackend::new());
        backend.set_auto_complete(false);
        let timeline = QueueTimeline::new(
            backend.clone() as Arc<dyn GpuBackend>,
            QueueId::new(QueueKind::Graphics, 0),
        )
        .unwrap();
        (backend, timeline)
    }

    #[test]
    fn test_invalid_sync_point_is_complete() {
        let point = SyncPoint::invalid();
        assert!(!point.is_valid());
        assert!(point.is_complete());
        point.wait(); // must not block
    }

    #[test]
    fn test_sync_point_completion_tracks_timeline() {
        let (_backend, timeline) = test_timeline();

        let value = timeline.advance();
        assert_eq!(value, 1);
        let point = SyncPoint::new(timeline.clone(), value);
        assert!(point.is_valid());
        assert!(!point.is_complete());

        // Waiting forces completion on the dummy backend.
        point.wait();
        assert!(point.is_complete());
        assert_eq!(timeline.completed_value(), 1);
    }

    #[test]
    fn test_completed_cache_never_regresses() {
        let (_backend, timeline) = test_timeline();
        let first = timeline.advance();
        timeline.wait(first);
        assert!(timeline.is_value_complete(first));

        let second = timeline.advance();
        assert!(!timeline.is_value_complete(second));
        assert!(timeline.is_value_complete(first));
    }

    #[test]
    fn test_sync_points_are_cheap_copies() {
        let (_backend, timeline) = test_timeline();
        let point = SyncPoint::new(timeline.clone(), timeline.advance());
        let copy = point.clone();
        timeline.wait(point.value());
        // Both observe the same completion state.
        assert!(point.is_complete());
        assert!(copy.is_complete());
    }
}
