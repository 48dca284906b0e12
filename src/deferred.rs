//! Deferred destruction keyed by sync points.
//!
//! The GPU runs behind the CPU, so a resource whose last reference is
//! dropped may still be read by in-flight command lists. Resources are
//! therefore retired with the sync point of their last use and destroyed
//! only once that point completes.
//!
//! Destruction here means dropping the final `Arc`; the backend handle's
//! `Drop` impl returns the memory.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::{GpuAccelStruct, GpuBuffer, GpuTexture};
use crate::sync::SyncPoint;

/// A backend resource awaiting destruction.
pub enum DeferredResource {
    /// A buffer.
    Buffer(Arc<GpuBuffer>),
    /// A texture.
    Texture(Arc<GpuTexture>),
    /// An acceleration structure.
    AccelStruct(Arc<GpuAccelStruct>),
}

impl std::fmt::Debug for DeferredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer(_) => write!(f, "DeferredResource::Buffer"),
            Self::Texture(_) => write!(f, "DeferredResource::Texture"),
            Self::AccelStruct(_) => write!(f, "DeferredResource::AccelStruct"),
        }
    }
}

/// Queue of resources waiting for their retirement sync point.
#[derive(Debug, Default)]
pub struct DeferredReleaseQueue {
    pending: Mutex<Vec<(SyncPoint, DeferredResource)>>,
}

impl DeferredReleaseQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a resource for destruction once `last_use` completes.
    ///
    /// An invalid sync point means the resource was never submitted; it is
    /// destroyed at the next reclaim.
    pub fn defer(&self, last_use: SyncPoint, resource: DeferredResource) {
        self.pending.lock().push((last_use, resource));
    }

    /// Destroy every queued resource whose sync point completed.
    ///
    /// Entries retire on different queues, so each is checked individually
    /// rather than draining in order. Returns the number destroyed.
    pub fn reclaim(&self) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|(sync_point, _)| !sync_point.is_complete());
        let destroyed = before - pending.len();
        if destroyed > 0 {
            log::trace!("deferred release: destroyed {destroyed} resources");
        }
        destroyed
    }

    /// Destroy everything regardless of sync state.
    ///
    /// Only call after all queues are idle (shutdown).
    pub fn flush_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        if count > 0 {
            log::debug!("deferred release: flushed {count} resources at shutdown");
        }
        count
    }

    /// Resources currently waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::GpuBackend;
    use crate::sync::QueueTimeline;
    use crate::types::{QueueId, QueueKind};

    #[test]
    fn test_reclaim_waits_for_sync_point() {
        let backend = Arc::new(DummyBackend::new());
        backend.set_auto_complete(false);
        let timeline = QueueTimeline::new(
            backend.clone() as Arc<dyn GpuBackend>,
            QueueId::new(QueueKind::Graphics, 0),
        )
        .unwrap();

        let queue = DeferredReleaseQueue::new();
        let buffer = Arc::new(GpuBuffer::new_dummy(64, 0x1000));
        let value = timeline.advance();
        queue.defer(
            SyncPoint::new(timeline.clone(), value),
            DeferredResource::Buffer(buffer),
        );

        assert_eq!(queue.reclaim(), 0);
        assert_eq!(queue.pending_count(), 1);

        timeline.wait(value);
        assert_eq!(queue.reclaim(), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_invalid_sync_point_reclaims_immediately() {
        let queue = DeferredReleaseQueue::new();
        queue.defer(
            SyncPoint::invalid(),
            DeferredResource::Buffer(Arc::new(GpuBuffer::new_dummy(64, 0x1000))),
        );
        assert_eq!(queue.reclaim(), 1);
    }

    #[test]
    fn test_flush_all() {
        let queue = DeferredReleaseQueue::new();
        for i in 0..3 {
            queue.defer(
                SyncPoint::invalid(),
                DeferredResource::Buffer(Arc::new(GpuBuffer::new_dummy(64, 0x1000 * (i + 1)))),
            );
        }
        assert_eq!(queue.flush_all(), 3);
        assert_eq!(queue.pending_count(), 0);
    }
}
