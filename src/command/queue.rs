//! Command queue: submission, fencing and allocator retirement.
//!
//! One `CommandQueue` per hardware queue. The queue owns the fence timeline
//! and the allocator pool, performs the submission-order reconciliation of
//! pending barriers against the global tracker, and keeps submitted lists
//! alive until their fence value retires.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::GpuBackend;
use crate::error::GpuError;
use crate::state::SharedStateTracker;
use crate::sync::{QueueTimeline, SyncPoint};
use crate::types::{QueueId, QueueKind};

use super::allocator_pool::CommandAllocatorPool;
use super::context::CommandContext;
use super::{CommandList, RecordedCommand};

/// A hardware submission queue.
pub struct CommandQueue {
    id: QueueId,
    backend: Arc<dyn GpuBackend>,
    timeline: Arc<QueueTimeline>,
    allocator_pool: CommandAllocatorPool,
    global_tracker: SharedStateTracker,
    /// GPU-side waits to attach to the next submission.
    pending_waits: Mutex<Vec<SyncPoint>>,
    /// Submitted lists retained until their fence value retires (their
    /// recorded commands hold the resource references the GPU is using).
    in_flight: Mutex<VecDeque<(u64, Vec<CommandList>)>>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("timeline", &self.timeline)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl CommandQueue {
    pub(crate) fn new(
        backend: Arc<dyn GpuBackend>,
        id: QueueId,
        global_tracker: SharedStateTracker,
    ) -> Result<Self, GpuError> {
        let timeline = QueueTimeline::new(backend.clone(), id)?;
        let allocator_pool = CommandAllocatorPool::new(backend.clone(), id);
        log::info!("created command queue {id}");
        Ok(Self {
            id,
            backend,
            timeline,
            allocator_pool,
            global_tracker,
            pending_waits: Mutex::new(Vec::new()),
            in_flight: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue identity.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Queue category.
    pub fn kind(&self) -> QueueKind {
        self.id.kind
    }

    /// The queue's fence timeline.
    pub fn timeline(&self) -> &Arc<QueueTimeline> {
        &self.timeline
    }

    /// The queue's allocator pool (exposed for inspection).
    pub fn allocator_pool(&self) -> &CommandAllocatorPool {
        &self.allocator_pool
    }

    /// Last completed fence value.
    pub fn completed_value(&self) -> u64 {
        self.timeline.completed_value()
    }

    /// Begin recording a command list against this queue.
    pub fn create_context(&self, name: impl Into<String>) -> Result<CommandContext, GpuError> {
        let allocator = self
            .allocator_pool
            .request_allocator(self.timeline.completed_value())?;
        Ok(CommandContext::new(name, self.id.kind, allocator))
    }

    /// Submit recorded contexts in order and return the sync point of the
    /// last submission.
    ///
    /// For each context this resolves its pending barriers against the
    /// global tracker (the system's single serialization point — contexts
    /// may have been recorded on worker threads in any order, but state
    /// merges happen here, in submission order), emits the resolved
    /// transitions into a separate list executed immediately before the
    /// context's own, then submits and retires the context's allocator at
    /// the new sync point.
    pub fn execute(&self, contexts: Vec<CommandContext>) -> Result<SyncPoint, GpuError> {
        assert!(
            !contexts.is_empty(),
            "execute called with no command contexts"
        );

        // Attach accumulated cross-queue waits to the first submission of
        // the batch; FIFO order covers the rest.
        let waits: Vec<SyncPoint> = std::mem::take(&mut *self.pending_waits.lock());
        let mut first = true;
        let mut sync_point = SyncPoint::invalid();

        for context in contexts {
            let finished = context.finish();

            let resolved = self
                .global_tracker
                .reconcile(&finished.pending, &finished.final_states);

            let mut lists = Vec::with_capacity(2);
            if !resolved.is_empty() {
                log::trace!(
                    "{}: {} pending barriers resolved ahead of '{}'",
                    self.id,
                    resolved.len(),
                    finished.main.name
                );
                let mut pending_list =
                    CommandList::new(format!("{}/pending", finished.main.name), self.id.kind);
                pending_list
                    .commands
                    .push(RecordedCommand::Barriers(resolved));
                lists.push(pending_list);
            }
            lists.push(finished.main);

            let value = self.timeline.advance();
            let wait_refs: Vec<_> = if first {
                waits
                    .iter()
                    .filter_map(|sp| sp.timeline().map(|t| (t.raw(), sp.value())))
                    .collect()
            } else {
                Vec::new()
            };
            first = false;

            self.backend.submit(
                self.id,
                &lists,
                finished.allocator.raw(),
                &wait_refs,
                self.timeline.raw(),
                value,
            )?;

            sync_point = SyncPoint::new(self.timeline.clone(), value);
            self.allocator_pool
                .discard_allocator(sync_point.clone(), finished.allocator);
            self.retain_in_flight(value, lists);
        }

        self.release_retired();
        Ok(sync_point)
    }

    /// Issue a new fence value with no attached work.
    pub fn signal(&self) -> Result<SyncPoint, GpuError> {
        let value = self.timeline.advance();
        self.backend.signal(self.id, self.timeline.raw(), value)?;
        Ok(SyncPoint::new(self.timeline.clone(), value))
    }

    /// Make the next submission on *this* queue wait GPU-side for a sync
    /// point from another queue.
    ///
    /// This is the only cross-queue ordering mechanism; it never blocks the
    /// CPU.
    pub fn gpu_wait(&self, sync_point: &SyncPoint) {
        if !sync_point.is_valid() || sync_point.is_complete() {
            return;
        }
        self.pending_waits.lock().push(sync_point.clone());
    }

    /// Block the calling thread until `sync_point` retires.
    ///
    /// Invalid and already-complete points return immediately.
    pub fn wait_for_sync_point(&self, sync_point: &SyncPoint) {
        sync_point.wait();
        self.release_retired();
    }

    /// Block until every submission on this queue has retired.
    pub fn wait_idle(&self) {
        self.timeline.wait(self.timeline.last_submitted_value());
        self.release_retired();
    }

    fn retain_in_flight(&self, value: u64, lists: Vec<CommandList>) {
        self.in_flight.lock().push_back((value, lists));
    }

    /// Drop retained lists whose fence value completed.
    pub fn release_retired(&self) {
        let completed = self.timeline.completed_value();
        let mut in_flight = self.in_flight.lock();
        while let Some((value, _)) = in_flight.front() {
            if *value > completed {
                break;
            }
            in_flight.pop_front();
        }
    }

    /// Number of submissions still in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}
