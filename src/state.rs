//! Resource state tracking and barrier resolution.
//!
//! Every GPU-visible resource is, at any point in a queue's timeline, in
//! exactly one access mode per subresource ([`ResourceAccess`]). Command
//! contexts track the states they leave resources in; the process-wide
//! [`GlobalStateTracker`] holds the authoritative state *between* command
//! lists.
//!
//! A context that touches a resource it has no local record for cannot know
//! the correct "before" state at record time — another thread may still be
//! recording the list that runs before it. It records a [`PendingBarrier`]
//! instead, and the queue resolves it against the global tracker at
//! submission time (see `command::queue`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{GpuBuffer, GpuTexture};

/// Sentinel subresource index meaning "every subresource of the resource".
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

/// Unique identity of a tracked resource.
///
/// Plain integer key; the tracker never owns the resource it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Create a resource id from a raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Mutually exclusive GPU access modes a subresource can be in.
///
/// Transitioning between two modes requires an explicit barrier; staying in
/// the same mode requires none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceAccess {
    /// No pending access; the state resources decay to between frames.
    #[default]
    Common,
    /// Read as a vertex or constant buffer.
    VertexAndConstantBuffer,
    /// Read as an index buffer.
    IndexBuffer,
    /// Written as a color render target.
    RenderTarget,
    /// Read/written as unordered access (storage).
    UnorderedAccess,
    /// Written as a depth attachment.
    DepthWrite,
    /// Read-only depth.
    DepthRead,
    /// Sampled or read in a shader.
    ShaderResource,
    /// Read as indirect draw/dispatch arguments.
    IndirectArgument,
    /// Destination of a copy.
    CopyDest,
    /// Source of a copy.
    CopySource,
    /// Acceleration structure storage (build output / trace input).
    AccelerationStructure,
    /// Presented by the swap chain.
    Present,
}

/// Raw backend handle behind a tracked resource.
#[derive(Clone)]
pub enum RawResource {
    /// A buffer resource.
    Buffer(Arc<GpuBuffer>),
    /// A texture resource.
    Texture(Arc<GpuTexture>),
}

impl std::fmt::Debug for RawResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer(_) => write!(f, "RawResource::Buffer"),
            Self::Texture(_) => write!(f, "RawResource::Texture"),
        }
    }
}

/// Weak-identity reference to a resource, carried by barriers.
///
/// Holds the backend handle so the submission backend can translate the
/// barrier, plus the identity and subresource count the trackers key on.
/// Never participates in resource destruction decisions.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    /// Tracker identity.
    pub id: ResourceId,
    /// Backend handle.
    pub raw: RawResource,
    /// Number of subresources (1 for buffers, mips × layers for textures).
    pub subresource_count: u32,
}

/// A fully resolved barrier instruction.
#[derive(Debug, Clone)]
pub enum Barrier {
    /// Transition a (sub)resource between access modes.
    Transition {
        /// The resource being transitioned.
        resource: ResourceRef,
        /// Subresource index, or [`ALL_SUBRESOURCES`].
        subresource: u32,
        /// Access mode the GPU last used.
        before: ResourceAccess,
        /// Access mode the next operation requires.
        after: ResourceAccess,
    },
    /// Aliasing barrier between two placed resources (either side optional).
    Aliasing {
        /// Resource whose use ends.
        before: Option<ResourceRef>,
        /// Resource whose use begins.
        after: Option<ResourceRef>,
    },
    /// Read/write hazard barrier for unordered access; `None` fences all UAVs.
    Uav {
        /// The resource to fence, or all UAV work when `None`.
        resource: Option<ResourceRef>,
    },
}

/// A transition whose "before" state is unknown at record time.
///
/// Produced when a command list touches a resource it has no local record
/// for; resolved against the global tracker when the list is submitted.
#[derive(Debug, Clone)]
pub struct PendingBarrier {
    /// The resource being transitioned.
    pub resource: ResourceRef,
    /// Subresource index, or [`ALL_SUBRESOURCES`].
    pub subresource: u32,
    /// Access mode the list's first use of the resource requires.
    pub after: ResourceAccess,
}

/// Per-resource state record: either one state for every subresource or an
/// explicit state per subresource — never a mix of the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubresourceStates {
    /// Every subresource shares this state.
    Uniform(ResourceAccess),
    /// Each subresource is tracked independently.
    PerSubresource(Vec<ResourceAccess>),
}

impl SubresourceStates {
    /// Create a uniform record.
    pub fn uniform(access: ResourceAccess) -> Self {
        Self::Uniform(access)
    }

    /// State of one subresource. `index` must not be the all-subresources
    /// sentinel.
    pub fn get(&self, index: u32) -> ResourceAccess {
        debug_assert_ne!(index, ALL_SUBRESOURCES);
        match self {
            Self::Uniform(access) => *access,
            Self::PerSubresource(states) => states[index as usize],
        }
    }

    /// The shared state if the record is (or has become) uniform.
    pub fn as_uniform(&self) -> Option<ResourceAccess> {
        match self {
            Self::Uniform(access) => Some(*access),
            Self::PerSubresource(states) => {
                let first = *states.first()?;
                states.iter().all(|s| *s == first).then_some(first)
            }
        }
    }

    /// Record a new state for `index` (or all subresources).
    ///
    /// Setting all subresources collapses the record back to uniform; setting
    /// one subresource of a uniform record expands it to per-subresource
    /// tracking first.
    pub fn set(&mut self, index: u32, access: ResourceAccess, subresource_count: u32) {
        if index == ALL_SUBRESOURCES {
            *self = Self::Uniform(access);
            return;
        }
        debug_assert!(index < subresource_count);
        match self {
            Self::Uniform(current) => {
                if *current == access {
                    return;
                }
                let mut states = vec![*current; subresource_count as usize];
                states[index as usize] = access;
                *self = Self::PerSubresource(states);
            }
            Self::PerSubresource(states) => {
                states[index as usize] = access;
            }
        }
    }
}

#[derive(Debug)]
struct TrackedResource {
    states: SubresourceStates,
    subresource_count: u32,
}

/// Process-wide authoritative resource state between command lists.
///
/// One instance per device, shared by every command queue. The only lock
/// held across both a read and a write of resource state is the one inside
/// [`reconcile`](Self::reconcile) — that call is the system's single
/// serialization point and must run in submission order.
#[derive(Debug, Default)]
pub struct GlobalStateTracker {
    records: Mutex<HashMap<ResourceId, TrackedResource>>,
}

impl GlobalStateTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a submitted list's pending barriers against the authoritative
    /// state, then fold the list's final states back in.
    ///
    /// Records for resources seen for the first time are created lazily in
    /// [`ResourceAccess::Common`]. Returns the resolved transitions, in
    /// pending order; transitions whose before and after states match are
    /// dropped.
    pub fn reconcile(
        &self,
        pending: &[PendingBarrier],
        final_states: &[(ResourceRef, u32, ResourceAccess)],
    ) -> Vec<Barrier> {
        let mut records = self.records.lock();
        let mut resolved = Vec::with_capacity(pending.len());

        for barrier in pending {
            let tracked = records
                .entry(barrier.resource.id)
                .or_insert_with(|| TrackedResource {
                    states: SubresourceStates::uniform(ResourceAccess::Common),
                    subresource_count: barrier.resource.subresource_count,
                });

            if barrier.subresource == ALL_SUBRESOURCES {
                match tracked.states.as_uniform() {
                    Some(before) => {
                        if before != barrier.after {
                            resolved.push(Barrier::Transition {
                                resource: barrier.resource.clone(),
                                subresource: ALL_SUBRESOURCES,
                                before,
                                after: barrier.after,
                            });
                        }
                    }
                    None => {
                        // Mixed per-subresource states: one transition per
                        // subresource that actually changes.
                        for index in 0..tracked.subresource_count {
                            let before = tracked.states.get(index);
                            if before != barrier.after {
                                resolved.push(Barrier::Transition {
                                    resource: barrier.resource.clone(),
                                    subresource: index,
                                    before,
                                    after: barrier.after,
                                });
                            }
                        }
                    }
                }
            } else {
                let before = tracked.states.get(barrier.subresource);
                if before != barrier.after {
                    resolved.push(Barrier::Transition {
                        resource: barrier.resource.clone(),
                        subresource: barrier.subresource,
                        before,
                        after: barrier.after,
                    });
                }
            }
        }

        for (resource, subresource, access) in final_states {
            let tracked = records.entry(resource.id).or_insert_with(|| TrackedResource {
                states: SubresourceStates::uniform(ResourceAccess::Common),
                subresource_count: resource.subresource_count,
            });
            tracked
                .states
                .set(*subresource, *access, tracked.subresource_count);
        }

        resolved
    }

    /// Current state of one subresource, if the resource is tracked.
    pub fn resource_state(&self, id: ResourceId, subresource: u32) -> Option<ResourceAccess> {
        let records = self.records.lock();
        let tracked = records.get(&id)?;
        if subresource == ALL_SUBRESOURCES {
            tracked.states.as_uniform()
        } else {
            Some(tracked.states.get(subresource))
        }
    }

    /// Drop the record for a destroyed resource.
    pub fn forget_resource(&self, id: ResourceId) {
        self.records.lock().remove(&id);
    }

    /// Number of tracked resources.
    pub fn tracked_count(&self) -> usize {
        self.records.lock().len()
    }
}

/// Shared handle to the global tracker.
pub type SharedStateTracker = Arc<GlobalStateTracker>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ref(id: u64, subresources: u32) -> ResourceRef {
        ResourceRef {
            id: ResourceId::from_raw(id),
            raw: RawResource::Buffer(Arc::new(GpuBuffer::new_dummy(64, 0x1000 * id))),
            subresource_count: subresources,
        }
    }

    #[test]
    fn test_uniform_expands_on_single_subresource() {
        let mut states = SubresourceStates::uniform(ResourceAccess::Common);
        states.set(2, ResourceAccess::RenderTarget, 4);

        assert_eq!(states.get(2), ResourceAccess::RenderTarget);
        assert_eq!(states.get(0), ResourceAccess::Common);
        assert!(states.as_uniform().is_none());

        // Setting all subresources collapses back to uniform.
        states.set(ALL_SUBRESOURCES, ResourceAccess::ShaderResource, 4);
        assert_eq!(states.as_uniform(), Some(ResourceAccess::ShaderResource));
    }

    #[test]
    fn test_set_same_state_keeps_uniform() {
        let mut states = SubresourceStates::uniform(ResourceAccess::ShaderResource);
        states.set(1, ResourceAccess::ShaderResource, 4);
        assert!(matches!(states, SubresourceStates::Uniform(_)));
    }

    #[test]
    fn test_reconcile_resolves_against_global_state() {
        let tracker = GlobalStateTracker::new();
        let resource = test_ref(1, 1);

        // First list leaves the resource as a render target.
        let barriers = tracker.reconcile(
            &[PendingBarrier {
                resource: resource.clone(),
                subresource: ALL_SUBRESOURCES,
                after: ResourceAccess::RenderTarget,
            }],
            &[(
                resource.clone(),
                ALL_SUBRESOURCES,
                ResourceAccess::RenderTarget,
            )],
        );
        // Lazily created in Common, so a Common -> RenderTarget transition.
        assert_eq!(barriers.len(), 1);
        match &barriers[0] {
            Barrier::Transition { before, after, .. } => {
                assert_eq!(*before, ResourceAccess::Common);
                assert_eq!(*after, ResourceAccess::RenderTarget);
            }
            other => panic!("unexpected barrier {other:?}"),
        }

        // Second list reads it: before must be what the first list left.
        let barriers = tracker.reconcile(
            &[PendingBarrier {
                resource: resource.clone(),
                subresource: ALL_SUBRESOURCES,
                after: ResourceAccess::ShaderResource,
            }],
            &[(
                resource.clone(),
                ALL_SUBRESOURCES,
                ResourceAccess::ShaderResource,
            )],
        );
        assert_eq!(barriers.len(), 1);
        match &barriers[0] {
            Barrier::Transition { before, .. } => {
                assert_eq!(*before, ResourceAccess::RenderTarget)
            }
            other => panic!("unexpected barrier {other:?}"),
        }
    }

    #[test]
    fn test_reconcile_skips_matching_state() {
        let tracker = GlobalStateTracker::new();
        let resource = test_ref(2, 1);

        let barriers = tracker.reconcile(
            &[PendingBarrier {
                resource: resource.clone(),
                subresource: ALL_SUBRESOURCES,
                after: ResourceAccess::Common,
            }],
            &[],
        );
        assert!(barriers.is_empty());
    }

    #[test]
    fn test_reconcile_mixed_subresources() {
        let tracker = GlobalStateTracker::new();
        let resource = test_ref(3, 3);

        // Leave subresource 1 in CopyDest, others Common.
        tracker.reconcile(&[], &[(resource.clone(), 1, ResourceAccess::CopyDest)]);

        // A whole-resource transition must emit per-subresource barriers for
        // the ones that actually change.
        let barriers = tracker.reconcile(
            &[PendingBarrier {
                resource: resource.clone(),
                subresource: ALL_SUBRESOURCES,
                after: ResourceAccess::CopyDest,
            }],
            &[],
        );
        assert_eq!(barriers.len(), 2); // subresources 0 and 2
        for barrier in &barriers {
            match barrier {
                Barrier::Transition {
                    subresource,
                    before,
                    ..
                } => {
                    assert_ne!(*subresource, 1);
                    assert_eq!(*before, ResourceAccess::Common);
                }
                other => panic!("unexpected barrier {other:?}"),
            }
        }
    }

    #[test]
    fn test_forget_resource() {
        let tracker = GlobalStateTracker::new();
        let resource = test_ref(4, 1);
        tracker.reconcile(&[], &[(resource.clone(), 0, ResourceAccess::CopySource)]);
        assert_eq!(tracker.tracked_count(), 1);

        tracker.forget_resource(resource.id);
        assert_eq!(tracker.tracked_count(), 0);
        assert!(tracker.resource_state(resource.id, 0).is_none());
    }
}
