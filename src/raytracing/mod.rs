//! Ray-tracing acceleration structures: memory management, asynchronous
//! builds and deferred compaction.
//!
//! Acceleration structures live inside large GPU pages sub-allocated by
//! [`AccelMemoryPool`]; [`AccelStructManager`] layers the build workflow on
//! top: compute sizes, sub-allocate scratch and result memory, build, read
//! back the post-build compacted size, and — once the relevant fence values
//! completed — issue the compacting copy.

mod manager;
mod memory;

pub use manager::{AccelStructIndex, AccelStructManager};
pub use memory::{AccelMemoryPool, AccelSection, ACCEL_ALIGNMENT, DEFAULT_ACCEL_PAGE_SIZE};

use bitflags::bitflags;

bitflags! {
    /// Build flags for acceleration structures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccelBuildFlags: u32 {
        /// Allow a compacting copy after the build.
        const ALLOW_COMPACTION = 1 << 0;
        /// Optimize for trace performance.
        const PREFER_FAST_TRACE = 1 << 1;
        /// Optimize for build speed.
        const PREFER_FAST_BUILD = 1 << 2;
        /// Allow incremental updates.
        const ALLOW_UPDATE = 1 << 3;
    }
}

impl Default for AccelBuildFlags {
    fn default() -> Self {
        Self::PREFER_FAST_TRACE
    }
}

/// Acceleration structure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelKind {
    /// Bottom-level structure built from triangle geometry.
    BottomLevel,
    /// Top-level structure built from instances of bottom-level structures.
    TopLevel,
}

/// One triangle geometry feeding a bottom-level build.
///
/// Addresses are GPU virtual addresses; the referenced buffers must stay
/// alive until the build's sync point completes.
#[derive(Debug, Clone, Copy)]
pub struct TriangleGeometry {
    /// GPU address of the vertex positions.
    pub vertex_address: u64,
    /// Number of vertices.
    pub vertex_count: u32,
    /// Stride between vertex positions in bytes.
    pub vertex_stride: u64,
    /// GPU address of the index data, if indexed.
    pub index_address: Option<u64>,
    /// Number of triangles.
    pub triangle_count: u32,
    /// Whether the geometry is opaque (skips any-hit shaders).
    pub opaque: bool,
}

/// Inputs to an acceleration structure build.
#[derive(Debug, Clone)]
pub enum AccelBuildInputs {
    /// Bottom-level build from triangle geometries.
    BottomLevel {
        /// The geometries, one sub-structure each.
        geometries: Vec<TriangleGeometry>,
    },
    /// Top-level build from an instance array in GPU memory.
    TopLevel {
        /// GPU address of the packed instance descriptors.
        instance_address: u64,
        /// Number of instances.
        instance_count: u32,
    },
}

impl AccelBuildInputs {
    /// Which level this input builds.
    pub fn kind(&self) -> AccelKind {
        match self {
            Self::BottomLevel { .. } => AccelKind::BottomLevel,
            Self::TopLevel { .. } => AccelKind::TopLevel,
        }
    }

    /// Total primitive count (triangles or instances).
    pub fn primitive_count(&self) -> u64 {
        match self {
            Self::BottomLevel { geometries } => geometries
                .iter()
                .map(|g| u64::from(g.triangle_count))
                .sum(),
            Self::TopLevel { instance_count, .. } => u64::from(*instance_count),
        }
    }
}

/// Memory requirements reported by the backend for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelSizes {
    /// Size of the result (the structure itself).
    pub result_size: u64,
    /// Size of the build scratch memory.
    pub scratch_size: u64,
    /// Size of the update scratch memory.
    pub update_scratch_size: u64,
}
