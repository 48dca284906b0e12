//! # Amaranth Graphics
//!
//! GPU resource lifetime and command submission core for the Amaranth
//! engine: command allocator pooling, resource state tracking with deferred
//! cross-list barrier resolution, fenced recycling of transient memory, and
//! ray-tracing acceleration structure management with deferred compaction.
//!
//! ## Overview
//!
//! - [`SyncPoint`] — copyable "work up to value N on queue Q retired" handle
//! - [`CommandQueue`] / [`CommandContext`] — recording and submission with
//!   automatic barrier placement
//! - [`GlobalStateTracker`](state::GlobalStateTracker) — authoritative
//!   resource states between command lists
//! - [`LinearAllocator`] — fenced page recycling for staging memory
//! - [`AccelStructManager`] — acceleration structure builds and compaction
//! - [`PipelineCompiler`] — asynchronous pipeline compilation
//! - Backends: native Vulkan (feature `vulkan-backend`) and a CPU dummy
//!   backend every test can run against
//!
//! ## Example
//!
//! ```
//! use amaranth_graphics::backend::dummy::DummyBackend;
//! use amaranth_graphics::{BufferDescriptor, BufferUsage, GraphicsInstance};
//! use std::sync::Arc;
//!
//! let instance = GraphicsInstance::with_backend(Arc::new(DummyBackend::new()));
//! let device = instance.create_device().unwrap();
//!
//! let vertices = device
//!     .create_buffer(&BufferDescriptor::new(
//!         1024,
//!         BufferUsage::VERTEX | BufferUsage::COPY_DST,
//!     ))
//!     .unwrap();
//! let upload = device.upload_buffer(&[0u8; 1024], &vertices).unwrap();
//! device.graphics_queue().gpu_wait(&upload);
//! device.wait_idle();
//! ```

pub mod backend;
pub mod command;
pub mod deferred;
pub mod device;
pub mod error;
pub mod instance;
pub mod pipeline;
pub mod raytracing;
pub mod resources;
pub mod shader;
pub mod state;
pub mod sync;
pub mod types;
pub mod upload;

// Re-export the main types for convenience.
pub use command::{CommandContext, CommandQueue};
pub use device::{DeviceConfig, GraphicsDevice};
pub use error::GpuError;
pub use instance::GraphicsInstance;
pub use pipeline::{PipelineCompiler, PipelineHandle, PipelineStream};
pub use raytracing::{AccelBuildFlags, AccelBuildInputs, AccelStructManager};
pub use resources::{Buffer, Texture, TrackedResource};
pub use state::{ResourceAccess, ALL_SUBRESOURCES};
pub use sync::SyncPoint;
pub use types::{
    BufferDescriptor, BufferUsage, Extent3d, QueueId, QueueKind, TextureDescriptor,
    TextureFormat, TextureUsage,
};
pub use upload::{LinearAllocator, SubresourceData, UploadAllocation};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version; call once at startup.
pub fn init() {
    log::info!("Amaranth Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GpuBackend as _;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend_available() {
        let backend = backend::dummy::DummyBackend::new();
        assert_eq!(backend.name(), "Dummy");
    }
}
