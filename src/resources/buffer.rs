//! Buffer resource wrapper.

use std::sync::Arc;

use crate::backend::GpuBuffer;
use crate::state::{RawResource, ResourceId, ResourceRef};
use crate::types::BufferDescriptor;

use super::TrackedResource;

/// A GPU buffer with a tracked identity.
///
/// Created through [`GraphicsDevice::create_buffer`](crate::device::GraphicsDevice::create_buffer).
#[derive(Debug)]
pub struct Buffer {
    id: ResourceId,
    raw: Arc<GpuBuffer>,
    descriptor: BufferDescriptor,
}

impl Buffer {
    pub(crate) fn new(id: ResourceId, raw: GpuBuffer, descriptor: BufferDescriptor) -> Self {
        Self {
            id,
            raw: Arc::new(raw),
            descriptor,
        }
    }

    /// Tracker identity.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// The backend handle.
    pub fn raw(&self) -> &Arc<GpuBuffer> {
        &self.raw
    }

    /// The descriptor the buffer was created with.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// GPU virtual address of the buffer start.
    pub fn gpu_address(&self) -> u64 {
        self.raw.gpu_address()
    }

    pub(crate) fn into_raw(self) -> Arc<GpuBuffer> {
        self.raw
    }
}

impl TrackedResource for Buffer {
    fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            id: self.id,
            raw: RawResource::Buffer(self.raw.clone()),
            // Buffers are a single subresource.
            subresource_count: 1,
        }
    }
}
