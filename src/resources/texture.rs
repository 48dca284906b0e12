//! Texture resource wrapper.

use std::sync::Arc;

use crate::backend::GpuTexture;
use crate::state::{RawResource, ResourceId, ResourceRef};
use crate::types::TextureDescriptor;

use super::TrackedResource;

/// A GPU texture with a tracked identity.
///
/// Subresources are indexed `mip + level_count * layer`, matching the order
/// upload data is provided in.
#[derive(Debug)]
pub struct Texture {
    id: ResourceId,
    raw: Arc<GpuTexture>,
    descriptor: TextureDescriptor,
}

impl Texture {
    pub(crate) fn new(id: ResourceId, raw: GpuTexture, descriptor: TextureDescriptor) -> Self {
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
    pub fn raw(&self) -> &Arc<GpuTexture> {
        &self.raw
    }

    /// The descriptor the texture was created with.
    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// Flat subresource index for a mip level of an array layer.
    pub fn subresource_index(&self, mip_level: u32, array_layer: u32) -> u32 {
        debug_assert!(mip_level < self.descriptor.mip_level_count);
        debug_assert!(array_layer < self.descriptor.array_layer_count);
        mip_level + self.descriptor.mip_level_count * array_layer
    }

    pub(crate) fn into_raw(self) -> Arc<GpuTexture> {
        self.raw
    }
}

impl TrackedResource for Texture {
    fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            id: self.id,
            raw: RawResource::Texture(self.raw.clone()),
            subresource_count: self.descriptor.subresource_count(),
        }
    }
}
