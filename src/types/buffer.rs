//! Buffer descriptors, usage flags and indirect argument layouts.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 0;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be used as a uniform/constant buffer.
        const UNIFORM = 1 << 2;
        /// Buffer can be used as a storage buffer (unordered access).
        const STORAGE = 1 << 3;
        /// Buffer can be used as an indirect argument buffer.
        const INDIRECT = 1 << 4;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 5;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 6;
        /// Buffer is mappable for CPU reads (readback heap).
        const MAP_READ = 1 << 7;
        /// Buffer is mappable for CPU writes (upload heap).
        const MAP_WRITE = 1 << 8;
        /// Buffer backs acceleration structure storage.
        const ACCELERATION_STRUCTURE = 1 << 9;
        /// Buffer backs acceleration structure build scratch memory.
        const ACCELERATION_SCRATCH = 1 << 10;
        /// Buffer holds a ray-tracing shader binding table.
        const SHADER_BINDING_TABLE = 1 << 11;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether the buffer lives in a CPU-visible heap.
    pub fn is_cpu_visible(&self) -> bool {
        self.usage
            .intersects(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE)
    }
}

/// Arguments for a non-indexed indirect draw.
///
/// `#[repr(C)]` to match the GPU layout consumed by indirect draw commands;
/// the containing buffer must have [`BufferUsage::INDIRECT`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct DrawIndirectArgs {
    /// Number of vertices to draw.
    pub vertex_count: u32,
    /// Number of instances to draw.
    pub instance_count: u32,
    /// Index of the first vertex.
    pub first_vertex: u32,
    /// Instance id of the first instance.
    pub first_instance: u32,
}

impl DrawIndirectArgs {
    /// Size of the struct in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Bytes for uploading into an indirect buffer.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Arguments for an indexed indirect draw.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct DrawIndexedIndirectArgs {
    /// Number of indices to draw.
    pub index_count: u32,
    /// Number of instances to draw.
    pub instance_count: u32,
    /// Index of the first index.
    pub first_index: u32,
    /// Value added to each index before vertex lookup.
    pub base_vertex: i32,
    /// Instance id of the first instance.
    pub first_instance: u32,
}

impl DrawIndexedIndirectArgs {
    /// Size of the struct in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Bytes for uploading into an indirect buffer.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indirect_args_layout() {
        assert_eq!(DrawIndirectArgs::SIZE, 16);
        assert_eq!(DrawIndexedIndirectArgs::SIZE, 20);

        let args = DrawIndirectArgs {
            vertex_count: 36,
            instance_count: 100,
            first_vertex: 0,
            first_instance: 0,
        };
        assert_eq!(args.as_bytes().len(), 16);
        assert_eq!(&args.as_bytes()[0..4], &36u32.to_le_bytes());
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = BufferDescriptor::new(1024, BufferUsage::UNIFORM | BufferUsage::COPY_DST)
            .with_label("camera_constants");
        assert_eq!(desc.size, 1024);
        assert_eq!(desc.label.as_deref(), Some("camera_constants"));
        assert!(!desc.is_cpu_visible());

        let staging = BufferDescriptor::new(64, BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC);
        assert!(staging.is_cpu_visible());
    }
}
