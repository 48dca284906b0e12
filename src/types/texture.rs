//! Texture descriptors, formats and usage flags.

use bitflags::bitflags;

/// Texture dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent3d {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth or array layer count.
    pub depth: u32,
}

impl Extent3d {
    /// Create a 2D extent with depth 1.
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }
}

impl Default for Extent3d {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
        }
    }
}

/// Texture formats supported by the submission layer.
///
/// This is the subset the engine renders and uploads into; backends reject
/// descriptors whose format they cannot represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    /// 8-bit RGBA, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA, unsigned normalized (common swap-chain format).
    Bgra8Unorm,
    /// 16-bit float RGBA (HDR intermediate targets).
    Rgba16Float,
    /// 32-bit float RG (motion vectors, reservoirs).
    Rg32Float,
    /// 32-bit float R.
    R32Float,
    /// 32-bit depth.
    Depth32Float,
    /// 24-bit depth + 8-bit stencil.
    Depth24PlusStencil8,
}

impl TextureFormat {
    /// Bytes per texel for non-depth formats.
    pub fn texel_size(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8UnormSrgb | Self::Bgra8Unorm => 4,
            Self::Rgba16Float => 8,
            Self::Rg32Float => 8,
            Self::R32Float => 4,
            Self::Depth32Float | Self::Depth24PlusStencil8 => 4,
        }
    }

    /// Whether this is a depth or depth-stencil format.
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24PlusStencil8)
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Texture can be sampled in shaders.
        const SAMPLED = 1 << 0;
        /// Texture can be written as a storage image (unordered access).
        const STORAGE = 1 << 1;
        /// Texture can be bound as a color or depth attachment.
        const RENDER_ATTACHMENT = 1 << 2;
        /// Texture can be copied from.
        const COPY_SRC = 1 << 3;
        /// Texture can be copied to.
        const COPY_DST = 1 << 4;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    /// Texture dimensions.
    pub size: Extent3d,
    /// Texel format.
    pub format: TextureFormat,
    /// Usage flags.
    pub usage: TextureUsage,
    /// Number of mip levels.
    pub mip_level_count: u32,
    /// Number of array layers.
    pub array_layer_count: u32,
}

impl TextureDescriptor {
    /// Create a 2D texture descriptor with one mip and one layer.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size: Extent3d::new_2d(width, height),
            format,
            usage,
            mip_level_count: 1,
            array_layer_count: 1,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, mip_level_count: u32) -> Self {
        self.mip_level_count = mip_level_count;
        self
    }

    /// Set the array layer count.
    pub fn with_array_layers(mut self, array_layer_count: u32) -> Self {
        self.array_layer_count = array_layer_count;
        self
    }

    /// Total number of subresources (mips × layers).
    pub fn subresource_count(&self) -> u32 {
        self.mip_level_count * self.array_layer_count
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self::new_2d(1, 1, TextureFormat::default(), TextureUsage::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_count() {
        let desc = TextureDescriptor::new_2d(
            256,
            256,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED,
        )
        .with_mip_levels(4)
        .with_array_layers(6);
        assert_eq!(desc.subresource_count(), 24);
    }

    #[test]
    fn test_depth_formats() {
        assert!(TextureFormat::Depth32Float.is_depth());
        assert!(!TextureFormat::Rgba16Float.is_depth());
    }
}
