//! Binding layout (root signature) builder.
//!
//! A binding layout declares how shader-visible slots map to resources:
//! inline constants, single descriptors, or descriptor tables of ranges.
//! Layouts are immutable once built and shared between pipelines via `Arc`.

use std::sync::Arc;

/// Kind of resource a binding range refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Constant/uniform buffer view.
    ConstantBuffer,
    /// Read-only shader resource view.
    ShaderResource,
    /// Read/write unordered access view.
    UnorderedAccess,
    /// Sampler.
    Sampler,
}

/// Shader stages that can see a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindingVisibility {
    /// Visible to every stage.
    #[default]
    All,
    /// Vertex stage only.
    Vertex,
    /// Pixel stage only.
    Pixel,
    /// Compute stage only.
    Compute,
}

/// A contiguous range of descriptors inside a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingRange {
    /// Kind of descriptor in the range.
    pub kind: BindingKind,
    /// First register of the range.
    pub base_register: u32,
    /// Register space.
    pub register_space: u32,
    /// Number of descriptors.
    pub count: u32,
}

/// One root-level parameter of a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingParameter {
    /// Inline 32-bit constants.
    Constants {
        /// Destination register.
        register: u32,
        /// Register space.
        register_space: u32,
        /// Number of 32-bit values.
        count: u32,
    },
    /// A single inline descriptor.
    Descriptor {
        /// Descriptor kind.
        kind: BindingKind,
        /// Destination register.
        register: u32,
        /// Register space.
        register_space: u32,
    },
    /// A descriptor table of one or more ranges.
    Table {
        /// The ranges making up the table.
        ranges: Vec<BindingRange>,
        /// Stage visibility.
        visibility: BindingVisibility,
    },
}

/// Immutable binding layout shared by pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingLayout {
    parameters: Vec<BindingParameter>,
}

impl BindingLayout {
    /// Start building a layout.
    pub fn builder() -> BindingLayoutBuilder {
        BindingLayoutBuilder::default()
    }

    /// The root parameters, in declaration order.
    pub fn parameters(&self) -> &[BindingParameter] {
        &self.parameters
    }
}

/// Builder for [`BindingLayout`].
#[derive(Debug, Default)]
pub struct BindingLayoutBuilder {
    parameters: Vec<BindingParameter>,
}

impl BindingLayoutBuilder {
    /// Add inline 32-bit constants.
    pub fn constants(mut self, register: u32, register_space: u32, count: u32) -> Self {
        assert!(count > 0, "constants parameter with zero values");
        self.parameters.push(BindingParameter::Constants {
            register,
            register_space,
            count,
        });
        self
    }

    /// Add a single inline descriptor.
    pub fn descriptor(mut self, kind: BindingKind, register: u32, register_space: u32) -> Self {
        self.parameters.push(BindingParameter::Descriptor {
            kind,
            register,
            register_space,
        });
        self
    }

    /// Add a descriptor table.
    pub fn table(mut self, ranges: Vec<BindingRange>, visibility: BindingVisibility) -> Self {
        assert!(!ranges.is_empty(), "descriptor table with no ranges");
        self.parameters
            .push(BindingParameter::Table { ranges, visibility });
        self
    }

    /// Finish the layout.
    pub fn build(self) -> Arc<BindingLayout> {
        Arc::new(BindingLayout {
            parameters: self.parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_builder_preserves_order() {
        let layout = BindingLayout::builder()
            .constants(0, 0, 4)
            .descriptor(BindingKind::ConstantBuffer, 1, 0)
            .table(
                vec![BindingRange {
                    kind: BindingKind::ShaderResource,
                    base_register: 0,
                    register_space: 0,
                    count: 8,
                }],
                BindingVisibility::Pixel,
            )
            .build();

        assert_eq!(layout.parameters().len(), 3);
        assert!(matches!(
            layout.parameters()[0],
            BindingParameter::Constants { count: 4, .. }
        ));
        assert!(matches!(
            layout.parameters()[2],
            BindingParameter::Table { .. }
        ));
    }

    #[test]
    #[should_panic(expected = "no ranges")]
    fn test_empty_table_panics() {
        let _ = BindingLayout::builder().table(vec![], BindingVisibility::All);
    }
}
