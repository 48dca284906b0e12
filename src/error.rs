//! GPU core error types.

use std::fmt;

/// Errors that can occur in the GPU resource and submission layer.
///
/// These cover failures reported by the underlying graphics API and invalid
/// parameters caught at this layer. Precondition violations (calling
/// operations out of order, unknown shader exports) are programmer errors and
/// panic instead; they are never represented here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Failed to initialize the backend or device.
    InitializationFailed(String),
    /// Failed to create a resource.
    ResourceCreationFailed(String),
    /// A requested feature is not supported by the active backend.
    FeatureNotSupported(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::FeatureNotSupported(msg) => write!(f, "feature not supported: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GpuError {}

#[cfg(feature = "vulkan-backend")]
impl From<ash::vk::Result> for GpuError {
    fn from(result: ash::vk::Result) -> Self {
        use ash::vk;
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Internal(format!("vulkan call failed: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GpuError::InvalidParameter("size must be nonzero".to_string());
        assert_eq!(err.to_string(), "invalid parameter: size must be nonzero");
    }
}
