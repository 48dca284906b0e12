//! Shared test fixtures for the submission-core integration tests.

use std::sync::Arc;

use amaranth_graphics::backend::dummy::DummyBackend;
use amaranth_graphics::{
    BufferDescriptor, BufferUsage, DeviceConfig, GraphicsDevice, GraphicsInstance,
};

/// Backend a test case runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// CPU-simulated backend; always available.
    Dummy,
    /// Native Vulkan; skipped when no driver responds.
    Vulkan,
}

/// A device plus direct access to the dummy backend's test controls.
pub struct TestContext {
    pub device: Arc<GraphicsDevice>,
    pub dummy: Option<Arc<DummyBackend>>,
}

impl TestContext {
    /// Create a context, or `None` when the backend is unavailable.
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_config(backend, DeviceConfig::default())
    }

    /// Create a context with explicit device configuration.
    pub fn with_config(backend: Backend, config: DeviceConfig) -> Option<Self> {
        init_logging();
        match backend {
            Backend::Dummy => {
                let dummy = Arc::new(DummyBackend::new());
                let instance = GraphicsInstance::with_backend(dummy.clone());
                let device = instance.create_device_with(config, None).ok()?;
                Some(Self {
                    device,
                    dummy: Some(dummy),
                })
            }
            Backend::Vulkan => {
                #[cfg(feature = "vulkan-backend")]
                {
                    let backend =
                        amaranth_graphics::backend::vulkan::VulkanBackend::new().ok()?;
                    let instance = GraphicsInstance::with_backend(Arc::new(backend));
                    let device = instance.create_device_with(config, None).ok()?;
                    Some(Self {
                        device,
                        dummy: None,
                    })
                }
                #[cfg(not(feature = "vulkan-backend"))]
                {
                    let _ = config;
                    None
                }
            }
        }
    }

    /// Create a GPU-local buffer usable as copy source and destination.
    pub fn create_gpu_buffer(&self, size: u64) -> amaranth_graphics::Buffer {
        self.device
            .create_buffer(&BufferDescriptor::new(
                size,
                BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            ))
            .unwrap()
    }

    /// Create a CPU-readable buffer for verifying copies.
    pub fn create_readback_buffer(&self, size: u64) -> amaranth_graphics::Buffer {
        self.device
            .create_buffer(&BufferDescriptor::new(
                size,
                BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            ))
            .unwrap()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.device.wait_idle();
    }
}

/// A deterministic byte pattern for copy verification.
pub fn generate_test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
