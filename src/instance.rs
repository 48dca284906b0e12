//! Backend probing and device creation.

use std::sync::Arc;

use crate::backend::{create_backend, GpuBackend};
use crate::device::{DeviceConfig, GraphicsDevice};
use crate::error::GpuError;
use crate::shader::CrashHandler;

/// Entry point: selects a backend and creates devices.
pub struct GraphicsInstance {
    backend: Arc<dyn GpuBackend>,
}

impl std::fmt::Debug for GraphicsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsInstance")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl GraphicsInstance {
    /// Probe for the best available backend (Vulkan when compiled in and a
    /// driver responds, the dummy backend otherwise).
    pub fn new() -> Result<Self, GpuError> {
        Ok(Self {
            backend: create_backend(),
        })
    }

    /// Use a specific backend (tests inject the dummy backend here).
    pub fn with_backend(backend: Arc<dyn GpuBackend>) -> Self {
        Self { backend }
    }

    /// Name of the selected backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Create a device with default configuration.
    pub fn create_device(&self) -> Result<Arc<GraphicsDevice>, GpuError> {
        GraphicsDevice::new(self.backend.clone(), DeviceConfig::default(), None)
    }

    /// Create a device with explicit configuration and an optional crash
    /// handler (registered exactly once, during construction).
    pub fn create_device_with(
        &self,
        config: DeviceConfig,
        crash_handler: Option<Arc<dyn CrashHandler>>,
    ) -> Result<Arc<GraphicsDevice>, GpuError> {
        GraphicsDevice::new(self.backend.clone(), config, crash_handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::shader::ShaderDatabase;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_instance_with_dummy_backend() {
        let instance = GraphicsInstance::with_backend(Arc::new(DummyBackend::new()));
        assert_eq!(instance.backend_name(), "Dummy");
        let device = instance.create_device().unwrap();
        device.wait_idle();
    }

    #[test]
    fn test_crash_handler_registered_once() {
        struct TestHandler {
            called: AtomicBool,
        }
        impl CrashHandler for TestHandler {
            fn on_device_created(&self, shaders: &Arc<ShaderDatabase>) {
                assert!(shaders.is_empty());
                self.called.store(true, Ordering::Release);
            }
        }

        let handler = Arc::new(TestHandler {
            called: AtomicBool::new(false),
        });
        let instance = GraphicsInstance::with_backend(Arc::new(DummyBackend::new()));
        let _device = instance
            .create_device_with(Default::default(), Some(handler.clone()))
            .unwrap();
        assert!(handler.called.load(Ordering::Acquire));
    }
}
