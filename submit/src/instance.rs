//! Graphics instance.
//!
//! The [`GraphicsInstance`] owns the GPU backend and the startup
//! configuration. It is constructed explicitly at engine init, passed by
//! reference to whatever creates devices, and lives until engine shutdown.
//! There is no process-wide driver state.

use std::sync::{Arc, RwLock, Weak};

use crate::backend::{self, GpuBackend};
use crate::config::SubmitConfig;
use crate::device::RenderDevice;
use crate::error::GraphicsError;

/// The graphics instance owns the backend and creates devices.
///
/// # Thread Safety
///
/// `GraphicsInstance` is `Send + Sync` and can be safely shared across threads.
///
/// # Example
///
/// ```ignore
/// let instance = GraphicsInstance::new(SubmitConfig::default())?;
/// let device = instance.create_device()?;
/// let mut context = device.create_context("main")?;
/// ```
pub struct GraphicsInstance {
    /// Weak self-reference for creating devices.
    self_ref: RwLock<Weak<GraphicsInstance>>,
    /// Devices created by this instance. Devices hold the instance strongly.
    devices: RwLock<Vec<Weak<RenderDevice>>>,
    backend: Arc<dyn GpuBackend>,
    config: SubmitConfig,
}

impl GraphicsInstance {
    /// Create an instance with the backend selected by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or no backend can be
    /// initialized.
    pub fn new(config: SubmitConfig) -> Result<Arc<Self>, GraphicsError> {
        config.validate()?;
        let backend = backend::create_backend(&config)?;
        Self::with_backend(backend, config)
    }

    /// Create an instance around an existing backend.
    pub fn with_backend(
        backend: Arc<dyn GpuBackend>,
        config: SubmitConfig,
    ) -> Result<Arc<Self>, GraphicsError> {
        config.validate()?;
        log::info!(
            "Creating GraphicsInstance (backend: {}, adapter: {})",
            backend.name(),
            backend.adapter_name()
        );

        let instance = Arc::new(Self {
            self_ref: RwLock::new(Weak::new()),
            devices: RwLock::new(Vec::new()),
            backend,
            config,
        });

        if let Ok(mut self_ref) = instance.self_ref.write() {
            *self_ref = Arc::downgrade(&instance);
        }

        Ok(instance)
    }

    /// Get the GPU backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Startup configuration.
    pub fn config(&self) -> &SubmitConfig {
        &self.config
    }

    fn arc_self(&self) -> Option<Arc<GraphicsInstance>> {
        self.self_ref.read().ok().and_then(|r| r.upgrade())
    }

    /// Create a render device.
    ///
    /// # Errors
    ///
    /// Returns an error if the per-frame arenas cannot be allocated.
    pub fn create_device(&self) -> Result<Arc<RenderDevice>, GraphicsError> {
        let instance = self.arc_self().ok_or_else(|| {
            GraphicsError::ResourceCreationFailed("instance has been dropped".to_string())
        })?;
        let device = Arc::new(RenderDevice::new(instance)?);

        if let Ok(mut devices) = self.devices.write() {
            devices.retain(|device| device.strong_count() > 0);
            devices.push(Arc::downgrade(&device));
        }

        Ok(device)
    }

    /// Get the number of live devices created by this instance.
    pub fn device_count(&self) -> usize {
        self.devices
            .read()
            .map(|d| d.iter().filter(|device| device.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for GraphicsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsInstance")
            .field("backend", &self.backend.name())
            .field("device_count", &self.device_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsInstance: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendChoice;

    fn dummy_config() -> SubmitConfig {
        SubmitConfig::default()
            .with_backend(BackendChoice::Dummy)
            .with_staging_capacity(1024 * 1024)
            .with_transient_heap_size(4 * 1024 * 1024)
    }

    #[test]
    fn test_instance_creation() {
        let instance = GraphicsInstance::new(dummy_config()).unwrap();
        assert_eq!(instance.device_count(), 0);
        assert_eq!(instance.backend().name(), "Dummy Backend");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = GraphicsInstance::new(dummy_config().with_buffering_depth(0));
        assert!(matches!(
            result,
            Err(GraphicsError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_create_multiple_devices() {
        let instance = GraphicsInstance::new(dummy_config()).unwrap();
        let _device1 = instance.create_device().unwrap();
        let device2 = instance.create_device().unwrap();
        assert_eq!(instance.device_count(), 2);

        drop(device2);
        assert_eq!(instance.device_count(), 1);
    }

    #[test]
    fn test_device_has_instance_reference() {
        let instance = GraphicsInstance::new(dummy_config()).unwrap();
        let device = instance.create_device().unwrap();
        assert!(Arc::ptr_eq(device.instance(), &instance));
    }
}
