//! Startup configuration.
//!
//! Everything here is read once when the [`GraphicsInstance`] is created and
//! stays fixed for the session. Values can be built in code or loaded from a
//! TOML table:
//!
//! ```toml
//! buffering_depth = 2
//! staging_capacity = 67108864
//! transient_heap_size = 33554432
//! force_non_coherent_staging = true
//! backend = "dummy"
//! ```
//!
//! [`GraphicsInstance`]: crate::instance::GraphicsInstance

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::GraphicsError;

/// Largest supported number of frames in flight.
pub const MAX_BUFFERING_DEPTH: u32 = 8;

/// Which GPU backend the instance should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Try Vulkan first, fall back to the dummy backend.
    #[default]
    Auto,
    /// Require the Vulkan backend.
    Vulkan,
    /// Use the simulated backend.
    Dummy,
}

/// Configuration of the submission core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    /// Number of frames that can be in flight at once.
    pub buffering_depth: u32,
    /// Total bytes of host-visible staging memory, split across frame slots.
    pub staging_capacity: u64,
    /// Total bytes of the transient heap, split across frame slots.
    pub transient_heap_size: u64,
    /// Use the staging path even on devices with coherent device-local memory.
    pub force_non_coherent_staging: bool,
    /// Capacity of each (queue kind, frame slot) command buffer ring.
    pub command_buffers_per_pool: u32,
    /// Deadline for blocking semaphore waits, in milliseconds.
    pub wait_timeout_ms: u64,
    /// Enable API validation layers when available.
    pub validation: bool,
    /// Backend selection.
    pub backend: BackendChoice,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            buffering_depth: 3,
            staging_capacity: 224 * 1024 * 1024,
            transient_heap_size: 64 * 1024 * 1024,
            force_non_coherent_staging: false,
            command_buffers_per_pool: 64,
            wait_timeout_ms: 10_000,
            validation: cfg!(debug_assertions),
            backend: BackendChoice::Auto,
        }
    }
}

impl SubmitConfig {
    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, GraphicsError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| GraphicsError::InvalidConfiguration(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, GraphicsError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GraphicsError::InvalidConfiguration(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        log::info!(
            "Loaded submit configuration from {} (buffering depth {})",
            path.display(),
            config.buffering_depth
        );
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), GraphicsError> {
        if self.buffering_depth == 0 || self.buffering_depth > MAX_BUFFERING_DEPTH {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "buffering_depth must be in 1..={MAX_BUFFERING_DEPTH}, got {}",
                self.buffering_depth
            )));
        }

        let depth = u64::from(self.buffering_depth);
        if self.staging_capacity < depth {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "staging_capacity {} is smaller than one byte per frame slot",
                self.staging_capacity
            )));
        }
        if self.transient_heap_size < depth {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "transient_heap_size {} is smaller than one byte per frame slot",
                self.transient_heap_size
            )));
        }
        if self.command_buffers_per_pool == 0 {
            return Err(GraphicsError::InvalidConfiguration(
                "command_buffers_per_pool cannot be zero".to_string(),
            ));
        }
        if self.wait_timeout_ms == 0 {
            return Err(GraphicsError::InvalidConfiguration(
                "wait_timeout_ms cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Set the buffering depth.
    pub fn with_buffering_depth(mut self, depth: u32) -> Self {
        self.buffering_depth = depth;
        self
    }

    /// Set the total staging capacity.
    pub fn with_staging_capacity(mut self, bytes: u64) -> Self {
        self.staging_capacity = bytes;
        self
    }

    /// Set the total transient heap size.
    pub fn with_transient_heap_size(mut self, bytes: u64) -> Self {
        self.transient_heap_size = bytes;
        self
    }

    /// Force the staging path on coherent devices.
    pub fn with_forced_staging(mut self, force: bool) -> Self {
        self.force_non_coherent_staging = force;
        self
    }

    /// Set the per-pool command buffer capacity.
    pub fn with_command_buffers_per_pool(mut self, count: u32) -> Self {
        self.command_buffers_per_pool = count;
        self
    }

    /// Set the blocking wait deadline.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    /// Select the backend.
    pub fn with_backend(mut self, backend: BackendChoice) -> Self {
        self.backend = backend;
        self
    }

    /// Blocking wait deadline as a [`Duration`].
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = SubmitConfig::default();
        assert_eq!(config.buffering_depth, 3);
        assert_eq!(config.staging_capacity, 224 * 1024 * 1024);
        assert_eq!(config.transient_heap_size, 64 * 1024 * 1024);
        assert!(!config.force_non_coherent_staging);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SubmitConfig::from_toml_str(
            r#"
            buffering_depth = 2
            force_non_coherent_staging = true
            backend = "dummy"
            "#,
        )
        .unwrap();

        assert_eq!(config.buffering_depth, 2);
        assert!(config.force_non_coherent_staging);
        assert_eq!(config.backend, BackendChoice::Dummy);
        assert_eq!(config.transient_heap_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_malformed_toml() {
        let result = SubmitConfig::from_toml_str("buffering_depth = \"three\"");
        assert!(matches!(
            result,
            Err(GraphicsError::InvalidConfiguration(_))
        ));
    }

    #[rstest]
    #[case(SubmitConfig::default().with_buffering_depth(0))]
    #[case(SubmitConfig::default().with_buffering_depth(MAX_BUFFERING_DEPTH + 1))]
    #[case(SubmitConfig::default().with_staging_capacity(2))]
    #[case(SubmitConfig::default().with_transient_heap_size(0))]
    #[case(SubmitConfig::default().with_command_buffers_per_pool(0))]
    fn test_validate_rejects(#[case] config: SubmitConfig) {
        assert!(matches!(
            config.validate(),
            Err(GraphicsError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_wait_timeout_round_trips_through_millis() {
        let config = SubmitConfig::default().with_wait_timeout(Duration::from_micros(10));
        assert_eq!(config.wait_timeout_ms, 1);

        let config = SubmitConfig::default().with_wait_timeout(Duration::from_secs(2));
        assert_eq!(config.wait_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_load_missing_file() {
        let result = SubmitConfig::load(Path::new("/nonexistent/submit.toml"));
        assert!(result.is_err());
    }
}
