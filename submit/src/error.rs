//! Submission error types.

use std::fmt;
use std::time::Duration;

/// Errors that can occur in the submission core.
///
/// Every variant except [`InvalidParameter`](Self::InvalidParameter) and
/// [`InvalidConfiguration`](Self::InvalidConfiguration) is unrecoverable at
/// this layer: GPU timeline state after a failed submit or a lost device
/// cannot be rolled back, so callers are expected to shut the engine down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    InitializationFailed(String),
    /// Failed to create a resource.
    ResourceCreationFailed(String),
    /// A requested feature is not supported.
    FeatureNotSupported(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// The startup configuration is unusable.
    InvalidConfiguration(String),
    /// A fixed-size arena or pool ran out of space for the current frame.
    CapacityExceeded {
        /// Name of the configuration value that sizes the arena.
        resource: &'static str,
        /// Amount the frame needed (bytes, or command buffers for pools).
        requested: u64,
        /// Amount one frame slot provides.
        available: u64,
    },
    /// A queue submission was rejected by the driver.
    SubmitFailed(String),
    /// A blocking semaphore wait exceeded its deadline.
    WaitTimeout {
        /// Value that was being waited for.
        value: u64,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// An internal error occurred.
    Internal(String),
    /// The surface is outdated and needs to be reconfigured.
    SurfaceOutdated,
    /// The surface was lost and needs to be recreated.
    SurfaceLost,
}

impl GraphicsError {
    /// Whether the error must be propagated to engine shutdown.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::InvalidParameter(_)
                | Self::InvalidConfiguration(_)
                | Self::FeatureNotSupported(_)
                | Self::SurfaceOutdated
        )
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::FeatureNotSupported(msg) => write!(f, "feature not supported: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::CapacityExceeded {
                resource,
                requested,
                available,
            } => write!(
                f,
                "{resource} exhausted: frame needs {requested} but only {available} \
                 are available, increase {resource}"
            ),
            Self::SubmitFailed(msg) => write!(f, "queue submission failed: {msg}"),
            Self::WaitTimeout { value, timeout } => {
                write!(f, "timed out after {timeout:?} waiting for value {value}")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::SurfaceOutdated => write!(f, "surface outdated, needs reconfiguration"),
            Self::SurfaceLost => write!(f, "surface lost, needs recreation"),
        }
    }
}

impl std::error::Error for GraphicsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GraphicsError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");
    }

    #[test]
    fn test_capacity_message_names_knob() {
        let err = GraphicsError::CapacityExceeded {
            resource: "staging_capacity",
            requested: 4096,
            available: 1024,
        };
        let message = err.to_string();
        assert!(message.contains("increase staging_capacity"));
        assert!(message.contains("4096"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GraphicsError::DeviceLost.is_fatal());
        assert!(GraphicsError::SubmitFailed("lost".into()).is_fatal());
        assert!(
            GraphicsError::WaitTimeout {
                value: 3,
                timeout: Duration::from_millis(5)
            }
            .is_fatal()
        );
        assert!(!GraphicsError::InvalidParameter("x".into()).is_fatal());
    }
}
