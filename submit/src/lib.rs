//! # RedLilium Submit
//!
//! Frame-pipelined command submission and synchronization for RedLilium.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsInstance`] - Owns the GPU backend and startup configuration
//! - [`RenderDevice`] - Hardware queues, the frame timeline and end-of-frame submission
//! - [`RenderContext`] - Per-thread command recording and queuing
//! - [`StagingArena`] - Per-frame CPU to GPU uploads on non-coherent devices
//! - [`TransientHeap`] - One-frame buffers and textures placed in a shared heap
//! - [`TimelineSemaphore`] - Monotonic GPU/CPU counters ordering all of the above
//! - Multiple backend support: Vulkan and Dummy (for testing)
//!
//! ## Example
//!
//! ```ignore
//! use redlilium_submit::{GraphicsInstance, SubmitConfig};
//!
//! let instance = GraphicsInstance::new(SubmitConfig::default())?;
//! let device = instance.create_device()?;
//! let mut context = device.create_context("main")?;
//!
//! let frame = device.begin_frame(None)?;
//! context.reset(frame.slot)?;
//! let cb = context.begin_graphics()?;
//! // record...
//! let handle = context.end()?;
//! context.queue_graphics(handle, None, None)?;
//! context.flush();
//! device.end_frame(None, None)?;
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod queue;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod transient;
pub mod types;

// Re-export main types for convenience
pub use backend::dummy::{DummyBackend, DummyConfig, ExecutionMode};
pub use backend::{GpuBackend, SubmitBatch, create_backend};
pub use config::{BackendChoice, SubmitConfig};
pub use context::{CommandBufferHandle, RenderContext, ResetStatus, SubmitRecord};
pub use device::{FrameInfo, RenderDevice};
pub use error::GraphicsError;
pub use frame::{FrameState, FrameTimeline};
pub use instance::GraphicsInstance;
pub use queue::QueueSet;
pub use staging::{StagingAllocation, StagingArena, StagingStats};
pub use swapchain::{DummySwapchain, Swapchain};
pub use sync::{SemaphoreOp, TimelineSemaphore, WaitStatus};
pub use transient::{TransientBuffer, TransientHeap, TransientHeapStats, TransientTexture};
pub use types::{
    BufferDescriptor, BufferUsage, FrameSlot, MemoryModel, QueueKind, TextureDescriptor,
    TextureFormat, TextureUsage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy Backend");
    }
}
