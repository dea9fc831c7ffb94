//! GPU backend abstraction layer.
//!
//! The submission core is written entirely against the [`GpuBackend`] trait
//! and the opaque handle enums below. Each backend fills in its own variant;
//! nothing outside this module matches on backend-specific fields.
//!
//! # Available Backends
//!
//! - `dummy`: Simulated GPU with per-queue FIFO execution, used for tests
//! - `vulkan-backend`: Native Vulkan backend using ash
//!
//! # Architecture
//!
//! Each backend implements the [`GpuBackend`] trait, which provides:
//! - Queue topology and memory model queries
//! - Timeline and binary semaphores
//! - Command pool and command buffer recording
//! - Batched queue submission with semaphore waits and signals
//! - Buffer, heap and placed resource creation

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod dummy;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "vulkan-backend")]
use ash::vk::Handle;
#[cfg(feature = "vulkan-backend")]
use gpu_allocator::vulkan::{Allocation, Allocator};
#[cfg(feature = "vulkan-backend")]
use parking_lot::Mutex;

use crate::config::{BackendChoice, SubmitConfig};
use crate::error::GraphicsError;
use crate::sync::{SemaphoreOp, WaitStatus};
use crate::types::{
    BufferDescriptor, MemoryLocation, MemoryModel, MemoryRequirements, QueueKind,
    TextureDescriptor,
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a process-unique id for backend objects without a native handle.
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Kind of semaphore to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreType {
    /// Binary semaphore, used only for the swapchain handoff.
    Binary,
    /// Timeline semaphore with its starting value.
    Timeline {
        /// Initial counter value.
        initial: u64,
    },
}

/// Handle to a GPU semaphore.
#[allow(clippy::large_enum_variant)]
pub enum GpuSemaphore {
    /// Dummy backend semaphore
    Dummy(Arc<dummy::DummySemaphore>),
    /// Vulkan backend semaphore
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        semaphore: vk::Semaphore,
        timeline: bool,
    },
}

impl GpuSemaphore {
    /// Process-unique identity of the semaphore.
    pub fn id(&self) -> u64 {
        match self {
            Self::Dummy(semaphore) => semaphore.id(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { semaphore, .. } => semaphore.as_raw(),
        }
    }

    /// Whether this is a timeline semaphore.
    pub fn is_timeline(&self) -> bool {
        match self {
            Self::Dummy(semaphore) => semaphore.is_timeline(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { timeline, .. } => *timeline,
        }
    }
}

impl std::fmt::Debug for GpuSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(semaphore) => f
                .debug_struct("GpuSemaphore::Dummy")
                .field("id", &semaphore.id())
                .field("label", &semaphore.label())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                semaphore,
                timeline,
                ..
            } => f
                .debug_struct("GpuSemaphore::Vulkan")
                .field("semaphore", semaphore)
                .field("timeline", timeline)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a command pool bound to one queue kind.
pub enum GpuCommandPool {
    /// Dummy backend pool
    Dummy(Arc<dummy::DummyCommandPool>),
    /// Vulkan backend pool
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pool: vk::CommandPool,
        kind: QueueKind,
    },
}

impl GpuCommandPool {
    /// Queue kind the pool's command buffers are submitted to.
    pub fn kind(&self) -> QueueKind {
        match self {
            Self::Dummy(pool) => pool.kind(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { kind, .. } => *kind,
        }
    }
}

impl std::fmt::Debug for GpuCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(pool) => f
                .debug_struct("GpuCommandPool::Dummy")
                .field("kind", &pool.kind())
                .field("label", &pool.label())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pool, kind, .. } => f
                .debug_struct("GpuCommandPool::Vulkan")
                .field("pool", pool)
                .field("kind", kind)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a command buffer owned by a [`GpuCommandPool`].
///
/// Cloning copies the handle, not the command buffer. The owning pool frees
/// the underlying object.
#[derive(Clone)]
pub enum GpuCommandBuffer {
    /// Dummy backend command buffer
    Dummy(Arc<dummy::DummyCommandBuffer>),
    /// Vulkan backend command buffer
    #[cfg(feature = "vulkan-backend")]
    Vulkan { buffer: vk::CommandBuffer },
}

impl GpuCommandBuffer {
    /// Process-unique identity of the command buffer.
    pub fn id(&self) -> u64 {
        match self {
            Self::Dummy(buffer) => buffer.id(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer } => buffer.as_raw(),
        }
    }
}

impl std::fmt::Debug for GpuCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(buffer) => f
                .debug_struct("GpuCommandBuffer::Dummy")
                .field("id", &buffer.id())
                .field("label", &buffer.label())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer } => f
                .debug_struct("GpuCommandBuffer::Vulkan")
                .field("buffer", buffer)
                .finish(),
        }
    }
}

/// Handle to a GPU buffer resource.
#[allow(clippy::large_enum_variant)]
pub enum GpuBuffer {
    /// Dummy backend buffer backed by host memory
    Dummy(Arc<dummy::DummyBuffer>),
    /// Vulkan backend buffer
    ///
    /// Placed buffers carry no allocation: their memory belongs to a heap.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        buffer: vk::Buffer,
        allocation: Mutex<Option<Allocation>>,
        allocator: Arc<Mutex<Allocator>>,
        size: u64,
    },
}

impl GpuBuffer {
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Dummy(buffer) => buffer.size(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }

    /// Process-unique identity of the buffer.
    pub fn id(&self) -> u64 {
        match self {
            Self::Dummy(buffer) => buffer.id(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, .. } => buffer.as_raw(),
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(buffer) => f
                .debug_struct("GpuBuffer::Dummy")
                .field("id", &buffer.id())
                .field("size", &buffer.size())
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, size, .. } => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", buffer)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU texture placed in a heap.
#[allow(clippy::large_enum_variant)]
pub enum GpuTexture {
    /// Dummy backend texture
    Dummy { id: u64, size: u64 },
    /// Vulkan backend texture
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent3D,
    },
}

impl GpuTexture {
    /// Process-unique identity of the texture.
    pub fn id(&self) -> u64 {
        match self {
            Self::Dummy { id, .. } => *id,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { image, .. } => image.as_raw(),
        }
    }
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { id, size } => f
                .debug_struct("GpuTexture::Dummy")
                .field("id", id)
                .field("size", size)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                image,
                format,
                extent,
                ..
            } => f
                .debug_struct("GpuTexture::Vulkan")
                .field("image", image)
                .field("format", format)
                .field("extent", extent)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to one large device-local allocation that resources are placed into.
pub enum GpuHeap {
    /// Dummy backend heap
    Dummy { id: u64, size: u64 },
    /// Vulkan backend heap
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        allocation: Mutex<Option<Allocation>>,
        allocator: Arc<Mutex<Allocator>>,
        size: u64,
    },
}

impl GpuHeap {
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Dummy { size, .. } => *size,
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => *size,
        }
    }
}

impl std::fmt::Debug for GpuHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy { id, size } => f
                .debug_struct("GpuHeap::Dummy")
                .field("id", id)
                .field("size", size)
                .finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { size, .. } => f
                .debug_struct("GpuHeap::Vulkan")
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// Vulkan Resource Cleanup (Drop implementations)
// ============================================================================

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuSemaphore {
    fn drop(&mut self) {
        if let GpuSemaphore::Vulkan {
            device, semaphore, ..
        } = self
        {
            unsafe {
                device.destroy_semaphore(*semaphore, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuCommandPool {
    fn drop(&mut self) {
        if let GpuCommandPool::Vulkan { device, pool, .. } = self {
            // Destroying the pool frees every command buffer allocated from it
            unsafe {
                device.destroy_command_pool(*pool, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let GpuBuffer::Vulkan {
            device,
            buffer,
            allocation,
            allocator,
            ..
        } = self
        {
            unsafe {
                device.destroy_buffer(*buffer, None);
            }
            if let Some(allocation) = allocation.lock().take()
                && let Err(e) = allocator.lock().free(allocation)
            {
                log::error!("Failed to free buffer allocation: {}", e);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let GpuTexture::Vulkan { device, image, .. } = self {
            // Memory belongs to the heap; only the image object is destroyed
            unsafe {
                device.destroy_image(*image, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuHeap {
    fn drop(&mut self) {
        if let GpuHeap::Vulkan {
            allocation,
            allocator,
            ..
        } = self
            && let Some(allocation) = allocation.lock().take()
            && let Err(e) = allocator.lock().free(allocation)
        {
            log::error!("Failed to free heap allocation: {}", e);
        }
    }
}

/// Region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    /// Offset into the source buffer.
    pub src_offset: u64,
    /// Offset into the destination buffer.
    pub dst_offset: u64,
    /// Bytes to copy.
    pub size: u64,
}

/// Global memory barriers recorded into a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBarrier {
    /// Make host writes to mapped memory visible to transfer reads.
    HostWriteToTransferRead,
}

/// One half of a buffer handoff between queues.
///
/// When both queue kinds live in the same queue family the release half is a
/// no-op and the acquire half degrades to a plain transfer-write to
/// shader-read barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTransition {
    /// Recorded on the producing queue after the transfer write.
    Release { from: QueueKind, to: QueueKind },
    /// Recorded on the consuming queue before the first read.
    Acquire { from: QueueKind, to: QueueKind },
}

/// A buffer range barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    /// Which half of the handoff this is.
    pub transition: BufferTransition,
    /// Start of the range.
    pub offset: u64,
    /// Length of the range.
    pub size: u64,
}

/// One queue submission: command buffers plus the semaphore operations that
/// gate and follow them.
///
/// A batch with no command buffers is valid and only forwards semaphores.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    /// Command buffers, executed in order.
    pub command_buffers: Vec<GpuCommandBuffer>,
    /// Semaphore values to wait for before execution.
    pub waits: Vec<SemaphoreOp>,
    /// Semaphore values to signal after execution.
    pub signals: Vec<SemaphoreOp>,
}

impl SubmitBatch {
    /// Whether the batch would do nothing at all.
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty() && self.waits.is_empty() && self.signals.is_empty()
    }

    /// Add a wait, keeping only the highest value per semaphore.
    pub fn add_wait(&mut self, op: SemaphoreOp) {
        merge_op(&mut self.waits, op);
    }

    /// Add a signal, keeping only the highest value per semaphore.
    pub fn add_signal(&mut self, op: SemaphoreOp) {
        merge_op(&mut self.signals, op);
    }
}

fn merge_op(ops: &mut Vec<SemaphoreOp>, op: SemaphoreOp) {
    match ops.iter_mut().find(|existing| existing.id() == op.id()) {
        Some(existing) => {
            if op.value() > existing.value() {
                *existing = op;
            }
        }
        None => ops.push(op),
    }
}

/// GPU backend trait for abstracting different GPU APIs.
///
/// Recording calls (`cmd_*`) cannot fail, mirroring the underlying APIs.
/// Handles from another backend are ignored with an error log.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Human-readable name of the selected adapter.
    fn adapter_name(&self) -> String;

    /// Whether the device has memory that is device-local, host-visible and
    /// host-coherent at once.
    fn memory_model(&self) -> MemoryModel;

    /// Index of the hardware queue that serves `kind`.
    ///
    /// Kinds returning the same index alias one hardware queue.
    fn hardware_queue(&self, kind: QueueKind) -> usize;

    /// Queue family of the hardware queue serving `kind`.
    fn queue_family(&self, kind: QueueKind) -> u32;

    /// Create a semaphore.
    fn create_semaphore(
        &self,
        ty: SemaphoreType,
        label: &str,
    ) -> Result<GpuSemaphore, GraphicsError>;

    /// Read a timeline semaphore's counter without blocking.
    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError>;

    /// Block until a timeline semaphore reaches `value` or `timeout` elapses.
    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Duration,
    ) -> Result<WaitStatus, GraphicsError>;

    /// Signal a timeline semaphore from the host.
    fn signal_semaphore(&self, semaphore: &GpuSemaphore, value: u64)
    -> Result<(), GraphicsError>;

    /// Create a command pool for one queue kind.
    fn create_command_pool(
        &self,
        kind: QueueKind,
        label: &str,
    ) -> Result<GpuCommandPool, GraphicsError>;

    /// Allocate a primary command buffer from a pool.
    fn allocate_command_buffer(
        &self,
        pool: &GpuCommandPool,
        label: &str,
    ) -> Result<GpuCommandBuffer, GraphicsError>;

    /// Return every command buffer of a pool to the initial state.
    fn reset_command_pool(&self, pool: &GpuCommandPool) -> Result<(), GraphicsError>;

    /// Start recording a one-time-submit command buffer.
    fn begin_command_buffer(&self, buffer: &GpuCommandBuffer) -> Result<(), GraphicsError>;

    /// Finish recording.
    fn end_command_buffer(&self, buffer: &GpuCommandBuffer) -> Result<(), GraphicsError>;

    /// Record a buffer-to-buffer copy.
    fn cmd_copy_buffer(
        &self,
        buffer: &GpuCommandBuffer,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        regions: &[BufferCopy],
    );

    /// Record a global memory barrier.
    fn cmd_memory_barrier(&self, buffer: &GpuCommandBuffer, barrier: MemoryBarrier);

    /// Record a buffer range barrier.
    fn cmd_buffer_barrier(
        &self,
        buffer: &GpuCommandBuffer,
        target: &GpuBuffer,
        barrier: &BufferBarrier,
    );

    /// Submit batches to the hardware queue serving `kind`, in order.
    ///
    /// Callers serialize submissions per hardware queue.
    fn submit(&self, kind: QueueKind, batches: &[SubmitBatch]) -> Result<(), GraphicsError>;

    /// Create a buffer with its own allocation.
    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
        location: MemoryLocation,
    ) -> Result<GpuBuffer, GraphicsError>;

    /// Persistent host mapping of a [`MemoryLocation::CpuToGpu`] buffer.
    fn map_buffer(&self, buffer: &GpuBuffer) -> Result<NonNull<u8>, GraphicsError>;

    /// Size and alignment a buffer needs when placed in a heap.
    fn buffer_requirements(
        &self,
        descriptor: &BufferDescriptor,
    ) -> Result<MemoryRequirements, GraphicsError>;

    /// Size and alignment a texture needs when placed in a heap.
    fn texture_requirements(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<MemoryRequirements, GraphicsError>;

    /// Allocate a device-local heap for placed resources.
    fn create_heap(&self, size: u64, label: &str) -> Result<GpuHeap, GraphicsError>;

    /// Bind a new buffer at `offset` inside `heap`.
    fn create_placed_buffer(
        &self,
        heap: &GpuHeap,
        offset: u64,
        descriptor: &BufferDescriptor,
    ) -> Result<GpuBuffer, GraphicsError>;

    /// Bind a new texture at `offset` inside `heap`.
    fn create_placed_texture(
        &self,
        heap: &GpuHeap,
        offset: u64,
        descriptor: &TextureDescriptor,
    ) -> Result<GpuTexture, GraphicsError>;

    /// Block until every queue is idle.
    fn wait_idle(&self) -> Result<(), GraphicsError>;
}

/// Create the backend selected by `config`.
///
/// [`BackendChoice::Auto`] tries Vulkan first and falls back to the dummy
/// backend.
pub fn create_backend(config: &SubmitConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    match config.backend {
        BackendChoice::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::new()))
        }
        BackendChoice::Vulkan => {
            #[cfg(feature = "vulkan-backend")]
            {
                let backend = vulkan::VulkanBackend::new(config)?;
                log::info!("Using Vulkan backend (ash)");
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "vulkan-backend"))]
            {
                Err(GraphicsError::FeatureNotSupported(
                    "Vulkan backend requested but the vulkan-backend feature is disabled"
                        .to_string(),
                ))
            }
        }
        BackendChoice::Auto => {
            #[cfg(feature = "vulkan-backend")]
            {
                match vulkan::VulkanBackend::new(config) {
                    Ok(backend) => {
                        log::info!("Using Vulkan backend (ash)");
                        return Ok(Arc::new(backend));
                    }
                    Err(e) => {
                        log::warn!("Failed to create Vulkan backend: {}", e);
                    }
                }
            }

            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::TimelineSemaphore;

    #[test]
    fn test_batch_merges_waits_to_highest_value() {
        let backend: Arc<dyn GpuBackend> = Arc::new(dummy::DummyBackend::new());
        let a = TimelineSemaphore::new(&backend, "a").unwrap();
        let b = TimelineSemaphore::new(&backend, "b").unwrap();

        let mut batch = SubmitBatch::default();
        assert!(batch.is_empty());

        batch.add_wait(a.op(3));
        batch.add_wait(b.op(1));
        batch.add_wait(a.op(2));
        batch.add_wait(a.op(5));

        let keys: Vec<_> = batch.waits.iter().map(SemaphoreOp::key).collect();
        assert_eq!(keys, vec![(a.id(), 5), (b.id(), 1)]);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_create_dummy_backend_from_config() {
        let config = SubmitConfig::default().with_backend(BackendChoice::Dummy);
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.name(), "Dummy Backend");
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = next_object_id();
        let b = next_object_id();
        assert_ne!(a, b);
    }
}
