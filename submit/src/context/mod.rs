//! Render contexts.
//!
//! A [`RenderContext`] is the per-thread recording front end. It owns one
//! command buffer ring per (queue kind, frame slot), records into at most one
//! open command buffer at a time, and collects queued command buffers until
//! they are flushed to the device for end-of-frame submission.
//!
//! # Recording Flow
//!
//! ```text
//! reset(slot) ──► begin_graphics() ──► record ──► end() ──► queue_graphics(handle, wait, signal)
//!                                                      └──► execute_graphics(handle)   (blocking)
//!             ... repeat ...
//! flush() ──► RenderDevice::end_frame()
//! ```
//!
//! Contexts share nothing but the device. Each worker thread should own its
//! own context.

mod pool;
mod record;

pub use record::{SubmitRecord, build_stage};

use std::sync::Arc;

use pool::CommandBufferRing;

use crate::backend::{
    BufferBarrier, BufferCopy, GpuBuffer, GpuCommandBuffer, MemoryBarrier, SubmitBatch,
};
use crate::device::RenderDevice;
use crate::error::GraphicsError;
use crate::sync::{SemaphoreOp, TimelineSemaphore};
use crate::types::{FrameSlot, QueueKind};

/// Outcome of [`RenderContext::try_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStatus {
    /// The slot's resources were recycled.
    Reset,
    /// The GPU is still working on the slot's previous frame.
    WouldBlock,
}

/// A finished command buffer, ready to be queued or executed.
///
/// Consumed by exactly one `queue_*` or `execute_*` call.
#[derive(Debug)]
#[must_use = "a recorded command buffer must be queued or executed"]
pub struct CommandBufferHandle {
    kind: QueueKind,
    slot: FrameSlot,
    index: usize,
    buffer: GpuCommandBuffer,
}

impl CommandBufferHandle {
    /// Queue kind the buffer was recorded for.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Frame slot whose ring owns the buffer.
    pub fn slot(&self) -> FrameSlot {
        self.slot
    }

    /// The backend command buffer.
    pub fn command_buffer(&self) -> &GpuCommandBuffer {
        &self.buffer
    }
}

#[derive(Debug)]
struct OpenBuffer {
    kind: QueueKind,
    slot: FrameSlot,
    index: usize,
    buffer: GpuCommandBuffer,
}

/// Per-thread command recording and queuing.
///
/// # Thread Safety
///
/// `RenderContext` is `Send` but not shared: every method that records takes
/// `&mut self`.
pub struct RenderContext {
    label: String,
    /// Rings indexed by `[slot][kind]`.
    rings: Vec<Vec<CommandBufferRing>>,
    /// Queued records per queue kind, in queue order.
    pending: [Vec<SubmitRecord>; QueueKind::COUNT],
    slot: Option<FrameSlot>,
    open: Option<OpenBuffer>,
    /// Private timeline for the blocking `execute_*` path.
    executed: TimelineSemaphore,
    device: Arc<RenderDevice>,
}

impl RenderContext {
    /// Create a context with its command pools (called by [`RenderDevice`]).
    pub(crate) fn new(device: Arc<RenderDevice>, label: &str) -> Result<Self, GraphicsError> {
        let backend = device.backend();
        let capacity = device.config().command_buffers_per_pool as usize;

        let rings = (0..device.buffering_depth())
            .map(|slot| {
                QueueKind::ALL
                    .iter()
                    .map(|&kind| {
                        CommandBufferRing::new(
                            backend.as_ref(),
                            kind,
                            FrameSlot::new(slot),
                            capacity,
                            label,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let executed = TimelineSemaphore::new(backend, format!("{label} execute"))?;

        log::debug!(
            "Created render context '{}' ({} slots x {} rings)",
            label,
            rings.len(),
            QueueKind::COUNT
        );

        Ok(Self {
            device,
            label: label.to_string(),
            rings,
            pending: Default::default(),
            slot: None,
            open: None,
            executed,
        })
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The owning device.
    pub fn device(&self) -> &Arc<RenderDevice> {
        &self.device
    }

    /// Slot the context was last reset for.
    pub fn current_slot(&self) -> Option<FrameSlot> {
        self.slot
    }

    // ========================================================================
    // Frame Reset
    // ========================================================================

    /// Prepare the context for recording into `slot`.
    ///
    /// Blocks until the frame semaphore reaches the value recorded for the
    /// slot's previous frame, then resets the slot's command pools and drops
    /// any records that were never flushed.
    pub fn reset(&mut self, slot: FrameSlot) -> Result<(), GraphicsError> {
        self.check_slot(slot)?;
        let value = self.device.slot_value(slot);
        self.device
            .frame_semaphore()
            .wait_or_fail(value, self.device.config().wait_timeout())?;
        self.recycle(slot)
    }

    /// Like [`reset`](Self::reset), but returns [`ResetStatus::WouldBlock`]
    /// instead of waiting when the slot is still in flight.
    pub fn try_reset(&mut self, slot: FrameSlot) -> Result<ResetStatus, GraphicsError> {
        self.check_slot(slot)?;
        let value = self.device.slot_value(slot);
        if !self.device.frame_semaphore().is_reached(value)? {
            log::trace!(
                "Context '{}': {} still in flight (waiting for {})",
                self.label,
                slot,
                value
            );
            return Ok(ResetStatus::WouldBlock);
        }
        self.recycle(slot)?;
        Ok(ResetStatus::Reset)
    }

    fn check_slot(&self, slot: FrameSlot) -> Result<(), GraphicsError> {
        if slot.index() < self.rings.len() {
            return Ok(());
        }
        Err(GraphicsError::InvalidParameter(format!(
            "{slot} is outside the buffering depth {}",
            self.rings.len()
        )))
    }

    fn recycle(&mut self, slot: FrameSlot) -> Result<(), GraphicsError> {
        debug_assert!(
            self.open.is_none(),
            "context '{}' reset while a command buffer is open",
            self.label
        );

        let backend = self.device.backend();
        let mut recycled = 0;
        for ring in &mut self.rings[slot.index()] {
            recycled += ring.in_use();
            ring.reset(backend.as_ref())?;
        }
        log::trace!(
            "Context '{}': recycled {} command buffers in {}",
            self.label,
            recycled,
            slot
        );

        for (records, kind) in self.pending.iter_mut().zip(QueueKind::ALL) {
            if !records.is_empty() {
                log::warn!(
                    "Context '{}' dropped {} unflushed {} records",
                    self.label,
                    records.len(),
                    kind
                );
                records.clear();
            }
        }

        self.slot = Some(slot);
        Ok(())
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Open a graphics command buffer.
    pub fn begin_graphics(&mut self) -> Result<GpuCommandBuffer, GraphicsError> {
        self.begin(QueueKind::Graphics)
    }

    /// Open a compute command buffer.
    pub fn begin_compute(&mut self) -> Result<GpuCommandBuffer, GraphicsError> {
        self.begin(QueueKind::Compute)
    }

    /// Open a transfer command buffer.
    pub fn begin_transfer(&mut self) -> Result<GpuCommandBuffer, GraphicsError> {
        self.begin(QueueKind::Transfer)
    }

    fn begin(&mut self, kind: QueueKind) -> Result<GpuCommandBuffer, GraphicsError> {
        debug_assert!(
            self.open.is_none(),
            "context '{}' already has an open command buffer",
            self.label
        );
        let Some(slot) = self.slot else {
            return Err(GraphicsError::InvalidParameter(format!(
                "context '{}' recorded before its first reset",
                self.label
            )));
        };

        let backend = self.device.backend();
        let (index, buffer) = self.rings[slot.index()][kind.index()].acquire(backend.as_ref())?;
        backend.begin_command_buffer(&buffer)?;

        log::trace!(
            "Context '{}': begin {} cb {} ({})",
            self.label,
            kind,
            index,
            slot
        );

        self.open = Some(OpenBuffer {
            kind,
            slot,
            index,
            buffer: buffer.clone(),
        });
        Ok(buffer)
    }

    /// The command buffer being recorded, if any.
    pub fn command_buffer(&self) -> Option<&GpuCommandBuffer> {
        self.open.as_ref().map(|open| &open.buffer)
    }

    /// Close the open command buffer.
    pub fn end(&mut self) -> Result<CommandBufferHandle, GraphicsError> {
        let Some(open) = self.open.take() else {
            return Err(GraphicsError::InvalidParameter(format!(
                "context '{}' has no open command buffer",
                self.label
            )));
        };

        self.device.backend().end_command_buffer(&open.buffer)?;
        log::trace!(
            "Context '{}': end {} cb {}",
            self.label,
            open.kind,
            open.index
        );

        Ok(CommandBufferHandle {
            kind: open.kind,
            slot: open.slot,
            index: open.index,
            buffer: open.buffer,
        })
    }

    /// Record a buffer copy into the open command buffer.
    pub fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, regions: &[BufferCopy]) {
        if let Some(buffer) = self.open_buffer() {
            self.device
                .backend()
                .cmd_copy_buffer(buffer, src, dst, regions);
        }
    }

    /// Record a global memory barrier into the open command buffer.
    pub fn memory_barrier(&self, barrier: MemoryBarrier) {
        if let Some(buffer) = self.open_buffer() {
            self.device.backend().cmd_memory_barrier(buffer, barrier);
        }
    }

    /// Record a buffer barrier into the open command buffer.
    pub fn buffer_barrier(&self, target: &GpuBuffer, barrier: &BufferBarrier) {
        if let Some(buffer) = self.open_buffer() {
            self.device
                .backend()
                .cmd_buffer_barrier(buffer, target, barrier);
        }
    }

    /// Record the acquire barrier for this frame's staged data.
    ///
    /// Does nothing on devices without a staging arena. The first queue kind
    /// to acquire in a frame receives the data; see
    /// [`StagingArena::record_acquire`](crate::staging::StagingArena::record_acquire).
    pub fn acquire_staged(&self) -> Result<(), GraphicsError> {
        let Some(open) = &self.open else {
            return Err(GraphicsError::InvalidParameter(format!(
                "context '{}' has no open command buffer",
                self.label
            )));
        };
        match self.device.staging() {
            Some(staging) => staging.record_acquire(&open.buffer, open.kind),
            None => Ok(()),
        }
    }

    /// The open command buffer. Recording without one is a caller bug that
    /// release builds skip.
    fn open_buffer(&self) -> Option<&GpuCommandBuffer> {
        debug_assert!(
            self.open.is_some(),
            "context '{}' has no open command buffer",
            self.label
        );
        self.open.as_ref().map(|open| &open.buffer)
    }

    // ========================================================================
    // Queuing
    // ========================================================================

    /// Queue a graphics command buffer for end-of-frame submission.
    ///
    /// Returns the value `signal` will reach once the buffer has run. The
    /// value is reserved now, so a dependent record can wait on it before
    /// anything has been submitted.
    ///
    /// # Errors
    ///
    /// Returns [`GraphicsError::InvalidParameter`] if `signal` already has a
    /// value queued on a stage that `end_frame` submits after this one
    /// (graphics after compute after transfer), since the higher value
    /// would be signaled first.
    pub fn queue_graphics(
        &mut self,
        handle: CommandBufferHandle,
        wait: Option<SemaphoreOp>,
        signal: Option<&TimelineSemaphore>,
    ) -> Result<Option<u64>, GraphicsError> {
        self.queue(QueueKind::Graphics, handle, wait, signal)
    }

    /// Queue a compute command buffer. See [`queue_graphics`](Self::queue_graphics).
    pub fn queue_compute(
        &mut self,
        handle: CommandBufferHandle,
        wait: Option<SemaphoreOp>,
        signal: Option<&TimelineSemaphore>,
    ) -> Result<Option<u64>, GraphicsError> {
        self.queue(QueueKind::Compute, handle, wait, signal)
    }

    /// Queue a transfer command buffer. See [`queue_graphics`](Self::queue_graphics).
    pub fn queue_transfer(
        &mut self,
        handle: CommandBufferHandle,
        wait: Option<SemaphoreOp>,
        signal: Option<&TimelineSemaphore>,
    ) -> Result<Option<u64>, GraphicsError> {
        self.queue(QueueKind::Transfer, handle, wait, signal)
    }

    fn queue(
        &mut self,
        kind: QueueKind,
        handle: CommandBufferHandle,
        wait: Option<SemaphoreOp>,
        signal: Option<&TimelineSemaphore>,
    ) -> Result<Option<u64>, GraphicsError> {
        debug_assert_eq!(
            handle.kind, kind,
            "{} command buffer queued as {}",
            handle.kind, kind
        );
        debug_assert_eq!(
            Some(handle.slot),
            self.slot,
            "command buffer queued after its context was reset"
        );

        let signal = signal
            .map(|semaphore| semaphore.reserve_queued(kind))
            .transpose()
            .inspect_err(|e| log::error!("Context '{}': {}", self.label, e))?;
        let value = signal.as_ref().map(SemaphoreOp::value);

        log::trace!(
            "Context '{}': queue {} cb {} (wait {:?}, signal {:?})",
            self.label,
            kind,
            handle.index,
            wait.as_ref().map(SemaphoreOp::key),
            value
        );

        self.pending[kind.index()].push(SubmitRecord {
            command_buffer: handle.buffer,
            kind,
            wait,
            signal,
        });
        Ok(value)
    }

    /// Number of records queued for `kind` and not yet flushed.
    pub fn pending_count(&self, kind: QueueKind) -> usize {
        self.pending[kind.index()].len()
    }

    /// Hand every queued record to the device, preserving queue order.
    pub fn flush(&mut self) {
        for kind in QueueKind::ALL {
            let records = std::mem::take(&mut self.pending[kind.index()]);
            self.device.enqueue(kind, records);
        }
    }

    // ========================================================================
    // Blocking Execution
    // ========================================================================

    /// Submit a graphics command buffer now and block until it has run.
    ///
    /// Stalls the calling thread; meant for startup and one-shot work.
    pub fn execute_graphics(&mut self, handle: CommandBufferHandle) -> Result<(), GraphicsError> {
        self.execute(QueueKind::Graphics, handle)
    }

    /// Submit a compute command buffer now and block until it has run.
    pub fn execute_compute(&mut self, handle: CommandBufferHandle) -> Result<(), GraphicsError> {
        self.execute(QueueKind::Compute, handle)
    }

    /// Submit a transfer command buffer now and block until it has run.
    pub fn execute_transfer(&mut self, handle: CommandBufferHandle) -> Result<(), GraphicsError> {
        self.execute(QueueKind::Transfer, handle)
    }

    fn execute(
        &mut self,
        kind: QueueKind,
        handle: CommandBufferHandle,
    ) -> Result<(), GraphicsError> {
        debug_assert_eq!(
            handle.kind, kind,
            "{} command buffer executed as {}",
            handle.kind, kind
        );

        let signal = self.executed.reserve_op();
        let value = signal.value();
        let batch = SubmitBatch {
            command_buffers: vec![handle.buffer.clone()],
            waits: Vec::new(),
            signals: vec![signal],
        };

        self.device.queues().submit(kind, &[batch])?;
        self.executed
            .wait_or_fail(value, self.device.config().wait_timeout())?;

        let released = self.rings[handle.slot.index()][kind.index()].release(handle.index);
        log::trace!(
            "Context '{}': executed {} cb {} (returned to ring: {})",
            self.label,
            kind,
            handle.index,
            released
        );
        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Some(open) = &self.open {
            log::warn!(
                "Context '{}' dropped with an open {} command buffer",
                self.label,
                open.kind
            );
        }

        // Pools must outlive the GPU work recorded into them.
        let timeout = self.device.config().wait_timeout();
        let frame = self.device.frame_semaphore();
        if let Err(e) = frame.wait_or_fail(frame.highest_reserved(), timeout) {
            log::error!("Context '{}' could not wait for the GPU: {}", self.label, e);
        }
        if let Err(e) = self
            .executed
            .wait_or_fail(self.executed.highest_reserved(), timeout)
        {
            log::error!("Context '{}' could not wait for the GPU: {}", self.label, e);
        }
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("label", &self.label)
            .field("slot", &self.slot)
            .field("open", &self.open.as_ref().map(|open| open.kind))
            .field(
                "pending",
                &self.pending.iter().map(Vec::len).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(RenderContext: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GpuBackend;
    use crate::backend::dummy::{DummyBackend, DummyConfig, ExecutionMode};
    use crate::config::{BackendChoice, SubmitConfig};
    use crate::instance::GraphicsInstance;
    use crate::types::{BufferDescriptor, MemoryLocation};

    fn create_context(mode: ExecutionMode) -> (Arc<DummyBackend>, RenderContext) {
        let backend = Arc::new(DummyBackend::with_config(DummyConfig::default().with_mode(mode)));
        let instance = GraphicsInstance::with_backend(
            backend.clone(),
            SubmitConfig::default()
                .with_backend(BackendChoice::Dummy)
                .with_buffering_depth(2)
                .with_staging_capacity(64 * 1024)
                .with_transient_heap_size(1024 * 1024)
                .with_command_buffers_per_pool(4),
        )
        .unwrap();
        let device = instance.create_device().unwrap();
        let context = device.create_context("test").unwrap();
        (backend, context)
    }

    #[test]
    fn test_queue_returns_reserved_value() {
        let (_backend, mut context) = create_context(ExecutionMode::Immediate);
        let user = TimelineSemaphore::new(context.device().backend(), "user").unwrap();
        context.reset(FrameSlot::new(0)).unwrap();

        context.begin_compute().unwrap();
        let first = context.end().unwrap();
        context.begin_compute().unwrap();
        let second = context.end().unwrap();

        assert_eq!(context.queue_compute(first, None, Some(&user)).unwrap(), Some(1));
        assert_eq!(context.queue_compute(second, None, Some(&user)).unwrap(), Some(2));
        assert_eq!(context.pending_count(QueueKind::Compute), 2);
        assert_eq!(user.current_value().unwrap(), 0);
    }

    #[test]
    fn test_reset_drops_unflushed_records() {
        let (_backend, mut context) = create_context(ExecutionMode::Immediate);
        context.reset(FrameSlot::new(0)).unwrap();

        context.begin_graphics().unwrap();
        let handle = context.end().unwrap();
        context.queue_graphics(handle, None, None).unwrap();
        assert_eq!(context.pending_count(QueueKind::Graphics), 1);

        context.reset(FrameSlot::new(1)).unwrap();
        assert_eq!(context.pending_count(QueueKind::Graphics), 0);
        assert_eq!(context.device().pending_count(QueueKind::Graphics), 0);
    }

    #[test]
    fn test_reset_rejects_slot_beyond_depth() {
        let (_backend, mut context) = create_context(ExecutionMode::Immediate);
        assert!(matches!(
            context.reset(FrameSlot::new(2)),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert_eq!(context.current_slot(), None);
    }

    #[test]
    fn test_acquire_staged_needs_open_buffer() {
        let (_backend, mut context) = create_context(ExecutionMode::Immediate);
        context.reset(FrameSlot::new(0)).unwrap();
        assert!(matches!(
            context.acquire_staged(),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_end_without_begin() {
        let (_backend, mut context) = create_context(ExecutionMode::Immediate);
        context.reset(FrameSlot::new(0)).unwrap();
        assert!(matches!(
            context.end(),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert!(context.command_buffer().is_none());
    }

    #[test]
    fn test_execute_returns_buffer_to_ring() {
        let (backend, mut context) = create_context(ExecutionMode::Manual);
        context.reset(FrameSlot::new(0)).unwrap();

        let buffer = context.begin_transfer().unwrap();
        let handle = context.end().unwrap();
        context.execute_transfer(handle).unwrap();
        assert_eq!(backend.host_wait_count(), 1);
        assert_eq!(backend.pending_batches(), 0);

        // The same ring entry is handed out again
        let again = context.begin_transfer().unwrap();
        assert_eq!(again.id(), buffer.id());
        let handle = context.end().unwrap();
        context.execute_transfer(handle).unwrap();
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn test_execute_compute_runs_recorded_copy() {
        let (backend, mut context) = create_context(ExecutionMode::Manual);
        context.reset(FrameSlot::new(0)).unwrap();

        let src = backend
            .create_buffer(&BufferDescriptor::new(64, Default::default()), MemoryLocation::CpuToGpu)
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDescriptor::new(64, Default::default()), MemoryLocation::GpuOnly)
            .unwrap();

        context.begin_compute().unwrap();
        context.copy_buffer(
            &src,
            &dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 32,
                size: 16,
            }],
        );
        let handle = context.end().unwrap();
        context.execute_compute(handle).unwrap();

        let copies = backend.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].dst, dst.id());
        assert_eq!(copies[0].region.dst_offset, 32);
        assert_eq!(backend.host_wait_count(), 1);
    }

    #[test]
    fn test_ring_capacity_exhausted() {
        let (_backend, mut context) = create_context(ExecutionMode::Immediate);
        context.reset(FrameSlot::new(0)).unwrap();

        for _ in 0..4 {
            context.begin_graphics().unwrap();
            let handle = context.end().unwrap();
            context.queue_graphics(handle, None, None).unwrap();
        }
        assert!(matches!(
            context.begin_graphics(),
            Err(GraphicsError::CapacityExceeded {
                resource: "command_buffers_per_pool",
                ..
            })
        ));
    }
}
