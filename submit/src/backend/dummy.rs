//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU but simulates the parts of one the
//! submission core depends on:
//!
//! - Each hardware queue is a FIFO. A batch starts only once every timeline
//!   wait it carries is satisfied; binary waits never block.
//! - Copies move real bytes between host allocations.
//! - Signals advance semaphore counters and wake blocked host waits.
//!
//! Every submission, execution and copy is logged, and misuse that a
//! validation layer would report (re-recording an in-flight command buffer,
//! non-monotonic signals, out-of-range copies) is collected as a violation.
//!
//! In [`ExecutionMode::Manual`] queued work only runs when a blocking host
//! wait needs it or when [`DummyBackend::execute_pending`] is called, which
//! lets tests observe work that is still in flight.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::GraphicsError;
use crate::sync::WaitStatus;
use crate::types::{
    BufferDescriptor, MemoryLocation, MemoryModel, MemoryRequirements, QueueKind,
    TextureDescriptor, align_up,
};

use super::{
    BufferBarrier, BufferCopy, GpuBackend, GpuBuffer, GpuCommandBuffer, GpuCommandPool, GpuHeap,
    GpuSemaphore, GpuTexture, MemoryBarrier, SemaphoreType, SubmitBatch, next_object_id,
};

/// Placement alignment of buffers.
pub const BUFFER_ALIGNMENT: u64 = 256;

/// Placement alignment of textures.
pub const TEXTURE_ALIGNMENT: u64 = 64 * 1024;

/// When queued GPU work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Runnable batches execute as soon as they are submitted or unblocked.
    #[default]
    Immediate,
    /// Batches run only on blocking host waits or explicit pumping.
    Manual,
}

/// Shape of the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DummyConfig {
    /// Whether coherent device-local memory exists.
    pub memory_model: MemoryModel,
    /// Hardware queue index for graphics, compute and transfer.
    pub queue_map: [usize; QueueKind::COUNT],
    /// Execution mode at creation.
    pub mode: ExecutionMode,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            memory_model: MemoryModel::Coherent,
            queue_map: [0, 1, 2],
            mode: ExecutionMode::Immediate,
        }
    }
}

impl DummyConfig {
    /// Set the memory model.
    pub fn with_memory_model(mut self, memory_model: MemoryModel) -> Self {
        self.memory_model = memory_model;
        self
    }

    /// Set the queue mapping.
    pub fn with_queue_map(mut self, queue_map: [usize; QueueKind::COUNT]) -> Self {
        self.queue_map = queue_map;
        self
    }

    /// Route every queue kind to one hardware queue.
    pub fn with_single_queue(self) -> Self {
        self.with_queue_map([0, 0, 0])
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Simulated semaphore.
pub struct DummySemaphore {
    id: u64,
    label: String,
    timeline: bool,
    value: AtomicU64,
    /// Highest value any submitted batch or host call will signal.
    highest_signal: AtomicU64,
}

impl DummySemaphore {
    /// Identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether this is a timeline semaphore.
    pub fn is_timeline(&self) -> bool {
        self.timeline
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Executable,
}

/// Simulated command pool.
pub struct DummyCommandPool {
    id: u64,
    kind: QueueKind,
    label: String,
    buffers: Mutex<Vec<Arc<DummyCommandBuffer>>>,
    resets: AtomicU64,
}

impl DummyCommandPool {
    /// Identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue kind.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of command buffers allocated from the pool.
    pub fn allocated(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Number of times the pool was reset.
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

/// Simulated command buffer.
pub struct DummyCommandBuffer {
    id: u64,
    kind: QueueKind,
    label: String,
    state: Mutex<(RecordState, Vec<Command>)>,
    in_flight: AtomicU32,
}

impl DummyCommandBuffer {
    /// Identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of submitted batches containing this buffer that have not run.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Commands recorded since the last begin.
    pub fn recorded(&self) -> Vec<RecordedCommand> {
        self.state.lock().1.iter().map(Command::summary).collect()
    }
}

/// Simulated buffer backed by a host allocation.
pub struct DummyBuffer {
    id: u64,
    label: String,
    location: MemoryLocation,
    storage: NonNull<[u8]>,
}

// SAFETY: `storage` is an owned heap allocation freed only in `Drop`. Host
// writes go through the mapped pointer handed out by `map_buffer`; the core
// never writes a region a pending simulated copy reads, which is the same
// contract a real mapped allocation has.
unsafe impl Send for DummyBuffer {}
unsafe impl Sync for DummyBuffer {}

impl DummyBuffer {
    fn new(label: String, size: u64, location: MemoryLocation) -> Result<Self, GraphicsError> {
        let len = usize::try_from(size).map_err(|_| GraphicsError::OutOfMemory)?;
        let storage = NonNull::from(Box::leak(vec![0u8; len].into_boxed_slice()));
        Ok(Self {
            id: next_object_id(),
            label,
            location,
            storage,
        })
    }

    /// Identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.storage.len() as u64
    }

    /// Copy bytes out of the buffer.
    ///
    /// Only meaningful once the work writing the range has executed.
    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        let end = start.saturating_add(len).min(self.storage.len());
        let start = start.min(end);
        // SAFETY: the range was clamped to the allocation.
        let bytes = unsafe { &self.storage.as_ref()[start..end] };
        bytes.to_vec()
    }

    fn base(&self) -> NonNull<u8> {
        self.storage.cast::<u8>()
    }
}

impl Drop for DummyBuffer {
    fn drop(&mut self) {
        // SAFETY: `storage` came from `Box::leak` in `new` and is freed once.
        unsafe {
            drop(Box::from_raw(self.storage.as_ptr()));
        }
    }
}

impl std::fmt::Debug for DummyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("size", &self.size())
            .finish()
    }
}

#[derive(Clone)]
enum Command {
    Copy {
        src: Arc<DummyBuffer>,
        dst: Arc<DummyBuffer>,
        regions: Vec<BufferCopy>,
    },
    MemoryBarrier(MemoryBarrier),
    BufferBarrier {
        buffer: u64,
        barrier: BufferBarrier,
    },
}

impl Command {
    fn summary(&self) -> RecordedCommand {
        match self {
            Self::Copy { src, dst, regions } => RecordedCommand::Copy {
                src: src.id(),
                dst: dst.id(),
                regions: regions.clone(),
            },
            Self::MemoryBarrier(barrier) => RecordedCommand::MemoryBarrier(*barrier),
            Self::BufferBarrier { buffer, barrier } => RecordedCommand::BufferBarrier {
                buffer: *buffer,
                barrier: *barrier,
            },
        }
    }
}

/// A command as it was recorded, with resources reduced to their ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    /// Buffer copy.
    Copy {
        src: u64,
        dst: u64,
        regions: Vec<BufferCopy>,
    },
    /// Global memory barrier.
    MemoryBarrier(MemoryBarrier),
    /// Buffer range barrier.
    BufferBarrier { buffer: u64, barrier: BufferBarrier },
}

/// One submitted batch as the queue received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionLog {
    /// Global submission order.
    pub index: usize,
    /// Queue kind the batch was submitted for.
    pub queue: QueueKind,
    /// Hardware queue that received it.
    pub hardware_queue: usize,
    /// Command buffer ids in execution order.
    pub command_buffers: Vec<u64>,
    /// Commands of all command buffers, flattened.
    pub commands: Vec<RecordedCommand>,
    /// `(semaphore id, value)` waits.
    pub waits: Vec<(u64, u64)>,
    /// `(semaphore id, value)` signals.
    pub signals: Vec<(u64, u64)>,
}

/// A batch that started executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    /// Index of the submission.
    pub submission: usize,
    /// Hardware queue it ran on.
    pub hardware_queue: usize,
    /// Command buffer ids in execution order.
    pub command_buffers: Vec<u64>,
}

/// A copy region that was executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyLog {
    /// Index of the submission.
    pub submission: usize,
    /// Source buffer id.
    pub src: u64,
    /// Destination buffer id.
    pub dst: u64,
    /// Region copied.
    pub region: BufferCopy,
}

struct PendingBatch {
    submission: usize,
    hardware_queue: usize,
    command_buffers: Vec<Arc<DummyCommandBuffer>>,
    commands: Vec<Command>,
    waits: Vec<(Arc<DummySemaphore>, u64)>,
    signals: Vec<(Arc<DummySemaphore>, u64)>,
}

impl PendingBatch {
    fn is_ready(&self) -> bool {
        self.waits
            .iter()
            .all(|(semaphore, value)| !semaphore.timeline || semaphore.value() >= *value)
    }
}

struct DummyState {
    mode: ExecutionMode,
    queues: Vec<VecDeque<PendingBatch>>,
    submissions: Vec<SubmissionLog>,
    executions: Vec<ExecutionLog>,
    copies: Vec<CopyLog>,
    violations: Vec<String>,
    host_waits: u64,
}

impl DummyState {
    fn violation(&mut self, message: String) {
        log::error!("DummyBackend: {}", message);
        self.violations.push(message);
    }
}

/// Dummy GPU backend.
pub struct DummyBackend {
    config: DummyConfig,
    state: Mutex<DummyState>,
    progress: Condvar,
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DummyBackend {
    /// Create a new dummy backend with three coherent, distinct queues.
    pub fn new() -> Self {
        Self::with_config(DummyConfig::default())
    }

    /// Create a dummy backend with a custom device shape.
    pub fn with_config(config: DummyConfig) -> Self {
        let queue_count = config.queue_map.iter().copied().max().unwrap_or(0) + 1;
        Self {
            config,
            state: Mutex::new(DummyState {
                mode: config.mode,
                queues: (0..queue_count).map(|_| VecDeque::new()).collect(),
                submissions: Vec::new(),
                executions: Vec::new(),
                copies: Vec::new(),
                violations: Vec::new(),
                host_waits: 0,
            }),
            progress: Condvar::new(),
        }
    }

    /// Device shape.
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Switch the execution mode. Switching to immediate runs ready work.
    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        let mut state = self.state.lock();
        state.mode = mode;
        if mode == ExecutionMode::Immediate {
            self.pump(&mut state);
        }
    }

    /// Run every batch whose waits are satisfied, returning how many ran.
    pub fn execute_pending(&self) -> usize {
        let mut state = self.state.lock();
        self.pump(&mut state)
    }

    /// Number of submitted batches that have not started.
    pub fn pending_batches(&self) -> usize {
        self.state.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Every submission so far.
    pub fn submissions(&self) -> Vec<SubmissionLog> {
        self.state.lock().submissions.clone()
    }

    /// Every executed batch, in start order.
    pub fn executions(&self) -> Vec<ExecutionLog> {
        self.state.lock().executions.clone()
    }

    /// Command buffer ids in the order their batches started.
    pub fn executed_command_buffers(&self) -> Vec<u64> {
        self.state
            .lock()
            .executions
            .iter()
            .flat_map(|execution| execution.command_buffers.iter().copied())
            .collect()
    }

    /// Every executed copy region.
    pub fn copies(&self) -> Vec<CopyLog> {
        self.state.lock().copies.clone()
    }

    /// Misuse the simulated validation layer detected.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Number of host waits that actually had to block.
    pub fn host_wait_count(&self) -> u64 {
        self.state.lock().host_waits
    }

    fn pump(&self, state: &mut DummyState) -> usize {
        let mut executed = 0;
        loop {
            let mut progressed = false;
            for queue in 0..state.queues.len() {
                while state.queues[queue]
                    .front()
                    .is_some_and(PendingBatch::is_ready)
                {
                    let Some(batch) = state.queues[queue].pop_front() else {
                        break;
                    };
                    Self::execute(state, batch);
                    progressed = true;
                    executed += 1;
                }
            }
            if !progressed {
                break;
            }
        }

        if executed > 0 {
            self.progress.notify_all();
        }
        executed
    }

    fn execute(state: &mut DummyState, batch: PendingBatch) {
        log::trace!(
            "DummyBackend: executing submission {} on hardware queue {}",
            batch.submission,
            batch.hardware_queue
        );

        state.executions.push(ExecutionLog {
            submission: batch.submission,
            hardware_queue: batch.hardware_queue,
            command_buffers: batch.command_buffers.iter().map(|cb| cb.id()).collect(),
        });

        for command in &batch.commands {
            if let Command::Copy { src, dst, regions } = command {
                for region in regions {
                    match copy_region(src, dst, region) {
                        Ok(()) => state.copies.push(CopyLog {
                            submission: batch.submission,
                            src: src.id(),
                            dst: dst.id(),
                            region: *region,
                        }),
                        Err(message) => state.violation(message),
                    }
                }
            }
        }

        for command_buffer in &batch.command_buffers {
            command_buffer.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        for (semaphore, value) in &batch.signals {
            if semaphore.timeline {
                semaphore.value.fetch_max(*value, Ordering::AcqRel);
            }
        }
    }

    fn record(&self, buffer: &GpuCommandBuffer, command: Command) {
        let Some(buffer) = dummy_command_buffer(buffer) else {
            log::error!("DummyBackend: recording into a foreign command buffer");
            return;
        };
        let mut inner = buffer.state.lock();
        if inner.0 != RecordState::Recording {
            drop(inner);
            self.state.lock().violation(format!(
                "command recorded into '{}' outside begin/end",
                buffer.label
            ));
            return;
        }
        inner.1.push(command);
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_region(src: &DummyBuffer, dst: &DummyBuffer, region: &BufferCopy) -> Result<(), String> {
    let src_end = region.src_offset.checked_add(region.size);
    let dst_end = region.dst_offset.checked_add(region.size);
    if src_end.is_none_or(|end| end > src.size()) || dst_end.is_none_or(|end| end > dst.size()) {
        return Err(format!(
            "copy {:?} out of range ('{}' is {} bytes, '{}' is {} bytes)",
            region,
            src.label,
            src.size(),
            dst.label,
            dst.size()
        ));
    }

    // SAFETY: both ranges were checked against their allocations. `copy`
    // tolerates overlap when source and destination are the same buffer.
    unsafe {
        std::ptr::copy(
            src.base().as_ptr().add(region.src_offset as usize),
            dst.base().as_ptr().add(region.dst_offset as usize),
            region.size as usize,
        );
    }
    Ok(())
}

fn dummy_semaphore(semaphore: &GpuSemaphore) -> Result<&Arc<DummySemaphore>, GraphicsError> {
    match semaphore {
        GpuSemaphore::Dummy(semaphore) => Ok(semaphore),
        #[cfg(feature = "vulkan-backend")]
        GpuSemaphore::Vulkan { .. } => Err(GraphicsError::InvalidParameter(
            "semaphore belongs to another backend".to_string(),
        )),
    }
}

fn dummy_command_buffer(buffer: &GpuCommandBuffer) -> Option<&Arc<DummyCommandBuffer>> {
    match buffer {
        GpuCommandBuffer::Dummy(buffer) => Some(buffer),
        #[cfg(feature = "vulkan-backend")]
        GpuCommandBuffer::Vulkan { .. } => None,
    }
}

fn dummy_pool(pool: &GpuCommandPool) -> Result<&Arc<DummyCommandPool>, GraphicsError> {
    match pool {
        GpuCommandPool::Dummy(pool) => Ok(pool),
        #[cfg(feature = "vulkan-backend")]
        GpuCommandPool::Vulkan { .. } => Err(GraphicsError::InvalidParameter(
            "command pool belongs to another backend".to_string(),
        )),
    }
}

fn dummy_buffer(buffer: &GpuBuffer) -> Option<&Arc<DummyBuffer>> {
    match buffer {
        GpuBuffer::Dummy(buffer) => Some(buffer),
        #[cfg(feature = "vulkan-backend")]
        GpuBuffer::Vulkan { .. } => None,
    }
}

fn heap_size(heap: &GpuHeap) -> Result<u64, GraphicsError> {
    match heap {
        GpuHeap::Dummy { size, .. } => Ok(*size),
        #[cfg(feature = "vulkan-backend")]
        GpuHeap::Vulkan { .. } => Err(GraphicsError::InvalidParameter(
            "heap belongs to another backend".to_string(),
        )),
    }
}

fn check_placement(
    heap: &GpuHeap,
    offset: u64,
    requirements: MemoryRequirements,
) -> Result<(), GraphicsError> {
    let size = heap_size(heap)?;
    if offset % requirements.alignment != 0 {
        return Err(GraphicsError::InvalidParameter(format!(
            "placement offset {offset} is not aligned to {}",
            requirements.alignment
        )));
    }
    if offset.saturating_add(requirements.size) > size {
        return Err(GraphicsError::InvalidParameter(format!(
            "placement [{offset}, {}) exceeds heap of {size} bytes",
            offset.saturating_add(requirements.size)
        )));
    }
    Ok(())
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn adapter_name(&self) -> String {
        "Simulated GPU".to_string()
    }

    fn memory_model(&self) -> MemoryModel {
        self.config.memory_model
    }

    fn hardware_queue(&self, kind: QueueKind) -> usize {
        self.config.queue_map[kind.index()]
    }

    fn queue_family(&self, kind: QueueKind) -> u32 {
        self.hardware_queue(kind) as u32
    }

    fn create_semaphore(
        &self,
        ty: SemaphoreType,
        label: &str,
    ) -> Result<GpuSemaphore, GraphicsError> {
        let (timeline, initial) = match ty {
            SemaphoreType::Binary => (false, 0),
            SemaphoreType::Timeline { initial } => (true, initial),
        };
        log::trace!(
            "DummyBackend: creating {} semaphore {:?}",
            if timeline { "timeline" } else { "binary" },
            label
        );
        Ok(GpuSemaphore::Dummy(Arc::new(DummySemaphore {
            id: next_object_id(),
            label: label.to_string(),
            timeline,
            value: AtomicU64::new(initial),
            highest_signal: AtomicU64::new(initial),
        })))
    }

    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError> {
        Ok(dummy_semaphore(semaphore)?.value())
    }

    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Duration,
    ) -> Result<WaitStatus, GraphicsError> {
        let semaphore = dummy_semaphore(semaphore)?;
        let mut state = self.state.lock();

        if semaphore.value() >= value {
            return Ok(WaitStatus::Reached);
        }
        if timeout.is_zero() {
            return Ok(WaitStatus::TimedOut);
        }

        state.host_waits += 1;
        self.pump(&mut state);

        let deadline = Instant::now().checked_add(timeout);
        while semaphore.value() < value {
            match deadline {
                Some(deadline) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.progress.wait(&mut state),
            }
        }

        if semaphore.value() >= value {
            Ok(WaitStatus::Reached)
        } else {
            Ok(WaitStatus::TimedOut)
        }
    }

    fn signal_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
    ) -> Result<(), GraphicsError> {
        let semaphore = dummy_semaphore(semaphore)?;
        let mut state = self.state.lock();

        let previous = semaphore.highest_signal.fetch_max(value, Ordering::AcqRel);
        if value <= previous {
            state.violation(format!(
                "host signal {} on '{}' does not exceed {}",
                value, semaphore.label, previous
            ));
        }
        semaphore.value.fetch_max(value, Ordering::AcqRel);

        if state.mode == ExecutionMode::Immediate {
            self.pump(&mut state);
        }
        self.progress.notify_all();
        Ok(())
    }

    fn create_command_pool(
        &self,
        kind: QueueKind,
        label: &str,
    ) -> Result<GpuCommandPool, GraphicsError> {
        log::trace!("DummyBackend: creating {} command pool {:?}", kind, label);
        Ok(GpuCommandPool::Dummy(Arc::new(DummyCommandPool {
            id: next_object_id(),
            kind,
            label: label.to_string(),
            buffers: Mutex::new(Vec::new()),
            resets: AtomicU64::new(0),
        })))
    }

    fn allocate_command_buffer(
        &self,
        pool: &GpuCommandPool,
        label: &str,
    ) -> Result<GpuCommandBuffer, GraphicsError> {
        let pool = dummy_pool(pool)?;
        let buffer = Arc::new(DummyCommandBuffer {
            id: next_object_id(),
            kind: pool.kind,
            label: label.to_string(),
            state: Mutex::new((RecordState::Initial, Vec::new())),
            in_flight: AtomicU32::new(0),
        });
        pool.buffers.lock().push(Arc::clone(&buffer));
        Ok(GpuCommandBuffer::Dummy(buffer))
    }

    fn reset_command_pool(&self, pool: &GpuCommandPool) -> Result<(), GraphicsError> {
        let pool = dummy_pool(pool)?;
        for buffer in pool.buffers.lock().iter() {
            if buffer.in_flight() > 0 {
                self.state.lock().violation(format!(
                    "pool '{}' reset while '{}' is in flight",
                    pool.label, buffer.label
                ));
            }
            let mut inner = buffer.state.lock();
            inner.0 = RecordState::Initial;
            inner.1.clear();
        }
        pool.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn begin_command_buffer(&self, buffer: &GpuCommandBuffer) -> Result<(), GraphicsError> {
        let Some(buffer) = dummy_command_buffer(buffer) else {
            return Err(GraphicsError::InvalidParameter(
                "command buffer belongs to another backend".to_string(),
            ));
        };
        if buffer.in_flight() > 0 {
            self.state.lock().violation(format!(
                "'{}' re-recorded while in flight",
                buffer.label
            ));
        }
        let mut inner = buffer.state.lock();
        if inner.0 == RecordState::Recording {
            drop(inner);
            self.state
                .lock()
                .violation(format!("'{}' begun twice", buffer.label));
            return Ok(());
        }
        inner.0 = RecordState::Recording;
        inner.1.clear();
        Ok(())
    }

    fn end_command_buffer(&self, buffer: &GpuCommandBuffer) -> Result<(), GraphicsError> {
        let Some(buffer) = dummy_command_buffer(buffer) else {
            return Err(GraphicsError::InvalidParameter(
                "command buffer belongs to another backend".to_string(),
            ));
        };
        let mut inner = buffer.state.lock();
        if inner.0 != RecordState::Recording {
            drop(inner);
            self.state
                .lock()
                .violation(format!("'{}' ended without begin", buffer.label));
            return Ok(());
        }
        inner.0 = RecordState::Executable;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        buffer: &GpuCommandBuffer,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        regions: &[BufferCopy],
    ) {
        let (Some(src), Some(dst)) = (dummy_buffer(src), dummy_buffer(dst)) else {
            log::error!("DummyBackend: copy between foreign buffers ignored");
            return;
        };
        self.record(
            buffer,
            Command::Copy {
                src: Arc::clone(src),
                dst: Arc::clone(dst),
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_memory_barrier(&self, buffer: &GpuCommandBuffer, barrier: MemoryBarrier) {
        self.record(buffer, Command::MemoryBarrier(barrier));
    }

    fn cmd_buffer_barrier(
        &self,
        buffer: &GpuCommandBuffer,
        target: &GpuBuffer,
        barrier: &BufferBarrier,
    ) {
        self.record(
            buffer,
            Command::BufferBarrier {
                buffer: target.id(),
                barrier: *barrier,
            },
        );
    }

    fn submit(&self, kind: QueueKind, batches: &[SubmitBatch]) -> Result<(), GraphicsError> {
        let hardware_queue = self.hardware_queue(kind);
        let mut state = self.state.lock();

        for batch in batches {
            let mut command_buffers = Vec::with_capacity(batch.command_buffers.len());
            let mut commands = Vec::new();
            for buffer in &batch.command_buffers {
                let Some(buffer) = dummy_command_buffer(buffer) else {
                    return Err(GraphicsError::SubmitFailed(
                        "command buffer belongs to another backend".to_string(),
                    ));
                };
                let inner = buffer.state.lock();
                if inner.0 != RecordState::Executable {
                    state.violation(format!("'{}' submitted while not executable", buffer.label));
                }
                if self.queue_family(buffer.kind) != self.queue_family(kind) {
                    state.violation(format!(
                        "'{}' recorded for {} submitted to {}",
                        buffer.label, buffer.kind, kind
                    ));
                }
                commands.extend(inner.1.iter().cloned());
                drop(inner);
                buffer.in_flight.fetch_add(1, Ordering::AcqRel);
                command_buffers.push(Arc::clone(buffer));
            }

            let mut waits = Vec::with_capacity(batch.waits.len());
            for op in &batch.waits {
                waits.push((Arc::clone(dummy_semaphore(op.semaphore())?), op.value()));
            }

            let mut signals = Vec::with_capacity(batch.signals.len());
            for op in &batch.signals {
                let semaphore = dummy_semaphore(op.semaphore())?;
                if semaphore.timeline {
                    let previous = semaphore
                        .highest_signal
                        .fetch_max(op.value(), Ordering::AcqRel);
                    if op.value() <= previous {
                        state.violation(format!(
                            "signal {} on '{}' does not exceed {}",
                            op.value(),
                            semaphore.label,
                            previous
                        ));
                    }
                }
                signals.push((Arc::clone(semaphore), op.value()));
            }

            let index = state.submissions.len();
            log::trace!(
                "DummyBackend: submission {} to {} (hardware queue {}), {} command buffers",
                index,
                kind,
                hardware_queue,
                command_buffers.len()
            );

            state.submissions.push(SubmissionLog {
                index,
                queue: kind,
                hardware_queue,
                command_buffers: command_buffers.iter().map(|cb| cb.id()).collect(),
                commands: commands.iter().map(Command::summary).collect(),
                waits: batch.waits.iter().map(|op| op.key()).collect(),
                signals: batch.signals.iter().map(|op| op.key()).collect(),
            });
            state.queues[hardware_queue].push_back(PendingBatch {
                submission: index,
                hardware_queue,
                command_buffers,
                commands,
                waits,
                signals,
            });
        }

        if state.mode == ExecutionMode::Immediate {
            self.pump(&mut state);
        }
        Ok(())
    }

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
        location: MemoryLocation,
    ) -> Result<GpuBuffer, GraphicsError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {}, {:?})",
            descriptor.label,
            descriptor.size,
            location
        );
        Ok(GpuBuffer::Dummy(Arc::new(DummyBuffer::new(
            descriptor.label_or("buffer").to_string(),
            descriptor.size,
            location,
        )?)))
    }

    fn map_buffer(&self, buffer: &GpuBuffer) -> Result<NonNull<u8>, GraphicsError> {
        let Some(buffer) = dummy_buffer(buffer) else {
            return Err(GraphicsError::InvalidParameter(
                "buffer belongs to another backend".to_string(),
            ));
        };
        if buffer.location != MemoryLocation::CpuToGpu {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer '{}' is not host visible",
                buffer.label
            )));
        }
        Ok(buffer.base())
    }

    fn buffer_requirements(
        &self,
        descriptor: &BufferDescriptor,
    ) -> Result<MemoryRequirements, GraphicsError> {
        Ok(MemoryRequirements {
            size: align_up(descriptor.size.max(1), BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
        })
    }

    fn texture_requirements(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<MemoryRequirements, GraphicsError> {
        Ok(MemoryRequirements {
            size: align_up(descriptor.packed_size().max(1), TEXTURE_ALIGNMENT),
            alignment: TEXTURE_ALIGNMENT,
        })
    }

    fn create_heap(&self, size: u64, label: &str) -> Result<GpuHeap, GraphicsError> {
        log::trace!("DummyBackend: creating heap {:?} ({} bytes)", label, size);
        Ok(GpuHeap::Dummy {
            id: next_object_id(),
            size,
        })
    }

    fn create_placed_buffer(
        &self,
        heap: &GpuHeap,
        offset: u64,
        descriptor: &BufferDescriptor,
    ) -> Result<GpuBuffer, GraphicsError> {
        check_placement(heap, offset, self.buffer_requirements(descriptor)?)?;
        Ok(GpuBuffer::Dummy(Arc::new(DummyBuffer::new(
            descriptor.label_or("transient buffer").to_string(),
            descriptor.size,
            MemoryLocation::GpuOnly,
        )?)))
    }

    fn create_placed_texture(
        &self,
        heap: &GpuHeap,
        offset: u64,
        descriptor: &TextureDescriptor,
    ) -> Result<GpuTexture, GraphicsError> {
        let requirements = self.texture_requirements(descriptor)?;
        check_placement(heap, offset, requirements)?;
        Ok(GpuTexture::Dummy {
            id: next_object_id(),
            size: requirements.size,
        })
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        self.pump(&mut state);
        let blocked: usize = state.queues.iter().map(VecDeque::len).sum();
        if blocked > 0 {
            return Err(GraphicsError::Internal(format!(
                "{blocked} batches wait on values that are never signaled"
            )));
        }
        Ok(())
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{SemaphoreOp, TimelineSemaphore};

    fn recorded_buffer(backend: &DummyBackend, pool: &GpuCommandPool) -> GpuCommandBuffer {
        let buffer = backend.allocate_command_buffer(pool, "cb").unwrap();
        backend.begin_command_buffer(&buffer).unwrap();
        backend.end_command_buffer(&buffer).unwrap();
        buffer
    }

    #[test]
    fn test_batch_waits_for_timeline_value() {
        let backend = Arc::new(DummyBackend::new());
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let semaphore = TimelineSemaphore::new(&dyn_backend, "gate").unwrap();
        let pool = backend
            .create_command_pool(QueueKind::Graphics, "pool")
            .unwrap();
        let buffer = recorded_buffer(&backend, &pool);

        let batch = SubmitBatch {
            command_buffers: vec![buffer],
            waits: vec![semaphore.op(1)],
            signals: Vec::new(),
        };
        backend.submit(QueueKind::Graphics, &[batch]).unwrap();
        assert_eq!(backend.pending_batches(), 1);
        assert!(backend.executions().is_empty());

        semaphore.signal(1).unwrap();
        assert_eq!(backend.pending_batches(), 0);
        assert_eq!(backend.executions().len(), 1);
    }

    #[test]
    fn test_manual_mode_runs_on_request() {
        let backend = Arc::new(DummyBackend::with_config(
            DummyConfig::default().with_mode(ExecutionMode::Manual),
        ));
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let semaphore = TimelineSemaphore::new(&dyn_backend, "done").unwrap();
        let pool = backend
            .create_command_pool(QueueKind::Compute, "pool")
            .unwrap();
        let buffer = recorded_buffer(&backend, &pool);

        let signal = semaphore.reserve_op();
        backend
            .submit(
                QueueKind::Compute,
                &[SubmitBatch {
                    command_buffers: vec![buffer],
                    waits: Vec::new(),
                    signals: vec![signal],
                }],
            )
            .unwrap();

        assert_eq!(semaphore.current_value().unwrap(), 0);
        assert_eq!(
            semaphore.wait(1, Duration::ZERO).unwrap(),
            WaitStatus::TimedOut
        );
        assert_eq!(backend.host_wait_count(), 0);

        assert_eq!(backend.execute_pending(), 1);
        assert_eq!(semaphore.current_value().unwrap(), 1);
    }

    #[test]
    fn test_blocking_wait_drives_manual_queue() {
        let backend = Arc::new(DummyBackend::with_config(
            DummyConfig::default().with_mode(ExecutionMode::Manual),
        ));
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let semaphore = TimelineSemaphore::new(&dyn_backend, "done").unwrap();
        backend
            .submit(
                QueueKind::Transfer,
                &[SubmitBatch {
                    command_buffers: Vec::new(),
                    waits: Vec::new(),
                    signals: vec![semaphore.reserve_op()],
                }],
            )
            .unwrap();

        let status = semaphore.wait(1, Duration::from_secs(1)).unwrap();
        assert_eq!(status, WaitStatus::Reached);
        assert_eq!(backend.host_wait_count(), 1);
    }

    #[test]
    fn test_copy_moves_bytes() {
        let backend = DummyBackend::new();
        let src = backend
            .create_buffer(&BufferDescriptor::new(16, Default::default()), MemoryLocation::CpuToGpu)
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDescriptor::new(16, Default::default()), MemoryLocation::GpuOnly)
            .unwrap();

        let mapped = backend.map_buffer(&src).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), mapped.as_ptr().add(4), 4);
        }

        let pool = backend
            .create_command_pool(QueueKind::Transfer, "pool")
            .unwrap();
        let buffer = backend.allocate_command_buffer(&pool, "copy").unwrap();
        backend.begin_command_buffer(&buffer).unwrap();
        backend.cmd_copy_buffer(
            &buffer,
            &src,
            &dst,
            &[BufferCopy {
                src_offset: 4,
                dst_offset: 0,
                size: 4,
            }],
        );
        backend.end_command_buffer(&buffer).unwrap();
        backend
            .submit(
                QueueKind::Transfer,
                &[SubmitBatch {
                    command_buffers: vec![buffer],
                    ..Default::default()
                }],
            )
            .unwrap();

        let GpuBuffer::Dummy(dst) = &dst else {
            panic!("expected a dummy buffer");
        };
        assert_eq!(dst.read(0, 4), vec![1, 2, 3, 4]);
        assert_eq!(backend.copies().len(), 1);
    }

    #[test]
    fn test_reset_while_in_flight_is_reported() {
        let backend = Arc::new(DummyBackend::with_config(
            DummyConfig::default().with_mode(ExecutionMode::Manual),
        ));
        let pool = backend
            .create_command_pool(QueueKind::Graphics, "frame pool")
            .unwrap();
        let buffer = recorded_buffer(&backend, &pool);
        backend
            .submit(
                QueueKind::Graphics,
                &[SubmitBatch {
                    command_buffers: vec![buffer],
                    ..Default::default()
                }],
            )
            .unwrap();

        backend.reset_command_pool(&pool).unwrap();
        assert_eq!(backend.violations().len(), 1);
        assert_eq!(dummy_pool(&pool).unwrap().reset_count(), 1);

        // The reset buffer still runs once the queue is released.
        backend.set_execution_mode(ExecutionMode::Immediate);
        assert_eq!(backend.pending_batches(), 0);
        assert_eq!(backend.executions().len(), 1);
    }

    #[test]
    fn test_gpu_only_buffer_cannot_be_mapped() {
        let backend = DummyBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(64, Default::default()), MemoryLocation::GpuOnly)
            .unwrap();
        assert!(backend.map_buffer(&buffer).is_err());
    }

    #[test]
    fn test_aliased_queues_share_one_fifo() {
        let backend = Arc::new(DummyBackend::with_config(
            DummyConfig::default()
                .with_single_queue()
                .with_mode(ExecutionMode::Manual),
        ));
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let gate = TimelineSemaphore::new(&dyn_backend, "gate").unwrap();

        // The blocked transfer batch holds back the later graphics batch
        backend
            .submit(
                QueueKind::Transfer,
                &[SubmitBatch {
                    waits: vec![gate.op(1)],
                    ..Default::default()
                }],
            )
            .unwrap();
        backend
            .submit(QueueKind::Graphics, &[SubmitBatch::default()])
            .unwrap();

        assert_eq!(backend.execute_pending(), 0);
        gate.signal(1).unwrap();
        assert_eq!(backend.execute_pending(), 2);
        let order: Vec<usize> = backend.executions().iter().map(|e| e.submission).collect();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_non_monotonic_queue_signal_is_reported() {
        let backend = Arc::new(DummyBackend::new());
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let semaphore = TimelineSemaphore::new(&dyn_backend, "t").unwrap();
        let op = SemaphoreOp::new(Arc::clone(semaphore.raw()), 2);

        backend
            .submit(
                QueueKind::Graphics,
                &[SubmitBatch {
                    signals: vec![op.clone()],
                    ..Default::default()
                }],
            )
            .unwrap();
        backend
            .submit(
                QueueKind::Graphics,
                &[SubmitBatch {
                    signals: vec![op],
                    ..Default::default()
                }],
            )
            .unwrap();

        assert_eq!(backend.violations().len(), 1);
    }
}
