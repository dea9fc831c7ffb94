//! Staging arena for devices without coherent device-local memory.
//!
//! The CPU writes into a persistently mapped upload buffer; once per frame
//! [`StagingArena::commit`] copies everything written into a GPU-local buffer
//! on the transfer queue.
//!
//! # Layout
//!
//! The upload buffer is split into one region per frame slot. Allocation
//! offsets are relative to the current slot's region and equal the offset
//! in the GPU-local buffer, which holds a single region:
//!
//! ```text
//! upload (host visible)   [ slot 0 region ][ slot 1 region ][ slot 2 region ]
//!                                             │ [0, cursor)
//!                                             ▼ copy at commit
//! target (device local)   [     region     ]
//! ```
//!
//! Writes for the next frame land in another region, so they never race the
//! copy of a frame that is still in flight. The GPU-local buffer is shared by
//! all frames; each commit waits on the previous frame's completion value
//! before overwriting it.
//!
//! # Frame Protocol
//!
//! 1. [`begin_frame`](StagingArena::begin_frame) selects the slot region and
//!    rewinds the cursor.
//! 2. Any thread calls [`allocate`](StagingArena::allocate) and writes through
//!    the returned pointer.
//! 3. [`commit`](StagingArena::commit) records a host-write barrier, one copy
//!    of `[0, cursor)` and a release barrier, submits it on the transfer queue
//!    and signals the staging semaphore. A second commit in the same frame is
//!    a no-op, and allocating after commit is rejected.
//! 4. Consumers record the acquire half of the handoff with
//!    [`record_acquire`](StagingArena::record_acquire) before first use.
//!
//! The release in step 3 targets the queue family of the first consumer that
//! recorded an acquire in the frame, or the default consumer when none did.
//! A buffer has one owning family at a time, so every consumer of a frame
//! must share that family.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    BufferBarrier, BufferCopy, BufferTransition, GpuBackend, GpuBuffer, GpuCommandBuffer,
    GpuCommandPool, MemoryBarrier, SubmitBatch,
};
use crate::error::GraphicsError;
use crate::queue::QueueSet;
use crate::sync::{SemaphoreOp, TimelineSemaphore};
use crate::types::{
    BufferDescriptor, BufferUsage, FrameSlot, MemoryLocation, QueueKind, align_down,
    checked_align_up,
};

/// Granularity of per-slot staging regions.
pub const STAGING_REGION_ALIGNMENT: u64 = 256;

#[derive(Debug)]
struct StagingState {
    slot: FrameSlot,
    cursor: u64,
    committed: bool,
    /// Queue kind whose family receives this frame's data.
    consumer: Option<QueueKind>,
    last_committed: u64,
    peak: u64,
    commits: u64,
}

/// Usage statistics of the staging arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StagingStats {
    /// Bytes copied by the most recent non-empty commit.
    pub last_committed: u64,
    /// Largest number of bytes a single frame committed.
    pub peak: u64,
    /// Number of commits that submitted a copy.
    pub commits: u64,
}

/// Host-visible bump allocator drained once per frame by a GPU copy.
pub struct StagingArena {
    upload: GpuBuffer,
    target: GpuBuffer,
    mapped: NonNull<u8>,
    region_size: u64,
    buffering_depth: u32,
    default_consumer: QueueKind,
    /// Owns the per-slot transfer command buffers.
    _pool: GpuCommandPool,
    command_buffers: Vec<GpuCommandBuffer>,
    semaphore: TimelineSemaphore,
    state: Mutex<StagingState>,
    /// Declared last: the GPU objects above are destroyed through it.
    backend: Arc<dyn GpuBackend>,
}

// SAFETY: `mapped` points into the persistently mapped upload buffer owned
// by the arena. Allocation hands out disjoint ranges under the state lock,
// and the arena is the only writer of its bookkeeping.
unsafe impl Send for StagingArena {}
unsafe impl Sync for StagingArena {}

impl StagingArena {
    /// Create an arena of `capacity` total bytes split across
    /// `buffering_depth` frame slots. Staged data is handed to
    /// `default_consumer` in frames where no consumer acquired it before
    /// commit.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        capacity: u64,
        buffering_depth: u32,
        default_consumer: QueueKind,
    ) -> Result<Self, GraphicsError> {
        let region_size = align_down(
            capacity / u64::from(buffering_depth.max(1)),
            STAGING_REGION_ALIGNMENT,
        );
        if region_size == 0 {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "staging_capacity {capacity} leaves no room for {buffering_depth} frame slots"
            )));
        }

        let upload = backend.create_buffer(
            &BufferDescriptor::new(region_size * u64::from(buffering_depth), BufferUsage::COPY_SRC)
                .with_label("staging upload"),
            MemoryLocation::CpuToGpu,
        )?;
        let mapped = backend.map_buffer(&upload)?;
        let target = backend.create_buffer(
            &BufferDescriptor::new(region_size, BufferUsage::STAGING_TARGET)
                .with_label("staging target"),
            MemoryLocation::GpuOnly,
        )?;

        let pool = backend.create_command_pool(QueueKind::Transfer, "staging transfer pool")?;
        let command_buffers = (0..buffering_depth)
            .map(|slot| {
                backend.allocate_command_buffer(&pool, &format!("staging copy slot {slot}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let semaphore = TimelineSemaphore::new(&backend, "staging complete")?;

        log::info!(
            "Staging arena: {} bytes per frame x {} slots",
            region_size,
            buffering_depth
        );

        Ok(Self {
            backend,
            upload,
            target,
            mapped,
            region_size,
            buffering_depth,
            default_consumer,
            _pool: pool,
            command_buffers,
            semaphore,
            state: Mutex::new(StagingState {
                slot: FrameSlot::new(0),
                cursor: 0,
                committed: false,
                consumer: None,
                last_committed: 0,
                peak: 0,
                commits: 0,
            }),
        })
    }

    /// Select `slot`'s region and rewind the cursor.
    ///
    /// The GPU must be done with the copy last committed from this slot.
    pub fn begin_frame(&self, slot: FrameSlot) {
        debug_assert!(slot.index() < self.buffering_depth as usize);
        let mut state = self.state.lock();
        state.slot = slot;
        state.cursor = 0;
        state.committed = false;
        state.consumer = None;
    }

    /// Reserve `size` bytes aligned to `alignment` in the current frame.
    ///
    /// # Errors
    ///
    /// - [`GraphicsError::CapacityExceeded`] if the frame region is full.
    /// - [`GraphicsError::InvalidParameter`] if the frame was already
    ///   committed.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
    ) -> Result<StagingAllocation<'_>, GraphicsError> {
        debug_assert!(
            alignment == 0 || alignment.is_power_of_two(),
            "alignment must be a power of 2, got {alignment}"
        );

        let mut state = self.state.lock();
        if state.committed {
            return Err(GraphicsError::InvalidParameter(
                "staging allocation after the frame was committed".to_string(),
            ));
        }

        let placed = checked_align_up(state.cursor, alignment.max(1))
            .and_then(|offset| Some((offset, offset.checked_add(size)?)));
        let Some((offset, end)) = placed.filter(|&(_, end)| end <= self.region_size) else {
            let requested = placed.map_or(u64::MAX, |(_, end)| end);
            log::error!(
                "Staging region exhausted: {} bytes needed, {} available",
                requested,
                self.region_size
            );
            return Err(GraphicsError::CapacityExceeded {
                resource: "staging_capacity",
                requested,
                available: self.region_size,
            });
        };
        state.cursor = end;

        let base = state.slot.index() as u64 * self.region_size;
        // SAFETY: base + offset + size lies within the upload buffer, which is
        // region_size * buffering_depth bytes long.
        let ptr = unsafe { self.mapped.add((base + offset) as usize) };

        Ok(StagingAllocation {
            offset,
            size,
            ptr,
            _arena: PhantomData,
        })
    }

    /// Copy the current frame's writes to the GPU-local buffer.
    ///
    /// The copy waits on `wait` (typically the previous frame's completion
    /// value) and signals the staging semaphore. Returns the signal to wait
    /// on before reading staged data, or `None` if nothing was copied.
    pub fn commit(
        &self,
        queues: &QueueSet,
        wait: Option<SemaphoreOp>,
    ) -> Result<Option<SemaphoreOp>, GraphicsError> {
        let mut state = self.state.lock();
        if state.committed {
            log::trace!("Staging arena already committed this frame");
            return Ok(None);
        }
        state.committed = true;
        let consumer = *state.consumer.get_or_insert(self.default_consumer);

        let size = state.cursor;
        if size == 0 {
            return Ok(None);
        }

        let base = state.slot.index() as u64 * self.region_size;
        let command_buffer = &self.command_buffers[state.slot.index()];

        self.backend.begin_command_buffer(command_buffer)?;
        self.backend
            .cmd_memory_barrier(command_buffer, MemoryBarrier::HostWriteToTransferRead);
        self.backend.cmd_copy_buffer(
            command_buffer,
            &self.upload,
            &self.target,
            &[BufferCopy {
                src_offset: base,
                dst_offset: 0,
                size,
            }],
        );
        self.backend.cmd_buffer_barrier(
            command_buffer,
            &self.target,
            &self.handoff(BufferTransition::Release {
                from: QueueKind::Transfer,
                to: consumer,
            }),
        );
        self.backend.end_command_buffer(command_buffer)?;

        let signal = self.semaphore.reserve_op();
        let mut batch = SubmitBatch {
            command_buffers: vec![command_buffer.clone()],
            ..Default::default()
        };
        if let Some(wait) = wait {
            batch.add_wait(wait);
        }
        batch.add_signal(signal.clone());
        queues.submit(QueueKind::Transfer, &[batch])?;

        state.cursor = 0;
        state.last_committed = size;
        state.peak = state.peak.max(size);
        state.commits += 1;

        log::trace!(
            "Staging commit: {} bytes from {} to {} (signal {})",
            size,
            state.slot,
            consumer,
            signal.value()
        );
        Ok(Some(signal))
    }

    /// Record the acquire half of the handoff into a consumer command buffer.
    ///
    /// Must precede the first read of staged data in each frame. The first
    /// call of a frame picks the family the commit releases to.
    ///
    /// # Errors
    ///
    /// Returns [`GraphicsError::InvalidParameter`] if the frame's data was
    /// already handed to a different queue family.
    pub fn record_acquire(
        &self,
        command_buffer: &GpuCommandBuffer,
        consumer: QueueKind,
    ) -> Result<(), GraphicsError> {
        {
            let mut state = self.state.lock();
            let owner = *state.consumer.get_or_insert(consumer);
            if self.backend.queue_family(owner) != self.backend.queue_family(consumer) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "staged data of {} is handed to the {} queue family, {} cannot acquire it",
                    state.slot, owner, consumer
                )));
            }
        }

        self.backend.cmd_buffer_barrier(
            command_buffer,
            &self.target,
            &self.handoff(BufferTransition::Acquire {
                from: QueueKind::Transfer,
                to: consumer,
            }),
        );
        Ok(())
    }

    fn handoff(&self, transition: BufferTransition) -> BufferBarrier {
        BufferBarrier {
            transition,
            offset: 0,
            size: self.region_size,
        }
    }

    /// GPU-local buffer holding the staged data after commit.
    pub fn target(&self) -> &GpuBuffer {
        &self.target
    }

    /// Host-visible upload buffer.
    pub fn upload(&self) -> &GpuBuffer {
        &self.upload
    }

    /// Bytes available to one frame.
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Bytes allocated so far in the current frame.
    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    /// Whether the current frame was committed.
    pub fn is_committed(&self) -> bool {
        self.state.lock().committed
    }

    /// Semaphore signaled by each commit.
    pub fn semaphore(&self) -> &TimelineSemaphore {
        &self.semaphore
    }

    /// Usage statistics.
    pub fn stats(&self) -> StagingStats {
        let state = self.state.lock();
        StagingStats {
            last_committed: state.last_committed,
            peak: state.peak,
            commits: state.commits,
        }
    }
}

impl std::fmt::Debug for StagingArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingArena")
            .field("region_size", &self.region_size)
            .field("buffering_depth", &self.buffering_depth)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// A range of the staging arena reserved for the current frame.
///
/// Writes must finish before the frame is committed.
#[derive(Debug)]
pub struct StagingAllocation<'a> {
    offset: u64,
    size: u64,
    ptr: NonNull<u8>,
    _arena: PhantomData<&'a StagingArena>,
}

impl StagingAllocation<'_> {
    /// Offset of the data in the GPU-local buffer after commit.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// CPU pointer to the reserved range.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The reserved range as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the range was reserved exclusively for this allocation and
        // stays mapped for the arena's lifetime.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size as usize) }
    }

    /// Copy `data` to the start of the range.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than the reservation.
    pub fn write(&mut self, data: &[u8]) {
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, DummyConfig};
    use crate::types::MemoryModel;
    use rstest::rstest;

    fn arena(capacity: u64, depth: u32) -> (Arc<DummyBackend>, QueueSet, StagingArena) {
        let backend = Arc::new(DummyBackend::with_config(
            DummyConfig::default().with_memory_model(MemoryModel::NonCoherent),
        ));
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let queues = QueueSet::new(Arc::clone(&dyn_backend));
        let arena = StagingArena::new(dyn_backend, capacity, depth, QueueKind::Graphics).unwrap();
        (backend, queues, arena)
    }

    #[test]
    fn test_regions_split_capacity() {
        let (_, _, arena) = arena(3 * 4096, 3);
        assert_eq!(arena.region_size(), 4096);
        assert_eq!(arena.upload().size(), 3 * 4096);
        assert_eq!(arena.target().size(), 4096);
    }

    #[test]
    fn test_too_small_capacity_rejected() {
        let backend: Arc<dyn GpuBackend> = Arc::new(DummyBackend::new());
        let result = StagingArena::new(backend, 100, 2, QueueKind::Graphics);
        assert!(matches!(
            result,
            Err(GraphicsError::InvalidConfiguration(_))
        ));
    }

    #[rstest]
    #[case(0, 16, 0)]
    #[case(1, 16, 16)]
    #[case(17, 256, 256)]
    #[case(300, 4, 300)]
    fn test_allocation_alignment(#[case] first: u64, #[case] align: u64, #[case] expected: u64) {
        let (_, _, arena) = arena(2 * 4096, 2);
        if first > 0 {
            arena.allocate(first, 1).unwrap();
        }
        assert_eq!(arena.allocate(8, align).unwrap().offset(), expected);
    }

    #[test]
    fn test_oversized_allocation_does_not_wrap() {
        let (_, _, arena) = arena(2 * 4096, 2);
        arena.allocate(16, 1).unwrap();

        let result = arena.allocate(u64::MAX, 1 << 8);
        assert!(matches!(
            result,
            Err(GraphicsError::CapacityExceeded {
                resource: "staging_capacity",
                requested: u64::MAX,
                ..
            })
        ));
        assert_eq!(arena.cursor(), 16);
    }

    #[test]
    fn test_slot_regions_do_not_overlap() {
        let (_, _, arena) = arena(2 * 4096, 2);
        let slot0 = arena.allocate(16, 16).unwrap().as_ptr();
        arena.begin_frame(FrameSlot::new(1));
        let slot1 = arena.allocate(16, 16).unwrap().as_ptr();
        assert_eq!(slot1.as_ptr() as usize - slot0.as_ptr() as usize, 4096);
    }

    #[test]
    fn test_commit_records_barriers_around_copy() {
        let (backend, queues, arena) = arena(2 * 4096, 2);
        arena.allocate(64, 16).unwrap().write(&[7u8; 64]);
        let signal = arena.commit(&queues, None).unwrap().unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].queue, QueueKind::Transfer);
        assert_eq!(submissions[0].signals, vec![signal.key()]);

        let commands = &submissions[0].commands;
        assert_eq!(commands.len(), 3);
        assert!(matches!(
            commands[0],
            crate::backend::dummy::RecordedCommand::MemoryBarrier(
                MemoryBarrier::HostWriteToTransferRead
            )
        ));
        assert!(matches!(
            commands[2],
            crate::backend::dummy::RecordedCommand::BufferBarrier {
                barrier: BufferBarrier {
                    transition: BufferTransition::Release { .. },
                    ..
                },
                ..
            }
        ));

        let GpuBuffer::Dummy(target) = arena.target() else {
            panic!("expected a dummy buffer");
        };
        assert_eq!(target.read(0, 64), vec![7u8; 64]);
    }

    fn release_target(backend: &DummyBackend) -> Option<QueueKind> {
        backend.submissions()[0]
            .commands
            .iter()
            .find_map(|command| match command {
                crate::backend::dummy::RecordedCommand::BufferBarrier {
                    barrier:
                        BufferBarrier {
                            transition: BufferTransition::Release { to, .. },
                            ..
                        },
                    ..
                } => Some(*to),
                _ => None,
            })
    }

    #[test]
    fn test_release_follows_first_acquire() {
        let (backend, queues, arena) = arena(2 * 4096, 2);
        let pool = backend
            .create_command_pool(QueueKind::Compute, "consumer")
            .unwrap();
        let consumer = backend.allocate_command_buffer(&pool, "dispatch").unwrap();
        backend.begin_command_buffer(&consumer).unwrap();

        arena.allocate(64, 16).unwrap().write(&[1u8; 64]);
        arena.record_acquire(&consumer, QueueKind::Compute).unwrap();
        arena.commit(&queues, None).unwrap();
        assert_eq!(release_target(&backend), Some(QueueKind::Compute));

        // Graphics has its own family, so it cannot read compute's data
        assert!(matches!(
            arena.record_acquire(&consumer, QueueKind::Graphics),
            Err(GraphicsError::InvalidParameter(_))
        ));
        assert!(arena.record_acquire(&consumer, QueueKind::Compute).is_ok());
    }

    #[test]
    fn test_release_defaults_to_graphics() {
        let (backend, queues, arena) = arena(2 * 4096, 2);
        arena.allocate(64, 16).unwrap();
        arena.commit(&queues, None).unwrap();
        assert_eq!(release_target(&backend), Some(QueueKind::Graphics));
    }

    #[test]
    fn test_shared_family_consumers_both_acquire() {
        let backend = Arc::new(DummyBackend::with_config(
            DummyConfig::default()
                .with_memory_model(MemoryModel::NonCoherent)
                .with_queue_map([0, 0, 1]),
        ));
        let dyn_backend: Arc<dyn GpuBackend> = backend.clone();
        let arena = StagingArena::new(dyn_backend, 4096, 1, QueueKind::Graphics).unwrap();
        let pool = backend
            .create_command_pool(QueueKind::Graphics, "consumer")
            .unwrap();
        let consumer = backend.allocate_command_buffer(&pool, "draw").unwrap();
        backend.begin_command_buffer(&consumer).unwrap();

        arena.record_acquire(&consumer, QueueKind::Compute).unwrap();
        arena.record_acquire(&consumer, QueueKind::Graphics).unwrap();
    }

    #[test]
    fn test_next_frame_picks_a_new_consumer() {
        let (backend, queues, arena) = arena(2 * 4096, 2);
        let pool = backend
            .create_command_pool(QueueKind::Graphics, "consumer")
            .unwrap();
        let consumer = backend.allocate_command_buffer(&pool, "draw").unwrap();
        backend.begin_command_buffer(&consumer).unwrap();

        arena.record_acquire(&consumer, QueueKind::Graphics).unwrap();
        arena.commit(&queues, None).unwrap();
        arena.begin_frame(FrameSlot::new(1));
        arena.record_acquire(&consumer, QueueKind::Compute).unwrap();
    }

    #[test]
    fn test_empty_commit_submits_nothing() {
        let (backend, queues, arena) = arena(4096, 1);
        assert!(arena.commit(&queues, None).unwrap().is_none());
        assert!(backend.submissions().is_empty());
    }

    #[test]
    fn test_stats_track_peak() {
        let (_, queues, arena) = arena(2 * 4096, 2);
        arena.allocate(1000, 1).unwrap();
        arena.commit(&queues, None).unwrap();
        arena.begin_frame(FrameSlot::new(1));
        arena.allocate(200, 1).unwrap();
        arena.commit(&queues, None).unwrap();

        let stats = arena.stats();
        assert_eq!(stats.last_committed, 200);
        assert_eq!(stats.peak, 1000);
        assert_eq!(stats.commits, 2);
    }
}
