//! Render device.
//!
//! The [`RenderDevice`] is the root of the submission core. It owns the
//! hardware queues, the frame timeline semaphore and the per-frame arenas,
//! collects the records that [`RenderContext`]s flush, and drives the
//! end-of-frame submission and present handoff.
//!
//! # Frame Flow
//!
//! ```text
//! begin_frame ─► wait slot value ─► reset heap + staging ─► acquire image
//!
//! end_frame   ─► staging commit ──────────────┐ (waits on previous frame)
//!                 transfer stage ◄────────────┤
//!                 compute stage  ◄── waits ───┤ each stage signals a fresh
//!                 graphics stage ◄────────────┘ frame value; graphics also
//!                      │                        waits image_acquired and
//!                      ▼                        signals render_finished
//!                 present (waits render_finished)
//! ```
//!
//! The last frame value reserved during `end_frame` is recorded against the
//! frame slot. The slot is handed out again only after the frame semaphore
//! reaches that value.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuSemaphore, SemaphoreType, SubmitBatch};
use crate::config::SubmitConfig;
use crate::context::{RenderContext, SubmitRecord, build_stage};
use crate::error::GraphicsError;
use crate::frame::{FrameState, FrameTimeline};
use crate::instance::GraphicsInstance;
use crate::queue::QueueSet;
use crate::staging::StagingArena;
use crate::swapchain::Swapchain;
use crate::sync::{SemaphoreOp, TimelineSemaphore};
use crate::transient::TransientHeap;
use crate::types::{FrameSlot, MemoryModel, QueueKind};

/// Information about the frame started by [`RenderDevice::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Slot whose per-frame resources the frame uses.
    pub slot: FrameSlot,
    /// One-based frame counter.
    pub frame_number: u64,
    /// Swapchain image acquired for the frame, if a swapchain was supplied.
    pub image_index: Option<u32>,
}

/// Orchestrates frame submission across the hardware queues.
///
/// Created by [`GraphicsInstance::create_device`].
///
/// # Thread Safety
///
/// `RenderDevice` is `Send + Sync`. Contexts on any thread may flush into it
/// concurrently. `begin_frame` and `end_frame` must be called from one
/// thread at a time.
pub struct RenderDevice {
    config: SubmitConfig,
    memory_model: MemoryModel,
    queues: QueueSet,
    /// Records flushed by contexts, per queue kind, in flush order.
    pending: [Mutex<Vec<SubmitRecord>>; QueueKind::COUNT],
    frame_semaphore: TimelineSemaphore,
    timeline: Mutex<FrameTimeline>,
    /// Image acquired for the current frame.
    frame_image: Mutex<Option<u32>>,
    image_acquired: Vec<Arc<GpuSemaphore>>,
    render_finished: Vec<Arc<GpuSemaphore>>,
    staging: Option<StagingArena>,
    transient: TransientHeap,
    /// GPU objects above are destroyed before the backend that owns the
    /// device they live on.
    backend: Arc<dyn GpuBackend>,
    instance: Arc<GraphicsInstance>,
}

impl RenderDevice {
    /// Create a device (called by [`GraphicsInstance`]).
    pub(crate) fn new(instance: Arc<GraphicsInstance>) -> Result<Self, GraphicsError> {
        let backend = Arc::clone(instance.backend());
        let config = instance.config().clone();
        let depth = config.buffering_depth;
        let memory_model = backend.memory_model();

        log::info!(
            "Creating RenderDevice on {} ({}, {:?} memory, buffering depth {})",
            backend.adapter_name(),
            backend.name(),
            memory_model,
            depth
        );

        let queues = QueueSet::new(Arc::clone(&backend));
        let frame_semaphore = TimelineSemaphore::new(&backend, "frame timeline")?;
        let image_acquired = binary_semaphores(backend.as_ref(), depth, "image acquired")?;
        let render_finished = binary_semaphores(backend.as_ref(), depth, "render finished")?;

        let staging = if memory_model.needs_staging() || config.force_non_coherent_staging {
            Some(StagingArena::new(
                Arc::clone(&backend),
                config.staging_capacity,
                depth,
                QueueKind::Graphics,
            )?)
        } else {
            log::info!("Coherent device memory: staging arena disabled");
            None
        };

        let transient = TransientHeap::new(Arc::clone(&backend), depth);
        transient.initialize(config.transient_heap_size)?;

        Ok(Self {
            instance,
            backend,
            memory_model,
            queues,
            pending: Default::default(),
            frame_semaphore,
            timeline: Mutex::new(FrameTimeline::new(depth)),
            frame_image: Mutex::new(None),
            image_acquired,
            render_finished,
            staging,
            transient,
            config,
        })
    }

    /// Get the parent instance.
    pub fn instance(&self) -> &Arc<GraphicsInstance> {
        &self.instance
    }

    /// Get the GPU backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Startup configuration.
    pub fn config(&self) -> &SubmitConfig {
        &self.config
    }

    /// Memory model reported by the backend.
    pub fn memory_model(&self) -> MemoryModel {
        self.memory_model
    }

    /// Hardware queues.
    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    /// The frame timeline semaphore.
    pub fn frame_semaphore(&self) -> &TimelineSemaphore {
        &self.frame_semaphore
    }

    /// Staging arena, present on non-coherent devices or when forced.
    pub fn staging(&self) -> Option<&StagingArena> {
        self.staging.as_ref()
    }

    /// Transient resource heap.
    pub fn transient_heap(&self) -> &TransientHeap {
        &self.transient
    }

    /// Number of frame slots.
    pub fn buffering_depth(&self) -> u32 {
        self.config.buffering_depth
    }

    /// Frame-semaphore value that marks `slot`'s last frame complete.
    pub fn slot_value(&self, slot: FrameSlot) -> u64 {
        self.timeline.lock().slot_value(slot)
    }

    /// State of the frame being built.
    pub fn frame_state(&self) -> FrameState {
        self.timeline.lock().state()
    }

    /// Slot of the current (or next) frame.
    pub fn current_slot(&self) -> FrameSlot {
        self.timeline.lock().current_slot()
    }

    /// Frames started so far.
    pub fn frame_count(&self) -> u64 {
        self.timeline.lock().frame_count()
    }

    /// Records flushed for `kind` and waiting for `end_frame`.
    pub fn pending_count(&self, kind: QueueKind) -> usize {
        self.pending[kind.index()].lock().len()
    }

    /// Create a recording context.
    pub fn create_context(self: &Arc<Self>, label: &str) -> Result<RenderContext, GraphicsError> {
        RenderContext::new(Arc::clone(self), label)
    }

    // ========================================================================
    // Frame Orchestration
    // ========================================================================

    /// Start a frame.
    ///
    /// Waits until the GPU has finished the previous frame that used the
    /// incoming slot, moves the transient heap and staging arena to the
    /// slot's region and, when `swapchain` is given, acquires an image.
    pub fn begin_frame(
        &self,
        swapchain: Option<&dyn Swapchain>,
    ) -> Result<FrameInfo, GraphicsError> {
        let (slot, wait_value) = {
            let timeline = self.timeline.lock();
            if timeline.state() != FrameState::Idle {
                return Err(GraphicsError::InvalidParameter(format!(
                    "begin_frame called in state {:?}",
                    timeline.state()
                )));
            }
            let slot = timeline.current_slot();
            (slot, timeline.slot_value(slot))
        };

        self.frame_semaphore
            .wait_or_fail(wait_value, self.config.wait_timeout())?;

        self.transient.reset_to_frame(slot);
        if let Some(staging) = &self.staging {
            staging.begin_frame(slot);
        }

        let image_index = match swapchain {
            Some(swapchain) => Some(swapchain.acquire_next_image(
                &self.image_acquired[slot.index()],
                self.config.wait_timeout(),
            )?),
            None => None,
        };
        *self.frame_image.lock() = image_index;

        let frame_number = {
            let mut timeline = self.timeline.lock();
            timeline.begin();
            timeline.frame_count()
        };

        Ok(FrameInfo {
            slot,
            frame_number,
            image_index,
        })
    }

    /// Add flushed records to the end-of-frame submission for `kind`.
    pub fn enqueue(&self, kind: QueueKind, records: Vec<SubmitRecord>) {
        if records.is_empty() {
            return;
        }

        log::trace!("Enqueued {} {} records", records.len(), kind);
        self.pending[kind.index()].lock().extend(records);
        self.timeline.lock().mark_queued();
    }

    /// Submit the frame and present it.
    ///
    /// Stages are submitted transfer, compute, then graphics. Each stage
    /// waits on everything the stages before it signaled, on the staging
    /// copy, and on `wait` when given. Returns the frame-semaphore value that
    /// marks the frame complete.
    ///
    /// A stage with no records submits nothing. The graphics stage still
    /// submits an empty batch when it must carry the swapchain handoff or
    /// close off a staging copy.
    pub fn end_frame(
        &self,
        wait: Option<SemaphoreOp>,
        swapchain: Option<&dyn Swapchain>,
    ) -> Result<u64, GraphicsError> {
        let (slot, previous_value) = {
            let timeline = self.timeline.lock();
            if !matches!(
                timeline.state(),
                FrameState::Recording | FrameState::Queued
            ) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "end_frame called in state {:?}",
                    timeline.state()
                )));
            }
            (timeline.current_slot(), timeline.last_frame_value())
        };

        let image = {
            let mut frame_image = self.frame_image.lock();
            if frame_image.is_some() && swapchain.is_none() {
                return Err(GraphicsError::InvalidParameter(
                    "end_frame needs the swapchain the frame acquired from".to_string(),
                ));
            }
            frame_image.take()
        };

        let mut stage_waits: Vec<SemaphoreOp> = wait.into_iter().collect();
        let mut staged = false;
        if let Some(staging) = &self.staging {
            let reuse_wait = (previous_value > 0).then(|| self.frame_semaphore.op(previous_value));
            if let Some(signal) = staging.commit(&self.queues, reuse_wait)? {
                stage_waits.push(signal);
                staged = true;
            }
        }

        let mut frame_value = None;
        for kind in [QueueKind::Transfer, QueueKind::Compute] {
            let records = std::mem::take(&mut *self.pending[kind.index()].lock());
            if records.is_empty() {
                continue;
            }

            let signal = self.frame_semaphore.reserve_op();
            let batches = build_stage(&records, &stage_waits, std::slice::from_ref(&signal));
            self.submit_stage(kind, &records, &batches)?;
            frame_value = Some(signal.value());
            stage_waits.push(signal);
        }

        let graphics = std::mem::take(&mut *self.pending[QueueKind::Graphics.index()].lock());
        let handoff = image.is_some() || (staged && frame_value.is_none());
        if !graphics.is_empty() || handoff {
            let signal = self.frame_semaphore.reserve_op();
            let mut waits = stage_waits;
            let mut signals = vec![signal.clone()];
            if image.is_some() {
                waits.push(SemaphoreOp::binary(Arc::clone(
                    &self.image_acquired[slot.index()],
                )));
                signals.push(SemaphoreOp::binary(Arc::clone(
                    &self.render_finished[slot.index()],
                )));
            }

            let batches = if graphics.is_empty() {
                let mut batch = SubmitBatch::default();
                waits.into_iter().for_each(|op| batch.add_wait(op));
                signals.into_iter().for_each(|op| batch.add_signal(op));
                vec![batch]
            } else {
                build_stage(&graphics, &waits, &signals)
            };
            self.submit_stage(QueueKind::Graphics, &graphics, &batches)?;
            frame_value = Some(signal.value());
        }

        let value = frame_value.unwrap_or_else(|| self.frame_semaphore.highest_reserved());
        self.timeline.lock().mark_submitted(value);

        let presented = match (image, swapchain) {
            (Some(index), Some(swapchain)) => {
                self.queues
                    .present(swapchain, index, &self.render_finished[slot.index()])
            }
            _ => Ok(()),
        };

        {
            let mut timeline = self.timeline.lock();
            timeline.mark_presented();
            timeline.finish();
        }
        presented?;

        log::trace!("Frame in {} ends at value {}", slot, value);
        Ok(value)
    }

    fn submit_stage(
        &self,
        kind: QueueKind,
        records: &[SubmitRecord],
        batches: &[SubmitBatch],
    ) -> Result<(), GraphicsError> {
        log::debug!(
            "Submitting {} stage: {} command buffers in {} batches",
            kind,
            records.len(),
            batches.len()
        );
        self.queues.submit(kind, batches)
    }

    /// Block until every queue has finished all submitted work.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.queues.wait_idle(self.config.wait_timeout())
    }
}

fn binary_semaphores(
    backend: &dyn GpuBackend,
    count: u32,
    label: &str,
) -> Result<Vec<Arc<GpuSemaphore>>, GraphicsError> {
    (0..count)
        .map(|slot| {
            backend
                .create_semaphore(SemaphoreType::Binary, &format!("{label} {slot}"))
                .map(Arc::new)
        })
        .collect()
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        log::info!("Destroying RenderDevice");
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {}", e);
        }
    }
}

impl std::fmt::Debug for RenderDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderDevice")
            .field("backend", &self.backend.name())
            .field("memory_model", &self.memory_model)
            .field("buffering_depth", &self.config.buffering_depth)
            .field("staging", &self.staging.is_some())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(RenderDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, DummyConfig};
    use crate::config::BackendChoice;
    use crate::swapchain::DummySwapchain;

    fn create_test_device(
        dummy: DummyConfig,
        config: SubmitConfig,
    ) -> (Arc<DummyBackend>, Arc<RenderDevice>) {
        let backend = Arc::new(DummyBackend::with_config(dummy));
        let instance = GraphicsInstance::with_backend(
            backend.clone(),
            config
                .with_backend(BackendChoice::Dummy)
                .with_staging_capacity(1024 * 1024)
                .with_transient_heap_size(4 * 1024 * 1024),
        )
        .unwrap();
        let device = instance.create_device().unwrap();
        (backend, device)
    }

    #[test]
    fn test_coherent_device_has_no_staging() {
        let (_, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        assert!(device.staging().is_none());
        assert_eq!(device.frame_state(), FrameState::Idle);
    }

    #[test]
    fn test_forced_staging() {
        let (_, device) = create_test_device(
            DummyConfig::default(),
            SubmitConfig::default().with_forced_staging(true),
        );
        assert!(device.staging().is_some());
    }

    #[test]
    fn test_end_frame_without_begin() {
        let (_, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        assert!(matches!(
            device.end_frame(None, None),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_begin_frame_twice() {
        let (_, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        device.begin_frame(None).unwrap();
        assert!(device.begin_frame(None).is_err());
    }

    #[test]
    fn test_empty_frame_submits_nothing() {
        let (backend, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        device.begin_frame(None).unwrap();
        let value = device.end_frame(None, None).unwrap();

        assert_eq!(value, 0);
        assert!(backend.submissions().is_empty());
        assert_eq!(device.frame_state(), FrameState::Idle);
        assert_eq!(device.current_slot(), FrameSlot::new(1));
    }

    #[test]
    fn test_present_only_frame_submits_handoff() {
        let (backend, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        let swapchain = DummySwapchain::new(3);

        let info = device.begin_frame(Some(&swapchain)).unwrap();
        assert_eq!(info.image_index, Some(0));
        let value = device.end_frame(None, Some(&swapchain)).unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].queue, QueueKind::Graphics);
        assert!(submissions[0].command_buffers.is_empty());
        assert!(submissions[0]
            .signals
            .contains(&(device.frame_semaphore().id(), value)));

        let acquire = swapchain.acquires()[0];
        let present = swapchain.presents()[0];
        assert!(submissions[0].waits.iter().any(|&(id, _)| id == acquire.signal_semaphore));
        assert!(submissions[0].signals.iter().any(|&(id, _)| id == present.wait_semaphore));
    }

    #[test]
    fn test_outdated_present_still_closes_frame() {
        let (_, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        let swapchain = DummySwapchain::new(2);
        swapchain.set_outdated(true);
        assert!(matches!(
            device.begin_frame(Some(&swapchain)),
            Err(GraphicsError::SurfaceOutdated)
        ));
        assert_eq!(device.frame_state(), FrameState::Idle);

        swapchain.set_outdated(false);
        device.begin_frame(Some(&swapchain)).unwrap();
        device.end_frame(None, Some(&swapchain)).unwrap();
        assert_eq!(device.frame_count(), 1);
    }

    #[test]
    fn test_missing_swapchain_at_end_frame() {
        let (_, device) = create_test_device(DummyConfig::default(), SubmitConfig::default());
        let swapchain = DummySwapchain::new(2);
        device.begin_frame(Some(&swapchain)).unwrap();
        assert!(device.end_frame(None, None).is_err());
    }
}
