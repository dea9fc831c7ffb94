//! Frame timeline bookkeeping for multiple frames in flight.
//!
//! [`FrameTimeline`] tracks which frame slot is current, the frame-semaphore
//! value each slot last signaled, and the state of the frame being built.
//! It never blocks: the [`RenderDevice`] reads the recorded value for a slot
//! and waits on the frame semaphore before handing the slot out again.
//!
//! # Frame Overlap (Pipelining)
//!
//! With a buffering depth of 2, the CPU records frame N+1 while the GPU
//! executes frame N:
//!
//! ```text
//! Frame 0: [record] [submit] ─────────────────────────────────────────────►
//!                            [GPU execute frame 0, signal v0] ───────────►
//!
//! Frame 1:          [record] [submit] ───────────────────────────────────►
//!                                     [GPU execute frame 1, signal v1] ──►
//!
//! Frame 2:                   [wait v0] [record] [submit] ────────────────►
//!                                               [GPU execute F2] ────────►
//!
//! Time ──────────────────────────────────────────────────────────────────►
//! ```
//!
//! # State Machine
//!
//! ```text
//! Idle ──► Recording ──► Queued ──► Submitted ──► Presented ──► Idle
//!              │                        ▲
//!              └────────────────────────┘   (frame with nothing queued)
//! ```
//!
//! [`RenderDevice`]: crate::device::RenderDevice

use crate::types::FrameSlot;

/// State of the frame currently being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Between frames.
    Idle,
    /// Slot handed out, commands are being recorded.
    Recording,
    /// At least one command buffer was handed to the device for this frame.
    Queued,
    /// End-of-frame submission happened.
    Submitted,
    /// The swapchain image was presented (or there was none).
    Presented,
}

impl FrameState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: FrameState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Recording)
                | (Self::Recording, Self::Queued)
                | (Self::Recording, Self::Submitted)
                | (Self::Queued, Self::Queued)
                | (Self::Queued, Self::Submitted)
                | (Self::Submitted, Self::Presented)
                | (Self::Presented, Self::Idle)
        )
    }
}

/// Per-slot frame-semaphore values and the current frame's state.
///
/// # Frame Slots
///
/// ```text
/// buffering_depth = 2
///
/// Slot 0: [Frame 0] ──► [Frame 2] ──► [Frame 4] ──►
/// Slot 1: [Frame 1] ──► [Frame 3] ──► [Frame 5] ──►
/// ```
///
/// # Thread Safety
///
/// `FrameTimeline` is not synchronized; the device keeps it behind a lock.
#[derive(Debug)]
pub struct FrameTimeline {
    /// Frame-semaphore value that marks each slot's last frame complete.
    /// Zero for slots that were never used.
    slot_values: Vec<u64>,

    /// Current frame slot.
    current_slot: FrameSlot,

    /// Number of frame slots.
    buffering_depth: u32,

    /// Total frames started.
    frame_count: u64,

    /// Value recorded by the most recently ended frame.
    last_frame_value: u64,

    state: FrameState,
}

impl FrameTimeline {
    /// Create a timeline with `buffering_depth` slots.
    ///
    /// # Panics
    ///
    /// Panics if `buffering_depth` is 0.
    pub fn new(buffering_depth: u32) -> Self {
        assert!(buffering_depth > 0, "buffering_depth must be at least 1");

        Self {
            slot_values: vec![0; buffering_depth as usize],
            current_slot: FrameSlot::new(0),
            buffering_depth,
            frame_count: 0,
            last_frame_value: 0,
            state: FrameState::Idle,
        }
    }

    /// Start a frame in the current slot.
    ///
    /// Returns the slot and the frame-semaphore value that must be reached
    /// before the slot's resources can be reused.
    pub fn begin(&mut self) -> (FrameSlot, u64) {
        self.transition(FrameState::Recording);
        self.frame_count += 1;

        log::trace!(
            "Begin frame {} (slot {})",
            self.frame_count,
            self.current_slot
        );

        (self.current_slot, self.slot_values[self.current_slot.index()])
    }

    /// Note that work was queued for this frame.
    pub fn mark_queued(&mut self) {
        if self.state == FrameState::Recording {
            self.transition(FrameState::Queued);
        }
    }

    /// Record the value that marks the current frame complete.
    pub fn mark_submitted(&mut self, value: u64) {
        self.transition(FrameState::Submitted);
        debug_assert!(
            value >= self.last_frame_value,
            "frame value went backwards: {} < {}",
            value,
            self.last_frame_value
        );
        self.slot_values[self.current_slot.index()] = value;
        self.last_frame_value = value;
    }

    /// Note that the frame was presented.
    pub fn mark_presented(&mut self) {
        self.transition(FrameState::Presented);
    }

    /// Close the frame and advance to the next slot.
    pub fn finish(&mut self) {
        log::trace!(
            "End frame {} (slot {}, value {})",
            self.frame_count,
            self.current_slot,
            self.last_frame_value
        );

        self.transition(FrameState::Idle);
        self.current_slot = self.current_slot.next(self.buffering_depth);
    }

    fn transition(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid frame transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// State of the current frame.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Current frame slot.
    pub fn current_slot(&self) -> FrameSlot {
        self.current_slot
    }

    /// Number of frame slots.
    pub fn buffering_depth(&self) -> u32 {
        self.buffering_depth
    }

    /// Total frames started.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Value recorded by the most recently ended frame.
    pub fn last_frame_value(&self) -> u64 {
        self.last_frame_value
    }

    /// Value that marks `slot`'s last frame complete.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is outside the buffering depth.
    pub fn slot_value(&self, slot: FrameSlot) -> u64 {
        assert!(slot.index() < self.slot_values.len(), "Invalid slot index");
        self.slot_values[slot.index()]
    }

    /// Highest value recorded for any slot.
    pub fn highest_value(&self) -> u64 {
        self.slot_values.iter().copied().max().unwrap_or(0)
    }
}
