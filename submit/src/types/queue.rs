//! Queue kinds and frame slots.

use std::fmt;

/// The three hardware queue kinds work can be recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    /// Draw work. Also the queue that presents.
    Graphics,
    /// Compute dispatches.
    Compute,
    /// Copies and uploads.
    Transfer,
}

impl QueueKind {
    /// Number of queue kinds.
    pub const COUNT: usize = 3;

    /// All queue kinds, in index order.
    pub const ALL: [QueueKind; Self::COUNT] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// Order in which stages are submitted at the end of a frame.
    pub const SUBMIT_ORDER: [QueueKind; Self::COUNT] =
        [Self::Transfer, Self::Compute, Self::Graphics];

    /// Dense index for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
        }
    }

    /// Position of the kind's stage in [`SUBMIT_ORDER`](Self::SUBMIT_ORDER).
    pub fn submit_rank(self) -> usize {
        match self {
            Self::Transfer => 0,
            Self::Compute => 1,
            Self::Graphics => 2,
        }
    }

    /// Lowercase name for logs and debug labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index into the ring of per-frame resources, `frame_number mod buffering_depth`.
///
/// Every per-frame resource (command buffer rings, staging regions, transient
/// heap regions, frame semaphore values) is indexed by slot, never by raw
/// frame number. Frame `K + depth` reuses frame `K`'s resources once the GPU
/// has signaled completion of frame `K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FrameSlot(u32);

impl FrameSlot {
    /// Create a slot from its index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Slot used by the given frame number.
    pub fn from_frame(frame_number: u64, buffering_depth: u32) -> Self {
        debug_assert!(buffering_depth > 0, "buffering depth must be at least 1");
        Self((frame_number % u64::from(buffering_depth)) as u32)
    }

    /// Slot index for per-slot arrays.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Slot used by the following frame.
    pub fn next(self, buffering_depth: u32) -> Self {
        Self((self.0 + 1) % buffering_depth)
    }
}

impl fmt::Display for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}
