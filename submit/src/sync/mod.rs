//! GPU synchronization primitives.
//!
//! Ordering between GPU work is expressed entirely through timeline
//! semaphores: a submission waits for `(semaphore, value)` pairs and signals
//! others. The CPU only blocks when it explicitly waits on a value, which the
//! core does at frame-resource reuse time and on the synchronous execute path.

mod timeline;

use std::fmt;
use std::sync::Arc;

use crate::backend::GpuSemaphore;

pub use timeline::{TimelineSemaphore, WaitStatus};

use timeline::QueuedSignal;

/// A semaphore paired with the value a submission waits for or signals.
///
/// Binary semaphores (swapchain handoff) carry a value of 0, which backends
/// ignore.
#[derive(Clone)]
pub struct SemaphoreOp {
    semaphore: Arc<GpuSemaphore>,
    value: u64,
    /// Set for signals queued for `end_frame`; shared by every clone.
    queued: Option<Arc<QueuedSignal>>,
}

impl SemaphoreOp {
    /// Pair a semaphore with a value.
    pub fn new(semaphore: Arc<GpuSemaphore>, value: u64) -> Self {
        Self {
            semaphore,
            value,
            queued: None,
        }
    }

    fn queued(semaphore: Arc<GpuSemaphore>, value: u64, queued: QueuedSignal) -> Self {
        Self {
            semaphore,
            value,
            queued: Some(Arc::new(queued)),
        }
    }

    /// Operation on a binary semaphore.
    pub fn binary(semaphore: Arc<GpuSemaphore>) -> Self {
        debug_assert!(!semaphore.is_timeline(), "expected a binary semaphore");
        Self {
            semaphore,
            value: 0,
            queued: None,
        }
    }

    /// The semaphore.
    pub fn semaphore(&self) -> &Arc<GpuSemaphore> {
        &self.semaphore
    }

    /// The value waited for or signaled.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Identity of the underlying semaphore.
    pub fn id(&self) -> u64 {
        self.semaphore.id()
    }

    /// `(semaphore id, value)` pair, convenient for comparisons in tests and logs.
    pub fn key(&self) -> (u64, u64) {
        (self.id(), self.value)
    }
}

impl PartialEq for SemaphoreOp {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SemaphoreOp {}

impl fmt::Debug for SemaphoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreOp")
            .field("semaphore", &self.id())
            .field("value", &self.value)
            .field("queued", &self.queued.is_some())
            .finish()
    }
}
