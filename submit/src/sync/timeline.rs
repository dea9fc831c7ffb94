//! Timeline semaphores.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuSemaphore, SemaphoreType};
use crate::error::GraphicsError;
use crate::types::QueueKind;

use super::SemaphoreOp;

/// Outcome of a bounded wait on a timeline value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The counter reached the value.
    Reached,
    /// The timeout elapsed first.
    TimedOut,
}

/// A GPU/CPU-visible monotonic counter.
///
/// Values used for queue signals are handed out with [`reserve`](Self::reserve)
/// before the submission exists, so a dependent submission can be built to
/// wait on a value whose signal has not reached the GPU yet. Ordering is
/// enforced by the GPU honoring the wait, not by CPU timing.
///
/// Every value handed out or host-signaled is strictly greater than all
/// previous ones. Values reserved for end-of-frame submission are tracked
/// until their signal reaches a queue, so neither a host signal nor a signal
/// from an earlier-submitted stage can overtake them.
pub struct TimelineSemaphore {
    raw: Arc<GpuSemaphore>,
    backend: Arc<dyn GpuBackend>,
    label: String,
    reservations: Arc<Mutex<Reservations>>,
}

#[derive(Debug, Default)]
struct Reservations {
    /// Highest value reserved for a queue signal or signaled from the host.
    highest: u64,
    /// Queued signals that have not been submitted or dropped yet.
    queued: usize,
    /// Latest end-of-frame stage a queued signal belongs to.
    stage: Option<QueueKind>,
}

/// Keeps a queued signal counted until every copy of its op is gone, which
/// happens once the batch carrying it was submitted or the record dropped.
pub(crate) struct QueuedSignal {
    reservations: Arc<Mutex<Reservations>>,
}

impl Drop for QueuedSignal {
    fn drop(&mut self) {
        let mut reservations = self.reservations.lock();
        reservations.queued = reservations.queued.saturating_sub(1);
        if reservations.queued == 0 {
            reservations.stage = None;
        }
    }
}

impl TimelineSemaphore {
    /// Create a timeline semaphore starting at 0.
    pub fn new(
        backend: &Arc<dyn GpuBackend>,
        label: impl Into<String>,
    ) -> Result<Self, GraphicsError> {
        let label = label.into();
        let raw = backend.create_semaphore(SemaphoreType::Timeline { initial: 0 }, &label)?;

        log::trace!("Created timeline semaphore '{}' (id {})", label, raw.id());

        Ok(Self {
            raw: Arc::new(raw),
            backend: Arc::clone(backend),
            label,
            reservations: Arc::default(),
        })
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Backend handle.
    pub fn raw(&self) -> &Arc<GpuSemaphore> {
        &self.raw
    }

    /// Identity of the backend handle.
    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    /// Pre-increment the counter and return the value a queue submission
    /// should signal.
    pub fn reserve(&self) -> u64 {
        let mut reservations = self.reservations.lock();
        reservations.highest += 1;
        reservations.highest
    }

    /// Reserve a value for a signal that `end_frame` submits in the `kind`
    /// stage.
    ///
    /// # Errors
    ///
    /// Returns [`GraphicsError::InvalidParameter`] if a value reserved
    /// earlier belongs to a stage submitted after `kind`, since the new,
    /// higher value would reach the GPU first.
    pub(crate) fn reserve_queued(&self, kind: QueueKind) -> Result<SemaphoreOp, GraphicsError> {
        let mut reservations = self.reservations.lock();
        if let Some(stage) = reservations
            .stage
            .filter(|stage| kind.submit_rank() < stage.submit_rank())
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "timeline '{}' already has value {} queued on the {} stage, \
                 which is submitted after {}",
                self.label, reservations.highest, stage, kind
            )));
        }

        reservations.highest += 1;
        reservations.queued += 1;
        reservations.stage = Some(kind);
        let value = reservations.highest;
        drop(reservations);

        let queued = QueuedSignal {
            reservations: Arc::clone(&self.reservations),
        };
        Ok(SemaphoreOp::queued(Arc::clone(&self.raw), value, queued))
    }

    /// Reserve a value and wrap it as a signal operation.
    pub fn reserve_op(&self) -> SemaphoreOp {
        let value = self.reserve();
        self.op(value)
    }

    /// Pair this semaphore with `value`.
    pub fn op(&self, value: u64) -> SemaphoreOp {
        SemaphoreOp::new(Arc::clone(&self.raw), value)
    }

    /// Highest value reserved or host-signaled so far.
    pub fn highest_reserved(&self) -> u64 {
        self.reservations.lock().highest
    }

    /// Number of queued signals that have not reached a queue yet.
    pub fn queued_signals(&self) -> usize {
        self.reservations.lock().queued
    }

    /// Signal `value` from the host.
    ///
    /// # Errors
    ///
    /// Returns [`GraphicsError::InvalidParameter`] if `value` is not greater
    /// than every value previously reserved or signaled, or while a queued
    /// signal on this semaphore is still waiting for `end_frame`.
    pub fn signal(&self, value: u64) -> Result<(), GraphicsError> {
        {
            let mut reservations = self.reservations.lock();
            if reservations.queued > 0 {
                return Err(GraphicsError::InvalidParameter(format!(
                    "timeline '{}' has {} queued signals up to {} that are not submitted yet",
                    self.label, reservations.queued, reservations.highest
                )));
            }
            if value <= reservations.highest {
                return Err(GraphicsError::InvalidParameter(format!(
                    "timeline '{}' signal value {value} must exceed {}",
                    self.label, reservations.highest
                )));
            }
            reservations.highest = value;
        }

        self.backend.signal_semaphore(&self.raw, value)
    }

    /// Block until the counter reaches `value` or `timeout` elapses.
    ///
    /// A zero timeout polls without blocking.
    pub fn wait(&self, value: u64, timeout: Duration) -> Result<WaitStatus, GraphicsError> {
        if value == 0 {
            return Ok(WaitStatus::Reached);
        }
        self.backend.wait_semaphore(&self.raw, value, timeout)
    }

    /// Block until the counter reaches `value`, treating a timeout as fatal.
    pub fn wait_or_fail(&self, value: u64, timeout: Duration) -> Result<(), GraphicsError> {
        match self.wait(value, timeout)? {
            WaitStatus::Reached => Ok(()),
            WaitStatus::TimedOut => {
                log::error!(
                    "Timeline '{}' did not reach {} within {:?}",
                    self.label,
                    value,
                    timeout
                );
                Err(GraphicsError::WaitTimeout { value, timeout })
            }
        }
    }

    /// Non-blocking read of the counter.
    ///
    /// Useful for liveness checks only: the value may have advanced by the
    /// time the caller acts on it.
    pub fn current_value(&self) -> Result<u64, GraphicsError> {
        self.backend.semaphore_value(&self.raw)
    }

    /// Whether the counter has reached `value`.
    pub fn is_reached(&self, value: u64) -> Result<bool, GraphicsError> {
        Ok(self.current_value()? >= value)
    }
}

impl fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimelineSemaphore")
            .field("label", &self.label)
            .field("id", &self.raw.id())
            .field("reservations", &*self.reservations.lock())
            .finish()
    }
}

static_assertions::assert_impl_all!(TimelineSemaphore: Send, Sync);
