//! Hardware queue access.
//!
//! [`QueueSet`] owns one submit lock per hardware queue. Queue kinds that the
//! device maps onto the same hardware queue share a lock, so submissions to a
//! queue are serialized no matter which kind they were recorded for. Locks
//! are held only for the duration of the backend submit or present call.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuSemaphore, SubmitBatch};
use crate::error::GraphicsError;
use crate::swapchain::Swapchain;
use crate::sync::{SemaphoreOp, WaitStatus};
use crate::types::QueueKind;

#[derive(Debug, Default)]
struct HardwareQueue {
    /// Batches submitted so far.
    submissions: u64,
    /// Most recent timeline signal submitted to this queue.
    last_signal: Option<SemaphoreOp>,
}

/// The device's hardware queues.
pub struct QueueSet {
    queues: Vec<Mutex<HardwareQueue>>,
    /// Dense hardware queue index for each queue kind.
    mapping: [usize; QueueKind::COUNT],
    backend: Arc<dyn GpuBackend>,
}

impl QueueSet {
    /// Build the queue set from the backend's queue topology.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        let mut distinct: Vec<usize> = Vec::with_capacity(QueueKind::COUNT);
        let mut mapping = [0; QueueKind::COUNT];
        for kind in QueueKind::ALL {
            let hardware = backend.hardware_queue(kind);
            let index = match distinct.iter().position(|&h| h == hardware) {
                Some(index) => index,
                None => {
                    distinct.push(hardware);
                    distinct.len() - 1
                }
            };
            mapping[kind.index()] = index;
        }

        if distinct.len() < QueueKind::COUNT {
            log::info!(
                "{} hardware queue(s) serve {} queue kinds",
                distinct.len(),
                QueueKind::COUNT
            );
        }

        Self {
            backend,
            queues: distinct
                .iter()
                .map(|_| Mutex::new(HardwareQueue::default()))
                .collect(),
            mapping,
        }
    }

    /// Number of distinct hardware queues.
    pub fn hardware_queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Dense index of the hardware queue serving `kind`.
    pub fn hardware_index(&self, kind: QueueKind) -> usize {
        self.mapping[kind.index()]
    }

    /// Whether `kind` shares its hardware queue with another kind.
    pub fn is_aliased(&self, kind: QueueKind) -> bool {
        let index = self.hardware_index(kind);
        QueueKind::ALL
            .iter()
            .any(|&other| other != kind && self.hardware_index(other) == index)
    }

    /// Submit batches to the queue serving `kind`, in order.
    ///
    /// Submitting no batches is a no-op.
    pub fn submit(&self, kind: QueueKind, batches: &[SubmitBatch]) -> Result<(), GraphicsError> {
        if batches.is_empty() {
            return Ok(());
        }

        let mut queue = self.queues[self.hardware_index(kind)].lock();
        self.backend.submit(kind, batches).map_err(|e| {
            log::error!("Submission to {} queue failed: {}", kind, e);
            e
        })?;

        queue.submissions += batches.len() as u64;
        if let Some(signal) = batches
            .iter()
            .rev()
            .flat_map(|batch| batch.signals.iter())
            .find(|op| op.semaphore().is_timeline())
        {
            // Plain copy: a kept queued op would block host signals forever
            queue.last_signal = Some(SemaphoreOp::new(
                Arc::clone(signal.semaphore()),
                signal.value(),
            ));
        }
        Ok(())
    }

    /// Present through `swapchain` under the graphics queue's lock.
    pub fn present(
        &self,
        swapchain: &dyn Swapchain,
        image_index: u32,
        wait: &GpuSemaphore,
    ) -> Result<(), GraphicsError> {
        let _queue = self.queues[self.hardware_index(QueueKind::Graphics)].lock();
        swapchain.present(image_index, wait)
    }

    /// Number of batches submitted to the hardware queue serving `kind`.
    pub fn submission_count(&self, kind: QueueKind) -> u64 {
        self.queues[self.hardware_index(kind)].lock().submissions
    }

    /// Most recent timeline signal submitted to the queue serving `kind`.
    pub fn last_signal(&self, kind: QueueKind) -> Option<SemaphoreOp> {
        self.queues[self.hardware_index(kind)]
            .lock()
            .last_signal
            .clone()
    }

    /// Block until every hardware queue has reached its most recent signal,
    /// then until the device is idle.
    pub fn wait_idle(&self, timeout: Duration) -> Result<(), GraphicsError> {
        for (index, queue) in self.queues.iter().enumerate() {
            let Some(signal) = queue.lock().last_signal.clone() else {
                continue;
            };

            log::trace!(
                "Waiting for hardware queue {} to reach {}",
                index,
                signal.value()
            );
            match self
                .backend
                .wait_semaphore(signal.semaphore(), signal.value(), timeout)?
            {
                WaitStatus::Reached => {}
                WaitStatus::TimedOut => {
                    log::error!(
                        "Hardware queue {} did not reach {} within {:?}",
                        index,
                        signal.value(),
                        timeout
                    );
                    return Err(GraphicsError::WaitTimeout {
                        value: signal.value(),
                        timeout,
                    });
                }
            }
        }

        self.backend.wait_idle()
    }
}

impl std::fmt::Debug for QueueSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSet")
            .field("hardware_queues", &self.queues.len())
            .field("mapping", &self.mapping)
            .finish()
    }
}

static_assertions::assert_impl_all!(QueueSet: Send, Sync);
