//! Queued command buffers and per-stage batch building.

use crate::backend::{GpuCommandBuffer, SubmitBatch};
use crate::sync::SemaphoreOp;
use crate::types::QueueKind;

/// A recorded command buffer waiting for end-of-frame submission.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    /// The command buffer.
    pub command_buffer: GpuCommandBuffer,
    /// Queue kind it was recorded for.
    pub kind: QueueKind,
    /// Value the GPU must reach before the buffer runs.
    pub wait: Option<SemaphoreOp>,
    /// Value signaled once the buffer has run.
    pub signal: Option<SemaphoreOp>,
}

/// Turn one stage's records into submit batches, preserving queue order.
///
/// Records are merged into as few batches as possible. Waits and signals are
/// deduplicated to the highest value per semaphore. A new batch starts when
/// a record waits on a value signaled by an earlier record of the current
/// batch, since a batch's signals only fire after all of its waits.
///
/// `stage_waits` are attached to the first batch and `stage_signals` to the
/// last. An empty stage yields no batches.
pub fn build_stage(
    records: &[SubmitRecord],
    stage_waits: &[SemaphoreOp],
    stage_signals: &[SemaphoreOp],
) -> Vec<SubmitBatch> {
    let mut batches = Vec::new();
    if records.is_empty() {
        return batches;
    }

    debug_assert!(
        records.windows(2).all(|pair| pair[0].kind == pair[1].kind),
        "records of one stage must target one queue kind"
    );

    let mut current = SubmitBatch::default();
    for op in stage_waits {
        current.add_wait(op.clone());
    }

    for record in records {
        if let Some(wait) = &record.wait {
            let signaled_in_batch = current
                .signals
                .iter()
                .any(|signal| signal.id() == wait.id() && signal.value() >= wait.value());
            if signaled_in_batch {
                batches.push(std::mem::take(&mut current));
            }
            current.add_wait(wait.clone());
        }

        current.command_buffers.push(record.command_buffer.clone());

        if let Some(signal) = &record.signal {
            current.add_signal(signal.clone());
        }
    }

    for op in stage_signals {
        current.add_signal(op.clone());
    }
    batches.push(current);
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::{GpuBackend, GpuCommandPool};
    use crate::sync::TimelineSemaphore;
    use std::sync::Arc;

    struct Fixture {
        backend: Arc<dyn GpuBackend>,
        pool: GpuCommandPool,
    }

    impl Fixture {
        fn new() -> Self {
            let backend: Arc<dyn GpuBackend> = Arc::new(DummyBackend::new());
            let pool = backend
                .create_command_pool(QueueKind::Graphics, "records")
                .unwrap();
            Self { backend, pool }
        }

        fn record(&self, wait: Option<SemaphoreOp>, signal: Option<SemaphoreOp>) -> SubmitRecord {
            SubmitRecord {
                command_buffer: self
                    .backend
                    .allocate_command_buffer(&self.pool, "cb")
                    .unwrap(),
                kind: QueueKind::Graphics,
                wait,
                signal,
            }
        }
    }

    #[test]
    fn test_empty_stage_yields_nothing() {
        let fixture = Fixture::new();
        let frame = TimelineSemaphore::new(&fixture.backend, "frame").unwrap();
        let batches = build_stage(&[], &[frame.op(1)], &[frame.op(2)]);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_records_merge_into_one_batch() {
        let fixture = Fixture::new();
        let frame = TimelineSemaphore::new(&fixture.backend, "frame").unwrap();
        let user = TimelineSemaphore::new(&fixture.backend, "user").unwrap();

        let records = vec![
            fixture.record(None, None),
            fixture.record(Some(user.op(4)), None),
            fixture.record(None, Some(user.op(9))),
        ];
        let batches = build_stage(&records, &[frame.op(1)], &[frame.op(2)]);

        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        let ids: Vec<u64> = batch.command_buffers.iter().map(|cb| cb.id()).collect();
        let expected: Vec<u64> = records.iter().map(|r| r.command_buffer.id()).collect();
        assert_eq!(ids, expected);

        let waits: Vec<_> = batch.waits.iter().map(SemaphoreOp::key).collect();
        assert_eq!(waits, vec![(frame.id(), 1), (user.id(), 4)]);
        let signals: Vec<_> = batch.signals.iter().map(SemaphoreOp::key).collect();
        assert_eq!(signals, vec![(user.id(), 9), (frame.id(), 2)]);
    }

    #[test]
    fn test_same_stage_dependency_splits_batch() {
        let fixture = Fixture::new();
        let frame = TimelineSemaphore::new(&fixture.backend, "frame").unwrap();
        let user = TimelineSemaphore::new(&fixture.backend, "user").unwrap();

        let records = vec![
            fixture.record(None, Some(user.op(1))),
            fixture.record(Some(user.op(1)), None),
        ];
        let batches = build_stage(&records, &[frame.op(3)], &[frame.op(4)]);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].waits, vec![frame.op(3)]);
        assert_eq!(batches[0].signals, vec![user.op(1)]);
        assert_eq!(batches[1].waits, vec![user.op(1)]);
        assert_eq!(batches[1].signals, vec![frame.op(4)]);
    }
}
