//! Per-slot command buffer rings.

use crate::backend::{GpuBackend, GpuCommandBuffer, GpuCommandPool};
use crate::error::GraphicsError;
use crate::types::{FrameSlot, QueueKind};

/// Fixed-capacity ring of command buffers for one (queue kind, frame slot).
///
/// Buffers are addressed by stable index. `in_use` counts the prefix handed
/// out since the last reset; everything past it is free for reuse. Buffers
/// are allocated lazily up to the capacity and never freed individually.
#[derive(Debug)]
pub(crate) struct CommandBufferRing {
    kind: QueueKind,
    slot: FrameSlot,
    pool: GpuCommandPool,
    buffers: Vec<GpuCommandBuffer>,
    capacity: usize,
    in_use: usize,
}

impl CommandBufferRing {
    pub fn new(
        backend: &dyn GpuBackend,
        kind: QueueKind,
        slot: FrameSlot,
        capacity: usize,
        label: &str,
    ) -> Result<Self, GraphicsError> {
        let pool = backend.create_command_pool(kind, &format!("{label} {kind} {slot}"))?;
        Ok(Self {
            kind,
            slot,
            pool,
            buffers: Vec::new(),
            capacity,
            in_use: 0,
        })
    }

    /// Hand out the next free buffer, allocating one if the ring has room.
    pub fn acquire(
        &mut self,
        backend: &dyn GpuBackend,
    ) -> Result<(usize, GpuCommandBuffer), GraphicsError> {
        if self.in_use == self.buffers.len() {
            if self.buffers.len() == self.capacity {
                log::error!(
                    "{} command buffer ring for {} is full ({} buffers)",
                    self.kind,
                    self.slot,
                    self.capacity
                );
                return Err(GraphicsError::CapacityExceeded {
                    resource: "command_buffers_per_pool",
                    requested: self.capacity as u64 + 1,
                    available: self.capacity as u64,
                });
            }

            let label = format!("{} cb {} ({})", self.kind, self.buffers.len(), self.slot);
            let buffer = backend.allocate_command_buffer(&self.pool, &label)?;
            self.buffers.push(buffer);
        }

        let index = self.in_use;
        self.in_use += 1;
        Ok((index, self.buffers[index].clone()))
    }

    /// Return the buffer at `index` to the free region.
    ///
    /// Only the most recently acquired buffer can be returned; anything else
    /// stays in use until the next reset.
    pub fn release(&mut self, index: usize) -> bool {
        if index + 1 == self.in_use {
            self.in_use -= 1;
            true
        } else {
            false
        }
    }

    /// Reset the pool and mark every buffer free.
    ///
    /// The GPU must be done with all work recorded into this ring.
    pub fn reset(&mut self, backend: &dyn GpuBackend) -> Result<(), GraphicsError> {
        if self.in_use > 0 {
            backend.reset_command_pool(&self.pool)?;
        }
        self.in_use = 0;
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    #[cfg(test)]
    pub fn allocated(&self) -> usize {
        self.buffers.len()
    }

    #[cfg(test)]
    pub fn buffer(&self, index: usize) -> Option<&GpuCommandBuffer> {
        self.buffers.get(index)
    }
}
