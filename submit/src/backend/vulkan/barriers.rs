//! Copy and barrier recording for the submission core.
//!
//! Only the transitions the staging path needs are expressed here: host
//! writes becoming visible to transfer reads, and the release/acquire pair
//! that hands a freshly written buffer from one queue family to another.

use ash::vk;

use crate::backend::{BufferBarrier, BufferCopy, BufferTransition, MemoryBarrier};
use crate::types::QueueKind;

use super::device::QueueTopology;

/// Stage and access masks for one side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierScope {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

/// Fully resolved buffer barrier, or nothing when the transition is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBarrier {
    pub src: BarrierScope,
    pub dst: BarrierScope,
    pub src_family: u32,
    pub dst_family: u32,
}

/// Stages and accesses that read a buffer on `kind`'s queue.
pub fn consumer_scope(kind: QueueKind) -> BarrierScope {
    match kind {
        QueueKind::Graphics => BarrierScope {
            stage: vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags::INDEX_READ
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::SHADER_READ,
        },
        QueueKind::Compute => BarrierScope {
            stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            access: vk::AccessFlags::UNIFORM_READ | vk::AccessFlags::SHADER_READ,
        },
        QueueKind::Transfer => BarrierScope {
            stage: vk::PipelineStageFlags::TRANSFER,
            access: vk::AccessFlags::TRANSFER_READ,
        },
    }
}

const TRANSFER_WRITE: BarrierScope = BarrierScope {
    stage: vk::PipelineStageFlags::TRANSFER,
    access: vk::AccessFlags::TRANSFER_WRITE,
};

/// Resolve a handoff half against the queue topology.
///
/// Returns `None` for a release between kinds sharing a family; ownership
/// does not change, so only the acquire side needs a barrier.
pub fn resolve_transition(
    transition: BufferTransition,
    topology: &QueueTopology,
) -> Option<ResolvedBarrier> {
    let family = |kind: QueueKind| topology.families[kind.index()];

    match transition {
        BufferTransition::Release { from, to } => {
            if family(from) == family(to) {
                return None;
            }
            Some(ResolvedBarrier {
                src: TRANSFER_WRITE,
                dst: BarrierScope {
                    stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    access: vk::AccessFlags::empty(),
                },
                src_family: family(from),
                dst_family: family(to),
            })
        }
        BufferTransition::Acquire { from, to } => {
            if family(from) == family(to) {
                return Some(ResolvedBarrier {
                    src: TRANSFER_WRITE,
                    dst: consumer_scope(to),
                    src_family: vk::QUEUE_FAMILY_IGNORED,
                    dst_family: vk::QUEUE_FAMILY_IGNORED,
                });
            }
            Some(ResolvedBarrier {
                src: BarrierScope {
                    stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                    access: vk::AccessFlags::empty(),
                },
                dst: consumer_scope(to),
                src_family: family(from),
                dst_family: family(to),
            })
        }
    }
}

/// Record a buffer-to-buffer copy.
pub fn record_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    dst: vk::Buffer,
    regions: &[BufferCopy],
) {
    if regions.is_empty() {
        return;
    }

    let vk_regions: Vec<vk::BufferCopy> = regions
        .iter()
        .map(|region| vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        })
        .collect();

    unsafe {
        device.cmd_copy_buffer(cmd, src, dst, &vk_regions);
    }
}

/// Record a global memory barrier.
pub fn record_memory_barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: MemoryBarrier) {
    let (src, dst) = match barrier {
        MemoryBarrier::HostWriteToTransferRead => (
            BarrierScope {
                stage: vk::PipelineStageFlags::HOST,
                access: vk::AccessFlags::HOST_WRITE,
            },
            BarrierScope {
                stage: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_READ,
            },
        ),
    };

    let memory_barrier = vk::MemoryBarrier::default()
        .src_access_mask(src.access)
        .dst_access_mask(dst.access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src.stage,
            dst.stage,
            vk::DependencyFlags::empty(),
            &[memory_barrier],
            &[],
            &[],
        );
    }
}

/// Record a buffer range barrier, skipping no-op releases.
pub fn record_buffer_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    barrier: &BufferBarrier,
    topology: &QueueTopology,
) {
    let Some(resolved) = resolve_transition(barrier.transition, topology) else {
        return;
    };

    let buffer_barrier = vk::BufferMemoryBarrier::default()
        .src_access_mask(resolved.src.access)
        .dst_access_mask(resolved.dst.access)
        .src_queue_family_index(resolved.src_family)
        .dst_queue_family_index(resolved.dst_family)
        .buffer(buffer)
        .offset(barrier.offset)
        .size(barrier.size);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            resolved.src.stage,
            resolved.dst.stage,
            vk::DependencyFlags::empty(),
            &[],
            &[buffer_barrier],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_topology() -> QueueTopology {
        QueueTopology {
            families: [0, 1, 2],
            hardware: [0, 1, 2],
        }
    }

    fn aliased_topology() -> QueueTopology {
        QueueTopology {
            families: [0, 0, 0],
            hardware: [0, 0, 0],
        }
    }

    #[test]
    fn test_release_skipped_on_shared_family() {
        let transition = BufferTransition::Release {
            from: QueueKind::Transfer,
            to: QueueKind::Graphics,
        };
        assert_eq!(resolve_transition(transition, &aliased_topology()), None);
    }

    #[test]
    fn test_release_between_families() {
        let transition = BufferTransition::Release {
            from: QueueKind::Transfer,
            to: QueueKind::Graphics,
        };
        let resolved = resolve_transition(transition, &split_topology()).unwrap();
        assert_eq!(resolved.src_family, 2);
        assert_eq!(resolved.dst_family, 0);
        assert_eq!(resolved.src.access, vk::AccessFlags::TRANSFER_WRITE);
        assert!(resolved.dst.access.is_empty());
    }

    #[test]
    fn test_acquire_on_shared_family_is_plain_barrier() {
        let transition = BufferTransition::Acquire {
            from: QueueKind::Transfer,
            to: QueueKind::Compute,
        };
        let resolved = resolve_transition(transition, &aliased_topology()).unwrap();
        assert_eq!(resolved.src_family, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(resolved.src.stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(resolved.dst.stage, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn test_acquire_between_families() {
        let transition = BufferTransition::Acquire {
            from: QueueKind::Transfer,
            to: QueueKind::Graphics,
        };
        let resolved = resolve_transition(transition, &split_topology()).unwrap();
        assert_eq!(resolved.src.stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(resolved.src_family, 2);
        assert_eq!(resolved.dst_family, 0);
        assert!(resolved.dst.access.contains(vk::AccessFlags::INDEX_READ));
    }
}
