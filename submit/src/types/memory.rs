//! Memory placement helpers.

/// Whether the device has a memory type that is device-local, host-visible
/// and host-coherent at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryModel {
    /// The CPU can write GPU-fast memory directly.
    Coherent,
    /// CPU writes must be staged and copied by the GPU each frame.
    NonCoherent,
}

impl MemoryModel {
    /// Whether the staging arena is needed.
    pub fn needs_staging(self) -> bool {
        self == Self::NonCoherent
    }
}

/// Where a committed buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local memory, not mappable.
    GpuOnly,
    /// Host-visible memory, persistently mapped.
    CpuToGpu,
}

/// Size and alignment a resource needs when placed in a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    /// Bytes the resource occupies.
    pub size: u64,
    /// Required offset alignment (a power of two).
    pub alignment: u64,
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of 2, got {alignment}"
    );
    (value + alignment - 1) & !(alignment - 1)
}

/// Like [`align_up`], but `None` when the result does not fit in a `u64`.
#[inline]
pub fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of 2, got {alignment}"
    );
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Round `value` down to a multiple of `alignment`.
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of 2, got {alignment}"
    );
    value & !(alignment - 1)
}
