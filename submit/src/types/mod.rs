//! Common types and descriptors for the submission core.
//!
//! This module contains queue kinds, frame slots, usage flags, and the
//! descriptor structs handed to the backend when memory is bound.

mod buffer;
mod memory;
mod queue;
mod texture;

pub use buffer::{BufferDescriptor, BufferUsage};
pub use memory::{
    MemoryLocation, MemoryModel, MemoryRequirements, align_down, align_up, checked_align_up,
};
pub use queue::{FrameSlot, QueueKind};
pub use texture::{Extent3d, TextureDescriptor, TextureFormat, TextureUsage};
