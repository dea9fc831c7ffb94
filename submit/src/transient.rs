//! Transient resource heap.
//!
//! One device-local allocation split into a region per frame slot. Buffers
//! and textures whose lifetime is a single frame are placed into the current
//! slot's region by bumping a cursor, and the whole region is reclaimed when
//! the slot comes around again:
//!
//! ```text
//! heap   [   slot 0 region   ][   slot 1 region   ][   slot 2 region   ]
//!                              ^frame_base
//!                              [buf][ tex ][buf]...^cursor
//! ```
//!
//! Resources are never freed individually. The handles returned by the heap
//! are kept alive by the heap until [`TransientHeap::reset_to_frame`] reuses
//! their region, so API objects are not destroyed while the GPU may still be
//! reading them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuBuffer, GpuHeap, GpuTexture};
use crate::error::GraphicsError;
use crate::types::{
    BufferDescriptor, FrameSlot, TextureDescriptor, align_down, checked_align_up,
};

/// Granularity of per-slot heap regions.
pub const TRANSIENT_REGION_ALIGNMENT: u64 = 64 * 1024;

/// A buffer placed in the transient heap for one frame.
#[derive(Debug)]
pub struct TransientBuffer {
    raw: GpuBuffer,
    offset: u64,
    size: u64,
    /// Keeps the backing memory alive; declared last so it drops after `raw`.
    _heap: Arc<GpuHeap>,
}

impl TransientBuffer {
    /// The backend buffer.
    pub fn raw(&self) -> &GpuBuffer {
        &self.raw
    }

    /// Absolute offset inside the heap.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes occupied in the heap.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A texture placed in the transient heap for one frame.
#[derive(Debug)]
pub struct TransientTexture {
    raw: GpuTexture,
    offset: u64,
    size: u64,
    _heap: Arc<GpuHeap>,
}

impl TransientTexture {
    /// The backend texture.
    pub fn raw(&self) -> &GpuTexture {
        &self.raw
    }

    /// Absolute offset inside the heap.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes occupied in the heap.
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
enum Retained {
    Buffer(Arc<TransientBuffer>),
    Texture(Arc<TransientTexture>),
}

/// Usage statistics of the transient heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransientHeapStats {
    /// Highest number of bytes one frame used.
    pub peak_usage: u64,
    /// Bytes used by the current frame.
    pub frame_usage: u64,
    /// Bytes available to one frame.
    pub per_frame_capacity: u64,
    /// Absolute offset of the current frame's region.
    pub frame_base: u64,
}

#[derive(Debug)]
struct HeapState {
    heap: Option<Arc<GpuHeap>>,
    per_frame_capacity: u64,
    slot: FrameSlot,
    frame_base: u64,
    /// Bytes used in the current region, relative to `frame_base`.
    cursor: u64,
    peak_usage: u64,
    retained: Vec<Vec<Retained>>,
}

/// GPU-local bump allocator for resources that live exactly one frame.
pub struct TransientHeap {
    buffering_depth: u32,
    state: Mutex<HeapState>,
    backend: Arc<dyn GpuBackend>,
}

impl TransientHeap {
    /// Create an uninitialized heap for `buffering_depth` frame slots.
    pub fn new(backend: Arc<dyn GpuBackend>, buffering_depth: u32) -> Self {
        Self {
            backend,
            buffering_depth,
            state: Mutex::new(HeapState {
                heap: None,
                per_frame_capacity: 0,
                slot: FrameSlot::new(0),
                frame_base: 0,
                cursor: 0,
                peak_usage: 0,
                retained: (0..buffering_depth).map(|_| Vec::new()).collect(),
            }),
        }
    }

    /// Allocate the backing memory.
    ///
    /// `total_size` is split evenly across frame slots, each region rounded
    /// down to [`TRANSIENT_REGION_ALIGNMENT`].
    pub fn initialize(&self, total_size: u64) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.heap.is_some() {
            return Err(GraphicsError::InvalidParameter(
                "transient heap is already initialized".to_string(),
            ));
        }

        let per_frame = align_down(
            total_size / u64::from(self.buffering_depth.max(1)),
            TRANSIENT_REGION_ALIGNMENT,
        );
        if per_frame == 0 {
            return Err(GraphicsError::InvalidConfiguration(format!(
                "transient_heap_size {} is below {} bytes per frame slot",
                total_size, TRANSIENT_REGION_ALIGNMENT
            )));
        }

        let heap = self
            .backend
            .create_heap(per_frame * u64::from(self.buffering_depth), "transient heap")?;
        log::info!(
            "Transient heap: {} bytes per frame x {} slots",
            per_frame,
            self.buffering_depth
        );

        state.heap = Some(Arc::new(heap));
        state.per_frame_capacity = per_frame;
        state.frame_base = state.slot.index() as u64 * per_frame;
        state.cursor = 0;
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has been called.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().heap.is_some()
    }

    /// Place a buffer in the current frame's region.
    ///
    /// `offset_hint` is relative to the start of the region; callers pass the
    /// running sum of the consumed sizes returned so far. Returns the buffer
    /// and the bytes it consumed counting from `offset_hint`.
    pub fn create_transient_buffer(
        &self,
        descriptor: &BufferDescriptor,
        offset_hint: u64,
    ) -> Result<(Arc<TransientBuffer>, u64), GraphicsError> {
        let requirements = self.backend.buffer_requirements(descriptor)?;
        let mut state = self.state.lock();
        let (heap, offset, consumed) = self.place(&mut state, offset_hint, requirements)?;

        let raw = self.backend.create_placed_buffer(&heap, offset, descriptor)?;
        let buffer = Arc::new(TransientBuffer {
            raw,
            offset,
            size: requirements.size,
            _heap: heap,
        });
        let slot = state.slot.index();
        state.retained[slot].push(Retained::Buffer(Arc::clone(&buffer)));

        log::trace!(
            "Transient buffer {:?} at {} ({} bytes)",
            descriptor.label_or("unnamed"),
            offset,
            requirements.size
        );
        Ok((buffer, consumed))
    }

    /// Place a texture in the current frame's region.
    ///
    /// Same contract as [`create_transient_buffer`](Self::create_transient_buffer).
    pub fn create_transient_texture(
        &self,
        descriptor: &TextureDescriptor,
        offset_hint: u64,
    ) -> Result<(Arc<TransientTexture>, u64), GraphicsError> {
        let requirements = self.backend.texture_requirements(descriptor)?;
        let mut state = self.state.lock();
        let (heap, offset, consumed) = self.place(&mut state, offset_hint, requirements)?;

        let raw = self.backend.create_placed_texture(&heap, offset, descriptor)?;
        let texture = Arc::new(TransientTexture {
            raw,
            offset,
            size: requirements.size,
            _heap: heap,
        });
        let slot = state.slot.index();
        state.retained[slot].push(Retained::Texture(Arc::clone(&texture)));

        log::trace!(
            "Transient texture {:?} at {} ({} bytes)",
            descriptor.label.as_deref().unwrap_or("unnamed"),
            offset,
            requirements.size
        );
        Ok((texture, consumed))
    }

    /// Bump the cursor for a resource and return the heap, the absolute
    /// offset and the bytes consumed from `offset_hint`.
    fn place(
        &self,
        state: &mut HeapState,
        offset_hint: u64,
        requirements: crate::types::MemoryRequirements,
    ) -> Result<(Arc<GpuHeap>, u64, u64), GraphicsError> {
        let Some(heap) = state.heap.clone() else {
            return Err(GraphicsError::InvalidParameter(
                "transient heap used before initialize".to_string(),
            ));
        };

        // `None` when the placement does not fit in a u64 at all
        let placed = checked_align_up(offset_hint.max(state.cursor), requirements.alignment)
            .and_then(|start| Some((start, start.checked_add(requirements.size)?)));
        let Some((start, end)) = placed.filter(|&(_, end)| end <= state.per_frame_capacity)
        else {
            let requested = placed.map_or(u64::MAX, |(_, end)| end);
            log::error!(
                "Transient heap region exhausted: {} bytes needed, {} available",
                requested,
                state.per_frame_capacity
            );
            return Err(GraphicsError::CapacityExceeded {
                resource: "transient_heap_size",
                requested,
                available: state.per_frame_capacity,
            });
        };

        state.cursor = end;
        state.peak_usage = state.peak_usage.max(end);
        Ok((heap, state.frame_base + start, end - offset_hint))
    }

    /// Move to `slot`'s region and release the resources it held.
    ///
    /// The GPU must be done with the region's previous occupants.
    pub fn reset_to_frame(&self, slot: FrameSlot) {
        debug_assert!(slot.index() < self.buffering_depth as usize);
        let released = {
            let mut state = self.state.lock();
            state.slot = slot;
            state.frame_base = slot.index() as u64 * state.per_frame_capacity;
            state.cursor = 0;
            std::mem::take(&mut state.retained[slot.index()])
        };

        if !released.is_empty() {
            log::trace!(
                "Transient heap released {} resources from {}",
                released.len(),
                slot
            );
        }
        for resource in &released {
            let outstanding = match resource {
                Retained::Buffer(buffer) => Arc::strong_count(buffer),
                Retained::Texture(texture) => Arc::strong_count(texture),
            };
            if outstanding > 1 {
                log::warn!("Transient resource from {} outlived its frame", slot);
            }
        }
    }

    /// Growing the heap is not supported.
    pub fn resize(&self, total_size: u64) -> Result<(), GraphicsError> {
        log::warn!(
            "Transient heap resize to {} bytes requested; the heap has a fixed size",
            total_size
        );
        Err(GraphicsError::FeatureNotSupported(
            "transient heap cannot be resized, raise transient_heap_size instead".to_string(),
        ))
    }

    /// Bytes available to one frame.
    pub fn per_frame_capacity(&self) -> u64 {
        self.state.lock().per_frame_capacity
    }

    /// Absolute offset of the current frame's region.
    pub fn frame_base(&self) -> u64 {
        self.state.lock().frame_base
    }

    /// Usage statistics.
    pub fn stats(&self) -> TransientHeapStats {
        let state = self.state.lock();
        TransientHeapStats {
            peak_usage: state.peak_usage,
            frame_usage: state.cursor,
            per_frame_capacity: state.per_frame_capacity,
            frame_base: state.frame_base,
        }
    }
}

impl std::fmt::Debug for TransientHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransientHeap")
            .field("buffering_depth", &self.buffering_depth)
            .field("per_frame_capacity", &state.per_frame_capacity)
            .field("frame_base", &state.frame_base)
            .field("cursor", &state.cursor)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(TransientHeap: Send, Sync);
