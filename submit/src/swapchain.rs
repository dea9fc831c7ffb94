//! Swapchain collaborator boundary.
//!
//! Surface creation and image management belong to the windowing layer. The
//! submission core only needs the semaphore handoff:
//!
//! - acquire an image index, having the presentation engine signal an
//!   "image acquired" binary semaphore;
//! - present an image once a "render finished" binary semaphore is signaled.
//!
//! ```text
//! acquire_next_image ──signal──► image_acquired ──wait──► graphics batch
//!                                                              │
//!                      present ◄──wait── render_finished ◄─signal─┘
//! ```
//!
//! The Vulkan implementation lives in the backend; [`DummySwapchain`] records
//! the handoff for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::GpuSemaphore;
use crate::error::GraphicsError;

/// Presentation engine interface used by the render device.
pub trait Swapchain: Send + Sync {
    /// Number of images in the swapchain.
    fn image_count(&self) -> u32;

    /// Acquire the next image, signaling `signal` when it is ready to be
    /// rendered to.
    ///
    /// Returns [`GraphicsError::SurfaceOutdated`] when the swapchain must be
    /// recreated before rendering can continue.
    fn acquire_next_image(
        &self,
        signal: &GpuSemaphore,
        timeout: Duration,
    ) -> Result<u32, GraphicsError>;

    /// Queue `image_index` for presentation once `wait` is signaled.
    ///
    /// Called with the graphics queue's submit lock held.
    fn present(&self, image_index: u32, wait: &GpuSemaphore) -> Result<(), GraphicsError>;
}

/// A recorded present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentLog {
    /// Image that was presented.
    pub image_index: u32,
    /// Semaphore the present waited on.
    pub wait_semaphore: u64,
}

/// A recorded acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireLog {
    /// Image that was handed out.
    pub image_index: u32,
    /// Semaphore the presentation engine signals.
    pub signal_semaphore: u64,
}

/// Swapchain stand-in that hands out images round-robin and logs the
/// semaphore handoff.
#[derive(Debug)]
pub struct DummySwapchain {
    image_count: u32,
    next_image: AtomicU32,
    outdated: AtomicBool,
    acquires: Mutex<Vec<AcquireLog>>,
    presents: Mutex<Vec<PresentLog>>,
}

impl DummySwapchain {
    /// Create a swapchain with `image_count` images.
    pub fn new(image_count: u32) -> Self {
        Self {
            image_count: image_count.max(1),
            next_image: AtomicU32::new(0),
            outdated: AtomicBool::new(false),
            acquires: Mutex::new(Vec::new()),
            presents: Mutex::new(Vec::new()),
        }
    }

    /// Make the next acquires fail as if the window was resized.
    pub fn set_outdated(&self, outdated: bool) {
        self.outdated.store(outdated, Ordering::Release);
    }

    /// Every acquire so far.
    pub fn acquires(&self) -> Vec<AcquireLog> {
        self.acquires.lock().clone()
    }

    /// Every present so far.
    pub fn presents(&self) -> Vec<PresentLog> {
        self.presents.lock().clone()
    }
}

impl Swapchain for DummySwapchain {
    fn image_count(&self) -> u32 {
        self.image_count
    }

    fn acquire_next_image(
        &self,
        signal: &GpuSemaphore,
        _timeout: Duration,
    ) -> Result<u32, GraphicsError> {
        if self.outdated.load(Ordering::Acquire) {
            return Err(GraphicsError::SurfaceOutdated);
        }

        let image_index = self.next_image.fetch_add(1, Ordering::AcqRel) % self.image_count;
        self.acquires.lock().push(AcquireLog {
            image_index,
            signal_semaphore: signal.id(),
        });
        log::trace!("DummySwapchain: acquired image {}", image_index);
        Ok(image_index)
    }

    fn present(&self, image_index: u32, wait: &GpuSemaphore) -> Result<(), GraphicsError> {
        self.presents.lock().push(PresentLog {
            image_index,
            wait_semaphore: wait.id(),
        });
        log::trace!("DummySwapchain: presented image {}", image_index);
        Ok(())
    }
}

static_assertions::assert_impl_all!(DummySwapchain: Send, Sync);
