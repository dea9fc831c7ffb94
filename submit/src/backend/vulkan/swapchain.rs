//! Vulkan swapchain implementation.
//!
//! The window and `VkSurfaceKHR` belong to the windowing layer. This type only
//! owns the swapchain object and implements the semaphore handoff the render
//! device drives through [`Swapchain`].

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use super::VulkanBackend;
use super::conversion::map_vk_error;
use crate::backend::GpuSemaphore;
use crate::error::GraphicsError;
use crate::swapchain::Swapchain;

/// Preferred surface formats, in order.
const PREFERRED_FORMATS: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];

/// Vulkan swapchain resources.
///
/// Drop it only after the render device is idle: presentation may still be
/// reading the images otherwise.
pub struct VulkanSwapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    loader: ash::khr::swapchain::Device,
    present_queue: vk::Queue,
    /// Keeps the device alive while the swapchain exists.
    _backend: Arc<VulkanBackend>,
}

impl VulkanSwapchain {
    /// Create a FIFO swapchain for `surface`.
    ///
    /// `width` and `height` are only used when the surface leaves the extent
    /// up to the application.
    pub fn new(
        backend: &Arc<VulkanBackend>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> Result<Self, GraphicsError> {
        let loader = backend.swapchain_loader().cloned().ok_or_else(|| {
            GraphicsError::FeatureNotSupported(
                "Device was created without VK_KHR_swapchain".to_string(),
            )
        })?;

        if !backend.is_surface_supported(surface) {
            return Err(GraphicsError::FeatureNotSupported(
                "Graphics queue cannot present to this surface".to_string(),
            ));
        }

        let capabilities = backend.surface_capabilities(surface)?;
        let formats = backend.surface_formats(surface)?;
        let surface_format = PREFERRED_FORMATS
            .iter()
            .find_map(|wanted| formats.iter().find(|f| f.format == *wanted))
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| {
                GraphicsError::ResourceCreationFailed("Surface reports no formats".to_string())
            })?;

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let max_images = if capabilities.max_image_count > 0 {
            capabilities.max_image_count
        } else {
            u32::MAX
        };
        let image_count = (capabilities.min_image_count + 1).min(max_images);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }.map_err(|e| {
            map_vk_error(
                e,
                "Failed to create swapchain",
                GraphicsError::ResourceCreationFailed,
            )
        })?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(map_vk_error(
                    e,
                    "Failed to get swapchain images",
                    GraphicsError::ResourceCreationFailed,
                ));
            }
        };

        log::info!(
            "Created swapchain: {}x{}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            images.len()
        );

        Ok(Self {
            swapchain,
            images,
            format: surface_format.format,
            extent,
            loader,
            present_queue: backend.graphics_queue(),
            _backend: Arc::clone(backend),
        })
    }

    /// Raw swapchain images.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

fn binary_semaphore(semaphore: &GpuSemaphore) -> Result<vk::Semaphore, GraphicsError> {
    match semaphore {
        GpuSemaphore::Vulkan {
            semaphore,
            timeline: false,
            ..
        } => Ok(*semaphore),
        _ => Err(GraphicsError::InvalidParameter(
            "Swapchain handoff needs a Vulkan binary semaphore".to_string(),
        )),
    }
}

impl Swapchain for VulkanSwapchain {
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn acquire_next_image(
        &self,
        signal: &GpuSemaphore,
        timeout: Duration,
    ) -> Result<u32, GraphicsError> {
        let semaphore = binary_semaphore(signal)?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal for the surface");
                }
                Ok(index)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GraphicsError::SurfaceOutdated),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(GraphicsError::SurfaceLost),
            Err(e) => Err(map_vk_error(
                e,
                "Failed to acquire swapchain image",
                GraphicsError::Internal,
            )),
        }
    }

    fn present(&self, image_index: u32, wait: &GpuSemaphore) -> Result<(), GraphicsError> {
        let wait_semaphores = [binary_semaphore(wait)?];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(self.present_queue, &present_info) } {
            Ok(_) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GraphicsError::SurfaceOutdated),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => Err(GraphicsError::SurfaceLost),
            Err(e) => Err(map_vk_error(e, "Failed to present", GraphicsError::Internal)),
        }
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

impl std::fmt::Debug for VulkanSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchain")
            .field("images", &self.images.len())
            .field("format", &self.format)
            .field("extent", &self.extent)
            .finish()
    }
}
