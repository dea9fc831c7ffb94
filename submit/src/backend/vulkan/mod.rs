//! Native Vulkan backend implementation using ash.
//!
//! The backend needs Vulkan 1.2 for timeline semaphores. Graphics, compute
//! and transfer map onto dedicated queue families when the device has them
//! and alias the graphics queue otherwise. Validation layers are enabled when
//! [`SubmitConfig::validation`] is set and the layer is installed.

mod allocator;
pub mod barriers;
mod command;
pub(crate) mod conversion;
mod debug;
mod device;
mod instance;
pub mod swapchain;
mod sync;

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;

use crate::config::SubmitConfig;
use crate::error::GraphicsError;
use crate::sync::WaitStatus;
use crate::types::{
    BufferDescriptor, BufferUsage, MemoryLocation, MemoryModel, MemoryRequirements, QueueKind,
    TextureDescriptor, TextureFormat, TextureUsage,
};

use super::{
    BufferBarrier, BufferCopy, GpuBackend, GpuBuffer, GpuCommandBuffer, GpuCommandPool, GpuHeap,
    GpuSemaphore, GpuTexture, MemoryBarrier, SemaphoreType, SubmitBatch,
};

use self::conversion::{
    convert_buffer_usage, convert_texture_format, convert_texture_usage, map_vk_error,
};

pub use device::QueueTopology;
pub use swapchain::VulkanSwapchain;

/// Alignment of the transient heap allocation and of resources placed in it.
const HEAP_ALIGNMENT: u64 = 64 * 1024;

/// Vulkan-based GPU backend using ash.
///
/// This backend provides:
/// - Timeline semaphores for every queue-to-queue and GPU-to-host dependency
/// - gpu-allocator for buffer and heap memory
/// - Queue-family ownership transfers when transfer and graphics differ
pub struct VulkanBackend {
    /// Vulkan entry points (function loader).
    entry: ash::Entry,
    /// Vulkan instance.
    instance: ash::Instance,
    /// Debug messenger for validation layer output.
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    /// Debug utils extension instance.
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    /// Debug utils device functions, used for object labels.
    debug_device: Option<ash::ext::debug_utils::Device>,
    /// Selected physical device.
    physical_device: vk::PhysicalDevice,
    /// Name of the selected physical device.
    adapter_name: String,
    /// Logical device.
    device: ash::Device,
    /// Queue family and hardware queue per queue kind.
    topology: QueueTopology,
    /// Queue handle per queue kind. Aliased kinds share a handle.
    queues: [vk::Queue; QueueKind::COUNT],
    /// Whether unified host-visible device-local memory exists.
    memory_model: MemoryModel,
    /// Memory types a heap must use to hold both buffers and images.
    heap_memory_type_bits: u32,
    /// Memory allocator, dropped explicitly before the device.
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    /// Surface extension, present when the loader offers it.
    surface_loader: Option<ash::khr::surface::Instance>,
    /// Swapchain extension, present when the device supports it.
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    /// Whether validation layers are enabled.
    validation_enabled: bool,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("adapter", &self.adapter_name)
            .field("topology", &self.topology)
            .field("memory_model", &self.memory_model)
            .field("validation_enabled", &self.validation_enabled)
            .finish()
    }
}

impl VulkanBackend {
    /// Create a new Vulkan backend.
    ///
    /// This initializes the Vulkan instance, selects a physical device,
    /// creates a logical device with one queue per used family, and sets up
    /// the memory allocator.
    pub fn new(config: &SubmitConfig) -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let bundle = instance::create_instance(&entry, config.validation)?;
        let validation_enabled = bundle.debug_utils.is_some();

        // Everything created below is torn down by hand if a later step fails
        let result = Self::create_device_objects(&bundle.instance);
        let objects = match result {
            Ok(objects) => objects,
            Err(e) => {
                unsafe {
                    if let (Some(debug_utils), Some(messenger)) =
                        (&bundle.debug_utils, bundle.debug_messenger)
                    {
                        debug_utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    bundle.instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        let DeviceObjects {
            physical_device,
            adapter_name,
            device,
            topology,
            memory_model,
            allocator,
            swapchain_supported,
        } = objects;

        let queues = QueueKind::ALL.map(|kind| unsafe {
            device.get_device_queue(topology.families[kind.index()], 0)
        });

        let debug_device = bundle
            .debug_utils
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&bundle.instance, &device));

        let surface_loader = bundle
            .surface_supported
            .then(|| ash::khr::surface::Instance::new(&entry, &bundle.instance));
        let swapchain_loader = swapchain_supported
            .then(|| ash::khr::swapchain::Device::new(&bundle.instance, &device));

        let mut backend = Self {
            entry,
            instance: bundle.instance,
            debug_messenger: bundle.debug_messenger,
            debug_utils: bundle.debug_utils,
            debug_device,
            physical_device,
            adapter_name,
            device,
            topology,
            queues,
            memory_model,
            heap_memory_type_bits: 0,
            allocator: ManuallyDrop::new(Arc::new(Mutex::new(allocator))),
            surface_loader,
            swapchain_loader,
            validation_enabled,
        };

        // From here on Drop cleans up after a failure
        backend.heap_memory_type_bits = backend.probe_heap_memory_types()?;

        log::info!(
            "Vulkan backend initialized on {} (validation: {}, memory: {:?})",
            backend.adapter_name,
            validation_enabled,
            memory_model
        );

        Ok(backend)
    }

    fn create_device_objects(instance: &ash::Instance) -> Result<DeviceObjects, GraphicsError> {
        let physical_device = device::select_physical_device(instance)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let adapter_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "Unknown GPU".to_string());

        let topology = device::find_queue_topology(instance, physical_device)?;
        let memory_model = device::detect_memory_model(instance, physical_device);
        let swapchain_supported = device::supports_swapchain(instance, physical_device);

        let device = device::create_logical_device(
            instance,
            physical_device,
            &topology,
            swapchain_supported,
        )?;

        let allocator =
            match allocator::create_allocator(instance, physical_device, device.clone()) {
                Ok(allocator) => allocator,
                Err(e) => {
                    unsafe { device.destroy_device(None) };
                    return Err(e);
                }
            };

        Ok(DeviceObjects {
            physical_device,
            adapter_name,
            device,
            topology,
            memory_model,
            allocator,
            swapchain_supported,
        })
    }

    /// Memory types able to back both buffers and optimal images.
    fn probe_heap_memory_types(&self) -> Result<u32, GraphicsError> {
        let buffer_descriptor = BufferDescriptor::new(
            HEAP_ALIGNMENT,
            BufferUsage::STAGING_TARGET | BufferUsage::COPY_SRC,
        );
        let buffer = self.create_raw_buffer(&buffer_descriptor)?;
        let buffer_bits =
            unsafe { self.device.get_buffer_memory_requirements(buffer) }.memory_type_bits;
        unsafe { self.device.destroy_buffer(buffer, None) };

        let texture_descriptor = TextureDescriptor::new_2d(
            64,
            64,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING | TextureUsage::RENDER_ATTACHMENT,
        );
        let image = self.create_raw_image(&texture_descriptor)?;
        let image_bits =
            unsafe { self.device.get_image_memory_requirements(image) }.memory_type_bits;
        unsafe { self.device.destroy_image(image, None) };

        let shared = buffer_bits & image_bits;
        if shared == 0 {
            log::warn!("No memory type holds both buffers and images, heap will hold buffers only");
            return Ok(buffer_bits);
        }
        Ok(shared)
    }

    /// Get the Vulkan device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan entry points.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the selected physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Queue topology chosen at startup.
    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Get the graphics queue, which is also the present queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.queues[QueueKind::Graphics.index()]
    }

    /// Surface extension, if the loader offers one.
    pub fn surface_loader(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref()
    }

    /// Swapchain extension, if the device supports it.
    pub fn swapchain_loader(&self) -> Option<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }

    /// Check if the graphics queue can present to a surface.
    pub fn is_surface_supported(&self, surface: vk::SurfaceKHR) -> bool {
        let Some(loader) = &self.surface_loader else {
            return false;
        };
        unsafe {
            loader
                .get_physical_device_surface_support(
                    self.physical_device,
                    self.topology.families[QueueKind::Graphics.index()],
                    surface,
                )
                .unwrap_or(false)
        }
    }

    /// Query surface capabilities for a given surface.
    pub fn surface_capabilities(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, GraphicsError> {
        let loader = self.require_surface_loader()?;
        unsafe { loader.get_physical_device_surface_capabilities(self.physical_device, surface) }
            .map_err(|e| {
                map_vk_error(
                    e,
                    "Failed to get surface capabilities",
                    GraphicsError::ResourceCreationFailed,
                )
            })
    }

    /// Query surface formats for a given surface.
    pub fn surface_formats(
        &self,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, GraphicsError> {
        let loader = self.require_surface_loader()?;
        unsafe { loader.get_physical_device_surface_formats(self.physical_device, surface) }
            .map_err(|e| {
                map_vk_error(
                    e,
                    "Failed to get surface formats",
                    GraphicsError::ResourceCreationFailed,
                )
            })
    }

    fn require_surface_loader(&self) -> Result<&ash::khr::surface::Instance, GraphicsError> {
        self.surface_loader.as_ref().ok_or_else(|| {
            GraphicsError::FeatureNotSupported("Vulkan loader has no surface support".to_string())
        })
    }

    fn set_name<H: vk::Handle>(&self, handle: H, label: &str) {
        if let Some(debug_device) = &self.debug_device {
            debug::set_object_name(debug_device, handle, label);
        }
    }

    fn create_raw_buffer(
        &self,
        descriptor: &BufferDescriptor,
    ) -> Result<vk::Buffer, GraphicsError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size.max(1))
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            map_vk_error(
                e,
                "Failed to create buffer",
                GraphicsError::ResourceCreationFailed,
            )
        })
    }

    fn create_raw_image(&self, descriptor: &TextureDescriptor) -> Result<vk::Image, GraphicsError> {
        let size = descriptor.size;
        let image_type = if size.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(convert_texture_format(descriptor.format))
            .extent(vk::Extent3D {
                width: size.width.max(1),
                height: size.height.max(1),
                depth: size.depth.max(1),
            })
            .mip_levels(descriptor.mip_level_count.max(1))
            .array_layers(1)
            .samples(convert_sample_count(descriptor.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe { self.device.create_image(&image_info, None) }.map_err(|e| {
            map_vk_error(
                e,
                "Failed to create image",
                GraphicsError::ResourceCreationFailed,
            )
        })
    }

    /// Placement offset of `heap` plus `offset`, after checking bounds.
    fn heap_memory(
        &self,
        heap: &GpuHeap,
        offset: u64,
        requirements: vk::MemoryRequirements,
    ) -> Result<(vk::DeviceMemory, u64), GraphicsError> {
        let GpuHeap::Vulkan {
            allocation, size, ..
        } = heap
        else {
            return Err(GraphicsError::InvalidParameter(
                "heap belongs to another backend".to_string(),
            ));
        };

        if offset % requirements.alignment.max(1) != 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "placement offset {} is not aligned to {}",
                offset, requirements.alignment
            )));
        }
        if offset.saturating_add(requirements.size) > *size {
            return Err(GraphicsError::InvalidParameter(format!(
                "placement [{}, {}) exceeds heap of {} bytes",
                offset,
                offset.saturating_add(requirements.size),
                size
            )));
        }
        if requirements.memory_type_bits & self.heap_memory_type_bits == 0 {
            return Err(GraphicsError::InvalidParameter(
                "resource cannot live in the heap's memory type".to_string(),
            ));
        }

        let guard = allocation.lock();
        let allocation = guard
            .as_ref()
            .ok_or_else(|| GraphicsError::Internal("heap allocation was freed".to_string()))?;
        Ok((unsafe { allocation.memory() }, allocation.offset() + offset))
    }

    fn prepare_batch(&self, batch: &SubmitBatch) -> Result<PreparedBatch, GraphicsError> {
        let mut prepared = PreparedBatch::default();

        for buffer in &batch.command_buffers {
            prepared.command_buffers.push(vk_command_buffer(buffer).ok_or_else(|| {
                GraphicsError::SubmitFailed("command buffer belongs to another backend".to_string())
            })?);
        }
        for op in &batch.waits {
            prepared.waits.push(vk_semaphore(op.semaphore())?);
            prepared.wait_values.push(op.value());
            prepared.wait_stages.push(vk::PipelineStageFlags::ALL_COMMANDS);
        }
        for op in &batch.signals {
            prepared.signals.push(vk_semaphore(op.semaphore())?);
            prepared.signal_values.push(op.value());
        }

        Ok(prepared)
    }
}

/// Objects created between the instance and the backend struct.
struct DeviceObjects {
    physical_device: vk::PhysicalDevice,
    adapter_name: String,
    device: ash::Device,
    topology: QueueTopology,
    memory_model: MemoryModel,
    allocator: Allocator,
    swapchain_supported: bool,
}

/// Raw arrays for one `VkSubmitInfo`.
#[derive(Default)]
struct PreparedBatch {
    command_buffers: Vec<vk::CommandBuffer>,
    waits: Vec<vk::Semaphore>,
    wait_values: Vec<u64>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    signals: Vec<vk::Semaphore>,
    signal_values: Vec<u64>,
}

fn convert_sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

fn vk_semaphore(semaphore: &GpuSemaphore) -> Result<vk::Semaphore, GraphicsError> {
    match semaphore {
        GpuSemaphore::Vulkan { semaphore, .. } => Ok(*semaphore),
        GpuSemaphore::Dummy(_) => Err(GraphicsError::InvalidParameter(
            "semaphore belongs to another backend".to_string(),
        )),
    }
}

fn vk_command_buffer(buffer: &GpuCommandBuffer) -> Option<vk::CommandBuffer> {
    match buffer {
        GpuCommandBuffer::Vulkan { buffer } => Some(*buffer),
        GpuCommandBuffer::Dummy(_) => None,
    }
}

fn vk_buffer(buffer: &GpuBuffer) -> Option<vk::Buffer> {
    match buffer {
        GpuBuffer::Vulkan { buffer, .. } => Some(*buffer),
        GpuBuffer::Dummy(_) => None,
    }
}

fn vk_pool(pool: &GpuCommandPool) -> Result<vk::CommandPool, GraphicsError> {
    match pool {
        GpuCommandPool::Vulkan { pool, .. } => Ok(*pool),
        GpuCommandPool::Dummy(_) => Err(GraphicsError::InvalidParameter(
            "command pool belongs to another backend".to_string(),
        )),
    }
}

fn foreign_command_buffer() -> GraphicsError {
    GraphicsError::InvalidParameter("command buffer belongs to another backend".to_string())
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            // Wait for device to be idle before cleanup
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle during shutdown: {:?}", e);
            }

            if Arc::strong_count(&self.allocator) > 1 {
                log::warn!("GPU resources outlive the Vulkan backend; their memory is leaked");
            }

            // Allocator frees its memory blocks, so it must go before the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend (ash)"
    }

    fn adapter_name(&self) -> String {
        self.adapter_name.clone()
    }

    fn memory_model(&self) -> MemoryModel {
        self.memory_model
    }

    fn hardware_queue(&self, kind: QueueKind) -> usize {
        self.topology.hardware[kind.index()]
    }

    fn queue_family(&self, kind: QueueKind) -> u32 {
        self.topology.families[kind.index()]
    }

    // ========================================================================
    // Semaphores
    // ========================================================================

    fn create_semaphore(
        &self,
        ty: SemaphoreType,
        label: &str,
    ) -> Result<GpuSemaphore, GraphicsError> {
        let (initial, timeline) = match ty {
            SemaphoreType::Binary => (None, false),
            SemaphoreType::Timeline { initial } => (Some(initial), true),
        };
        let semaphore = sync::create_semaphore(&self.device, initial)?;
        self.set_name(semaphore, label);

        Ok(GpuSemaphore::Vulkan {
            device: self.device.clone(),
            semaphore,
            timeline,
        })
    }

    fn semaphore_value(&self, semaphore: &GpuSemaphore) -> Result<u64, GraphicsError> {
        sync::semaphore_value(&self.device, vk_semaphore(semaphore)?)
    }

    fn wait_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
        timeout: Duration,
    ) -> Result<WaitStatus, GraphicsError> {
        sync::wait_semaphore(&self.device, vk_semaphore(semaphore)?, value, timeout)
    }

    fn signal_semaphore(
        &self,
        semaphore: &GpuSemaphore,
        value: u64,
    ) -> Result<(), GraphicsError> {
        sync::signal_semaphore(&self.device, vk_semaphore(semaphore)?, value)
    }

    // ========================================================================
    // Command recording
    // ========================================================================

    fn create_command_pool(
        &self,
        kind: QueueKind,
        label: &str,
    ) -> Result<GpuCommandPool, GraphicsError> {
        let pool = command::create_command_pool(&self.device, self.queue_family(kind))?;
        self.set_name(pool, label);

        Ok(GpuCommandPool::Vulkan {
            device: self.device.clone(),
            pool,
            kind,
        })
    }

    fn allocate_command_buffer(
        &self,
        pool: &GpuCommandPool,
        label: &str,
    ) -> Result<GpuCommandBuffer, GraphicsError> {
        let buffer = command::allocate_command_buffer(&self.device, vk_pool(pool)?)?;
        self.set_name(buffer, label);
        Ok(GpuCommandBuffer::Vulkan { buffer })
    }

    fn reset_command_pool(&self, pool: &GpuCommandPool) -> Result<(), GraphicsError> {
        command::reset_command_pool(&self.device, vk_pool(pool)?)
    }

    fn begin_command_buffer(&self, buffer: &GpuCommandBuffer) -> Result<(), GraphicsError> {
        let buffer = vk_command_buffer(buffer).ok_or_else(foreign_command_buffer)?;
        command::begin_command_buffer(&self.device, buffer)
    }

    fn end_command_buffer(&self, buffer: &GpuCommandBuffer) -> Result<(), GraphicsError> {
        let buffer = vk_command_buffer(buffer).ok_or_else(foreign_command_buffer)?;
        command::end_command_buffer(&self.device, buffer)
    }

    fn cmd_copy_buffer(
        &self,
        buffer: &GpuCommandBuffer,
        src: &GpuBuffer,
        dst: &GpuBuffer,
        regions: &[BufferCopy],
    ) {
        let (Some(cmd), Some(src), Some(dst)) =
            (vk_command_buffer(buffer), vk_buffer(src), vk_buffer(dst))
        else {
            log::error!("VulkanBackend: copy with foreign handles ignored");
            return;
        };
        barriers::record_copy(&self.device, cmd, src, dst, regions);
    }

    fn cmd_memory_barrier(&self, buffer: &GpuCommandBuffer, barrier: MemoryBarrier) {
        let Some(cmd) = vk_command_buffer(buffer) else {
            log::error!("VulkanBackend: barrier on foreign command buffer ignored");
            return;
        };
        barriers::record_memory_barrier(&self.device, cmd, barrier);
    }

    fn cmd_buffer_barrier(
        &self,
        buffer: &GpuCommandBuffer,
        target: &GpuBuffer,
        barrier: &BufferBarrier,
    ) {
        let (Some(cmd), Some(target)) = (vk_command_buffer(buffer), vk_buffer(target)) else {
            log::error!("VulkanBackend: buffer barrier with foreign handles ignored");
            return;
        };
        barriers::record_buffer_barrier(&self.device, cmd, target, barrier, &self.topology);
    }

    // ========================================================================
    // Submission
    // ========================================================================

    fn submit(&self, kind: QueueKind, batches: &[SubmitBatch]) -> Result<(), GraphicsError> {
        if batches.is_empty() {
            return Ok(());
        }

        let prepared = batches
            .iter()
            .map(|batch| self.prepare_batch(batch))
            .collect::<Result<Vec<_>, _>>()?;

        let mut timeline_infos: Vec<vk::TimelineSemaphoreSubmitInfo> = prepared
            .iter()
            .map(|batch| {
                vk::TimelineSemaphoreSubmitInfo::default()
                    .wait_semaphore_values(&batch.wait_values)
                    .signal_semaphore_values(&batch.signal_values)
            })
            .collect();

        let submit_infos: Vec<vk::SubmitInfo> = prepared
            .iter()
            .zip(timeline_infos.iter_mut())
            .map(|(batch, timeline_info)| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&batch.waits)
                    .wait_dst_stage_mask(&batch.wait_stages)
                    .command_buffers(&batch.command_buffers)
                    .signal_semaphores(&batch.signals)
                    .push_next(timeline_info)
            })
            .collect();

        let queue = self.queues[kind.index()];
        unsafe {
            self.device
                .queue_submit(queue, &submit_infos, vk::Fence::null())
        }
        .map_err(|e| {
            let error = map_vk_error(e, "Failed to submit", GraphicsError::SubmitFailed);
            log::error!("Submission to {} queue failed: {}", kind, error);
            error
        })
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
        location: MemoryLocation,
    ) -> Result<GpuBuffer, GraphicsError> {
        let label = descriptor.label_or("buffer");
        let buffer = self.create_raw_buffer(descriptor)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = self.allocator.lock();
            allocator::allocate(&mut allocator, label, requirements, location, true)
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            if let Err(free_error) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", free_error);
            }
            return Err(map_vk_error(
                e,
                "Failed to bind buffer memory",
                GraphicsError::ResourceCreationFailed,
            ));
        }

        self.set_name(buffer, label);

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            buffer,
            allocation: Mutex::new(Some(allocation)),
            allocator: Arc::clone(&self.allocator),
            size: descriptor.size,
        })
    }

    fn map_buffer(&self, buffer: &GpuBuffer) -> Result<NonNull<u8>, GraphicsError> {
        let GpuBuffer::Vulkan { allocation, .. } = buffer else {
            return Err(GraphicsError::InvalidParameter(
                "buffer belongs to another backend".to_string(),
            ));
        };

        allocation
            .lock()
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter("buffer is not host visible".to_string())
            })
    }

    fn buffer_requirements(
        &self,
        descriptor: &BufferDescriptor,
    ) -> Result<MemoryRequirements, GraphicsError> {
        let buffer = self.create_raw_buffer(descriptor)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        unsafe { self.device.destroy_buffer(buffer, None) };

        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
        })
    }

    fn texture_requirements(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<MemoryRequirements, GraphicsError> {
        let image = self.create_raw_image(descriptor)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        unsafe { self.device.destroy_image(image, None) };

        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
        })
    }

    fn create_heap(&self, size: u64, label: &str) -> Result<GpuHeap, GraphicsError> {
        let requirements = vk::MemoryRequirements {
            size,
            alignment: HEAP_ALIGNMENT,
            memory_type_bits: self.heap_memory_type_bits,
        };

        let allocation = {
            let mut allocator = self.allocator.lock();
            allocator::allocate(
                &mut allocator,
                label,
                requirements,
                MemoryLocation::GpuOnly,
                false,
            )?
        };

        log::info!("Created heap '{}' ({} bytes)", label, size);

        Ok(GpuHeap::Vulkan {
            allocation: Mutex::new(Some(allocation)),
            allocator: Arc::clone(&self.allocator),
            size,
        })
    }

    fn create_placed_buffer(
        &self,
        heap: &GpuHeap,
        offset: u64,
        descriptor: &BufferDescriptor,
    ) -> Result<GpuBuffer, GraphicsError> {
        let buffer = self.create_raw_buffer(descriptor)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let bound = self
            .heap_memory(heap, offset, requirements)
            .and_then(|(memory, memory_offset)| {
                unsafe { self.device.bind_buffer_memory(buffer, memory, memory_offset) }.map_err(
                    |e| {
                        map_vk_error(
                            e,
                            "Failed to bind placed buffer",
                            GraphicsError::ResourceCreationFailed,
                        )
                    },
                )
            });
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e);
        }

        self.set_name(buffer, descriptor.label_or("transient buffer"));

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            buffer,
            allocation: Mutex::new(None),
            allocator: Arc::clone(&self.allocator),
            size: descriptor.size,
        })
    }

    fn create_placed_texture(
        &self,
        heap: &GpuHeap,
        offset: u64,
        descriptor: &TextureDescriptor,
    ) -> Result<GpuTexture, GraphicsError> {
        let image = self.create_raw_image(descriptor)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let bound = self
            .heap_memory(heap, offset, requirements)
            .and_then(|(memory, memory_offset)| {
                unsafe { self.device.bind_image_memory(image, memory, memory_offset) }.map_err(
                    |e| {
                        map_vk_error(
                            e,
                            "Failed to bind placed texture",
                            GraphicsError::ResourceCreationFailed,
                        )
                    },
                )
            });
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            return Err(e);
        }

        self.set_name(image, descriptor.label.as_deref().unwrap_or("transient texture"));

        let size = descriptor.size;
        Ok(GpuTexture::Vulkan {
            device: self.device.clone(),
            image,
            format: convert_texture_format(descriptor.format),
            extent: vk::Extent3D {
                width: size.width.max(1),
                height: size.height.max(1),
                depth: size.depth.max(1),
            },
        })
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| map_vk_error(e, "Failed to wait for device idle", GraphicsError::Internal))
    }
}

static_assertions::assert_impl_all!(VulkanBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count_conversion() {
        assert_eq!(convert_sample_count(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(convert_sample_count(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(convert_sample_count(3), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn test_vulkan_backend_creation() {
        let config = SubmitConfig::default().with_backend(crate::config::BackendChoice::Vulkan);
        match VulkanBackend::new(&config) {
            Ok(backend) => {
                assert_eq!(backend.name(), "Vulkan Backend (ash)");
                assert!(!backend.adapter_name().is_empty());
            }
            Err(e) => {
                // Machines without a Vulkan 1.2 driver cannot create the backend
                println!("Vulkan not available: {}", e);
            }
        }
    }
}
