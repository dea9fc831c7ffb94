//! Vulkan command pool and buffer management.

use ash::vk;

use crate::error::GraphicsError;

use super::conversion::map_vk_error;

/// Create a command pool for one queue family.
///
/// Context rings reset the whole pool once their frame slot has retired.
/// The staging arena re-begins its per-slot buffer instead, which needs the
/// implicit per-buffer reset.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        );

    let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        map_vk_error(
            e,
            "Failed to create command pool",
            GraphicsError::ResourceCreationFailed,
        )
    })?;

    Ok(pool)
}

/// Allocate one primary command buffer.
pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer, GraphicsError> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(|e| {
        map_vk_error(
            e,
            "Failed to allocate command buffer",
            GraphicsError::ResourceCreationFailed,
        )
    })?;

    buffers.into_iter().next().ok_or_else(|| {
        GraphicsError::ResourceCreationFailed("Driver returned no command buffer".to_string())
    })
}

/// Return every command buffer of `pool` to the initial state.
pub fn reset_command_pool(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<(), GraphicsError> {
    unsafe { device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
        .map_err(|e| map_vk_error(e, "Failed to reset command pool", GraphicsError::Internal))
}

/// Begin a one-time-submit recording.
pub fn begin_command_buffer(
    device: &ash::Device,
    buffer: vk::CommandBuffer,
) -> Result<(), GraphicsError> {
    let begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe { device.begin_command_buffer(buffer, &begin_info) }
        .map_err(|e| map_vk_error(e, "Failed to begin command buffer", GraphicsError::Internal))
}

/// Finish recording.
pub fn end_command_buffer(
    device: &ash::Device,
    buffer: vk::CommandBuffer,
) -> Result<(), GraphicsError> {
    unsafe { device.end_command_buffer(buffer) }
        .map_err(|e| map_vk_error(e, "Failed to end command buffer", GraphicsError::Internal))
}
