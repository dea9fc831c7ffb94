//! Vulkan semaphore helpers.
//!
//! Timeline semaphores carry all queue-to-queue and GPU-to-host ordering.
//! Binary semaphores exist only for the swapchain handoff.

use std::time::Duration;

use ash::vk;

use crate::error::GraphicsError;
use crate::sync::WaitStatus;

use super::conversion::map_vk_error;

/// Create a binary or timeline semaphore.
pub fn create_semaphore(
    device: &ash::Device,
    timeline_initial: Option<u64>,
) -> Result<vk::Semaphore, GraphicsError> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(timeline_initial.unwrap_or(0));

    let mut create_info = vk::SemaphoreCreateInfo::default();
    if timeline_initial.is_some() {
        create_info = create_info.push_next(&mut type_info);
    }

    unsafe { device.create_semaphore(&create_info, None) }.map_err(|e| {
        map_vk_error(e, "Failed to create semaphore", GraphicsError::ResourceCreationFailed)
    })
}

/// Current counter value of a timeline semaphore.
pub fn semaphore_value(
    device: &ash::Device,
    semaphore: vk::Semaphore,
) -> Result<u64, GraphicsError> {
    unsafe { device.get_semaphore_counter_value(semaphore) }
        .map_err(|e| map_vk_error(e, "Failed to read semaphore value", GraphicsError::Internal))
}

/// Block until `semaphore` reaches `value` or `timeout` elapses.
pub fn wait_semaphore(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout: Duration,
) -> Result<WaitStatus, GraphicsError> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

    match unsafe { device.wait_semaphores(&wait_info, timeout_ns) } {
        Ok(()) => Ok(WaitStatus::Reached),
        Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
        Err(e) => Err(map_vk_error(
            e,
            "Failed to wait for semaphore",
            GraphicsError::Internal,
        )),
    }
}

/// Signal a timeline value from the host.
pub fn signal_semaphore(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
) -> Result<(), GraphicsError> {
    let signal_info = vk::SemaphoreSignalInfo::default()
        .semaphore(semaphore)
        .value(value);

    unsafe { device.signal_semaphore(&signal_info) }.map_err(|e| {
        map_vk_error(e, "Failed to signal semaphore", GraphicsError::Internal)
    })
}
