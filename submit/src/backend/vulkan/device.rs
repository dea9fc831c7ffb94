//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::error::GraphicsError;
use crate::types::{MemoryModel, QueueKind};

use super::instance::REQUIRED_API_VERSION;

/// Where each queue kind is served.
///
/// Kinds without a dedicated family fall back to the graphics queue, so
/// `hardware` may map several kinds to the same queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTopology {
    /// Queue family per queue kind.
    pub families: [u32; QueueKind::COUNT],
    /// Hardware queue index per queue kind. Equal to the family index, since
    /// one queue is created per family.
    pub hardware: [usize; QueueKind::COUNT],
}

impl QueueTopology {
    /// Distinct families to create queues for.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = self.families.to_vec();
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Select the best physical device for rendering.
///
/// Prefers discrete GPUs over integrated GPUs. Devices below Vulkan 1.2 or
/// without timeline semaphores are skipped.
pub fn select_physical_device(
    instance: &ash::Instance,
) -> Result<vk::PhysicalDevice, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best_device = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {:?}: Vulkan 1.2 not supported", device_name);
            continue;
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features =
            vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_12_features);
        unsafe { instance.get_physical_device_features2(device, &mut features) };
        if vulkan_12_features.timeline_semaphore == vk::FALSE {
            log::info!("Skipping GPU {:?}: no timeline semaphores", device_name);
            continue;
        }

        // Always positive so any suitable device beats "none".
        let mut score = 1;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 100;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        if find_dedicated(&families, vk::QueueFlags::TRANSFER).is_some() {
            score += 10;
        }
        if find_dedicated(&families, vk::QueueFlags::COMPUTE).is_some() {
            score += 10;
        }

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Map graphics, compute and transfer onto queue families.
///
/// Compute prefers a family without graphics; transfer prefers one with
/// neither graphics nor compute. Missing dedicated families alias the
/// graphics queue.
pub fn find_queue_topology(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueTopology, GraphicsError> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let graphics = families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .ok_or_else(|| {
            GraphicsError::InitializationFailed("No graphics queue family found".to_string())
        })? as u32;

    let compute = find_dedicated(&families, vk::QueueFlags::COMPUTE).unwrap_or(graphics);
    let transfer = find_dedicated(&families, vk::QueueFlags::TRANSFER).unwrap_or(graphics);

    let mut topology = QueueTopology {
        families: [0; QueueKind::COUNT],
        hardware: [0; QueueKind::COUNT],
    };
    for (kind, family) in [
        (QueueKind::Graphics, graphics),
        (QueueKind::Compute, compute),
        (QueueKind::Transfer, transfer),
    ] {
        topology.families[kind.index()] = family;
        topology.hardware[kind.index()] = family as usize;
    }

    log::info!(
        "Queue families: graphics {}, compute {}, transfer {}",
        graphics,
        compute,
        transfer
    );
    Ok(topology)
}

/// Family that supports `wanted` and as few other capabilities as possible.
fn find_dedicated(families: &[vk::QueueFamilyProperties], wanted: vk::QueueFlags) -> Option<u32> {
    let excluded = if wanted == vk::QueueFlags::TRANSFER {
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE
    } else {
        vk::QueueFlags::GRAPHICS
    };

    families
        .iter()
        .position(|family| {
            family.queue_count > 0
                && family.queue_flags.contains(wanted)
                && !family.queue_flags.intersects(excluded)
        })
        .map(|index| index as u32)
}

/// Whether the device has memory that is device-local, host-visible and
/// host-coherent at once.
pub fn detect_memory_model(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> MemoryModel {
    let properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let unified = vk::MemoryPropertyFlags::DEVICE_LOCAL
        | vk::MemoryPropertyFlags::HOST_VISIBLE
        | vk::MemoryPropertyFlags::HOST_COHERENT;

    let coherent = properties.memory_types_as_slice()
        .iter()
        .any(|memory_type| memory_type.property_flags.contains(unified));

    if coherent {
        MemoryModel::Coherent
    } else {
        MemoryModel::NonCoherent
    }
}

/// Whether the device can present to surfaces.
pub fn supports_swapchain(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let Ok(extensions) =
        (unsafe { instance.enumerate_device_extension_properties(physical_device) })
    else {
        return false;
    };

    extensions.iter().any(|extension| {
        extension
            .extension_name_as_c_str()
            .is_ok_and(|name| name == ash::khr::swapchain::NAME)
    })
}

/// Create a logical device with one queue per family in `topology`.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    topology: &QueueTopology,
    enable_swapchain: bool,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = topology
        .unique_families()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let device_extensions = if enable_swapchain {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    } else {
        vec![]
    };

    let mut vulkan_12_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_12_features);

    let device =
        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
        })?;

    Ok(device)
}
