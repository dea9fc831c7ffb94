//! Vulkan instance creation and configuration.

use std::ffi::CStr;

use ash::vk;

use crate::error::GraphicsError;

use super::debug;

/// Required Vulkan API version. Timeline semaphores are core in 1.2.
pub const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Validation layer name.
const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Surface extensions enabled when the loader offers them.
///
/// Surfaces are created by the windowing layer; the instance only has to
/// allow them. A headless loader without these still yields a usable
/// instance.
const SURFACE_EXTENSIONS: &[&CStr] = &[
    ash::khr::surface::NAME,
    #[cfg(target_os = "windows")]
    ash::khr::win32_surface::NAME,
    #[cfg(target_os = "linux")]
    ash::khr::xlib_surface::NAME,
    #[cfg(target_os = "linux")]
    ash::khr::wayland_surface::NAME,
    #[cfg(target_os = "macos")]
    ash::ext::metal_surface::NAME,
];

/// Instance together with its optional debug messenger.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub surface_supported: bool,
}

/// Create a Vulkan instance with optional validation layers.
pub fn create_instance(
    entry: &ash::Entry,
    validation_enabled: bool,
) -> Result<InstanceBundle, GraphicsError> {
    let loader_version = unsafe { entry.try_enumerate_instance_version() }
        .ok()
        .flatten()
        .unwrap_or(vk::API_VERSION_1_0);
    if loader_version < REQUIRED_API_VERSION {
        return Err(GraphicsError::InitializationFailed(format!(
            "Vulkan loader supports {}.{}, timeline semaphores need 1.2",
            vk::api_version_major(loader_version),
            vk::api_version_minor(loader_version)
        )));
    }

    let available = available_extensions(entry);
    let validation_available = validation_enabled
        && check_validation_layer_support(entry)
        && available.contains(&ash::ext::debug_utils::NAME);

    if validation_enabled && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"RedLilium")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"RedLilium Engine")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions: Vec<*const std::ffi::c_char> = SURFACE_EXTENSIONS
        .iter()
        .filter(|name| available.contains(*name))
        .map(|name| name.as_ptr())
        .collect();
    let surface_supported = !extensions.is_empty();

    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layer_names: Vec<*const std::ffi::c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })?;

    let (debug_messenger, debug_utils) = if validation_available {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        let messenger = debug::create_debug_messenger(&debug_utils)?;
        (Some(messenger), Some(debug_utils))
    } else {
        (None, None)
    };

    Ok(InstanceBundle {
        instance,
        debug_messenger,
        debug_utils,
        surface_supported,
    })
}

fn available_extensions(entry: &ash::Entry) -> Vec<&'static CStr> {
    let Ok(properties) = (unsafe { entry.enumerate_instance_extension_properties(None) }) else {
        return Vec::new();
    };

    let known = SURFACE_EXTENSIONS
        .iter()
        .copied()
        .chain(std::iter::once(ash::ext::debug_utils::NAME));
    known
        .filter(|name| {
            properties.iter().any(|property| {
                property.extension_name_as_c_str().is_ok_and(|available| available == *name)
            })
        })
        .collect()
}

/// Check if the validation layer is available.
fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available_layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };

    available_layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
    })
}
