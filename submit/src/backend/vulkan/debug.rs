//! Validation output routed into `log`, and debug labels for GPU objects.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::GraphicsError;

/// Create a messenger that forwards validation messages to `log`.
///
/// INFO-level chatter from the loader is dropped; submission problems show up
/// as validation warnings or errors.
pub fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> Result<vk::DebugUtilsMessengerEXT, GraphicsError> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_to_log));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("debug messenger creation failed: {e:?}"))
    })
}

/// Attach a debug label to a Vulkan object so validation output names it.
///
/// Labels are best effort: a label with an interior nul or a failed call is
/// logged and otherwise ignored.
pub fn set_object_name<H: vk::Handle>(
    debug_device: &ash::ext::debug_utils::Device,
    handle: H,
    label: &str,
) {
    let Ok(name) = CString::new(label) else {
        log::trace!("Skipping debug label with interior nul: {:?}", label);
        return;
    };

    let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
        .object_handle(handle)
        .object_name(&name);

    if let Err(e) = unsafe { debug_device.set_debug_utils_object_name(&name_info) } {
        log::trace!("Failed to set debug label '{}': {:?}", label, e);
    }
}

/// Read a driver-owned C string, tolerating null.
///
/// # Safety
///
/// `ptr` must be null or point to a nul-terminated string that outlives the call.
unsafe fn driver_str(ptr: *const std::ffi::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and nul-terminated per the caller's contract
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Labels of the objects a message refers to, e.g. `["staging copy slot 1"]`.
///
/// # Safety
///
/// `data` must be the callback data the driver passed to the messenger.
unsafe fn object_labels(data: &vk::DebugUtilsMessengerCallbackDataEXT<'_>) -> Vec<String> {
    if data.p_objects.is_null() || data.object_count == 0 {
        return Vec::new();
    }
    // SAFETY: the driver provides `object_count` entries at `p_objects`
    let objects = unsafe { std::slice::from_raw_parts(data.p_objects, data.object_count as usize) };
    objects
        .iter()
        .filter_map(|object| unsafe { driver_str(object.p_object_name) })
        .collect()
}

unsafe extern "system" fn forward_to_log(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes null or valid callback data for this call
    let Some(data) = (unsafe { callback_data.as_ref() }) else {
        return vk::FALSE;
    };

    let (message, id, labels) = unsafe {
        (
            driver_str(data.p_message).unwrap_or_default(),
            driver_str(data.p_message_id_name).unwrap_or_default(),
            object_labels(data),
        )
    };
    let kind = if message_type.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "validation"
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("Vulkan {} {} {:?}: {}", kind, id, labels, message);
    } else {
        log::warn!("Vulkan {} {} {:?}: {}", kind, id, labels, message);
    }

    vk::FALSE
}
