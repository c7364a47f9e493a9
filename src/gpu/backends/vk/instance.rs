use std::ffi::{c_char, c_void, CStr, CString};
use ash::vk;
use color_eyre::Result;
use crate::gpu::config::ContextConfig;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Loads Vulkan and keeps the instance, and the debug messenger when
/// validation is on, alive.
pub struct VulkanInstance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// `surface_extensions` are the instance extensions the window system
    /// needs, empty for contexts that do not present.
    pub fn new(
        config: &ContextConfig,
        surface_extensions: &[&'static CStr],
    ) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let validation = config.validation_enabled && Self::validation_layer_supported(&entry)?;
        if config.validation_enabled && !validation {
            log::warn!("Validation layer {:?} not available, continuing without it", VALIDATION_LAYER);
        }

        let app_name = CString::new(config.app_name.as_str())?;
        let application_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(c"raxa")
            .api_version(vk::API_VERSION_1_3);

        let enabled_layer_names = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let mut extensions = surface_extensions.to_vec();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME);
        }
        #[cfg(target_os = "macos")]
        {
            extensions.push(ash::khr::portability_enumeration::NAME);
            extensions.push(ash::khr::get_physical_device_properties2::NAME);
        }
        let enabled_extension_names = extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        let mut debug_info = debug_utils_messenger_create_info();
        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if validation {
            instance_info = instance_info.push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info
            .flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match unsafe { loader.create_debug_utils_messenger(&debug_utils_messenger_create_info(), None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        log::debug!("Vulkan instance created (validation: {})", validation);
        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn validation_layer_supported(entry: &ash::Entry) -> Result<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(layers
            .iter()
            .filter_map(|props| props.layer_name_as_c_str().ok())
            .any(|name| name == VALIDATION_LAYER))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Instance extensions and surface of a window.
#[cfg(feature = "graphics")]
pub mod window {
    use std::ffi::CStr;
    use ash::vk;
    use color_eyre::Result;
    use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
    use winit::window::Window;

    pub fn required_extensions(window: &Window) -> Result<Vec<&'static CStr>> {
        Ok(ash_window::enumerate_required_extensions(window.display_handle()?.as_raw())?
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(*ext) })
            .collect())
    }

    pub fn create_surface(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &Window,
    ) -> Result<vk::SurfaceKHR> {
        Ok(unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.display_handle()?.as_raw(),
                window.window_handle()?.as_raw(),
                None,
            )?
        })
    }
}

fn debug_utils_messenger_create_info(
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_severity = vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(message_severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let msg_type = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let msg = unsafe {
        let data = &*p_callback_data;
        if data.p_message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(data.p_message)
    };
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            log::trace!("[Verbose]{} {:?}", msg_type, msg);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Warning]{} {:?}", msg_type, msg);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Error]{} {:?}", msg_type, msg);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Info]{} {:?}", msg_type, msg);
        }
        _ => {
            log::warn!("[Unknown]{} {:?}", msg_type, msg);
        }
    }

    vk::FALSE
}
