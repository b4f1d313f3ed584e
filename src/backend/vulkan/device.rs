//! Instance, physical device and logical device setup for headless rendering.

use std::ffi::{CStr, CString};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::backend::{BackendError, BackendResult, QueueFamilies};

use super::VulkanConfig;

/// Timeline semaphores are core in 1.2.
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance-level objects.
pub struct InstanceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl InstanceContext {
    pub fn new(config: &VulkanConfig) -> BackendResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to load Vulkan library: {e}"))
        })?;

        let validation = config.validation && check_validation_layer_support(&entry);
        if config.validation && !validation {
            log::warn!("Validation layers requested but not available");
        }

        let app_name = CString::new(config.app_name.as_str()).map_err(|e| {
            BackendError::InitializationFailed(format!("Invalid application name: {e}"))
        })?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"cluster-renderer")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(REQUIRED_API_VERSION);

        let mut extensions = Vec::new();
        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        #[cfg(target_os = "macos")]
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());

        let layers = if validation {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        #[allow(unused_mut)]
        let mut flags = vk::InstanceCreateFlags::empty();
        #[cfg(target_os = "macos")]
        {
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create Vulkan instance: {e:?}"))
        })?;

        let debug_utils = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match create_debug_messenger(&loader) {
                Ok(messenger) => Some((loader, messenger)),
                Err(err) => {
                    log::warn!("{err}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    /// # Safety
    /// Every object created from the instance must already be destroyed.
    pub unsafe fn destroy(&mut self) {
        if let Some((loader, messenger)) = self.debug_utils.take() {
            loader.destroy_debug_utils_messenger(messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}

fn create_debug_messenger(
    loader: &ash::ext::debug_utils::Instance,
) -> BackendResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { loader.create_debug_utils_messenger(&create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create debug messenger: {e:?}"))
    })
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the loader passes either null or valid callback data
    let message = match unsafe { callback_data.as_ref() } {
        Some(data) if !data.p_message.is_null() => {
            unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy().into_owned()
        }
        _ => String::from("(no message)"),
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message}");
    } else {
        log::warn!("[Vulkan] {message}");
    }
    vk::FALSE
}

/// The selected GPU and the queue families the renderer uses.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceInfo {
    pub physical_device: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub limits: vk::PhysicalDeviceLimits,
    /// Valid timestamp bits of the graphics and compute family.
    pub timestamp_bits: [u32; 2],
}

/// Pick the highest scoring device that has every required feature.
///
/// Discrete GPUs are preferred over integrated ones.
pub fn select_physical_device(
    instance: &ash::Instance,
    config: &VulkanConfig,
) -> BackendResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to enumerate physical devices: {e:?}"))
    })?;

    let device_count = devices.len();
    let mut best: Option<(u32, PhysicalDeviceInfo)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {name:?}: Vulkan 1.2 unavailable");
            continue;
        }
        let missing = device_missing_features(instance, device);
        if !missing.is_empty() {
            log::info!("Skipping GPU {name:?}: missing features {missing:?}");
            continue;
        }
        let Some((families, timestamp_bits)) = find_queue_families(instance, device, config) else {
            log::info!("Skipping GPU {name:?}: no graphics queue family");
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((
                score,
                PhysicalDeviceInfo {
                    physical_device: device,
                    families,
                    limits: properties.limits,
                    timestamp_bits,
                },
            ));
        }
    }

    match best {
        Some((_, info)) => Ok(info),
        None if device_count == 0 => Err(BackendError::InitializationFailed("No GPU found".to_string())),
        None => Err(BackendError::Unsupported(format!(
            "none of {device_count} GPUs offers the required features and a graphics queue"
        ))),
    }
}

/// Core features the renderer enables. The clustering fragment shader writes
/// the grid flags storage buffer.
pub fn required_features() -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures::default().fragment_stores_and_atomics(true)
}

/// Names of required features the device lacks.
pub fn missing_features(
    features: &vk::PhysicalDeviceFeatures,
    vulkan_12: &vk::PhysicalDeviceVulkan12Features<'_>,
) -> Vec<&'static str> {
    let required = required_features();
    let mut missing = Vec::new();
    if required.fragment_stores_and_atomics == vk::TRUE
        && features.fragment_stores_and_atomics != vk::TRUE
    {
        missing.push("fragmentStoresAndAtomics");
    }
    if vulkan_12.timeline_semaphore != vk::TRUE {
        missing.push("timelineSemaphore");
    }
    missing
}

fn device_missing_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> Vec<&'static str> {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_12);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let core = features.features;
    missing_features(&core, &vulkan_12)
}

/// Graphics family plus a compute family, which is a dedicated one when
/// requested and available.
fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    config: &VulkanConfig,
) -> Option<(QueueFamilies, [u32; 2])> {
    let properties = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let graphics = properties.iter().position(|family| {
        family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })?;
    let dedicated_compute = properties.iter().position(|family| {
        family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });
    let compute = match dedicated_compute {
        Some(index) if config.prefer_separate_compute => index,
        _ => graphics,
    };
    Some((
        QueueFamilies {
            graphics: graphics as u32,
            compute: compute as u32,
        },
        [
            properties[graphics].timestamp_valid_bits,
            properties[compute].timestamp_valid_bits,
        ],
    ))
}

/// Create the logical device with one queue per used family.
pub fn create_logical_device(
    instance: &ash::Instance,
    info: &PhysicalDeviceInfo,
) -> BackendResult<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos: Vec<_> = info
        .families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
    let features = required_features();

    #[allow(unused_mut)]
    let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME.as_ptr());

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut vulkan_12);

    unsafe { instance.create_device(info.physical_device, &create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
    })
}

pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> BackendResult<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_stores_requested() {
        assert_eq!(required_features().fragment_stores_and_atomics, vk::TRUE);
    }

    #[test]
    fn test_missing_features_reported() {
        let none = vk::PhysicalDeviceFeatures::default();
        let no_timeline = vk::PhysicalDeviceVulkan12Features::default();
        assert_eq!(
            missing_features(&none, &no_timeline),
            vec!["fragmentStoresAndAtomics", "timelineSemaphore"]
        );

        let stores = vk::PhysicalDeviceFeatures::default().fragment_stores_and_atomics(true);
        let timeline = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        assert!(missing_features(&stores, &timeline).is_empty());
        assert_eq!(missing_features(&none, &timeline), vec!["fragmentStoresAndAtomics"]);
    }
}
