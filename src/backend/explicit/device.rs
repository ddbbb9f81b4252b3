// Vulkan compute device
//
// One instance, one physical device, one queue with compute support. The
// device must expose Vulkan 1.2 timeline semaphores, which back the
// completion counter of every command stream. Memory comes from a single
// gpu-allocator instance guarded by a mutex.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// What the debug-utils extension is loaded for. Command labels need the
/// extension alone; the messenger only makes sense with validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DebugSetup {
    extension: bool,
    messenger: bool,
}

impl DebugSetup {
    fn new(validation: bool, labels: bool) -> Self {
        Self {
            extension: validation || labels,
            messenger: validation,
        }
    }
}

/// Optional capabilities found on the selected device
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportedFeatures {
    pub subgroup_arithmetic: bool,
    pub float32_filterable: bool,
    pub storage_16bit_norm: bool,
    pub image_cube_array: bool,
}

/// Shared through `Arc` by every allocation, so it outlives all of them
pub struct VulkanDevice {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub compute_queue: vk::Queue,
    pub compute_queue_family: u32,

    debug_utils: Option<ash::extensions::ext::DebugUtils>,
    messenger: Option<vk::DebugUtilsMessengerEXT>,

    pub properties: vk::PhysicalDeviceProperties,
    pub features: SupportedFeatures,
}

struct Candidate {
    device: vk::PhysicalDevice,
    queue_family: u32,
    score: u32,
}

impl VulkanDevice {
    /// `debug_labels` loads debug utils for command buffer labels even
    /// without validation. `prefer_software` ranks CPU implementations
    /// (lavapipe, SwiftShader) above any GPU.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        debug_labels: bool,
        prefer_software: bool,
    ) -> Result<Arc<Self>> {
        log::info!("Bringing up Vulkan for {}", app_name);

        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && Self::has_validation_layer(&entry);
        let debug_labels = debug_labels && Self::has_debug_utils(&entry);
        let debug = DebugSetup::new(enable_validation, debug_labels);
        let instance = Self::create_instance(&entry, app_name, enable_validation, debug.extension)?;

        let debug_utils = debug
            .extension
            .then(|| ash::extensions::ext::DebugUtils::new(&entry, &instance));

        let messenger = match &debug_utils {
            Some(utils) if debug.messenger => Some(Self::setup_debug_messenger(utils)?),
            _ => None,
        };

        let candidate = Self::pick_physical_device(&instance, prefer_software)?;
        let physical_device = candidate.device;
        let compute_queue_family = candidate.queue_family;

        let features = Self::query_features(&instance, physical_device);
        let (device, compute_queue) =
            Self::create_logical_device(&instance, physical_device, compute_queue_family, &features)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::debug!("Device features: {:?}", features);

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            compute_queue,
            compute_queue_family,
            debug_utils,
            messenger,
            properties,
            features,
        }))
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Present when validation or command labels were requested
    pub fn debug_utils(&self) -> Option<&ash::extensions::ext::DebugUtils> {
        self.debug_utils.as_ref()
    }

    fn has_debug_utils(entry: &Entry) -> bool {
        let extensions = entry.enumerate_instance_extension_properties(None).unwrap_or_default();
        let found = extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == ash::extensions::ext::DebugUtils::name()
        });

        if !found {
            log::warn!("Capture requested but VK_EXT_debug_utils is missing, commands will not be labeled");
        }

        found
    }

    fn has_validation_layer(entry: &Entry) -> bool {
        let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if !found {
            log::warn!("Validation layer requested but not installed, continuing without it");
        }

        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        enable_debug_utils: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("cubemill")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = Vec::new();
        let mut layer_names = Vec::new();

        if enable_debug_utils {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        if enable_validation {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(debug_utils: &ash::extensions::ext::DebugUtils) -> Result<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(messenger)
    }

    fn pick_physical_device(instance: &ash::Instance, prefer_software: bool) -> Result<Candidate> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable device found");
        }

        let mut best: Option<Candidate> = None;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if props.api_version < vk::API_VERSION_1_2 {
                log::debug!("Skipping {}: Vulkan 1.2 required", name);
                continue;
            }

            let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut vk12);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };

            if vk12.timeline_semaphore != vk::TRUE {
                log::debug!("Skipping {}: no timeline semaphores", name);
                continue;
            }

            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

            let compute_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .map(|(i, _)| i as u32);

            let Some(queue_family) = compute_family else {
                continue;
            };

            let score = match (props.device_type, prefer_software) {
                (vk::PhysicalDeviceType::CPU, true) => 2000,
                (vk::PhysicalDeviceType::DISCRETE_GPU, _) => 1000,
                (vk::PhysicalDeviceType::INTEGRATED_GPU, _) => 100,
                _ => 1,
            };

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    device,
                    queue_family,
                    score,
                });
            }
        }

        best.ok_or_else(|| anyhow::anyhow!("No device with a compute queue and Vulkan 1.2 found"))
    }

    fn query_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> SupportedFeatures {
        let base = unsafe { instance.get_physical_device_features(device) };

        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut subgroup);
        unsafe { instance.get_physical_device_properties2(device, &mut props2) };

        let format_supports = |format: vk::Format, flags: vk::FormatFeatureFlags| {
            let props = unsafe { instance.get_physical_device_format_properties(device, format) };
            props.optimal_tiling_features.contains(flags)
        };

        SupportedFeatures {
            subgroup_arithmetic: subgroup.supported_stages.contains(vk::ShaderStageFlags::COMPUTE)
                && subgroup
                    .supported_operations
                    .contains(vk::SubgroupFeatureFlags::BASIC | vk::SubgroupFeatureFlags::ARITHMETIC),
            float32_filterable: format_supports(
                vk::Format::R32G32B32A32_SFLOAT,
                vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
            ),
            storage_16bit_norm: format_supports(vk::Format::R16G16B16A16_UNORM, vk::FormatFeatureFlags::STORAGE_IMAGE),
            image_cube_array: base.image_cube_array == vk::TRUE,
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        compute_queue_family: u32,
        supported: &SupportedFeatures,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(compute_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let base = unsafe { instance.get_physical_device_features(physical_device) };

        let features = vk::PhysicalDeviceFeatures {
            image_cube_array: supported.image_cube_array as vk::Bool32,
            shader_storage_image_extended_formats: base.shader_storage_image_extended_formats,
            ..Default::default()
        };

        let mut vk12 = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&features)
            .push_next(&mut vk12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let compute_queue = unsafe { device.get_device_queue(compute_queue_family, 0) };

        Ok((device, compute_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(allocator)
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::debug!("Releasing Vulkan device");

        let _ = self.wait_idle();

        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.messenger.take()) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

// Validation messages go through the log facade
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    let level = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        _ => log::Level::Debug,
    };
    log::log!(target: "cubemill::vulkan", level, "{}", message);

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_load_debug_utils_without_validation() {
        assert_eq!(
            DebugSetup::new(false, true),
            DebugSetup {
                extension: true,
                messenger: false
            }
        );
        assert_eq!(
            DebugSetup::new(true, false),
            DebugSetup {
                extension: true,
                messenger: true
            }
        );
        assert!(!DebugSetup::new(false, false).extension);
    }
}
