// Shader module creation
//
// Vulkan consumes SPIR-V. Modules are built from the words naga emits for
// the reflected WGSL and only live long enough to create a pipeline.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
