// Compute pipeline creation
//
// The binding signature of a shader is one descriptor set layout per bind
// group, built from the reflected binding table. The pipeline layout and
// the pipeline live as long as the shader's Context.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use super::shader::create_shader_module;
use super::VulkanDevice;
use crate::shader::{BindingTable, SlotKind, ENTRY_POINT};

pub fn descriptor_type(kind: &SlotKind) -> vk::DescriptorType {
    match kind {
        SlotKind::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
        SlotKind::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
        SlotKind::SampledTexture { .. } => vk::DescriptorType::SAMPLED_IMAGE,
        SlotKind::StorageTexture { .. } => vk::DescriptorType::STORAGE_IMAGE,
        SlotKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

/// Descriptor counts needed for one instantiation of `table`
pub fn pool_sizes(table: &BindingTable) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();

    for slot in table.iter() {
        let ty = descriptor_type(&slot.kind);

        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: 1,
            }),
        }
    }

    sizes
}

/// Layout bindings of `group`, ordered by binding index
pub fn layout_bindings(table: &BindingTable, group: u32) -> Vec<vk::DescriptorSetLayoutBinding> {
    table
        .group(group)
        .into_iter()
        .map(|slot| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(slot.binding)
                .descriptor_type(descriptor_type(&slot.kind))
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build()
        })
        .collect()
}

/// Pipeline, layout and binding signature of one shader
pub struct ComputePipeline {
    device: Arc<VulkanDevice>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl ComputePipeline {
    pub fn new(device: &Arc<VulkanDevice>, name: &str, table: &BindingTable, spirv: &[u32]) -> Result<Self> {
        let mut pipeline = Self {
            device: device.clone(),
            set_layouts: Vec::new(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };

        for group in 0..table.group_count() {
            let bindings = layout_bindings(table, group);
            let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

            let set_layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
                .context("Failed to create descriptor set layout")?;
            pipeline.set_layouts.push(set_layout);
        }

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&pipeline.set_layouts);

        pipeline.layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let module = create_shader_module(device, spirv)?;
        let entry_point = CString::new(ENTRY_POINT)?;

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline.layout)
            .build();

        let created = unsafe {
            device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        unsafe { device.device.destroy_shader_module(module, None) };

        let pipelines = created
            .map_err(|(_, e)| e)
            .with_context(|| format!("Failed to create compute pipeline \"{}\"", name))?;

        pipeline.pipeline = pipelines[0];

        log::debug!(
            "Built compute pipeline \"{}\" with {} descriptor set(s)",
            name,
            pipeline.set_layouts.len()
        );

        Ok(pipeline)
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);

            for set_layout in &self.set_layouts {
                self.device.device.destroy_descriptor_set_layout(*set_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderSource;

    const SHADER: &str = r#"
struct Globals { targetMip: i32, }

@group(0) @binding(0) var<uniform> CBGlobal: Globals;
@group(0) @binding(1) var srcMip: texture_2d_array<f32>;
@group(0) @binding(2) var srcOther: texture_2d_array<f32>;
@group(1) @binding(0) var dstMipSlice: texture_storage_2d_array<rgba16float, write>;
@group(1) @binding(3) var ssPoint: sampler;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let a = textureSampleLevel(srcMip, ssPoint, vec2<f32>(0.0), i32(id.z), 0.0);
    let b = textureSampleLevel(srcOther, ssPoint, vec2<f32>(0.0), i32(id.z), f32(CBGlobal.targetMip));
    textureStore(dstMipSlice, id.xy, i32(id.z), a + b);
}
"#;

    #[test]
    fn pool_sizes_count_each_descriptor_type() {
        let shader = ShaderSource::parse("two_groups", SHADER).unwrap();
        let mut sizes = pool_sizes(&shader.bindings);
        sizes.sort_by_key(|s| s.ty.as_raw());

        let counts: Vec<_> = sizes.iter().map(|s| (s.ty, s.descriptor_count)).collect();
        let mut expected = vec![
            (vk::DescriptorType::SAMPLER, 1),
            (vk::DescriptorType::SAMPLED_IMAGE, 2),
            (vk::DescriptorType::STORAGE_IMAGE, 1),
            (vk::DescriptorType::UNIFORM_BUFFER, 1),
        ];
        expected.sort_by_key(|(ty, _)| ty.as_raw());

        assert_eq!(counts, expected);
    }

    #[test]
    fn layout_bindings_follow_groups() {
        let shader = ShaderSource::parse("two_groups", SHADER).unwrap();

        let group0 = layout_bindings(&shader.bindings, 0);
        assert_eq!(group0.iter().map(|b| b.binding).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(group0[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);

        let group1 = layout_bindings(&shader.bindings, 1);
        assert_eq!(group1.iter().map(|b| b.binding).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(group1[1].descriptor_type, vk::DescriptorType::SAMPLER);
        assert!(group1.iter().all(|b| b.stage_flags == vk::ShaderStageFlags::COMPUTE));
    }
}
