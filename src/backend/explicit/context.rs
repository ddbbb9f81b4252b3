// Context / SubContext caches
//
// A Context is the long-lived per-shader state: pipeline plus binding
// signature. A SubContext is one descriptor pool + set list instantiated
// for an exact binding set. Both are looked up by an Fx hash of their key
// and the full key is compared on every hit, so a hash collision is a miss
// rather than a wrong descriptor set.

use std::any::Any;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use anyhow::{Context as _, Result};
use ash::vk;
use rustc_hash::{FxHashMap, FxHasher};

use super::pipeline::{pool_sizes, ComputePipeline};
use super::VulkanDevice;
use crate::binding::{BoundResource, ResolvedBinding};
use crate::shader::ShaderSource;
use crate::types::{ComputeCommand, SamplerState};

fn fx_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Cache key of a Context
pub fn shader_key(shader: &str) -> u64 {
    fx_hash(shader)
}

/// Identity of whatever occupies one slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BoundId {
    ConstantBuffer(String),
    Srv(u64),
    Uav(u64),
    Sampler(SamplerState),
}

/// Everything a descriptor set instantiation depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub shader: String,
    pub cbuffer: Option<String>,
    pub dispatch: [u32; 3],
    pub slots: Vec<(u32, u32, BoundId)>,
}

impl BindingKey {
    pub fn new(command: &ComputeCommand<'_>, resolved: &[ResolvedBinding<'_>]) -> Self {
        let slots = resolved
            .iter()
            .map(|r| {
                let id = match r.resource {
                    BoundResource::ConstantBuffer(name) => BoundId::ConstantBuffer(name.to_string()),
                    BoundResource::Srv(view) => BoundId::Srv(view.id()),
                    BoundResource::Uav(view) => BoundId::Uav(view.id()),
                    BoundResource::Sampler(sampler) => BoundId::Sampler(sampler.state),
                };
                (r.group, r.binding, id)
            })
            .collect();

        Self {
            shader: command.shader.clone(),
            cbuffer: command.cbuffer.clone(),
            dispatch: command.dispatch,
            slots,
        }
    }

    pub fn hash64(&self) -> u64 {
        fx_hash(self)
    }
}

/// One descriptor-set instantiation of a Context
pub struct SubContext {
    device: Arc<VulkanDevice>,
    pub key: BindingKey,
    pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
    resources: Vec<Weak<dyn Any + Send + Sync>>,
}

impl SubContext {
    /// Allocate one set per layout of `pipeline`. Descriptors are written by
    /// the caller.
    pub fn new(
        device: &Arc<VulkanDevice>,
        shader: &ShaderSource,
        pipeline: &ComputePipeline,
        key: BindingKey,
        resources: Vec<Weak<dyn Any + Send + Sync>>,
    ) -> Result<Self> {
        let sizes = pool_sizes(&shader.bindings);
        let max_sets = pipeline.set_layouts.len().max(1) as u32;

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let mut sub_context = Self {
            device: device.clone(),
            key,
            pool,
            sets: Vec::new(),
            resources,
        };

        if !pipeline.set_layouts.is_empty() {
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&pipeline.set_layouts);

            sub_context.sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
                .context("Failed to allocate descriptor sets")?;
        }

        Ok(sub_context)
    }

    /// False once any resource it references has been released
    pub fn is_alive(&self) -> bool {
        self.resources.iter().all(|r| r.strong_count() > 0)
    }
}

impl Drop for SubContext {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// Per-shader state and its SubContexts
pub struct Context {
    pub shader: Arc<ShaderSource>,
    pub pipeline: ComputePipeline,
    sub_contexts: FxHashMap<u64, SubContext>,
}

impl Context {
    pub fn new(shader: Arc<ShaderSource>, pipeline: ComputePipeline) -> Self {
        Self {
            shader,
            pipeline,
            sub_contexts: FxHashMap::default(),
        }
    }

    /// Built against `shader`, not an older version of it
    pub fn is_current(&self, shader: &Arc<ShaderSource>) -> bool {
        Arc::ptr_eq(&self.shader, shader)
    }

    pub fn sub_context(&self, key: &BindingKey) -> Option<&SubContext> {
        self.sub_contexts
            .get(&key.hash64())
            .filter(|sub_context| sub_context.key == *key)
    }

    pub fn insert_sub_context(&mut self, sub_context: SubContext) {
        let hash = sub_context.key.hash64();

        if let Some(previous) = self.sub_contexts.insert(hash, sub_context) {
            log::warn!(
                "SubContext hash collision on shader \"{}\": {:?} replaced",
                self.shader.name,
                previous.key
            );
        }
    }

    /// Drop SubContexts that reference released resources
    pub fn prune(&mut self) -> usize {
        let before = self.sub_contexts.len();
        self.sub_contexts.retain(|_, sub_context| sub_context.is_alive());
        before - self.sub_contexts.len()
    }

    pub fn sub_context_count(&self) -> usize {
        self.sub_contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::resolve;
    use crate::tracker::ObjectTracker;
    use crate::types::{BufferObject, BufferParam, ViewFlags};

    const SHADER: &str = r#"
struct Globals { count: u32, }

@group(0) @binding(0) var<uniform> CBGlobal: Globals;
@group(0) @binding(1) var<storage, read> input: array<u32>;
@group(0) @binding(2) var<storage, read_write> output: array<u32>;

@compute @workgroup_size(64, 1, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < CBGlobal.count) {
        output[id.x] = input[id.x] * 2u;
    }
}
"#;

    fn buffer(tracker: &Arc<ObjectTracker>, flags: ViewFlags) -> BufferObject {
        let desc = Arc::new(BufferParam::new(16, 4, flags));
        BufferObject::new(desc, tracker.track(()), Vec::new())
    }

    #[test]
    fn identical_binding_sets_share_a_key() {
        let shader = ShaderSource::parse("double", SHADER).unwrap();
        let tracker = ObjectTracker::new();
        let input = buffer(&tracker, ViewFlags::SRV);
        let output = buffer(&tracker, ViewFlags::UAV);

        let make = || {
            ComputeCommand::new("double")
                .cbuffer("CBGlobal")
                .srv("input", input.srv().unwrap())
                .uav("output", output.uav().unwrap())
                .dispatch(1, 1, 1)
        };

        let first = make();
        let second = make();
        let a = BindingKey::new(&first, &resolve(&first, &shader.bindings).unwrap());
        let b = BindingKey::new(&second, &resolve(&second, &shader.bindings).unwrap());

        assert_eq!(a, b);
        assert_eq!(a.hash64(), b.hash64());
    }

    #[test]
    fn any_change_in_the_binding_set_changes_the_key() {
        let shader = ShaderSource::parse("double", SHADER).unwrap();
        let tracker = ObjectTracker::new();
        let input = buffer(&tracker, ViewFlags::SRV);
        let other_input = buffer(&tracker, ViewFlags::SRV);
        let output = buffer(&tracker, ViewFlags::UAV);

        let base = ComputeCommand::new("double")
            .cbuffer("CBGlobal")
            .srv("input", input.srv().unwrap())
            .uav("output", output.uav().unwrap());
        let base_key = BindingKey::new(&base, &resolve(&base, &shader.bindings).unwrap());

        let swapped = ComputeCommand::new("double")
            .cbuffer("CBGlobal")
            .srv("input", other_input.srv().unwrap())
            .uav("output", output.uav().unwrap());
        let swapped_key = BindingKey::new(&swapped, &resolve(&swapped, &shader.bindings).unwrap());

        let wider = ComputeCommand::new("double")
            .cbuffer("CBGlobal")
            .srv("input", input.srv().unwrap())
            .uav("output", output.uav().unwrap())
            .dispatch(2, 1, 1);
        let wider_key = BindingKey::new(&wider, &resolve(&wider, &shader.bindings).unwrap());

        assert_ne!(base_key, swapped_key);
        assert_ne!(base_key, wider_key);
        assert_ne!(base_key.hash64(), swapped_key.hash64());
    }

    #[test]
    fn shader_keys_are_stable() {
        assert_eq!(shader_key("downsample"), shader_key("downsample"));
        assert_ne!(shader_key("downsample"), shader_key("color_mips"));
    }
}
