// Compute command
//
// A transient, name-keyed record of what a dispatch binds. Names are the
// variable names declared in the shader; the device resolves them to slots.

use std::collections::BTreeMap;

use super::view::{Sampler, ShaderResourceView, UnorderedAccessView};

#[derive(Debug, Clone, Default)]
pub struct ComputeCommand<'a> {
    /// Name of a loaded shader
    pub shader: String,
    /// Name of the constant buffer to bind, as declared in the shader
    pub cbuffer: Option<String>,
    /// Number of workgroups on each axis
    pub dispatch: [u32; 3],
    pub srv_bindings: BTreeMap<String, &'a ShaderResourceView>,
    pub uav_bindings: BTreeMap<String, &'a UnorderedAccessView>,
    pub ss_bindings: BTreeMap<String, Sampler>,
}

impl<'a> ComputeCommand<'a> {
    pub fn new(shader: impl Into<String>) -> Self {
        Self {
            shader: shader.into(),
            dispatch: [1, 1, 1],
            ..Default::default()
        }
    }

    pub fn cbuffer(mut self, name: impl Into<String>) -> Self {
        self.cbuffer = Some(name.into());
        self
    }

    pub fn dispatch(mut self, x: u32, y: u32, z: u32) -> Self {
        self.dispatch = [x, y, z];
        self
    }

    pub fn srv(mut self, name: impl Into<String>, view: &'a ShaderResourceView) -> Self {
        self.srv_bindings.insert(name.into(), view);
        self
    }

    pub fn uav(mut self, name: impl Into<String>, view: &'a UnorderedAccessView) -> Self {
        self.uav_bindings.insert(name.into(), view);
        self
    }

    pub fn sampler(mut self, name: impl Into<String>, sampler: Sampler) -> Self {
        self.ss_bindings.insert(name.into(), sampler);
        self
    }

    pub fn binding_count(&self) -> usize {
        self.srv_bindings.len() + self.uav_bindings.len() + self.ss_bindings.len()
    }
}
