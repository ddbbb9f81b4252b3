// Named binding resolution
//
// Turns the name-keyed maps of a command into a slot-ordered list. Either
// every name resolves or nothing does: backends only mutate state after
// this has succeeded.

use crate::error::{DeviceError, Result};
use crate::shader::{BindingSlot, BindingTable, SlotKind};
use crate::types::{ComputeCommand, Sampler, ShaderResourceView, SrvKind, UavKind, UnorderedAccessView, ViewDimension};

#[derive(Debug, Clone, Copy)]
pub enum BoundResource<'c> {
    /// Constant buffer, by name
    ConstantBuffer(&'c str),
    Srv(&'c ShaderResourceView),
    Uav(&'c UnorderedAccessView),
    Sampler(Sampler),
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedBinding<'c> {
    pub group: u32,
    pub binding: u32,
    pub resource: BoundResource<'c>,
}

fn mismatch(shader: &str, slot: &BindingSlot, expected: impl Into<String>) -> DeviceError {
    DeviceError::BindingMismatch {
        shader: shader.to_string(),
        name: slot.name.clone(),
        expected: expected.into(),
    }
}

fn lookup<'t>(shader: &str, table: &'t BindingTable, name: &str) -> Result<&'t BindingSlot> {
    table.get(name).ok_or_else(|| DeviceError::UnresolvedBinding {
        shader: shader.to_string(),
        name: name.to_string(),
    })
}

/// Resolve every binding of `command` against `table`, ordered by
/// (group, binding)
pub fn resolve<'c>(command: &'c ComputeCommand<'_>, table: &BindingTable) -> Result<Vec<ResolvedBinding<'c>>> {
    let shader = command.shader.as_str();
    let mut resolved = Vec::with_capacity(command.binding_count() + 1);

    if let Some(cbuffer) = &command.cbuffer {
        let slot = lookup(shader, table, cbuffer)?;

        if !matches!(slot.kind, SlotKind::UniformBuffer { .. }) {
            return Err(mismatch(shader, slot, "a constant buffer"));
        }

        resolved.push(ResolvedBinding {
            group: slot.group,
            binding: slot.binding,
            resource: BoundResource::ConstantBuffer(cbuffer.as_str()),
        });
    }

    for (name, view) in &command.srv_bindings {
        let slot = lookup(shader, table, name)?;
        let view: &'c ShaderResourceView = view;

        match (&slot.kind, view.kind()) {
            (SlotKind::StorageBuffer { read_only: true }, SrvKind::Buffer) => {}
            (SlotKind::SampledTexture { dimension }, kind) if kind != SrvKind::Buffer => {
                if *dimension != view.dimension() {
                    return Err(mismatch(shader, slot, format!("a {:?} view, got {:?}", dimension, view.dimension())));
                }
            }
            _ => return Err(mismatch(shader, slot, format!("a binding compatible with {:?}", slot.kind))),
        }

        resolved.push(ResolvedBinding {
            group: slot.group,
            binding: slot.binding,
            resource: BoundResource::Srv(view),
        });
    }

    for (name, view) in &command.uav_bindings {
        let slot = lookup(shader, table, name)?;
        let view: &'c UnorderedAccessView = view;

        match (&slot.kind, view.kind()) {
            (SlotKind::StorageBuffer { read_only: false }, UavKind::Buffer) => {}
            (SlotKind::StorageTexture { dimension, .. }, UavKind::Mip(_)) => {
                if *dimension != view.dimension() {
                    return Err(mismatch(shader, slot, format!("a {:?} view, got {:?}", dimension, view.dimension())));
                }
            }
            _ => return Err(mismatch(shader, slot, format!("a binding compatible with {:?}", slot.kind))),
        }

        resolved.push(ResolvedBinding {
            group: slot.group,
            binding: slot.binding,
            resource: BoundResource::Uav(view),
        });
    }

    for (name, sampler) in &command.ss_bindings {
        let slot = lookup(shader, table, name)?;

        if slot.kind != SlotKind::Sampler {
            return Err(mismatch(shader, slot, "a sampler"));
        }

        resolved.push(ResolvedBinding {
            group: slot.group,
            binding: slot.binding,
            resource: BoundResource::Sampler(*sampler),
        });
    }

    if resolved.len() != table.len() {
        let unbound = table
            .iter()
            .find(|slot| !resolved.iter().any(|r| r.group == slot.group && r.binding == slot.binding));

        if let Some(slot) = unbound {
            return Err(DeviceError::UnboundSlot {
                shader: shader.to_string(),
                name: slot.name.clone(),
            });
        }
    }

    resolved.sort_by_key(|r| (r.group, r.binding));
    Ok(resolved)
}

/// A texture view bound both for reading and for writing by one dispatch
pub fn reads_resource_written(resolved: &[ResolvedBinding<'_>], srv: &ShaderResourceView) -> bool {
    srv.dimension() != ViewDimension::Buffer
        && resolved.iter().any(|r| match r.resource {
            BoundResource::Uav(uav) => uav.resource_id() == srv.resource_id(),
            _ => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderSource;
    use crate::tracker::ObjectTracker;
    use crate::types::{Format, SamplerState, TextureObject, TextureParam, ViewFlags};
    use std::sync::Arc;

    const SHADER: &str = r#"
struct Globals { targetMip: i32, }

@group(0) @binding(0) var<uniform> CBGlobal: Globals;
@group(0) @binding(1) var srcMip: texture_2d_array<f32>;
@group(0) @binding(2) var dstMipSlice: texture_storage_2d_array<rgba16float, write>;
@group(0) @binding(3) var ssPoint: sampler;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let c = textureSampleLevel(srcMip, ssPoint, vec2<f32>(0.5), i32(id.z), f32(CBGlobal.targetMip));
    textureStore(dstMipSlice, id.xy, id.z, c);
}
"#;

    fn cube(tracker: &Arc<ObjectTracker>) -> TextureObject {
        let param = TextureParam::new_cube(16, 2, Format::Rgba16Float, ViewFlags::SRV | ViewFlags::UAV);
        TextureObject::new(Arc::new(param), tracker.track(()))
    }

    const POINT: Sampler = Sampler { state: SamplerState::Point };

    #[test]
    fn resolves_in_slot_order() {
        let tracker = ObjectTracker::new();
        let texture = cube(&tracker);
        let shader = ShaderSource::parse("downsample", SHADER).unwrap();

        let command = ComputeCommand::new("downsample")
            .cbuffer("CBGlobal")
            .sampler("ssPoint", POINT)
            .uav("dstMipSlice", texture.uav(1).unwrap())
            .srv("srcMip", texture.srv_array(0).unwrap());

        let resolved = resolve(&command, &shader.bindings).unwrap();
        let bindings: Vec<_> = resolved.iter().map(|r| r.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2, 3]);

        let BoundResource::Srv(srv) = resolved[1].resource else { panic!("slot 1 is the srv") };
        assert!(reads_resource_written(&resolved, srv));
    }

    #[test]
    fn unknown_name_fails_the_whole_command() {
        let tracker = ObjectTracker::new();
        let texture = cube(&tracker);
        let shader = ShaderSource::parse("downsample", SHADER).unwrap();

        let command = ComputeCommand::new("downsample")
            .cbuffer("CBGlobal")
            .sampler("ssPoint", POINT)
            .uav("dstMipSlice", texture.uav(1).unwrap())
            .srv("srcMip", texture.srv_array(0).unwrap())
            .srv("typo", texture.srv_array(1).unwrap());

        let err = resolve(&command, &shader.bindings).unwrap_err();
        assert!(matches!(err, DeviceError::UnresolvedBinding { ref name, .. } if name == "typo"));
    }

    #[test]
    fn missing_binding_is_reported() {
        let tracker = ObjectTracker::new();
        let texture = cube(&tracker);
        let shader = ShaderSource::parse("downsample", SHADER).unwrap();

        let command = ComputeCommand::new("downsample")
            .cbuffer("CBGlobal")
            .uav("dstMipSlice", texture.uav(1).unwrap())
            .srv("srcMip", texture.srv_array(0).unwrap());

        let err = resolve(&command, &shader.bindings).unwrap_err();
        assert!(matches!(err, DeviceError::UnboundSlot { ref name, .. } if name == "ssPoint"));
    }

    #[test]
    fn wrong_view_dimension_is_rejected() {
        let tracker = ObjectTracker::new();
        let texture = cube(&tracker);
        let shader = ShaderSource::parse("downsample", SHADER).unwrap();

        let command = ComputeCommand::new("downsample")
            .cbuffer("CBGlobal")
            .sampler("ssPoint", POINT)
            .uav("dstMipSlice", texture.uav(1).unwrap())
            .srv("srcMip", texture.srv_cube().unwrap());

        let err = resolve(&command, &shader.bindings).unwrap_err();
        assert!(matches!(err, DeviceError::BindingMismatch { .. }));
    }

    #[test]
    fn cbuffer_must_name_a_uniform() {
        let tracker = ObjectTracker::new();
        let texture = cube(&tracker);
        let shader = ShaderSource::parse("downsample", SHADER).unwrap();

        let command = ComputeCommand::new("downsample")
            .cbuffer("ssPoint")
            .sampler("ssPoint", POINT)
            .uav("dstMipSlice", texture.uav(1).unwrap())
            .srv("srcMip", texture.srv_array(0).unwrap());

        assert!(matches!(
            resolve(&command, &shader.bindings),
            Err(DeviceError::BindingMismatch { .. })
        ));
    }
}
