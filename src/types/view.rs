// Resource views
//
// Views are owned by their resource object and refer back to the backend
// allocation weakly. The set of views a texture gets is computed once by
// `ViewPlan`, which both backends realize one-to-one.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::param::{BufferParam, TextureParam, TextureShape, ViewFlags, CUBEMAP_NUM_FACES};
use crate::error::Result;
use crate::tracker::{upgrade_weak, TrackedRef};

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

fn next_view_id() -> u64 {
    NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDimension {
    Buffer,
    D1,
    D1Array,
    D2,
    D2Array,
    Cube,
    CubeArray,
    D3,
}

/// Which shader-read view of a resource this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SrvKind {
    Buffer,
    Default,
    Cube,
    CubeArray,
    /// All array slices of a single mip
    ArrayMip(u32),
    /// All array slices, all mips
    ArrayAllMips,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UavKind {
    Buffer,
    Mip(u32),
}

/// Subresource range and interpretation of one view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub dimension: ViewDimension,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ViewDesc {
    fn buffer() -> Self {
        Self {
            dimension: ViewDimension::Buffer,
            base_mip: 0,
            mip_count: 1,
            base_layer: 0,
            layer_count: 1,
        }
    }
}

/// Every view a resource exposes, computed from its descriptor alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewPlan {
    pub srvs: Vec<(SrvKind, ViewDesc)>,
    pub uavs: Vec<(UavKind, ViewDesc)>,
}

impl ViewPlan {
    pub fn for_buffer(param: &BufferParam) -> Self {
        let mut plan = ViewPlan::default();

        if param.view_flags.contains(ViewFlags::SRV) {
            plan.srvs.push((SrvKind::Buffer, ViewDesc::buffer()));
        }

        if param.view_flags.contains(ViewFlags::UAV) {
            plan.uavs.push((UavKind::Buffer, ViewDesc::buffer()));
        }

        plan
    }

    pub fn for_texture(param: &TextureParam) -> Self {
        let mut plan = ViewPlan::default();
        let shape = param.shape();
        let mips = param.num_mips;
        let layers = param.array_size;

        let array_dimension = if shape == TextureShape::D1 {
            ViewDimension::D1Array
        } else {
            ViewDimension::D2Array
        };

        let range = |dimension, base_mip, mip_count| ViewDesc {
            dimension,
            base_mip,
            mip_count,
            base_layer: 0,
            layer_count: layers,
        };

        if param.view_flags.contains(ViewFlags::SRV) {
            match shape {
                TextureShape::Cube | TextureShape::CubeArray => {
                    if shape == TextureShape::Cube {
                        plan.srvs.push((SrvKind::Cube, range(ViewDimension::Cube, 0, mips)));
                    } else {
                        plan.srvs.push((SrvKind::CubeArray, range(ViewDimension::CubeArray, 0, mips)));
                    }

                    for mip in 0..mips {
                        plan.srvs.push((SrvKind::ArrayMip(mip), range(ViewDimension::D2Array, mip, 1)));
                    }

                    plan.srvs.push((SrvKind::ArrayAllMips, range(ViewDimension::D2Array, 0, mips)));
                }
                _ if layers > 1 => {
                    for mip in 0..mips {
                        plan.srvs.push((SrvKind::ArrayMip(mip), range(array_dimension, mip, 1)));
                    }
                }
                _ => {
                    let dimension = match shape {
                        TextureShape::D1 => ViewDimension::D1,
                        TextureShape::D3 => ViewDimension::D3,
                        _ => ViewDimension::D2,
                    };

                    plan.srvs.push((SrvKind::Default, range(dimension, 0, mips)));
                }
            }
        }

        if param.view_flags.contains(ViewFlags::UAV) {
            let dimension = match shape {
                TextureShape::D3 => ViewDimension::D3,
                _ if layers > 1 => array_dimension,
                TextureShape::D1 => ViewDimension::D1,
                _ => ViewDimension::D2,
            };

            for mip in 0..mips {
                plan.uavs.push((UavKind::Mip(mip), range(dimension, mip, 1)));
            }
        }

        plan
    }

    pub fn count_srv(&self, pred: impl Fn(SrvKind) -> bool) -> usize {
        self.srvs.iter().filter(|(kind, _)| pred(*kind)).count()
    }
}

/// Number of whole cubes in an array of `layers` slices
pub fn cube_count(layers: u32) -> u32 {
    layers / CUBEMAP_NUM_FACES
}

/// Shader-read view of a buffer or texture
pub struct ShaderResourceView {
    id: u64,
    kind: SrvKind,
    desc: ViewDesc,
    resource_id: u64,
    resource: Weak<dyn Any + Send + Sync>,
}

/// Unordered-access view of a buffer or one texture mip
pub struct UnorderedAccessView {
    id: u64,
    kind: UavKind,
    desc: ViewDesc,
    resource_id: u64,
    resource: Weak<dyn Any + Send + Sync>,
}

macro_rules! view_accessors {
    ($ty:ident, $kind:ident, $what:literal) => {
        impl $ty {
            pub(crate) fn new(kind: $kind, desc: ViewDesc, resource: &TrackedRef) -> Self {
                Self {
                    id: next_view_id(),
                    kind,
                    desc,
                    resource_id: resource.id(),
                    resource: resource.downgrade(),
                }
            }

            /// Process-unique identity, stable for the life of the view
            pub fn id(&self) -> u64 {
                self.id
            }

            pub fn kind(&self) -> $kind {
                self.kind
            }

            pub fn desc(&self) -> &ViewDesc {
                &self.desc
            }

            pub fn dimension(&self) -> ViewDimension {
                self.desc.dimension
            }

            /// Identity of the allocation this view was derived from
            pub fn resource_id(&self) -> u64 {
                self.resource_id
            }

            pub fn is_alive(&self) -> bool {
                self.resource.strong_count() > 0
            }

            pub(crate) fn resource<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
                upgrade_weak(&self.resource, $what)
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("id", &self.id)
                    .field("kind", &self.kind)
                    .field("dimension", &self.desc.dimension)
                    .field("resource_id", &self.resource_id)
                    .finish()
            }
        }
    };
}

view_accessors!(ShaderResourceView, SrvKind, "shader resource view");
view_accessors!(UnorderedAccessView, UavKind, "unordered access view");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SamplerState {
    Point,
    Linear,
}

/// Device-owned sampler, clamp-to-edge addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sampler {
    pub state: SamplerState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Format;

    fn texture(array_size: u32, mips: u32) -> TextureParam {
        TextureParam::new_2d(64, 64, Format::Rgba16Float, ViewFlags::SRV | ViewFlags::UAV)
            .with_array_size(array_size)
            .with_mips(mips)
    }

    #[test]
    fn cube_views() {
        let plan = ViewPlan::for_texture(&texture(6, 4));

        assert_eq!(plan.count_srv(|k| k == SrvKind::Cube), 1);
        assert_eq!(plan.count_srv(|k| matches!(k, SrvKind::ArrayMip(_))), 4);
        assert_eq!(plan.count_srv(|k| k == SrvKind::ArrayAllMips), 1);
        assert_eq!(plan.count_srv(|k| k == SrvKind::CubeArray), 0);
        assert_eq!(plan.count_srv(|k| k == SrvKind::Default), 0);
        assert_eq!(plan.uavs.len(), 4);

        for (kind, desc) in &plan.uavs {
            let UavKind::Mip(mip) = kind else { panic!("texture uav must be per mip") };
            assert_eq!(desc.base_mip, *mip);
            assert_eq!(desc.dimension, ViewDimension::D2Array);
            assert_eq!(desc.layer_count, 6);
        }
    }

    #[test]
    fn cube_array_views() {
        let plan = ViewPlan::for_texture(&texture(12, 3));

        assert_eq!(plan.count_srv(|k| k == SrvKind::CubeArray), 1);
        assert_eq!(plan.count_srv(|k| k == SrvKind::Cube), 0);
        assert_eq!(plan.count_srv(|k| matches!(k, SrvKind::ArrayMip(_))), 3);
        assert_eq!(plan.count_srv(|k| k == SrvKind::ArrayAllMips), 1);
        assert_eq!(cube_count(12), 2);
    }

    #[test]
    fn single_slice_gets_only_default_view() {
        let plan = ViewPlan::for_texture(&texture(1, 5));

        assert_eq!(plan.srvs.len(), 1);
        assert_eq!(plan.srvs[0].0, SrvKind::Default);
        assert_eq!(plan.srvs[0].1.mip_count, 5);
        assert_eq!(plan.srvs[0].1.dimension, ViewDimension::D2);
        assert!(plan.uavs.iter().all(|(_, d)| d.dimension == ViewDimension::D2));
    }

    #[test]
    fn plain_array_gets_per_mip_views() {
        let plan = ViewPlan::for_texture(&texture(4, 2));

        assert_eq!(plan.srvs.len(), 2);
        assert!(plan.srvs.iter().all(|(k, _)| matches!(k, SrvKind::ArrayMip(_))));
    }

    #[test]
    fn volume_and_line_dimensions() {
        let volume = TextureParam::new_2d(8, 8, Format::R32Float, ViewFlags::SRV | ViewFlags::UAV).with_depth(8);
        let plan = ViewPlan::for_texture(&volume);
        assert_eq!(plan.srvs[0].1.dimension, ViewDimension::D3);
        assert_eq!(plan.uavs[0].1.dimension, ViewDimension::D3);

        let line = TextureParam::new_2d(8, 1, Format::R32Float, ViewFlags::SRV);
        let plan = ViewPlan::for_texture(&line);
        assert_eq!(plan.srvs[0].1.dimension, ViewDimension::D1);
        assert!(plan.uavs.is_empty());
    }

    #[test]
    fn no_flags_no_views() {
        let readback = TextureParam::new_2d(8, 8, Format::R32Float, ViewFlags::CPU_READ);
        assert_eq!(ViewPlan::for_texture(&readback), ViewPlan::default());

        let buffer = BufferParam::new(4, 4, ViewFlags::SRV | ViewFlags::UAV);
        let plan = ViewPlan::for_buffer(&buffer);
        assert_eq!(plan.srvs.len(), 1);
        assert_eq!(plan.uavs.len(), 1);
    }
}
