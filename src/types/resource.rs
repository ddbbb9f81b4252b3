// Client-facing resource objects
//
// A resource object owns its views and a weak reference to the backend
// allocation. The allocation itself lives in the device's tracker.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::param::{BufferParam, TextureParam};
use super::view::{ShaderResourceView, SrvKind, UavKind, UnorderedAccessView, ViewPlan};
use crate::tracker::TrackedRef;

pub struct BufferObject {
    desc: Arc<BufferParam>,
    resource: TrackedRef,
    srv: Option<ShaderResourceView>,
    uav: Option<UnorderedAccessView>,
    data: Vec<u32>,
}

impl BufferObject {
    pub(crate) fn new(desc: Arc<BufferParam>, resource: TrackedRef, data: Vec<u32>) -> Self {
        let plan = ViewPlan::for_buffer(&desc);

        let srv = plan
            .srvs
            .into_iter()
            .next()
            .map(|(kind, view)| ShaderResourceView::new(kind, view, &resource));
        let uav = plan
            .uavs
            .into_iter()
            .next()
            .map(|(kind, view)| UnorderedAccessView::new(kind, view, &resource));

        Self {
            desc,
            resource,
            srv,
            uav,
            data,
        }
    }

    /// Descriptor the buffer was created with
    pub fn desc(&self) -> &Arc<BufferParam> {
        &self.desc
    }

    pub fn srv(&self) -> Option<&ShaderResourceView> {
        self.srv.as_ref()
    }

    pub fn uav(&self) -> Option<&UnorderedAccessView> {
        self.uav.as_ref()
    }

    /// CPU copy of the contents, filled when the buffer was cloned from
    /// another one. Empty otherwise.
    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn is_alive(&self) -> bool {
        self.resource.is_alive()
    }

    pub(crate) fn resource(&self) -> &TrackedRef {
        &self.resource
    }
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("num_elements", &self.desc.num_elements)
            .field("element_size", &self.desc.element_size)
            .field("resource", &self.resource)
            .finish()
    }
}

pub struct TextureObject {
    desc: Arc<TextureParam>,
    resource: TrackedRef,
    srvs: BTreeMap<SrvKind, ShaderResourceView>,
    uavs: Vec<UnorderedAccessView>,
}

impl TextureObject {
    pub(crate) fn new(desc: Arc<TextureParam>, resource: TrackedRef) -> Self {
        let plan = ViewPlan::for_texture(&desc);

        let srvs = plan
            .srvs
            .into_iter()
            .map(|(kind, view)| (kind, ShaderResourceView::new(kind, view, &resource)))
            .collect();
        let uavs = plan
            .uavs
            .into_iter()
            .map(|(kind, view)| UnorderedAccessView::new(kind, view, &resource))
            .collect();

        Self {
            desc,
            resource,
            srvs,
            uavs,
        }
    }

    pub fn desc(&self) -> &Arc<TextureParam> {
        &self.desc
    }

    /// Whole-resource view, only present when the texture has a single slice
    pub fn srv_default(&self) -> Option<&ShaderResourceView> {
        self.srvs.get(&SrvKind::Default)
    }

    pub fn srv_cube(&self) -> Option<&ShaderResourceView> {
        self.srvs.get(&SrvKind::Cube)
    }

    pub fn srv_cube_array(&self) -> Option<&ShaderResourceView> {
        self.srvs.get(&SrvKind::CubeArray)
    }

    /// Every array slice of a single mip
    pub fn srv_array(&self, mip: u32) -> Option<&ShaderResourceView> {
        self.srvs.get(&SrvKind::ArrayMip(mip))
    }

    pub fn srv_array_with_mips(&self) -> Option<&ShaderResourceView> {
        self.srvs.get(&SrvKind::ArrayAllMips)
    }

    pub fn srvs(&self) -> impl Iterator<Item = &ShaderResourceView> {
        self.srvs.values()
    }

    pub fn uav(&self, mip: u32) -> Option<&UnorderedAccessView> {
        self.uavs.iter().find(|uav| uav.kind() == UavKind::Mip(mip))
    }

    pub fn uavs(&self) -> &[UnorderedAccessView] {
        &self.uavs
    }

    pub fn is_alive(&self) -> bool {
        self.resource.is_alive()
    }

    pub(crate) fn resource(&self) -> &TrackedRef {
        &self.resource
    }
}

impl std::fmt::Debug for TextureObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureObject")
            .field("width", &self.desc.width)
            .field("height", &self.desc.height)
            .field("num_mips", &self.desc.num_mips)
            .field("array_size", &self.desc.array_size)
            .field("resource", &self.resource)
            .finish()
    }
}

/// Whole-buffer device copy
#[derive(Debug, Clone, Copy)]
pub struct CopyBufferParam<'a> {
    pub src: &'a BufferObject,
    pub dst: &'a BufferObject,
}

/// Copy of exactly one (face, mip) between two textures
#[derive(Debug, Clone, Copy)]
pub struct CopyTextureSubresourceParam<'a> {
    pub src: &'a TextureObject,
    pub src_face: u32,
    pub src_mip: u32,
    pub dst: &'a TextureObject,
    pub dst_face: u32,
    pub dst_mip: u32,
}

impl<'a> CopyTextureSubresourceParam<'a> {
    /// Same face and mip on both sides
    pub fn new(src: &'a TextureObject, dst: &'a TextureObject, face: u32, mip: u32) -> Self {
        Self {
            src,
            src_face: face,
            src_mip: mip,
            dst,
            dst_face: face,
            dst_mip: mip,
        }
    }
}

/// Copy of one (face, mip) of a texture into a CPU_READ buffer
#[derive(Debug, Clone, Copy)]
pub struct CopyTextureSubresourceToBufferParam<'a> {
    pub texture: &'a TextureObject,
    pub face: u32,
    pub mip: u32,
    pub buffer: &'a BufferObject,
}
