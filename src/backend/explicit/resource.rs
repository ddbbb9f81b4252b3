// Vulkan-side allocations owned by the tracker
//
// Every allocation carries the state of its subresources. Buffers count as
// a single subresource.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use super::barrier::{buffer_barrier, image_barrier, ResourceState, SubresourceStates, Transition};
use super::buffer::{GpuBuffer, GpuImage};
use super::VulkanDevice;
use crate::backend::MapGuard;
use crate::types::{SrvKind, TextureParam};

/// A native barrier produced from a state transition
pub enum Barrier {
    Buffer(vk::BufferMemoryBarrier),
    Image(vk::ImageMemoryBarrier),
}

/// Anything whose subresources move through `ResourceState`
pub trait Barriered {
    fn states(&self) -> &Mutex<SubresourceStates>;

    fn barrier(&self, transition: &Transition) -> Barrier;
}

pub struct VkBuffer {
    pub buffer: GpuBuffer,
    pub cpu_read: bool,
    states: Mutex<SubresourceStates>,
    mapped: AtomicBool,
}

impl VkBuffer {
    pub fn new(buffer: GpuBuffer, cpu_read: bool) -> Self {
        Self {
            buffer,
            cpu_read,
            states: Mutex::new(SubresourceStates::new(1, ResourceState::ShaderReadable)),
            mapped: AtomicBool::new(false),
        }
    }
}

impl Barriered for VkBuffer {
    fn states(&self) -> &Mutex<SubresourceStates> {
        &self.states
    }

    fn barrier(&self, transition: &Transition) -> Barrier {
        Barrier::Buffer(buffer_barrier(self.buffer.buffer, transition))
    }
}

impl MapGuard for VkBuffer {
    fn map_flag(&self) -> &AtomicBool {
        &self.mapped
    }
}

pub struct VkTexture {
    device: Arc<VulkanDevice>,
    pub desc: Arc<TextureParam>,
    pub image: GpuImage,
    srvs: HashMap<SrvKind, vk::ImageView>,
    uavs: HashMap<u32, vk::ImageView>,
    states: Mutex<SubresourceStates>,
}

impl VkTexture {
    /// Subresources start `Undefined`; the creator moves them to rest
    pub fn new(device: &Arc<VulkanDevice>, desc: Arc<TextureParam>, image: GpuImage) -> Self {
        let count = desc.num_subresources();

        Self {
            device: device.clone(),
            desc,
            image,
            srvs: HashMap::new(),
            uavs: HashMap::new(),
            states: Mutex::new(SubresourceStates::new(count, ResourceState::Undefined)),
        }
    }

    pub fn add_srv(&mut self, kind: SrvKind, view: vk::ImageView) {
        self.srvs.insert(kind, view);
    }

    pub fn add_uav(&mut self, mip: u32, view: vk::ImageView) {
        self.uavs.insert(mip, view);
    }

    pub fn srv(&self, kind: SrvKind) -> Result<vk::ImageView> {
        self.srvs
            .get(&kind)
            .copied()
            .with_context(|| format!("texture has no {:?} view", kind))
    }

    pub fn uav(&self, mip: u32) -> Result<vk::ImageView> {
        self.uavs
            .get(&mip)
            .copied()
            .with_context(|| format!("texture has no UAV for mip {}", mip))
    }
}

impl Barriered for VkTexture {
    fn states(&self) -> &Mutex<SubresourceStates> {
        &self.states
    }

    fn barrier(&self, transition: &Transition) -> Barrier {
        Barrier::Image(image_barrier(self.image.image, &self.desc, transition))
    }
}

impl Drop for VkTexture {
    fn drop(&mut self) {
        unsafe {
            for view in self.srvs.values().chain(self.uavs.values()) {
                self.device.device.destroy_image_view(*view, None);
            }
        }
    }
}

/// Device-local constant buffer plus the host-visible buffer it is filled from
pub struct ConstantBuffer {
    pub buffer: GpuBuffer,
    pub upload: GpuBuffer,
    /// Bytes accepted by `update_constant_buffer`, fixed by the first call
    pub size: usize,
    states: Mutex<SubresourceStates>,
}

impl ConstantBuffer {
    pub fn new(buffer: GpuBuffer, upload: GpuBuffer, size: usize) -> Self {
        Self {
            buffer,
            upload,
            size,
            states: Mutex::new(SubresourceStates::new(1, ResourceState::ShaderReadable)),
        }
    }
}

impl Barriered for ConstantBuffer {
    fn states(&self) -> &Mutex<SubresourceStates> {
        &self.states
    }

    fn barrier(&self, transition: &Transition) -> Barrier {
        Barrier::Buffer(buffer_barrier(self.buffer.buffer, transition))
    }
}
