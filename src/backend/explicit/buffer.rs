// Buffer and image allocations
//
// Memory comes from gpu-allocator. Each allocation keeps the device alive
// and returns its memory on drop.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;

/// A `vk::Buffer` bound to its own allocation
pub struct GpuBuffer {
    device: Arc<VulkanDevice>,
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer =
            unsafe { device.device.create_buffer(&buffer_info, None) }.context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };

        let gpu_buffer = Self {
            device: device.clone(),
            buffer,
            size,
            allocation: Some(allocation),
        };

        bound.context("Failed to bind buffer memory")?;
        Ok(gpu_buffer)
    }

    /// Host view of the buffer. None for device-local memory.
    pub fn mapped(&self) -> Option<&[u8]> {
        self.allocation.as_ref()?.mapped_slice()
    }

    /// Copy `data` to the start of a host-visible buffer
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let slice = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        anyhow::ensure!(data.len() <= slice.len(), "{} bytes do not fit in {}", data.len(), slice.len());

        slice[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy `range` out of a host-visible buffer
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let slice = self.mapped().context("Buffer is not host visible")?;
        let bytes = slice
            .get(offset..offset + len)
            .with_context(|| format!("Range {}..{} is outside the buffer", offset, offset + len))?;
        Ok(bytes.to_vec())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }

        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
    }
}

/// A `vk::Image` bound to its own device-local allocation
pub struct GpuImage {
    device: Arc<VulkanDevice>,
    pub image: vk::Image,
    allocation: Option<Allocation>,
}

impl GpuImage {
    pub fn new(device: &Arc<VulkanDevice>, name: &str, info: &vk::ImageCreateInfo) -> Result<Self> {
        let image = unsafe { device.device.create_image(info, None) }.context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e).context("Failed to allocate image memory");
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };

        let gpu_image = Self {
            device: device.clone(),
            image,
            allocation: Some(allocation),
        };

        bound.context("Failed to bind image memory")?;
        Ok(gpu_image)
    }

    /// Create a view onto this image
    pub fn create_view(
        &self,
        view_type: vk::ImageViewType,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
    ) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(view_type)
            .format(format)
            .subresource_range(range);

        unsafe { self.device.device.create_image_view(&view_info, None) }.context("Failed to create image view")
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free image memory: {}", e);
            }
        }

        unsafe { self.device.device.destroy_image(self.image, None) };
    }
}

/// Color subresource range covering `mips` and `layers`
pub fn color_range(base_mip: u32, mip_count: u32, base_layer: u32, layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: base_mip,
        level_count: mip_count,
        base_array_layer: base_layer,
        layer_count,
    }
}
