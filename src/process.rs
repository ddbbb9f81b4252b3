// Processing flows built on the device primitives
//
// Each flow creates its own output resources, runs one or more dispatches
// and returns the result. Nothing here knows which backend is active.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::device::RenderDevice;
use crate::error::{DeviceError, Result};
use crate::image::{CubeImage, Image, SizeFix};
use crate::types::{
    count_mips, BufferObject, BufferParam, ComputeCommand, CopyTextureSubresourceParam, Format, SamplerState,
    TextureObject, TextureParam, TextureShape, ViewFlags, CUBEMAP_NUM_FACES,
};

/// Threads per workgroup along x and y of the texture shaders
const TILE: u32 = 8;
/// Threads per workgroup of fill_buffer
const FILL_GROUP: u32 = 64;

/// Layout of the `CBGlobal` constant buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CbGlobal {
    pub target_mip: i32,
}

fn groups(size: u32, tile: u32) -> u32 {
    size.div_ceil(tile).max(1)
}

fn missing(what: &str) -> DeviceError {
    DeviceError::invalid(format!("texture has no {}", what))
}

pub struct Processor<'d> {
    device: &'d mut dyn RenderDevice,
}

impl<'d> Processor<'d> {
    pub fn new(device: &'d mut dyn RenderDevice) -> Self {
        Self { device }
    }

    fn create_cube(&mut self, size: u32, num_mips: u32) -> Result<TextureObject> {
        self.device.create_texture(&Arc::new(TextureParam::new_cube(
            size,
            num_mips,
            Format::Rgba16Float,
            ViewFlags::SRV | ViewFlags::UAV,
        )))
    }

    /// Upload a 2D image as a shader-readable texture
    pub fn upload(&mut self, image: &dyn Image) -> Result<TextureObject> {
        self.device
            .create_texture(&Arc::new(image.create_texture_param(ViewFlags::SRV)))
    }

    /// Project a latitude/longitude panorama onto a `face_size` cubemap
    pub fn equirect_to_cube(&mut self, source: &TextureObject, face_size: u32) -> Result<TextureObject> {
        let _marker = self.device.create_debug_marker("EquirectToCube");
        log::info!("Projecting panorama onto {}x{} faces", face_size, face_size);

        let cube = self.create_cube(face_size, 1)?;
        let linear = self.device.get_sampler(SamplerState::Linear);

        let command = ComputeCommand::new("equirect_to_cube")
            .srv("srcTex", source.srv_default().ok_or_else(|| missing("default view"))?)
            .uav("dstTex", cube.uav(0).ok_or_else(|| missing("UAV for mip 0"))?)
            .sampler("ssLinear", linear)
            .dispatch(groups(face_size, TILE), groups(face_size, TILE), CUBEMAP_NUM_FACES);

        self.device.dispatch(&command)?;
        Ok(cube)
    }

    /// Resample mip 0 of `source` to the extent of `fix` with a linear
    /// filter. 2D textures, arrays and cubemaps keep their shape; the result
    /// has a single mip.
    pub fn resize(&mut self, source: &TextureObject, fix: SizeFix) -> Result<TextureObject> {
        let _marker = self.device.create_debug_marker("Resize");
        let desc = source.desc();

        if !fix.needs_fix {
            log::debug!("Resizing a texture that already has a valid extent");
        }

        if fix.width == 0 || fix.height == 0 {
            return Err(DeviceError::invalid(format!(
                "cannot resize to {}x{}",
                fix.width, fix.height
            )));
        }

        if desc.num_mips > 1 {
            log::warn!("Source texture has mips, only mip 0 is resized");
        }

        log::info!(
            "Resizing {}x{} to {}x{}",
            desc.width,
            desc.height,
            fix.width,
            fix.height
        );

        let shape = desc.shape();
        let param = TextureParam {
            array_size: desc.array_size,
            ..TextureParam::new_2d(fix.width, fix.height, Format::Rgba16Float, ViewFlags::SRV | ViewFlags::UAV)
        };

        if param.shape() != shape {
            return Err(DeviceError::invalid(format!(
                "a {:?} texture cannot be resized to {}x{}",
                shape, fix.width, fix.height
            )));
        }

        let (shader, src) = match shape {
            TextureShape::D2 if desc.array_size == 1 => ("resize", source.srv_default()),
            TextureShape::D2 | TextureShape::Cube | TextureShape::CubeArray => ("resize_array", source.srv_array(0)),
            TextureShape::D1 | TextureShape::D3 => {
                return Err(DeviceError::unsupported(format!("resizing a {:?} texture", shape)));
            }
        };

        let dst = self.device.create_texture(&Arc::new(param))?;
        let linear = self.device.get_sampler(SamplerState::Linear);

        let command = ComputeCommand::new(shader)
            .srv("srcTex", src.ok_or_else(|| missing("shader-readable view of mip 0"))?)
            .uav("dstTex", dst.uav(0).ok_or_else(|| missing("UAV for mip 0"))?)
            .sampler("ssLinear", linear)
            .dispatch(groups(fix.width, TILE), groups(fix.height, TILE), desc.array_size);

        self.device.dispatch(&command)?;
        Ok(dst)
    }

    /// New cubemap with a full mip chain: mip 0 copied from `source`, every
    /// other mip box-filtered from the one above
    pub fn generate_mips(&mut self, source: &TextureObject) -> Result<TextureObject> {
        let _marker = self.device.create_debug_marker("Downsample");
        let desc = source.desc();

        if desc.num_mips > 1 {
            log::warn!("Source texture already has mips, they are ignored and rebuilt from mip 0");
        }

        let size = desc.width;
        let num_mips = count_mips(size);
        let cube = self.create_cube(size, num_mips)?;

        {
            let _copy = self.device.create_debug_marker("Copy mip 0");

            for face in 0..CUBEMAP_NUM_FACES {
                self.device
                    .copy_texture_subresource(&CopyTextureSubresourceParam::new(source, &cube, face, 0))?;
            }
        }

        let _generate = self.device.create_debug_marker("Generate remaining mips");
        let point = self.device.get_sampler(SamplerState::Point);

        for src_mip in 0..num_mips - 1 {
            let dst_size = (size >> (src_mip + 1)).max(1);

            let cb = CbGlobal { target_mip: src_mip as i32 };
            self.device.update_constant_buffer("CBGlobal", bytemuck::bytes_of(&cb))?;

            let command = ComputeCommand::new("downsample")
                .cbuffer("CBGlobal")
                .srv("srcMip", cube.srv_array(src_mip).ok_or_else(|| missing("array view"))?)
                .uav("dstMipSlice", cube.uav(src_mip + 1).ok_or_else(|| missing("mip UAV"))?)
                .sampler("ssPoint", point)
                .dispatch(groups(dst_size, TILE), groups(dst_size, TILE), CUBEMAP_NUM_FACES);

            self.device.dispatch(&command)?;
        }

        log::info!("Generated {} mips of {}x{}", num_mips, size, size);
        Ok(cube)
    }

    /// Cubemap with one flat color per mip
    pub fn color_mips(&mut self, size: u32) -> Result<TextureObject> {
        let _marker = self.device.create_debug_marker("ColorMips");

        let num_mips = count_mips(size);
        let cube = self.create_cube(size, num_mips)?;

        for mip in 0..num_mips {
            let mip_size = (size >> mip).max(1);
            let cb = CbGlobal { target_mip: mip as i32 };
            self.device.update_constant_buffer("CBGlobal", bytemuck::bytes_of(&cb))?;

            let command = ComputeCommand::new("color_mips")
                .cbuffer("CBGlobal")
                .uav("dstTex", cube.uav(mip).ok_or_else(|| missing("mip UAV"))?)
                .dispatch(groups(mip_size, TILE), groups(mip_size, TILE), CUBEMAP_NUM_FACES);

            self.device.dispatch(&command)?;
        }

        Ok(cube)
    }

    /// Buffer of `num_elements` x `element_size` bytes filled on the GPU
    /// with word i = i * 3 + 1, returned as a clone whose `data()` holds
    /// the contents
    pub fn fill_buffer(&mut self, num_elements: u32, element_size: u32) -> Result<BufferObject> {
        let _marker = self.device.create_debug_marker("FillBuffer");

        let param = Arc::new(BufferParam::new(num_elements, element_size, ViewFlags::UAV));
        let words = param.word_count() as u32;
        let buffer = self.device.create_buffer(&param)?;

        let command = ComputeCommand::new("fill_buffer")
            .uav("dstBuffer", buffer.uav().ok_or_else(|| DeviceError::invalid("buffer has no UAV"))?)
            .dispatch(groups(words, FILL_GROUP), 1, 1);

        self.device.dispatch(&command)?;
        self.device.create_buffer_from(&buffer)
    }

    /// Read every face and mip of a cubemap back to the CPU
    pub fn image_from_texture_object(&mut self, texture: &TextureObject) -> Result<CubeImage> {
        let _marker = self.device.create_debug_marker("ImageFromTextureObject");

        let mut image = CubeImage::default();
        image.initialize_from_texture_object(&mut *self.device, texture)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_partial_tiles() {
        assert_eq!(groups(512, TILE), 64);
        assert_eq!(groups(12, TILE), 2);
        assert_eq!(groups(1, TILE), 1);
        assert_eq!(groups(0, TILE), 1);
    }

    #[test]
    fn constant_buffer_layout_matches_the_shaders() {
        assert_eq!(std::mem::size_of::<CbGlobal>(), 4);
        assert_eq!(bytemuck::bytes_of(&CbGlobal { target_mip: 3 }), &3i32.to_ne_bytes());
    }
}
