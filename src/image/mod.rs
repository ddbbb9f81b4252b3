// Image collaborators
//
// Decoding and encoding live here, outside the device. An image reaches the
// GPU only through a texture descriptor and comes back only through
// `copy_texture_subresource_to_buffer` + `map_buffer`, so any backend works.

mod cube;
mod generic;

pub use cube::CubeImage;
pub use generic::GenericImage;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use half::f16;
use image::{DynamicImage, ImageBuffer, Rgba};

use crate::device::RenderDevice;
use crate::error::{DeviceError, Result};
use crate::types::{
    BufferParam, CopyTextureSubresourceToBufferParam, Format, TextureObject, TextureParam, ViewFlags,
};

/// Whether an image has to be resized before processing, and to what
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeFix {
    pub needs_fix: bool,
    pub width: u32,
    pub height: u32,
}

impl SizeFix {
    /// Power-of-two check. A non power-of-two axis is brought down to the
    /// nearest lower power of two.
    pub fn for_extent(width: u32, height: u32) -> Self {
        let fix = |v: u32| if v.is_power_of_two() { v } else { previous_power_of_two(v) };

        Self {
            needs_fix: !width.is_power_of_two() || !height.is_power_of_two(),
            width: fix(width),
            height: fix(height),
        }
    }
}

fn previous_power_of_two(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (31 - value.leading_zeros())
    }
}

/// Capabilities an image type offers to the processing flows
pub trait Image {
    /// Decode a file
    fn load(&mut self, path: &Path) -> Result<()>;

    /// Take tightly packed pixels of `format`
    fn load_raw(&mut self, data: &[u8], width: u32, height: u32, format: Format) -> Result<()>;

    /// Descriptor of a texture holding this image. Initial data is attached
    /// unless `view_flags` asks for CPU readback.
    fn create_texture_param(&self, view_flags: ViewFlags) -> TextureParam;

    /// Raw pixels, every subresource back to back
    fn data(&self) -> &[u8];

    /// Replace the contents with those of `texture`
    fn initialize_from_texture_object(&mut self, device: &mut dyn RenderDevice, texture: &TextureObject) -> Result<()>;

    fn is_requiring_fix(&self) -> SizeFix;
}

/// Pixels of one (face, mip) of `texture`, rows tightly packed
pub fn read_subresource(
    device: &mut dyn RenderDevice,
    texture: &TextureObject,
    face: u32,
    mip: u32,
) -> Result<Vec<u8>> {
    let desc = texture.desc();
    let (width, height, depth) = desc.mip_extent(mip);
    let row_bytes = desc.format.row_pitch(width) as usize;
    let rows = height * depth;
    let size = desc.format.readback_row_pitch(width) as u64 * rows as u64;

    let readback = device.create_buffer(&Arc::new(BufferParam::new(
        (size / 4) as u32,
        4,
        ViewFlags::CPU_READ,
    )))?;

    let row_pitch = device.copy_texture_subresource_to_buffer(&CopyTextureSubresourceToBufferParam {
        texture,
        face,
        mip,
        buffer: &readback,
    })?;

    let mapped = device.map_buffer(&readback)?;

    if mapped.data().len() < row_pitch as usize * rows as usize {
        return Err(DeviceError::invalid("readback buffer is smaller than the subresource"));
    }

    let mut pixels = Vec::with_capacity(row_bytes * rows as usize);

    for row in 0..rows as usize {
        let start = row * row_pitch as usize;
        pixels.extend_from_slice(&mapped.data()[start..start + row_bytes]);
    }

    Ok(pixels)
}

/// Wrap tightly packed pixels in a `DynamicImage`
pub(crate) fn to_dynamic(data: &[u8], width: u32, height: u32, format: Format) -> Result<DynamicImage> {
    let mismatch = || DeviceError::invalid(format!("{} bytes do not make a {}x{} {:?} image", data.len(), width, height, format));

    let image = match format {
        Format::Rgba8Unorm => DynamicImage::ImageRgba8(
            ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data.to_vec()).ok_or_else(mismatch)?,
        ),
        Format::Rgba16Unorm => DynamicImage::ImageRgba16(
            ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, bytemuck::pod_collect_to_vec(data))
                .ok_or_else(mismatch)?,
        ),
        Format::Rgba16Float => {
            let halves: Vec<f16> = bytemuck::pod_collect_to_vec(data);
            let floats = halves.iter().map(|h| h.to_f32()).collect();
            DynamicImage::ImageRgba32F(ImageBuffer::from_raw(width, height, floats).ok_or_else(mismatch)?)
        }
        Format::Rgba32Float => DynamicImage::ImageRgba32F(
            ImageBuffer::from_raw(width, height, bytemuck::pod_collect_to_vec(data)).ok_or_else(mismatch)?,
        ),
        other => return Err(DeviceError::unsupported(format!("saving {:?} images", other))),
    };

    Ok(image)
}

/// Float formats go out as EXR, everything else as 8-bit
pub(crate) fn save_dynamic(image: &DynamicImage, path: &Path) -> Result<()> {
    let is_exr = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("exr"));

    let encoded = if is_exr {
        DynamicImage::ImageRgba32F(image.to_rgba32f())
    } else {
        DynamicImage::ImageRgba8(image.to_rgba8())
    };

    encoded
        .save(path)
        .with_context(|| format!("Failed to save image {:?}", path))?;

    log::debug!("Saved {:?}", path);
    Ok(())
}

/// RGBA16F bytes of a decoded image
pub(crate) fn to_rgba16f(image: &DynamicImage) -> Vec<u8> {
    let halves: Vec<f16> = image.to_rgba32f().into_raw().into_iter().map(f16::from_f32).collect();
    bytemuck::cast_slice(&halves).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_images_need_no_fix() {
        let fix = SizeFix::for_extent(512, 256);
        assert_eq!(fix, SizeFix { needs_fix: false, width: 512, height: 256 });
    }

    #[test]
    fn other_sizes_round_down() {
        let fix = SizeFix::for_extent(600, 256);
        assert!(fix.needs_fix);
        assert_eq!((fix.width, fix.height), (512, 256));

        assert_eq!(previous_power_of_two(1), 1);
        assert_eq!(previous_power_of_two(1023), 512);
    }

    #[test]
    fn half_float_pixels_convert_back_to_f32() {
        let source = DynamicImage::ImageRgba32F(
            ImageBuffer::from_raw(1, 1, vec![0.5f32, 1.0, 2.0, 1.0]).unwrap(),
        );
        let bytes = to_rgba16f(&source);
        assert_eq!(bytes.len(), 8);

        let back = to_dynamic(&bytes, 1, 1, Format::Rgba16Float).unwrap();
        assert_eq!(back.to_rgba32f().into_raw(), vec![0.5, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn wrong_sizes_are_rejected() {
        let err = to_dynamic(&[0u8; 3], 1, 1, Format::Rgba8Unorm).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidDescriptor(_)));
    }
}
