// Single-face 2D image decoded with the `image` crate

use std::path::Path;

use anyhow::Context;
use image::DynamicImage;

use super::{read_subresource, save_dynamic, to_dynamic, to_rgba16f, Image, SizeFix};
use crate::device::RenderDevice;
use crate::error::{DeviceError, Result};
use crate::types::{Format, SubresourceData, TextureObject, TextureParam, ViewFlags};

/// 2D image. HDR sources are kept as RGBA16F, 16-bit sources as RGBA16
/// unorm, everything else as RGBA8.
#[derive(Debug, Clone)]
pub struct GenericImage {
    width: u32,
    height: u32,
    format: Format,
    data: Vec<u8>,
}

impl Default for GenericImage {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: Format::Rgba8Unorm,
            data: Vec::new(),
        }
    }
}

impl GenericImage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut image = Self::default();
        image.load(path)?;
        Ok(image)
    }

    pub fn from_dynamic(image: &DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());

        let (format, data) = match image {
            DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => (Format::Rgba16Float, to_rgba16f(image)),
            DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_)
            | DynamicImage::ImageRgb16(_)
            | DynamicImage::ImageRgba16(_) => {
                let pixels = image.to_rgba16().into_raw();
                (Format::Rgba16Unorm, bytemuck::cast_slice(&pixels).to_vec())
            }
            _ => (Format::Rgba8Unorm, image.to_rgba8().into_raw()),
        };

        Self {
            width,
            height,
            format,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_dynamic(&to_dynamic(&self.data, self.width, self.height, self.format)?, path)
    }
}

impl Image for GenericImage {
    fn load(&mut self, path: &Path) -> Result<()> {
        let decoded = image::open(path).with_context(|| format!("Failed to load image {:?}", path))?;
        *self = Self::from_dynamic(&decoded);

        log::debug!(
            "Loaded {:?}: {}x{} {:?}",
            path,
            self.width,
            self.height,
            self.format
        );

        Ok(())
    }

    fn load_raw(&mut self, data: &[u8], width: u32, height: u32, format: Format) -> Result<()> {
        let expected = format.row_pitch(width) as usize * height as usize;

        if data.len() != expected {
            return Err(DeviceError::invalid(format!(
                "raw {}x{} {:?} image needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }

        self.width = width;
        self.height = height;
        self.format = format;
        self.data = data.to_vec();
        Ok(())
    }

    fn create_texture_param(&self, view_flags: ViewFlags) -> TextureParam {
        let param = TextureParam::new_2d(self.width, self.height, self.format, view_flags);

        if view_flags.contains(ViewFlags::CPU_READ) {
            return param;
        }

        let row_pitch = self.format.row_pitch(self.width);

        param.with_data(vec![SubresourceData {
            data: self.data.clone(),
            row_pitch,
            depth_pitch: row_pitch * self.height,
        }])
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn initialize_from_texture_object(&mut self, device: &mut dyn RenderDevice, texture: &TextureObject) -> Result<()> {
        let desc = texture.desc();

        self.data = read_subresource(device, texture, 0, 0)?;
        self.width = desc.width;
        self.height = desc.height;
        self.format = desc.format;
        Ok(())
    }

    fn is_requiring_fix(&self) -> SizeFix {
        SizeFix::for_extent(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn hdr_sources_become_half_float() {
        let hdr = DynamicImage::ImageRgb32F(ImageBuffer::from_pixel(4, 2, Rgb([1.0f32, 0.5, 0.25])));
        let image = GenericImage::from_dynamic(&hdr);

        assert_eq!(image.format(), Format::Rgba16Float);
        assert_eq!(image.data().len(), 4 * 2 * 8);
    }

    #[test]
    fn ldr_sources_become_rgba8() {
        let ldr = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(3, 3, Rgb([10u8, 20, 30])));
        let image = GenericImage::from_dynamic(&ldr);

        assert_eq!(image.format(), Format::Rgba8Unorm);
        assert_eq!(&image.data()[..4], &[10, 20, 30, 255]);
        assert!(image.is_requiring_fix().needs_fix);
    }

    #[test]
    fn texture_param_carries_the_pixels() {
        let mut image = GenericImage::default();
        image.load_raw(&[7u8; 16], 2, 2, Format::Rgba8Unorm).unwrap();

        let param = image.create_texture_param(ViewFlags::SRV);
        assert_eq!((param.width, param.height, param.num_mips), (2, 2, 1));
        assert_eq!(param.image_datas.len(), 1);
        assert_eq!(param.image_datas[0].row_pitch, 8);
        param.validate().unwrap();

        let readback = image.create_texture_param(ViewFlags::CPU_READ);
        assert!(readback.image_datas.is_empty());
    }

    #[test]
    fn raw_data_must_match_the_extent() {
        let mut image = GenericImage::default();
        let err = image.load_raw(&[0u8; 15], 2, 2, Format::Rgba8Unorm).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidDescriptor(_)));
    }

    #[test]
    fn png_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixels.png");

        let mut image = GenericImage::default();
        image.load_raw(&[1, 2, 3, 255, 4, 5, 6, 255], 2, 1, Format::Rgba8Unorm).unwrap();
        image.save(&path).unwrap();

        let loaded = GenericImage::open(&path).unwrap();
        assert_eq!(loaded.data(), image.data());
    }
}
