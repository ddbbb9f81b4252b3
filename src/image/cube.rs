// Cubemap image: six faces, each with a full or partial mip chain

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{read_subresource, save_dynamic, to_dynamic, to_rgba16f, Image, SizeFix};
use crate::device::RenderDevice;
use crate::error::{DeviceError, Result};
use crate::types::{Format, SubresourceData, TextureObject, TextureParam, ViewFlags, CUBEMAP_NUM_FACES};

const FORMAT: Format = Format::Rgba16Float;

/// RGBA16F cubemap. Subresources are stored face-major, like texture
/// initial data: index = mip + face * num_mips.
#[derive(Debug, Clone, Default)]
pub struct CubeImage {
    size: u32,
    num_mips: u32,
    data: Vec<u8>,
    offsets: Vec<usize>,
}

impl CubeImage {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn num_mips(&self) -> u32 {
        self.num_mips
    }

    fn mip_size(&self, mip: u32) -> u32 {
        (self.size >> mip).max(1)
    }

    fn subresource_len(&self, mip: u32) -> usize {
        let size = self.mip_size(mip);
        FORMAT.row_pitch(size) as usize * size as usize
    }

    /// Lay out storage for `size` x `num_mips`, zero filled
    fn allocate(&mut self, size: u32, num_mips: u32) {
        self.size = size;
        self.num_mips = num_mips;
        self.offsets.clear();

        let mut total = 0;
        for _face in 0..CUBEMAP_NUM_FACES {
            for mip in 0..num_mips {
                self.offsets.push(total);
                total += self.subresource_len(mip);
            }
        }

        self.data = vec![0; total];
    }

    fn index(&self, face: u32, mip: u32) -> Result<usize> {
        if face >= CUBEMAP_NUM_FACES || mip >= self.num_mips {
            return Err(DeviceError::invalid(format!(
                "cube image has no face {} mip {} ({} mips)",
                face, mip, self.num_mips
            )));
        }

        Ok((mip + face * self.num_mips) as usize)
    }

    /// Pixels of one face of one mip
    pub fn face(&self, face: u32, mip: u32) -> Result<&[u8]> {
        let index = self.index(face, mip)?;
        let start = self.offsets[index];
        Ok(&self.data[start..start + self.subresource_len(mip)])
    }

    /// Overwrite one face of one mip with tightly packed pixels
    pub fn update_sub_image(&mut self, face: u32, mip: u32, pixels: &[u8]) -> Result<()> {
        let index = self.index(face, mip)?;
        let len = self.subresource_len(mip);

        if pixels.len() != len {
            return Err(DeviceError::invalid(format!(
                "face {} mip {} needs {} bytes, got {}",
                face,
                mip,
                len,
                pixels.len()
            )));
        }

        let start = self.offsets[index];
        self.data[start..start + len].copy_from_slice(pixels);
        Ok(())
    }

    /// Write every face/mip as `<stem>_face<F>_mip<M>.exr` under `dir`
    pub fn save(&self, dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let mut written = Vec::new();

        for face in 0..CUBEMAP_NUM_FACES {
            for mip in 0..self.num_mips {
                let size = self.mip_size(mip);
                let path = dir.join(format!("{}_face{}_mip{}.exr", stem, face, mip));

                save_dynamic(&to_dynamic(self.face(face, mip)?, size, size, FORMAT)?, &path)?;
                written.push(path);
            }
        }

        log::info!("Saved {} cubemap image(s) to {:?}", written.len(), dir);
        Ok(written)
    }
}

impl Image for CubeImage {
    /// Reads a horizontal strip of six square faces (+X, -X, +Y, -Y, +Z, -Z)
    fn load(&mut self, path: &Path) -> Result<()> {
        let decoded = image::open(path).with_context(|| format!("Failed to load image {:?}", path))?;
        let (width, height) = (decoded.width(), decoded.height());

        if width != height * CUBEMAP_NUM_FACES {
            return Err(DeviceError::invalid(format!(
                "{:?} is {}x{}, expected a 6:1 strip of cube faces",
                path, width, height
            )));
        }

        let strip = to_rgba16f(&decoded);
        let strip_pitch = FORMAT.row_pitch(width) as usize;
        let face_pitch = FORMAT.row_pitch(height) as usize;

        let mut faces = Vec::with_capacity(strip.len());
        for face in 0..CUBEMAP_NUM_FACES as usize {
            for y in 0..height as usize {
                let start = y * strip_pitch + face * face_pitch;
                faces.extend_from_slice(&strip[start..start + face_pitch]);
            }
        }

        self.load_raw(&faces, height, height, FORMAT)
    }

    /// Takes mip 0 of the six faces back to back
    fn load_raw(&mut self, data: &[u8], width: u32, height: u32, format: Format) -> Result<()> {
        if format != FORMAT {
            return Err(DeviceError::unsupported(format!("{:?} cube images", format)));
        }

        if width != height {
            return Err(DeviceError::invalid(format!("cube faces must be square, got {}x{}", width, height)));
        }

        self.allocate(width, 1);

        if data.len() != self.data.len() {
            return Err(DeviceError::invalid(format!(
                "six {}x{} faces need {} bytes, got {}",
                width,
                height,
                self.data.len(),
                data.len()
            )));
        }

        self.data.copy_from_slice(data);
        Ok(())
    }

    fn create_texture_param(&self, view_flags: ViewFlags) -> TextureParam {
        let param = TextureParam::new_cube(self.size, self.num_mips, FORMAT, view_flags);

        if view_flags.contains(ViewFlags::CPU_READ) {
            return param;
        }

        let image_datas = (0..CUBEMAP_NUM_FACES)
            .flat_map(|face| (0..self.num_mips).map(move |mip| (face, mip)))
            .map(|(face, mip)| {
                let row_pitch = FORMAT.row_pitch(self.mip_size(mip));
                let start = self.offsets[(mip + face * self.num_mips) as usize];

                SubresourceData {
                    data: self.data[start..start + self.subresource_len(mip)].to_vec(),
                    row_pitch,
                    depth_pitch: row_pitch * self.mip_size(mip),
                }
            })
            .collect();

        param.with_data(image_datas)
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn initialize_from_texture_object(&mut self, device: &mut dyn RenderDevice, texture: &TextureObject) -> Result<()> {
        let desc = texture.desc();

        if desc.array_size != CUBEMAP_NUM_FACES || desc.width != desc.height {
            return Err(DeviceError::invalid(format!(
                "texture {}x{} with {} slices is not a cubemap",
                desc.width, desc.height, desc.array_size
            )));
        }

        if desc.format != FORMAT {
            return Err(DeviceError::unsupported(format!("reading {:?} textures into a cube image", desc.format)));
        }

        self.allocate(desc.width, desc.num_mips);

        for face in 0..CUBEMAP_NUM_FACES {
            for mip in 0..desc.num_mips {
                let pixels = read_subresource(device, texture, face, mip)?;
                self.update_sub_image(face, mip, &pixels)?;
            }
        }

        Ok(())
    }

    fn is_requiring_fix(&self) -> SizeFix {
        SizeFix::for_extent(self.size, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(size: u32) -> CubeImage {
        let face_len = FORMAT.row_pitch(size) as usize * size as usize;
        let data: Vec<u8> = (0..CUBEMAP_NUM_FACES as usize)
            .flat_map(|face| std::iter::repeat(face as u8).take(face_len))
            .collect();

        let mut image = CubeImage::default();
        image.load_raw(&data, size, size, FORMAT).unwrap();
        image
    }

    #[test]
    fn faces_are_stored_face_major() {
        let image = cube(4);

        assert_eq!(image.num_mips(), 1);
        assert!(image.face(3, 0).unwrap().iter().all(|b| *b == 3));
        assert!(image.face(6, 0).is_err());
        assert!(image.face(0, 1).is_err());
    }

    #[test]
    fn texture_param_is_a_cube_with_data() {
        let image = cube(8);
        let param = image.create_texture_param(ViewFlags::SRV);

        assert!(param.shape().is_cube());
        assert_eq!(param.image_datas.len(), 6);
        assert!(param.image_datas[5].data.iter().all(|b| *b == 5));
        param.validate().unwrap();
    }

    #[test]
    fn sub_images_must_match_the_mip() {
        let mut image = CubeImage::default();
        image.allocate(8, 4);

        let mip2 = vec![9u8; FORMAT.row_pitch(2) as usize * 2];
        image.update_sub_image(1, 2, &mip2).unwrap();
        assert_eq!(image.face(1, 2).unwrap(), &mip2[..]);
        assert!(image.face(1, 1).unwrap().iter().all(|b| *b == 0));

        assert!(image.update_sub_image(1, 3, &mip2).is_err());
    }

    #[test]
    fn only_half_float_is_accepted() {
        let mut image = CubeImage::default();
        let err = image.load_raw(&[0u8; 24], 1, 1, Format::Rgba8Unorm).unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported(_)));
    }

    #[test]
    fn non_power_of_two_faces_need_a_fix() {
        assert!(cube(6).is_requiring_fix().needs_fix);
        assert!(!cube(4).is_requiring_fix().needs_fix);
    }
}
