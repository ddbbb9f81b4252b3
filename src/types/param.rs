// Resource descriptors
//
// Plain values describing the buffer or texture a client wants. They are
// validated before any backend call and shared with the created resource
// object behind an Arc, so they never change once a resource exists.

use bitflags::bitflags;

use super::Format;
use crate::error::{DeviceError, Result};

/// Number of faces of a cubemap
pub const CUBEMAP_NUM_FACES: u32 = 6;

bitflags! {
    /// Views and usages requested for a resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ViewFlags: u32 {
        /// Shader-readable (sampled texture / read-only storage buffer)
        const SRV = 1;
        /// Unordered access (storage texture / read-write storage buffer)
        const UAV = 1 << 1;
        /// Host-readable staging resource
        const CPU_READ = 1 << 2;
    }
}

/// Number of levels of a full mip chain for `size`
pub fn count_mips(size: u32) -> u32 {
    if size == 0 {
        return 0;
    }

    32 - size.leading_zeros()
}

/// Buffer descriptor. Contents are 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferParam {
    pub num_elements: u32,
    /// Size of one element in bytes, must be a multiple of 4
    pub element_size: u32,
    pub view_flags: ViewFlags,
    /// Optional initial contents, empty or exactly `word_count()` words
    pub initial_data: Vec<u32>,
}

impl BufferParam {
    pub fn new(num_elements: u32, element_size: u32, view_flags: ViewFlags) -> Self {
        Self {
            num_elements,
            element_size,
            view_flags,
            initial_data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u32>) -> Self {
        self.initial_data = data;
        self
    }

    /// Independent copy, used when cloning a resource
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn byte_size(&self) -> u64 {
        self.num_elements as u64 * self.element_size as u64
    }

    pub fn word_count(&self) -> usize {
        (self.byte_size() / 4) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_elements == 0 || self.element_size == 0 {
            return Err(DeviceError::invalid("buffer has zero elements or zero element size"));
        }

        if self.element_size % 4 != 0 {
            return Err(DeviceError::invalid(format!(
                "buffer element size {} is not a multiple of 4",
                self.element_size
            )));
        }

        if self.view_flags.contains(ViewFlags::CPU_READ)
            && self.view_flags.intersects(ViewFlags::UAV | ViewFlags::SRV)
        {
            return Err(DeviceError::invalid(
                "CPU_READ buffers cannot also be shader-visible",
            ));
        }

        if !self.initial_data.is_empty() && self.initial_data.len() != self.word_count() {
            return Err(DeviceError::invalid(format!(
                "buffer initial data has {} words, expected {}",
                self.initial_data.len(),
                self.word_count()
            )));
        }

        Ok(())
    }
}

/// Initial pixels of one subresource (one array slice of one mip)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubresourceData {
    pub data: Vec<u8>,
    pub row_pitch: u32,
    /// Bytes between two depth slices, only meaningful for 3D textures
    pub depth_pitch: u32,
}

/// Dimensionality of a texture, derived from its extents and array size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureShape {
    D1,
    D2,
    D3,
    Cube,
    CubeArray,
}

impl TextureShape {
    pub fn is_cube(self) -> bool {
        matches!(self, TextureShape::Cube | TextureShape::CubeArray)
    }
}

/// Texture descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureParam {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub num_mips: u32,
    pub array_size: u32,
    pub format: Format,
    pub view_flags: ViewFlags,
    /// Initial data, face-major: index = mip + face * num_mips
    pub image_datas: Vec<SubresourceData>,
}

impl TextureParam {
    pub fn new_2d(width: u32, height: u32, format: Format, view_flags: ViewFlags) -> Self {
        Self {
            width,
            height,
            depth: 1,
            num_mips: 1,
            array_size: 1,
            format,
            view_flags,
            image_datas: Vec::new(),
        }
    }

    pub fn new_cube(size: u32, num_mips: u32, format: Format, view_flags: ViewFlags) -> Self {
        Self {
            num_mips,
            array_size: CUBEMAP_NUM_FACES,
            ..Self::new_2d(size, size, format, view_flags)
        }
    }

    pub fn with_mips(mut self, num_mips: u32) -> Self {
        self.num_mips = num_mips;
        self
    }

    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_data(mut self, image_datas: Vec<SubresourceData>) -> Self {
        self.image_datas = image_datas;
        self
    }

    /// Independent copy, used when cloning a resource
    pub fn duplicate(&self) -> Self {
        self.clone()
    }

    pub fn shape(&self) -> TextureShape {
        if self.depth > 1 {
            TextureShape::D3
        } else if self.height == 1 {
            TextureShape::D1
        } else if self.array_size == CUBEMAP_NUM_FACES {
            TextureShape::Cube
        } else if self.array_size > CUBEMAP_NUM_FACES && self.array_size % CUBEMAP_NUM_FACES == 0 {
            TextureShape::CubeArray
        } else {
            TextureShape::D2
        }
    }

    pub fn num_subresources(&self) -> u32 {
        self.num_mips * self.array_size
    }

    pub fn subresource_index(&self, face: u32, mip: u32) -> u32 {
        mip + face * self.num_mips
    }

    /// Extent of `mip`, each axis clamped to 1
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 || self.array_size == 0 {
            return Err(DeviceError::invalid(format!(
                "texture has a zero extent ({}x{}x{}, array {})",
                self.width, self.height, self.depth, self.array_size
            )));
        }

        let max_mips = count_mips(self.width.max(self.height).max(self.depth));

        if self.num_mips == 0 || self.num_mips > max_mips {
            return Err(DeviceError::invalid(format!(
                "texture of {}x{}x{} cannot have {} mips (max {})",
                self.width, self.height, self.depth, self.num_mips, max_mips
            )));
        }

        if self.depth > 1 && self.array_size > 1 {
            return Err(DeviceError::invalid("3D textures cannot be arrays"));
        }

        let cpu_read = self.view_flags.contains(ViewFlags::CPU_READ);

        if cpu_read && self.view_flags.contains(ViewFlags::UAV) {
            return Err(DeviceError::invalid(
                "CPU_READ and UAV are mutually exclusive on a texture",
            ));
        }

        if cpu_read && !self.image_datas.is_empty() {
            return Err(DeviceError::invalid(
                "CPU_READ textures cannot be created with initial data",
            ));
        }

        if !self.image_datas.is_empty() {
            if self.image_datas.len() != self.num_subresources() as usize {
                return Err(DeviceError::invalid(format!(
                    "texture has {} subresources but {} initial datas were given",
                    self.num_subresources(),
                    self.image_datas.len()
                )));
            }

            for face in 0..self.array_size {
                for mip in 0..self.num_mips {
                    let index = self.subresource_index(face, mip) as usize;
                    let sub = &self.image_datas[index];
                    let (w, h, d) = self.mip_extent(mip);

                    if sub.row_pitch < self.format.row_pitch(w) {
                        return Err(DeviceError::invalid(format!(
                            "subresource {} row pitch {} is smaller than a row ({} bytes)",
                            index,
                            sub.row_pitch,
                            self.format.row_pitch(w)
                        )));
                    }

                    let slice = sub.row_pitch as usize * h as usize;
                    let needed = if d > 1 {
                        (sub.depth_pitch as usize).max(slice) * d as usize
                    } else {
                        slice
                    };

                    if sub.data.len() < needed {
                        return Err(DeviceError::invalid(format!(
                            "subresource {} holds {} bytes, needs {}",
                            index,
                            sub.data.len(),
                            needed
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_counts() {
        assert_eq!(count_mips(0), 0);
        assert_eq!(count_mips(1), 1);
        assert_eq!(count_mips(2), 2);
        assert_eq!(count_mips(3), 2);
        assert_eq!(count_mips(512), 10);
        assert_eq!(count_mips(1000), 10);
    }

    #[test]
    fn buffer_element_size_must_be_word_aligned() {
        assert!(BufferParam::new(4, 12, ViewFlags::UAV).validate().is_ok());

        let err = BufferParam::new(4, 6, ViewFlags::UAV).validate().unwrap_err();
        assert!(matches!(err, DeviceError::InvalidDescriptor(_)));
    }

    #[test]
    fn buffer_initial_data_length_is_checked() {
        let param = BufferParam::new(2, 8, ViewFlags::SRV).with_data(vec![1, 2, 3]);
        assert!(param.validate().is_err());

        let param = BufferParam::new(2, 8, ViewFlags::SRV).with_data(vec![1, 2, 3, 4]);
        assert!(param.validate().is_ok());
    }

    #[test]
    fn duplicate_is_independent() {
        let original = TextureParam::new_cube(64, 3, Format::Rgba16Float, ViewFlags::SRV);
        let mut copy = original.duplicate();

        assert_eq!(copy, original);

        copy.width = 32;
        copy.view_flags |= ViewFlags::UAV;

        assert_eq!(original.width, 64);
        assert_eq!(original.view_flags, ViewFlags::SRV);

        let buffer = BufferParam::new(4, 4, ViewFlags::UAV).with_data(vec![0; 4]);
        let mut buffer_copy = buffer.duplicate();
        buffer_copy.initial_data[0] = 7;
        assert_eq!(buffer.initial_data[0], 0);
    }

    #[test]
    fn shape_classification() {
        let flags = ViewFlags::SRV;

        assert_eq!(TextureParam::new_2d(16, 1, Format::R32Float, flags).shape(), TextureShape::D1);
        assert_eq!(TextureParam::new_2d(16, 16, Format::R32Float, flags).shape(), TextureShape::D2);
        assert_eq!(
            TextureParam::new_2d(16, 16, Format::R32Float, flags).with_depth(4).shape(),
            TextureShape::D3
        );
        assert_eq!(
            TextureParam::new_cube(16, 1, Format::R32Float, flags).shape(),
            TextureShape::Cube
        );
        assert_eq!(
            TextureParam::new_2d(16, 16, Format::R32Float, flags).with_array_size(12).shape(),
            TextureShape::CubeArray
        );
        assert_eq!(
            TextureParam::new_2d(16, 16, Format::R32Float, flags).with_array_size(8).shape(),
            TextureShape::D2
        );
    }

    #[test]
    fn conflicting_texture_flags_are_rejected() {
        let param = TextureParam::new_2d(8, 8, Format::Rgba8Unorm, ViewFlags::UAV | ViewFlags::CPU_READ);
        assert!(param.validate().is_err());

        let data = SubresourceData { data: vec![0; 8 * 8 * 4], row_pitch: 32, depth_pitch: 0 };
        let param = TextureParam::new_2d(8, 8, Format::Rgba8Unorm, ViewFlags::CPU_READ).with_data(vec![data]);
        assert!(param.validate().is_err());
    }

    #[test]
    fn initial_data_must_cover_every_subresource() {
        let face = |size: u32| SubresourceData {
            data: vec![0; (size * size * 8) as usize],
            row_pitch: size * 8,
            depth_pitch: 0,
        };

        let param = TextureParam::new_cube(4, 2, Format::Rgba16Float, ViewFlags::SRV)
            .with_data((0..6).map(|_| face(4)).collect());
        assert!(param.validate().is_err());

        let datas = (0..6).flat_map(|_| [face(4), face(2)]).collect();
        let param = TextureParam::new_cube(4, 2, Format::Rgba16Float, ViewFlags::SRV).with_data(datas);
        assert!(param.validate().is_ok());
        assert_eq!(param.subresource_index(3, 1), 7);
    }

    #[test]
    fn too_many_mips_are_rejected() {
        let param = TextureParam::new_2d(8, 8, Format::R8Unorm, ViewFlags::SRV).with_mips(5);
        assert!(param.validate().is_err());
        assert!(param.with_mips(4).validate().is_ok());
    }
}
