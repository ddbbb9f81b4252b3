// Format <-> wgpu::TextureFormat

use crate::types::Format;

pub fn to_native(format: Format) -> wgpu::TextureFormat {
    match format {
        Format::R8Unorm => wgpu::TextureFormat::R8Unorm,
        Format::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        Format::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Format::R11g11b10Float => wgpu::TextureFormat::Rg11b10Ufloat,
        Format::R16Unorm => wgpu::TextureFormat::R16Unorm,
        Format::Rg16Unorm => wgpu::TextureFormat::Rg16Unorm,
        Format::Rgba16Unorm => wgpu::TextureFormat::Rgba16Unorm,
        Format::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        Format::R32Float => wgpu::TextureFormat::R32Float,
        Format::Rg32Float => wgpu::TextureFormat::Rg32Float,
        Format::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

pub fn from_native(native: wgpu::TextureFormat) -> Option<Format> {
    Format::ALL.into_iter().find(|format| to_native(*format) == native)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        for format in Format::ALL {
            assert_eq!(from_native(to_native(format)), Some(format));
        }

        assert!(from_native(wgpu::TextureFormat::Bgra8Unorm).is_none());
    }

    #[test]
    fn pixel_sizes_agree() {
        for format in Format::ALL {
            let native = to_native(format);
            assert_eq!(native.block_copy_size(None), Some(format.bytes_per_pixel()));
        }
    }
}
