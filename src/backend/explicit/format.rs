// Format <-> vk::Format

use ash::vk;

use crate::types::Format;

pub fn to_vk(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R11g11b10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
        Format::R16Unorm => vk::Format::R16_UNORM,
        Format::Rg16Unorm => vk::Format::R16G16_UNORM,
        Format::Rgba16Unorm => vk::Format::R16G16B16A16_UNORM,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn from_vk(native: vk::Format) -> Option<Format> {
    Format::ALL.into_iter().find(|format| to_vk(*format) == native)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identity() {
        for format in Format::ALL {
            assert_eq!(from_vk(to_vk(format)), Some(format));
        }

        assert!(from_vk(vk::Format::B8G8R8A8_UNORM).is_none());
        assert!(from_vk(vk::Format::UNDEFINED).is_none());
    }

    #[test]
    fn packed_float_maps_to_packed_ufloat() {
        assert_eq!(to_vk(Format::R11g11b10Float), vk::Format::B10G11R11_UFLOAT_PACK32);
        assert_eq!(Format::R11g11b10Float.bytes_per_pixel(), 4);
    }
}
