// Pixel / element formats
//
// A small closed set shared by both backends. Each backend owns a
// table mapping these to its native enumeration (see
// backend/immediate/format.rs and backend/explicit/format.rs).

use serde::Deserialize;

/// Row alignment of texture data copied into buffers
pub const READBACK_PITCH_ALIGNMENT: u32 = 256;

/// Formats a texture can be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    R11g11b10Float,
    R16Unorm,
    Rg16Unorm,
    Rgba16Unorm,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
}

impl Format {
    /// Every supported format, in declaration order
    pub const ALL: [Format; 11] = [
        Format::R8Unorm,
        Format::Rg8Unorm,
        Format::Rgba8Unorm,
        Format::R11g11b10Float,
        Format::R16Unorm,
        Format::Rg16Unorm,
        Format::Rgba16Unorm,
        Format::Rgba16Float,
        Format::R32Float,
        Format::Rg32Float,
        Format::Rgba32Float,
    ];

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Unorm => 2,
            Format::Rgba8Unorm
            | Format::R11g11b10Float
            | Format::Rg16Unorm
            | Format::R32Float => 4,
            Format::Rgba16Unorm | Format::Rgba16Float | Format::Rg32Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub fn channels(self) -> u32 {
        match self {
            Format::R8Unorm | Format::R16Unorm | Format::R32Float => 1,
            Format::Rg8Unorm | Format::Rg16Unorm | Format::Rg32Float => 2,
            Format::R11g11b10Float => 3,
            Format::Rgba8Unorm | Format::Rgba16Unorm | Format::Rgba16Float | Format::Rgba32Float => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            Format::R11g11b10Float
                | Format::Rgba16Float
                | Format::R32Float
                | Format::Rg32Float
                | Format::Rgba32Float
        )
    }

    /// Tightly packed row size for `width` pixels
    pub fn row_pitch(self, width: u32) -> u32 {
        width * self.bytes_per_pixel()
    }

    /// Row size used when a texture row is copied into a buffer
    pub fn readback_row_pitch(self, width: u32) -> u32 {
        self.row_pitch(width).div_ceil(READBACK_PITCH_ALIGNMENT) * READBACK_PITCH_ALIGNMENT
    }
}
