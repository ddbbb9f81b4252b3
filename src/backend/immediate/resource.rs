// wgpu-side allocations
//
// These are what the tracker owns. CPU_READ textures have no wgpu texture
// at all: they are a mappable buffer laid out one subresource after the
// other, with rows padded to the copy alignment.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::MapGuard;
use crate::types::{SrvKind, TextureParam, ViewDimension};

pub struct WgpuBuffer {
    pub buffer: wgpu::Buffer,
    pub cpu_read: bool,
    mapped: AtomicBool,
}

impl WgpuBuffer {
    pub fn new(buffer: wgpu::Buffer, cpu_read: bool) -> Self {
        Self {
            buffer,
            cpu_read,
            mapped: AtomicBool::new(false),
        }
    }
}

/// Placement of one subresource inside a readback buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackRegion {
    pub offset: u64,
    pub row_pitch: u32,
    pub rows: u32,
    pub depth: u32,
}

impl ReadbackRegion {
    pub fn size(&self) -> u64 {
        self.row_pitch as u64 * self.rows as u64 * self.depth as u64
    }
}

/// Regions of every subresource, indexed like subresources
pub fn readback_regions(desc: &TextureParam) -> Vec<ReadbackRegion> {
    let mut regions = vec![
        ReadbackRegion {
            offset: 0,
            row_pitch: 0,
            rows: 0,
            depth: 0,
        };
        desc.num_subresources() as usize
    ];
    let mut offset = 0;

    for face in 0..desc.array_size {
        for mip in 0..desc.num_mips {
            let (w, h, d) = desc.mip_extent(mip);
            let region = ReadbackRegion {
                offset,
                row_pitch: desc.format.readback_row_pitch(w),
                rows: h,
                depth: d,
            };

            offset += region.size();
            regions[desc.subresource_index(face, mip) as usize] = region;
        }
    }

    regions
}

pub enum TextureStorage {
    Device {
        texture: wgpu::Texture,
        srvs: HashMap<SrvKind, wgpu::TextureView>,
        uavs: HashMap<u32, wgpu::TextureView>,
    },
    Readback {
        buffer: wgpu::Buffer,
        regions: Vec<ReadbackRegion>,
    },
}

pub struct WgpuTexture {
    pub desc: Arc<TextureParam>,
    pub storage: TextureStorage,
    mapped: AtomicBool,
}

impl WgpuTexture {
    pub fn new(desc: Arc<TextureParam>, storage: TextureStorage) -> Self {
        Self {
            desc,
            storage,
            mapped: AtomicBool::new(false),
        }
    }

    pub fn texture(&self) -> Result<&wgpu::Texture> {
        match &self.storage {
            TextureStorage::Device { texture, .. } => Ok(texture),
            TextureStorage::Readback { .. } => anyhow::bail!("CPU_READ textures only exist as readback memory"),
        }
    }

    pub fn srv(&self, kind: SrvKind) -> Result<&wgpu::TextureView> {
        match &self.storage {
            TextureStorage::Device { srvs, .. } => srvs.get(&kind).with_context(|| format!("texture has no {:?} view", kind)),
            TextureStorage::Readback { .. } => anyhow::bail!("CPU_READ textures have no views"),
        }
    }

    pub fn uav(&self, mip: u32) -> Result<&wgpu::TextureView> {
        match &self.storage {
            TextureStorage::Device { uavs, .. } => uavs.get(&mip).with_context(|| format!("texture has no UAV for mip {}", mip)),
            TextureStorage::Readback { .. } => anyhow::bail!("CPU_READ textures have no views"),
        }
    }
}

impl MapGuard for WgpuBuffer {
    fn map_flag(&self) -> &AtomicBool {
        &self.mapped
    }
}

impl MapGuard for WgpuTexture {
    fn map_flag(&self) -> &AtomicBool {
        &self.mapped
    }
}

pub fn view_dimension(dimension: ViewDimension) -> wgpu::TextureViewDimension {
    match dimension {
        ViewDimension::D1 | ViewDimension::D1Array => wgpu::TextureViewDimension::D1,
        ViewDimension::D2 | ViewDimension::Buffer => wgpu::TextureViewDimension::D2,
        ViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
        ViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        ViewDimension::CubeArray => wgpu::TextureViewDimension::CubeArray,
        ViewDimension::D3 => wgpu::TextureViewDimension::D3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Format, ViewFlags};

    #[test]
    fn readback_regions_are_contiguous_and_aligned() {
        let desc = TextureParam::new_2d(64, 64, Format::Rgba16Float, ViewFlags::CPU_READ)
            .with_mips(3)
            .with_array_size(2);
        let regions = readback_regions(&desc);

        assert_eq!(regions.len(), 6);

        // face 0: mips 64, 32, 16 all fit in one 512 or 256 byte row
        assert_eq!(regions[0], ReadbackRegion { offset: 0, row_pitch: 512, rows: 64, depth: 1 });
        assert_eq!(regions[1].offset, 512 * 64);
        assert_eq!(regions[1].row_pitch, 256);
        assert_eq!(regions[2].offset, 512 * 64 + 256 * 32);

        // face 1 starts after face 0's last mip
        let face1 = desc.subresource_index(1, 0) as usize;
        assert_eq!(regions[face1].offset, regions[2].offset + regions[2].size());

        for region in &regions {
            assert_eq!(region.offset % 256, 0);
        }
    }
}
