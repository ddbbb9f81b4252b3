// Explicit backend (Vulkan)
//
// Work is recorded on one of three streams and submitted synchronously.
// Copies and unordered-access dispatches are bracketed by transitions on
// the transition stream: into the operation state, run, back to rest.
// Pipelines are cached per shader (Context), descriptor sets per binding
// set (SubContext).

mod barrier;
mod buffer;
mod context;
mod device;
mod format;
mod pipeline;
mod resource;
mod shader;
mod sync;

pub use device::{SupportedFeatures, VulkanDevice};
pub use format::{from_vk, to_vk};

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use ash::vk;
use gpu_allocator::MemoryLocation;
use rustc_hash::FxHashMap;

use super::{mapped_buffer_pitch, MapGuard};
use crate::binding::{reads_resource_written, resolve, BoundResource};
use crate::config::{DeviceConfig, RendererKind};
use crate::device::{DebugMarker, DeviceFeature, MarkerStack, RenderDevice};
use crate::error::{DeviceError, LogFailure, Result};
use crate::shader::{ShaderLibrary, ShaderSource};
use crate::tracker::ObjectTracker;
use crate::types::{
    BufferObject, BufferParam, ComputeCommand, CopyBufferParam, CopyTextureSubresourceParam,
    CopyTextureSubresourceToBufferParam, MappedResource, SamplerState, SrvKind, TextureObject,
    TextureParam, TextureShape, UavKind, ViewDimension, ViewFlags, ViewPlan,
};
use barrier::{commit, stage_masks, Move, ResourceState, Transition};
use buffer::{color_range, GpuBuffer, GpuImage};
use context::{shader_key, BindingKey, Context, SubContext};
use pipeline::ComputePipeline;
use resource::{Barrier, Barriered, ConstantBuffer, VkBuffer, VkTexture};
use sync::{StreamKind, Streams};

/// A resource taking part in an operation and the state it needs
struct Usage<'a> {
    resource: &'a dyn Barriered,
    subresources: Vec<u32>,
    state: ResourceState,
}

/// What a resolved slot is bound to, kept alive for the dispatch
enum Held<'a> {
    Constant(&'a ConstantBuffer),
    /// Buffer and whether it is bound for writing
    Buffer(Arc<VkBuffer>, bool),
    /// Texture, view kind, and whether the same dispatch also writes it
    Srv(Arc<VkTexture>, SrvKind, bool),
    Uav(Arc<VkTexture>, u32),
    Sampler(vk::Sampler),
}

enum DescriptorInfo {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
}

fn weak_any<T: Any + Send + Sync>(object: &Arc<T>) -> Weak<dyn Any + Send + Sync> {
    let weak: Weak<T> = Arc::downgrade(object);
    weak
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn view_type(dimension: ViewDimension) -> vk::ImageViewType {
    match dimension {
        ViewDimension::D1 => vk::ImageViewType::TYPE_1D,
        ViewDimension::D1Array => vk::ImageViewType::TYPE_1D_ARRAY,
        ViewDimension::D2 | ViewDimension::Buffer => vk::ImageViewType::TYPE_2D,
        ViewDimension::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        ViewDimension::Cube => vk::ImageViewType::CUBE,
        ViewDimension::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        ViewDimension::D3 => vk::ImageViewType::TYPE_3D,
    }
}

fn array_layer(desc: &TextureParam, face: u32) -> u32 {
    if desc.shape() == TextureShape::D3 {
        0
    } else {
        face
    }
}

fn subresource_layers(desc: &TextureParam, face: u32, mip: u32) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: mip,
        base_array_layer: array_layer(desc, face),
        layer_count: 1,
    }
}

fn check_subresource(desc: &TextureParam, face: u32, mip: u32) -> Result<()> {
    if face >= desc.array_size || mip >= desc.num_mips {
        return Err(DeviceError::invalid(format!(
            "subresource (face {}, mip {}) is out of range for a texture with {} slices and {} mips",
            face, mip, desc.array_size, desc.num_mips
        )));
    }
    Ok(())
}

/// Make transfer writes visible to host reads of mapped memory
unsafe fn host_read_barrier(device: &ash::Device, cb: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ)
        .build();

    device.cmd_pipeline_barrier(
        cb,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::HOST,
        vk::DependencyFlags::empty(),
        &[barrier],
        &[],
        &[],
    );
}

/// Record the barriers of `transitions` on the transition stream and wait
fn submit_barriers(
    streams: &mut Streams,
    labels: &[String],
    usages: &[Usage<'_>],
    transitions: &[Vec<Transition>],
) -> anyhow::Result<()> {
    let mut buffer_barriers = Vec::new();
    let mut image_barriers = Vec::new();

    for (usage, list) in usages.iter().zip(transitions) {
        for transition in list {
            match usage.resource.barrier(transition) {
                Barrier::Buffer(b) => buffer_barriers.push(b),
                Barrier::Image(i) => image_barriers.push(i),
            }
        }
    }

    if buffer_barriers.is_empty() && image_barriers.is_empty() {
        return Ok(());
    }

    let (src_stage, dst_stage) = stage_masks(transitions.iter().flatten());

    streams.execute(StreamKind::Transition, labels, |device, cb| unsafe {
        device.cmd_pipeline_barrier(
            cb,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &buffer_barriers,
            &image_barriers,
        );
    })?;

    Ok(())
}

/// Move every usage to the state `to` picks for it. The tracker is only
/// updated once the barriers are on the device.
fn move_usages(
    streams: &mut Streams,
    labels: &[String],
    usages: &[Usage<'_>],
    to: impl Fn(&Usage<'_>) -> ResourceState,
) -> anyhow::Result<()> {
    let moves: Vec<Move<'_>> = usages
        .iter()
        .map(|u| Move {
            states: u.resource.states(),
            subresources: &u.subresources,
            to: to(u),
        })
        .collect();

    commit(&moves, |transitions| submit_barriers(streams, labels, usages, transitions))
}

/// Move `usages` into their operation state, run `record` on `stream`, then
/// move them back to rest
fn run_transitioned(
    streams: &mut Streams,
    labels: &[String],
    usages: &[Usage<'_>],
    stream: StreamKind,
    record: impl FnOnce(&ash::Device, vk::CommandBuffer),
) -> anyhow::Result<()> {
    move_usages(streams, labels, usages, |u| u.state)?;

    let result = streams.execute(stream, labels, record);

    move_usages(streams, labels, usages, |_| ResourceState::ShaderReadable)?;

    result.map(|_| ())
}

fn create_sampler(device: &VulkanDevice, state: SamplerState) -> anyhow::Result<vk::Sampler> {
    let (filter, mipmap_mode) = match state {
        SamplerState::Point => (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST),
        SamplerState::Linear => (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR),
    };

    let info = vk::SamplerCreateInfo::builder()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(mipmap_mode)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE);

    unsafe { device.device.create_sampler(&info, None) }.context("Failed to create sampler")
}

pub struct ExplicitDevice {
    config: DeviceConfig,
    contexts: FxHashMap<u64, Context>,
    constant_buffers: HashMap<String, ConstantBuffer>,
    point_sampler: vk::Sampler,
    linear_sampler: vk::Sampler,
    streams: Streams,
    tracker: Arc<ObjectTracker>,
    shaders: ShaderLibrary,
    markers: MarkerStack,
    device: Arc<VulkanDevice>,
}

impl ExplicitDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let device = VulkanDevice::new(
            "cubemill",
            config.debug_layer,
            config.capture,
            config.software_adapter,
        )?;
        let streams = Streams::new(&device)?;
        let point_sampler = create_sampler(&device, SamplerState::Point)?;
        let linear_sampler = match create_sampler(&device, SamplerState::Linear) {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe { device.device.destroy_sampler(point_sampler, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            config,
            contexts: FxHashMap::default(),
            constant_buffers: HashMap::new(),
            point_sampler,
            linear_sampler,
            streams,
            tracker: ObjectTracker::new(),
            shaders: ShaderLibrary::default(),
            markers: MarkerStack::default(),
            device,
        })
    }

    fn labels(&self) -> Vec<String> {
        if self.config.capture {
            self.markers.labels()
        } else {
            Vec::new()
        }
    }

    fn sampler(&self, state: SamplerState) -> vk::Sampler {
        match state {
            SamplerState::Point => self.point_sampler,
            SamplerState::Linear => self.linear_sampler,
        }
    }

    fn create_buffer_impl(&mut self, params: &Arc<BufferParam>) -> Result<BufferObject> {
        params.validate()?;

        let labels = self.labels();
        let cpu_read = params.view_flags.contains(ViewFlags::CPU_READ);
        let size = params.byte_size();

        log::debug!(
            "Creating buffer: {} x {} bytes, flags {:?}",
            params.num_elements,
            params.element_size,
            params.view_flags
        );

        let (usage, location) = if cpu_read {
            (vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu)
        } else {
            (
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )
        };

        let mut buffer = GpuBuffer::new(&self.device, "cubemill buffer", size, usage, location)?;
        let initial: &[u8] = bytemuck::cast_slice(&params.initial_data);

        if cpu_read && !initial.is_empty() {
            buffer.write(initial)?;
        }

        let internal = VkBuffer::new(buffer, cpu_read);

        if !cpu_read && !initial.is_empty() {
            let mut staging = GpuBuffer::new(
                &self.device,
                "cubemill staging buffer",
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            )?;
            staging.write(initial)?;

            let usages = [Usage {
                resource: &internal,
                subresources: vec![0],
                state: ResourceState::CopyDest,
            }];

            run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Copy, |device, cb| unsafe {
                let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
                device.cmd_copy_buffer(cb, staging.buffer, internal.buffer.buffer, &[region]);
            })?;
        }

        let resource = self.tracker.track(internal);
        Ok(BufferObject::new(params.clone(), resource, Vec::new()))
    }

    fn create_buffer_from_impl(&mut self, src: &BufferObject) -> Result<BufferObject> {
        let source = src.resource().upgrade::<VkBuffer>()?;

        if source.cpu_read {
            return Err(DeviceError::unsupported("cloning a CPU_READ buffer"));
        }

        let labels = self.labels();
        let desc = Arc::new(src.desc().duplicate());
        let size = desc.byte_size();

        let internal = VkBuffer::new(
            GpuBuffer::new(
                &self.device,
                "cubemill buffer",
                size,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )?,
            false,
        );

        let readback = GpuBuffer::new(
            &self.device,
            "cubemill readback buffer",
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let usages = [
            Usage {
                resource: source.as_ref(),
                subresources: vec![0],
                state: ResourceState::CopySource,
            },
            Usage {
                resource: &internal,
                subresources: vec![0],
                state: ResourceState::CopyDest,
            },
        ];

        run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Copy, |device, cb| unsafe {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            device.cmd_copy_buffer(cb, source.buffer.buffer, internal.buffer.buffer, &[region]);
            device.cmd_copy_buffer(cb, source.buffer.buffer, readback.buffer, &[region]);
            host_read_barrier(device, cb);
        })?;

        let bytes = readback.read(0, size as usize)?;
        let data: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);

        let resource = self.tracker.track(internal);
        Ok(BufferObject::new(desc, resource, data))
    }

    fn create_texture_impl(&mut self, params: &Arc<TextureParam>) -> Result<TextureObject> {
        params.validate()?;

        if params.view_flags.contains(ViewFlags::CPU_READ) {
            return Err(DeviceError::unsupported(
                "CPU_READ textures on the explicit backend, copy into a CPU_READ buffer instead",
            ));
        }

        let labels = self.labels();
        let shape = params.shape();
        let format = to_vk(params.format);

        log::debug!(
            "Creating texture: {}x{}x{}, mips {}, array {}, {:?}, flags {:?}",
            params.width,
            params.height,
            params.depth,
            params.num_mips,
            params.array_size,
            params.format,
            params.view_flags
        );

        let image_type = match shape {
            TextureShape::D1 => vk::ImageType::TYPE_1D,
            TextureShape::D3 => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        };

        let flags = if shape.is_cube() {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let mut usage =
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;

        if params.view_flags.contains(ViewFlags::UAV) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }

        let layers = if shape == TextureShape::D3 { 1 } else { params.array_size };

        let info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(image_type)
            .format(format)
            .extent(vk::Extent3D {
                width: params.width,
                height: params.height,
                depth: params.depth,
            })
            .mip_levels(params.num_mips)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = GpuImage::new(&self.device, "cubemill texture", &info)?;
        let mut texture = VkTexture::new(&self.device, params.clone(), image);

        let plan = ViewPlan::for_texture(params);
        let view_layers = |count: u32| if shape == TextureShape::D3 { 1 } else { count };

        for (kind, desc) in &plan.srvs {
            if desc.dimension == ViewDimension::CubeArray && !self.device.features.image_cube_array {
                log::warn!("Device lacks cube array views, {:?} view not created", kind);
                continue;
            }

            let view = texture.image.create_view(
                view_type(desc.dimension),
                format,
                color_range(desc.base_mip, desc.mip_count, desc.base_layer, view_layers(desc.layer_count)),
            )?;
            texture.add_srv(*kind, view);
        }

        for (kind, desc) in &plan.uavs {
            if let UavKind::Mip(mip) = kind {
                let view = texture.image.create_view(
                    view_type(desc.dimension),
                    format,
                    color_range(desc.base_mip, desc.mip_count, desc.base_layer, view_layers(desc.layer_count)),
                )?;
                texture.add_uav(*mip, view);
            }
        }

        let all = texture.states().lock().all();

        if params.image_datas.is_empty() {
            let usages = [Usage {
                resource: &texture,
                subresources: all,
                state: ResourceState::ShaderReadable,
            }];
            move_usages(&mut self.streams, &labels, &usages, |u| u.state)?;
        } else {
            self.upload_texture(&labels, &texture, all)?;
        }

        let resource = self.tracker.track(texture);
        Ok(TextureObject::new(params.clone(), resource))
    }

    fn upload_texture(&mut self, labels: &[String], texture: &VkTexture, all: Vec<u32>) -> Result<()> {
        let desc = &texture.desc;
        let bpp = desc.format.bytes_per_pixel();
        let mut regions = Vec::new();
        let mut offset = 0u64;

        for face in 0..desc.array_size {
            for mip in 0..desc.num_mips {
                let sub = &desc.image_datas[desc.subresource_index(face, mip) as usize];
                let (w, h, d) = desc.mip_extent(mip);

                if sub.row_pitch % bpp != 0 {
                    return Err(DeviceError::invalid(format!(
                        "row pitch {} is not a multiple of the {} byte pixel",
                        sub.row_pitch, bpp
                    )));
                }

                regions.push(vk::BufferImageCopy {
                    buffer_offset: offset,
                    buffer_row_length: sub.row_pitch / bpp,
                    buffer_image_height: if d > 1 { (sub.depth_pitch / sub.row_pitch).max(h) } else { 0 },
                    image_subresource: subresource_layers(desc, face, mip),
                    image_offset: vk::Offset3D::default(),
                    image_extent: vk::Extent3D {
                        width: w,
                        height: h,
                        depth: d,
                    },
                });

                offset = align_to(offset + sub.data.len() as u64, 16);
            }
        }

        let mut staging = GpuBuffer::new(
            &self.device,
            "cubemill staging buffer",
            offset.max(16),
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        let mut packed = vec![0u8; offset as usize];
        for (region, sub) in regions.iter().zip(
            (0..desc.array_size)
                .flat_map(|face| (0..desc.num_mips).map(move |mip| (face, mip)))
                .map(|(face, mip)| &desc.image_datas[desc.subresource_index(face, mip) as usize]),
        ) {
            let start = region.buffer_offset as usize;
            packed[start..start + sub.data.len()].copy_from_slice(&sub.data);
        }
        staging.write(&packed)?;

        let usages = [Usage {
            resource: texture,
            subresources: all,
            state: ResourceState::CopyDest,
        }];

        run_transitioned(&mut self.streams, labels, &usages, StreamKind::Copy, |device, cb| unsafe {
            device.cmd_copy_buffer_to_image(
                cb,
                staging.buffer,
                texture.image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        })?;

        Ok(())
    }

    fn copy_buffer_resource_impl(&mut self, params: &CopyBufferParam<'_>) -> Result<()> {
        let src = params.src.resource().upgrade::<VkBuffer>()?;
        let dst = params.dst.resource().upgrade::<VkBuffer>()?;

        if src.cpu_read {
            return Err(DeviceError::unsupported("copying from a CPU_READ buffer"));
        }

        if Arc::ptr_eq(&src, &dst) {
            return Err(DeviceError::invalid("source and destination are the same buffer"));
        }

        let size = params.src.desc().byte_size();

        if params.dst.desc().byte_size() != size {
            return Err(DeviceError::invalid(format!(
                "buffer copy size mismatch: {} vs {} bytes",
                size,
                params.dst.desc().byte_size()
            )));
        }

        let labels = self.labels();
        let usages = [
            Usage {
                resource: src.as_ref(),
                subresources: vec![0],
                state: ResourceState::CopySource,
            },
            Usage {
                resource: dst.as_ref(),
                subresources: vec![0],
                state: ResourceState::CopyDest,
            },
        ];

        run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Copy, |device, cb| unsafe {
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            device.cmd_copy_buffer(cb, src.buffer.buffer, dst.buffer.buffer, &[region]);

            if dst.cpu_read {
                host_read_barrier(device, cb);
            }
        })?;

        Ok(())
    }

    fn copy_texture_subresource_impl(&mut self, params: &CopyTextureSubresourceParam<'_>) -> Result<(u32, u32)> {
        let src = params.src.resource().upgrade::<VkTexture>()?;
        let dst = params.dst.resource().upgrade::<VkTexture>()?;

        check_subresource(&src.desc, params.src_face, params.src_mip)?;
        check_subresource(&dst.desc, params.dst_face, params.dst_mip)?;

        let (w, h, d) = src.desc.mip_extent(params.src_mip);

        if (w, h, d) != dst.desc.mip_extent(params.dst_mip) || src.desc.format != dst.desc.format {
            return Err(DeviceError::invalid("source and destination subresources differ in size or format"));
        }

        let src_index = src.desc.subresource_index(params.src_face, params.src_mip);
        let dst_index = dst.desc.subresource_index(params.dst_face, params.dst_mip);

        if Arc::ptr_eq(&src, &dst) && src_index == dst_index {
            return Err(DeviceError::invalid("source and destination are the same subresource"));
        }

        let labels = self.labels();
        let usages = [
            Usage {
                resource: src.as_ref(),
                subresources: vec![src_index],
                state: ResourceState::CopySource,
            },
            Usage {
                resource: dst.as_ref(),
                subresources: vec![dst_index],
                state: ResourceState::CopyDest,
            },
        ];

        let region = vk::ImageCopy {
            src_subresource: subresource_layers(&src.desc, params.src_face, params.src_mip),
            src_offset: vk::Offset3D::default(),
            dst_subresource: subresource_layers(&dst.desc, params.dst_face, params.dst_mip),
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: w,
                height: h,
                depth: d,
            },
        };

        run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Copy, |device, cb| unsafe {
            device.cmd_copy_image(
                cb,
                src.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })?;

        Ok((src_index, dst_index))
    }

    fn copy_texture_subresource_to_buffer_impl(
        &mut self,
        params: &CopyTextureSubresourceToBufferParam<'_>,
    ) -> Result<u32> {
        let texture = params.texture.resource().upgrade::<VkTexture>()?;
        let buffer = params.buffer.resource().upgrade::<VkBuffer>()?;

        check_subresource(&texture.desc, params.face, params.mip)?;

        let (w, h, d) = texture.desc.mip_extent(params.mip);
        let bpp = texture.desc.format.bytes_per_pixel();
        let row_pitch = texture.desc.format.readback_row_pitch(w);
        let needed = row_pitch as u64 * h as u64 * d as u64;

        if params.buffer.desc().byte_size() < needed {
            return Err(DeviceError::invalid(format!(
                "buffer holds {} bytes, subresource needs {}",
                params.buffer.desc().byte_size(),
                needed
            )));
        }

        let index = texture.desc.subresource_index(params.face, params.mip);
        let labels = self.labels();
        let usages = [
            Usage {
                resource: texture.as_ref(),
                subresources: vec![index],
                state: ResourceState::CopySource,
            },
            Usage {
                resource: buffer.as_ref(),
                subresources: vec![0],
                state: ResourceState::CopyDest,
            },
        ];

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: row_pitch / bpp,
            buffer_image_height: h,
            image_subresource: subresource_layers(&texture.desc, params.face, params.mip),
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: w,
                height: h,
                depth: d,
            },
        };

        run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Copy, |device, cb| unsafe {
            device.cmd_copy_image_to_buffer(
                cb,
                texture.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer.buffer.buffer,
                &[region],
            );

            if buffer.cpu_read {
                host_read_barrier(device, cb);
            }
        })?;

        Ok(row_pitch)
    }

    fn map_buffer_impl(&mut self, buffer: &BufferObject) -> Result<MappedResource> {
        let internal = buffer.resource().upgrade::<VkBuffer>()?;

        if !internal.cpu_read {
            return Err(DeviceError::invalid("only CPU_READ buffers can be mapped"));
        }

        let size = buffer.desc().byte_size();
        let pitch = mapped_buffer_pitch(size)?;

        internal.begin_map()?;

        let data = match internal.buffer.read(0, size as usize) {
            Ok(data) => data,
            Err(e) => {
                internal.end_map();
                return Err(e.into());
            }
        };

        let weak = Arc::downgrade(&internal);
        Ok(MappedResource::new(data, pitch, move || {
            if let Some(internal) = weak.upgrade() {
                internal.end_map();
            }
        }))
    }

    fn map_texture_impl(&mut self, texture: &TextureObject, _subresource: u32) -> Result<MappedResource> {
        texture.resource().upgrade::<VkTexture>()?;
        Err(DeviceError::invalid(
            "only CPU_READ textures can be mapped, copy the subresource into a CPU_READ buffer instead",
        ))
    }

    fn update_constant_buffer_impl(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let reflected = self
            .shaders
            .constant_buffer_size(name)
            .ok_or_else(|| DeviceError::UnknownConstantBuffer(name.to_string()))?;

        if data.is_empty() {
            return Err(DeviceError::invalid("constant buffer data is empty"));
        }

        if let Some(existing) = self.constant_buffers.get(name) {
            if existing.size != data.len() {
                return Err(DeviceError::ConstantBufferSizeMismatch {
                    name: name.to_string(),
                    expected: existing.size,
                    actual: data.len(),
                });
            }
        } else {
            let size = align_to(data.len().max(reflected as usize) as u64, 16);

            log::debug!("Creating constant buffer \"{}\" ({} bytes)", name, size);

            let buffer = GpuBuffer::new(
                &self.device,
                name,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )?;
            let upload = GpuBuffer::new(
                &self.device,
                name,
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            )?;

            self.constant_buffers
                .insert(name.to_string(), ConstantBuffer::new(buffer, upload, data.len()));
        }

        let labels = self.labels();
        let cb = self
            .constant_buffers
            .get_mut(name)
            .ok_or_else(|| DeviceError::UnknownConstantBuffer(name.to_string()))?;

        cb.upload.write(data)?;

        let cb = &*cb;
        let usages = [Usage {
            resource: cb,
            subresources: vec![0],
            state: ResourceState::CopyDest,
        }];

        run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Copy, |device, command| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: cb.buffer.size,
            };
            device.cmd_copy_buffer(command, cb.upload.buffer, cb.buffer.buffer, &[region]);
        })?;

        Ok(())
    }

    fn dispatch_impl(&mut self, command: &ComputeCommand<'_>) -> Result<()> {
        let shader = self.shaders.get(&command.shader)?.clone();
        let resolved = resolve(command, &shader.bindings)?;

        if command.dispatch.contains(&0) {
            return Err(DeviceError::invalid(format!("dispatch extent {:?} is empty", command.dispatch)));
        }

        let labels = self.labels();
        let mut held = Vec::with_capacity(resolved.len());

        for binding in &resolved {
            let item = match binding.resource {
                BoundResource::ConstantBuffer(name) => Held::Constant(
                    self.constant_buffers
                        .get(name)
                        .ok_or_else(|| DeviceError::UnknownConstantBuffer(name.to_string()))?,
                ),
                BoundResource::Srv(view) => match view.kind() {
                    SrvKind::Buffer => Held::Buffer(view.resource::<VkBuffer>()?, false),
                    kind => Held::Srv(
                        view.resource::<VkTexture>()?,
                        kind,
                        reads_resource_written(&resolved, view),
                    ),
                },
                BoundResource::Uav(view) => match view.kind() {
                    UavKind::Buffer => Held::Buffer(view.resource::<VkBuffer>()?, true),
                    UavKind::Mip(mip) => Held::Uav(view.resource::<VkTexture>()?, mip),
                },
                BoundResource::Sampler(sampler) => Held::Sampler(self.sampler(sampler.state)),
            };

            held.push((binding.group, binding.binding, item));
        }

        let key = shader_key(&shader.name);
        let stale = self.contexts.get(&key).map_or(true, |context| !context.is_current(&shader));

        if stale {
            log::debug!("Rebuilding stale Context for \"{}\"", shader.name);
            let pipeline = ComputePipeline::new(&self.device, &shader.name, &shader.bindings, &shader.spirv()?)?;
            self.contexts.insert(key, Context::new(shader.clone(), pipeline));
        }

        let context = self
            .contexts
            .get_mut(&key)
            .ok_or_else(|| DeviceError::UnknownShader(shader.name.clone()))?;

        let pruned = context.prune();
        if pruned > 0 {
            log::trace!("Pruned {} SubContext(s) of \"{}\"", pruned, shader.name);
        }

        let binding_key = BindingKey::new(command, &resolved);

        if context.sub_context(&binding_key).is_none() {
            let resources = held
                .iter()
                .filter_map(|(_, _, item)| match item {
                    Held::Buffer(buffer, _) => Some(weak_any(buffer)),
                    Held::Srv(texture, _, _) | Held::Uav(texture, _) => Some(weak_any(texture)),
                    Held::Constant(_) | Held::Sampler(_) => None,
                })
                .collect();

            let sub_context =
                SubContext::new(&self.device, &shader, &context.pipeline, binding_key.clone(), resources)?;
            write_descriptors(&self.device, &sub_context, &held)?;

            log::trace!("Built SubContext for \"{}\"", shader.name);
            context.insert_sub_context(sub_context);
        }

        let sub_context = context
            .sub_context(&binding_key)
            .ok_or_else(|| DeviceError::Backend(anyhow::anyhow!("SubContext missing after insertion")))?;

        let pipeline = context.pipeline.pipeline;
        let layout = context.pipeline.layout;
        let sets = sub_context.sets.clone();

        let mut usages: Vec<Usage<'_>> = Vec::new();
        let mut written: Vec<&Arc<VkTexture>> = Vec::new();

        for (_, _, item) in &held {
            match item {
                Held::Uav(texture, _) => {
                    if !written.iter().any(|t| Arc::ptr_eq(t, texture)) {
                        written.push(texture);
                        usages.push(Usage {
                            resource: texture.as_ref(),
                            subresources: texture.states().lock().all(),
                            state: ResourceState::UnorderedAccess,
                        });
                    }
                }
                Held::Buffer(buffer, true) => usages.push(Usage {
                    resource: buffer.as_ref(),
                    subresources: vec![0],
                    state: ResourceState::UnorderedAccess,
                }),
                _ => {}
            }
        }

        let [x, y, z] = command.dispatch;

        run_transitioned(&mut self.streams, &labels, &usages, StreamKind::Compute, |device, cb| unsafe {
            device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, pipeline);

            if !sets.is_empty() {
                device.cmd_bind_descriptor_sets(cb, vk::PipelineBindPoint::COMPUTE, layout, 0, &sets, &[]);
            }

            device.cmd_dispatch(cb, x, y, z);
        })?;

        Ok(())
    }

    fn install_shader_impl(&mut self, shader: ShaderSource) -> Result<()> {
        let spirv = shader.spirv()?;
        let pipeline = ComputePipeline::new(&self.device, &shader.name, &shader.bindings, &spirv)?;

        let (shader, _previous) = self.shaders.insert(shader);

        if let Some(old) = self
            .contexts
            .insert(shader_key(&shader.name), Context::new(shader.clone(), pipeline))
        {
            log::debug!(
                "Replaced Context of \"{}\", {} SubContext(s) dropped",
                shader.name,
                old.sub_context_count()
            );
        }

        Ok(())
    }
}

/// Fill the descriptor sets of a fresh SubContext
fn write_descriptors(
    device: &VulkanDevice,
    sub_context: &SubContext,
    held: &[(u32, u32, Held<'_>)],
) -> anyhow::Result<()> {
    let mut infos = Vec::with_capacity(held.len());

    for (group, binding, item) in held {
        let (ty, info) = match item {
            Held::Constant(cb) => (
                vk::DescriptorType::UNIFORM_BUFFER,
                DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                    buffer: cb.buffer.buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                }),
            ),
            Held::Buffer(buffer, _) => (
                vk::DescriptorType::STORAGE_BUFFER,
                DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                    buffer: buffer.buffer.buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                }),
            ),
            Held::Srv(texture, kind, general) => (
                vk::DescriptorType::SAMPLED_IMAGE,
                DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: texture.srv(*kind)?,
                    image_layout: if *general {
                        vk::ImageLayout::GENERAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    },
                }),
            ),
            Held::Uav(texture, mip) => (
                vk::DescriptorType::STORAGE_IMAGE,
                DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: texture.uav(*mip)?,
                    image_layout: vk::ImageLayout::GENERAL,
                }),
            ),
            Held::Sampler(sampler) => (
                vk::DescriptorType::SAMPLER,
                DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: *sampler,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }),
            ),
        };

        let set = *sub_context
            .sets
            .get(*group as usize)
            .with_context(|| format!("no descriptor set for group {}", group))?;

        infos.push((set, *binding, ty, info));
    }

    let writes: Vec<vk::WriteDescriptorSet> = infos
        .iter()
        .map(|(set, binding, ty, info)| {
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(*binding)
                .descriptor_type(*ty);

            match info {
                DescriptorInfo::Image(image) => write.image_info(std::slice::from_ref(image)).build(),
                DescriptorInfo::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)).build(),
            }
        })
        .collect();

    unsafe { device.device.update_descriptor_sets(&writes, &[]) };
    Ok(())
}

impl RenderDevice for ExplicitDevice {
    fn kind(&self) -> RendererKind {
        RendererKind::Explicit
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn check_feature_support(&self, feature: DeviceFeature) -> bool {
        let features = &self.device.features;

        match feature {
            DeviceFeature::SubgroupOperations => features.subgroup_arithmetic,
            DeviceFeature::Float32Filterable => features.float32_filterable,
            DeviceFeature::Storage16BitNorm => features.storage_16bit_norm,
        }
    }

    fn copy_buffer_resource(&mut self, params: &CopyBufferParam<'_>) -> Result<()> {
        self.copy_buffer_resource_impl(params).log_failure("copy_buffer_resource")
    }

    fn copy_texture_subresource(&mut self, params: &CopyTextureSubresourceParam<'_>) -> Result<(u32, u32)> {
        self.copy_texture_subresource_impl(params)
            .log_failure("copy_texture_subresource")
    }

    fn copy_texture_subresource_to_buffer(
        &mut self,
        params: &CopyTextureSubresourceToBufferParam<'_>,
    ) -> Result<u32> {
        self.copy_texture_subresource_to_buffer_impl(params)
            .log_failure("copy_texture_subresource_to_buffer")
    }

    fn create_buffer(&mut self, params: &Arc<BufferParam>) -> Result<BufferObject> {
        self.create_buffer_impl(params).log_failure("create_buffer")
    }

    fn create_buffer_from(&mut self, src: &BufferObject) -> Result<BufferObject> {
        self.create_buffer_from_impl(src).log_failure("create_buffer_from")
    }

    fn create_texture(&mut self, params: &Arc<TextureParam>) -> Result<TextureObject> {
        self.create_texture_impl(params).log_failure("create_texture")
    }

    fn create_debug_marker(&self, name: &str) -> DebugMarker {
        DebugMarker::new(&self.markers, name, self.config.capture)
    }

    fn dispatch(&mut self, command: &ComputeCommand<'_>) -> Result<()> {
        self.dispatch_impl(command).log_failure("dispatch")
    }

    fn install_shader(&mut self, shader: ShaderSource) -> Result<()> {
        self.install_shader_impl(shader).log_failure("install_shader")
    }

    fn map_buffer(&mut self, buffer: &BufferObject) -> Result<MappedResource> {
        self.map_buffer_impl(buffer).log_failure("map_buffer")
    }

    fn map_texture(&mut self, texture: &TextureObject, subresource: u32) -> Result<MappedResource> {
        self.map_texture_impl(texture, subresource).log_failure("map_texture")
    }

    fn update_constant_buffer(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.update_constant_buffer_impl(name, data)
            .log_failure("update_constant_buffer")
    }

    fn finalize(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Failed to wait for the device at finalize: {:#}", e);
        }

        let released = self.tracker.release_all();

        if released > 0 {
            log::warn!("{} resource(s) were still alive at finalize", released);
        }

        self.contexts.clear();
        self.constant_buffers.clear();
    }
}

impl Drop for ExplicitDevice {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();

        unsafe {
            self.device.device.destroy_sampler(self.point_sampler, None);
            self.device.device.destroy_sampler(self.linear_sampler, None);
        }
    }
}
