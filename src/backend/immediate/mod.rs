// Immediate backend (wgpu)
//
// One device, one queue, no persistent binding state. Every operation
// records a fresh encoder, submits it and waits on the queue before
// returning. Validation errors are captured with error scopes and turned
// into DeviceError instead of reaching the uncaptured-error handler.

mod format;
mod resource;

pub use format::{from_native, to_native};

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use anyhow::Context;
use wgpu::util::DeviceExt;

use crate::binding::{resolve, BoundResource};
use crate::config::{DeviceConfig, RendererKind};
use crate::device::{DebugMarker, DeviceFeature, MarkerStack, RenderDevice};
use crate::error::{DeviceError, LogFailure, Result};
use crate::shader::{ShaderLibrary, ShaderSource, ENTRY_POINT};
use crate::tracker::ObjectTracker;
use crate::types::{
    BufferObject, BufferParam, ComputeCommand, CopyBufferParam, CopyTextureSubresourceParam,
    CopyTextureSubresourceToBufferParam, MappedResource, SamplerState, SrvKind, TextureObject,
    TextureParam, TextureShape, UavKind, ViewFlags, ViewPlan,
};
use super::{mapped_buffer_pitch, MapGuard};
use resource::{readback_regions, view_dimension, TextureStorage, WgpuBuffer, WgpuTexture};

struct ConstantBuffer {
    buffer: wgpu::Buffer,
    size: usize,
}

/// Encoder plus the debug groups opened on it
struct Recording {
    encoder: wgpu::CommandEncoder,
    groups: usize,
}

/// Allocations kept alive while a bind group is built
enum Held<'a> {
    Constant(&'a wgpu::Buffer),
    Buffer(Arc<WgpuBuffer>),
    Srv(Arc<WgpuTexture>, SrvKind),
    Uav(Arc<WgpuTexture>, u32),
    Sampler(&'a wgpu::Sampler),
}

pub struct ImmediateDevice {
    config: DeviceConfig,
    device: wgpu::Device,
    queue: wgpu::Queue,
    tracker: Arc<ObjectTracker>,
    shaders: ShaderLibrary,
    pipelines: HashMap<String, wgpu::ComputePipeline>,
    constant_buffers: HashMap<String, ConstantBuffer>,
    point_sampler: wgpu::Sampler,
    linear_sampler: wgpu::Sampler,
    markers: MarkerStack,
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn create_sampler(device: &wgpu::Device, state: SamplerState) -> wgpu::Sampler {
    let filter = match state {
        SamplerState::Point => wgpu::FilterMode::Nearest,
        SamplerState::Linear => wgpu::FilterMode::Linear,
    };

    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(match state {
            SamplerState::Point => "point sampler",
            SamplerState::Linear => "linear sampler",
        }),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: filter,
        ..Default::default()
    })
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

fn origin(desc: &TextureParam, face: u32) -> wgpu::Origin3d {
    let z = if desc.shape() == TextureShape::D3 { 0 } else { face };
    wgpu::Origin3d { x: 0, y: 0, z }
}

impl ImmediateDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let (device, queue) = pollster::block_on(Self::create_device(&config))?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("[wgpu] {}", error);
        }));

        let point_sampler = create_sampler(&device, SamplerState::Point);
        let linear_sampler = create_sampler(&device, SamplerState::Linear);

        Ok(Self {
            config,
            device,
            queue,
            tracker: ObjectTracker::new(),
            shaders: ShaderLibrary::default(),
            pipelines: HashMap::new(),
            constant_buffers: HashMap::new(),
            point_sampler,
            linear_sampler,
            markers: MarkerStack::default(),
        })
    }

    async fn create_device(config: &DeviceConfig) -> anyhow::Result<(wgpu::Device, wgpu::Queue)> {
        let flags = if config.debug_layer {
            wgpu::InstanceFlags::DEBUG | wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: config.software_adapter,
            })
            .await
            .context("No suitable wgpu adapter found")?;

        let info = adapter.get_info();
        log::info!("Selected adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);

        let optional = wgpu::Features::SUBGROUP
            | wgpu::Features::FLOAT32_FILTERABLE
            | wgpu::Features::TEXTURE_FORMAT_16BIT_NORM
            | wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("cubemill immediate device"),
                required_features: adapter.features() & optional,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: Default::default(),
            })
            .await
            .context("Failed to create wgpu device")?;

        Ok((device, queue))
    }

    /// Run `f` inside a validation error scope
    fn scoped<T>(&self, what: &str, f: impl FnOnce(&Self) -> T) -> anyhow::Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(self);

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(anyhow::anyhow!("{} failed: {}", what, error)),
            None => Ok(value),
        }
    }

    fn begin(&self, label: &str) -> Recording {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });

        let labels = if self.config.capture { self.markers.labels() } else { Vec::new() };

        for marker in &labels {
            encoder.push_debug_group(marker);
        }

        Recording {
            encoder,
            groups: labels.len(),
        }
    }

    /// Submit and block until the queue is idle
    fn submit(&self, recording: Recording) -> anyhow::Result<()> {
        let Recording { mut encoder, groups } = recording;

        for _ in 0..groups {
            encoder.pop_debug_group();
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        self.device
            .poll(wgpu::PollType::Wait)
            .context("Failed to wait for the queue")?;
        Ok(())
    }

    /// Map `range` of a MAP_READ buffer and copy it out. The buffer stays
    /// mapped; the caller unmaps.
    fn read_mapped(&self, buffer: &wgpu::Buffer, range: Range<u64>) -> anyhow::Result<Vec<u8>> {
        let slice = buffer.slice(range);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();

        slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = sender.send(v);
        });

        self.device
            .poll(wgpu::PollType::Wait)
            .context("Failed to wait for the map")?;

        pollster::block_on(receiver.receive())
            .context("Map callback was never called")?
            .context("Failed to map buffer for reading")?;

        let data = slice.get_mapped_range().to_vec();
        Ok(data)
    }

    fn sampler(&self, state: SamplerState) -> &wgpu::Sampler {
        match state {
            SamplerState::Point => &self.point_sampler,
            SamplerState::Linear => &self.linear_sampler,
        }
    }

    fn create_buffer_impl(&mut self, params: &Arc<BufferParam>) -> Result<BufferObject> {
        params.validate()?;

        let cpu_read = params.view_flags.contains(ViewFlags::CPU_READ);
        let usage = if cpu_read {
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST
        } else {
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
        };

        log::debug!(
            "Creating buffer: {} x {} bytes, flags {:?}",
            params.num_elements,
            params.element_size,
            params.view_flags
        );

        let buffer = self.scoped("create_buffer", |this| {
            if params.initial_data.is_empty() {
                this.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("cubemill buffer"),
                    size: params.byte_size(),
                    usage,
                    mapped_at_creation: false,
                })
            } else {
                this.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("cubemill buffer"),
                    contents: bytemuck::cast_slice(&params.initial_data),
                    usage,
                })
            }
        })?;

        let resource = self.tracker.track(WgpuBuffer::new(buffer, cpu_read));
        Ok(BufferObject::new(params.clone(), resource, Vec::new()))
    }

    fn create_buffer_from_impl(&mut self, src: &BufferObject) -> Result<BufferObject> {
        let source = src.resource().upgrade::<WgpuBuffer>()?;

        if source.cpu_read {
            return Err(DeviceError::unsupported("cloning a CPU_READ buffer"));
        }

        let desc = Arc::new(src.desc().duplicate());
        let size = desc.byte_size();

        let (buffer, staging) = self.scoped("create_buffer_from", |this| {
            let buffer = this.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("cubemill buffer"),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let staging = this.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("cubemill staging buffer"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            (buffer, staging)
        })?;

        let mut recording = self.begin("create_buffer_from");
        recording.encoder.copy_buffer_to_buffer(&source.buffer, 0, &buffer, 0, size);
        recording.encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
        self.submit(recording)?;

        let bytes = self.read_mapped(&staging, 0..size)?;
        staging.unmap();

        let data: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        let resource = self.tracker.track(WgpuBuffer::new(buffer, false));

        Ok(BufferObject::new(desc, resource, data))
    }

    fn create_texture_impl(&mut self, params: &Arc<TextureParam>) -> Result<TextureObject> {
        params.validate()?;

        let shape = params.shape();

        if shape == TextureShape::D1 && (params.num_mips > 1 || params.array_size > 1) {
            return Err(DeviceError::unsupported(
                "1D textures with mips or array slices on the immediate backend",
            ));
        }

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

        let internal = if params.view_flags.contains(ViewFlags::CPU_READ) {
            let regions = readback_regions(params);
            let size = regions.iter().map(|r| r.offset + r.size()).max().unwrap_or(0);

            let buffer = self.scoped("create_texture", |this| {
                this.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("cubemill readback texture"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })?;

            WgpuTexture::new(params.clone(), TextureStorage::Readback { buffer, regions })
        } else {
            self.create_device_texture(params)?
        };

        let resource = self.tracker.track(internal);
        Ok(TextureObject::new(params.clone(), resource))
    }

    fn create_device_texture(&self, params: &Arc<TextureParam>) -> Result<WgpuTexture> {
        let shape = params.shape();

        let dimension = match shape {
            TextureShape::D1 => wgpu::TextureDimension::D1,
            TextureShape::D3 => wgpu::TextureDimension::D3,
            _ => wgpu::TextureDimension::D2,
        };

        let mut usage = wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;

        if params.view_flags.contains(ViewFlags::SRV) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }

        if params.view_flags.contains(ViewFlags::UAV) {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        let layers = if shape == TextureShape::D3 { params.depth } else { params.array_size };

        let texture = self.scoped("create_texture", |this| {
            this.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("cubemill texture"),
                size: wgpu::Extent3d {
                    width: params.width,
                    height: params.height,
                    depth_or_array_layers: layers,
                },
                mip_level_count: params.num_mips,
                sample_count: 1,
                dimension,
                format: to_native(params.format),
                usage,
                view_formats: &[],
            })
        })?;

        if !params.image_datas.is_empty() {
            for face in 0..params.array_size {
                for mip in 0..params.num_mips {
                    let sub = &params.image_datas[params.subresource_index(face, mip) as usize];
                    let (w, h, d) = params.mip_extent(mip);
                    let rows_per_image = if d > 1 { (sub.depth_pitch / sub.row_pitch).max(h) } else { h };

                    self.queue.write_texture(
                        wgpu::TexelCopyTextureInfo {
                            texture: &texture,
                            mip_level: mip,
                            origin: origin(params, face),
                            aspect: wgpu::TextureAspect::All,
                        },
                        &sub.data,
                        wgpu::TexelCopyBufferLayout {
                            offset: 0,
                            bytes_per_row: Some(sub.row_pitch),
                            rows_per_image: Some(rows_per_image),
                        },
                        wgpu::Extent3d {
                            width: w,
                            height: h,
                            depth_or_array_layers: d,
                        },
                    );
                }
            }

            self.submit(self.begin("upload texture"))?;
        }

        let plan = ViewPlan::for_texture(params);

        let (srvs, uavs) = self.scoped("create_texture_views", |_| {
            let make_view = |desc: &crate::types::ViewDesc| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: None,
                    dimension: Some(view_dimension(desc.dimension)),
                    base_mip_level: desc.base_mip,
                    mip_level_count: Some(desc.mip_count),
                    base_array_layer: desc.base_layer,
                    array_layer_count: Some(if shape == TextureShape::D3 { 1 } else { desc.layer_count }),
                    ..Default::default()
                })
            };

            let srvs: HashMap<_, _> = plan.srvs.iter().map(|(kind, desc)| (*kind, make_view(desc))).collect();
            let uavs: HashMap<_, _> = plan
                .uavs
                .iter()
                .filter_map(|(kind, desc)| match kind {
                    UavKind::Mip(mip) => Some((*mip, make_view(desc))),
                    UavKind::Buffer => None,
                })
                .collect();

            (srvs, uavs)
        })?;

        Ok(WgpuTexture::new(params.clone(), TextureStorage::Device { texture, srvs, uavs }))
    }

    fn copy_buffer_resource_impl(&mut self, params: &CopyBufferParam<'_>) -> Result<()> {
        let src = params.src.resource().upgrade::<WgpuBuffer>()?;
        let dst = params.dst.resource().upgrade::<WgpuBuffer>()?;

        if src.cpu_read {
            return Err(DeviceError::unsupported("copying from a CPU_READ buffer"));
        }

        let size = params.src.desc().byte_size();

        if params.dst.desc().byte_size() != size {
            return Err(DeviceError::invalid(format!(
                "buffer copy size mismatch: {} vs {} bytes",
                size,
                params.dst.desc().byte_size()
            )));
        }

        self.scoped("copy_buffer_resource", |this| {
            let mut recording = this.begin("copy_buffer_resource");
            recording.encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, size);
            this.submit(recording)
        })??;

        Ok(())
    }

    fn copy_texture_subresource_impl(&mut self, params: &CopyTextureSubresourceParam<'_>) -> Result<(u32, u32)> {
        let src = params.src.resource().upgrade::<WgpuTexture>()?;
        let dst = params.dst.resource().upgrade::<WgpuTexture>()?;

        check_subresource(&src.desc, params.src_face, params.src_mip)?;
        check_subresource(&dst.desc, params.dst_face, params.dst_mip)?;

        let extent = src.desc.mip_extent(params.src_mip);

        if extent != dst.desc.mip_extent(params.dst_mip) || src.desc.format != dst.desc.format {
            return Err(DeviceError::invalid("source and destination subresources differ in size or format"));
        }

        let src_index = src.desc.subresource_index(params.src_face, params.src_mip);
        let dst_index = dst.desc.subresource_index(params.dst_face, params.dst_mip);

        let src_texture = src
            .texture()
            .map_err(|_| DeviceError::unsupported("copying from a CPU_READ texture"))?;

        let source = wgpu::TexelCopyTextureInfo {
            texture: src_texture,
            mip_level: params.src_mip,
            origin: origin(&src.desc, params.src_face),
            aspect: wgpu::TextureAspect::All,
        };
        let size = wgpu::Extent3d {
            width: extent.0,
            height: extent.1,
            depth_or_array_layers: extent.2,
        };

        self.scoped("copy_texture_subresource", |this| {
            let mut recording = this.begin("copy_texture_subresource");

            match &dst.storage {
                TextureStorage::Device { texture, .. } => recording.encoder.copy_texture_to_texture(
                    source,
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: params.dst_mip,
                        origin: origin(&dst.desc, params.dst_face),
                        aspect: wgpu::TextureAspect::All,
                    },
                    size,
                ),
                TextureStorage::Readback { buffer, regions } => {
                    let region = regions[dst_index as usize];
                    recording.encoder.copy_texture_to_buffer(
                        source,
                        wgpu::TexelCopyBufferInfo {
                            buffer,
                            layout: wgpu::TexelCopyBufferLayout {
                                offset: region.offset,
                                bytes_per_row: Some(region.row_pitch),
                                rows_per_image: Some(region.rows),
                            },
                        },
                        size,
                    )
                }
            }

            this.submit(recording)
        })??;

        Ok((src_index, dst_index))
    }

    fn copy_texture_subresource_to_buffer_impl(
        &mut self,
        params: &CopyTextureSubresourceToBufferParam<'_>,
    ) -> Result<u32> {
        let texture = params.texture.resource().upgrade::<WgpuTexture>()?;
        let buffer = params.buffer.resource().upgrade::<WgpuBuffer>()?;

        check_subresource(&texture.desc, params.face, params.mip)?;

        let (w, h, d) = texture.desc.mip_extent(params.mip);
        let row_pitch = texture.desc.format.readback_row_pitch(w);
        let needed = row_pitch as u64 * h as u64 * d as u64;

        if params.buffer.desc().byte_size() < needed {
            return Err(DeviceError::invalid(format!(
                "buffer holds {} bytes, subresource needs {}",
                params.buffer.desc().byte_size(),
                needed
            )));
        }

        let src_texture = texture
            .texture()
            .map_err(|_| DeviceError::unsupported("copying from a CPU_READ texture"))?;

        self.scoped("copy_texture_subresource_to_buffer", |this| {
            let mut recording = this.begin("copy_texture_subresource_to_buffer");
            recording.encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: src_texture,
                    mip_level: params.mip,
                    origin: origin(&texture.desc, params.face),
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &buffer.buffer,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(row_pitch),
                        rows_per_image: Some(h),
                    },
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: d,
                },
            );
            this.submit(recording)
        })??;

        Ok(row_pitch)
    }

    fn map_buffer_impl(&mut self, buffer: &BufferObject) -> Result<MappedResource> {
        let internal = buffer.resource().upgrade::<WgpuBuffer>()?;

        if !internal.cpu_read {
            return Err(DeviceError::invalid("only CPU_READ buffers can be mapped"));
        }

        let size = buffer.desc().byte_size();
        let pitch = mapped_buffer_pitch(size)?;

        internal.begin_map()?;

        let data = match self.read_mapped(&internal.buffer, 0..size) {
            Ok(data) => data,
            Err(e) => {
                internal.end_map();
                return Err(e.into());
            }
        };

        let weak = Arc::downgrade(&internal);
        Ok(MappedResource::new(data, pitch, move || {
            if let Some(internal) = weak.upgrade() {
                internal.buffer.unmap();
                internal.end_map();
            }
        }))
    }

    fn map_texture_impl(&mut self, texture: &TextureObject, subresource: u32) -> Result<MappedResource> {
        let internal = texture.resource().upgrade::<WgpuTexture>()?;

        let TextureStorage::Readback { buffer, regions } = &internal.storage else {
            return Err(DeviceError::invalid("only CPU_READ textures can be mapped"));
        };

        let region = *regions.get(subresource as usize).ok_or_else(|| {
            DeviceError::invalid(format!("subresource {} is out of range", subresource))
        })?;

        internal.begin_map()?;

        let data = match self.read_mapped(buffer, region.offset..region.offset + region.size()) {
            Ok(data) => data,
            Err(e) => {
                internal.end_map();
                return Err(e.into());
            }
        };

        let weak = Arc::downgrade(&internal);
        Ok(MappedResource::new(data, region.row_pitch, move || {
            if let Some(internal) = weak.upgrade() {
                if let TextureStorage::Readback { buffer, .. } = &internal.storage {
                    buffer.unmap();
                }
                internal.end_map();
            }
        }))
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

            let buffer = self.scoped("update_constant_buffer", |this| {
                this.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(name),
                    size,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })?;

            self.constant_buffers.insert(
                name.to_string(),
                ConstantBuffer {
                    buffer,
                    size: data.len(),
                },
            );
        }

        let mut padded = data.to_vec();
        padded.resize(align_to(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);

        if let Some(cb) = self.constant_buffers.get(name) {
            self.queue.write_buffer(&cb.buffer, 0, &padded);
        }

        self.submit(self.begin("update_constant_buffer"))?;
        Ok(())
    }

    fn dispatch_impl(&mut self, command: &ComputeCommand<'_>) -> Result<()> {
        let shader = self.shaders.get(&command.shader)?.clone();
        let resolved = resolve(command, &shader.bindings)?;

        if command.dispatch.contains(&0) {
            return Err(DeviceError::invalid(format!("dispatch extent {:?} is empty", command.dispatch)));
        }

        let pipeline = self
            .pipelines
            .get(&command.shader)
            .ok_or_else(|| DeviceError::UnknownShader(command.shader.clone()))?;

        let mut held = Vec::with_capacity(resolved.len());

        for binding in &resolved {
            let item = match binding.resource {
                BoundResource::ConstantBuffer(name) => Held::Constant(
                    &self
                        .constant_buffers
                        .get(name)
                        .ok_or_else(|| DeviceError::UnknownConstantBuffer(name.to_string()))?
                        .buffer,
                ),
                BoundResource::Srv(view) => match view.kind() {
                    SrvKind::Buffer => Held::Buffer(view.resource::<WgpuBuffer>()?),
                    kind => Held::Srv(view.resource::<WgpuTexture>()?, kind),
                },
                BoundResource::Uav(view) => match view.kind() {
                    UavKind::Buffer => Held::Buffer(view.resource::<WgpuBuffer>()?),
                    UavKind::Mip(mip) => Held::Uav(view.resource::<WgpuTexture>()?, mip),
                },
                BoundResource::Sampler(sampler) => Held::Sampler(self.sampler(sampler.state)),
            };

            held.push((binding.group, binding.binding, item));
        }

        // Each dispatch records its own pass, so nothing stays bound after it
        self.scoped("dispatch", |this| -> anyhow::Result<()> {
            let mut bind_groups = Vec::new();

            for group in 0..shader.bindings.group_count() {
                let mut entries = Vec::new();

                for (g, binding, item) in &held {
                    if *g != group {
                        continue;
                    }

                    let resource = match item {
                        Held::Constant(buffer) => buffer.as_entire_binding(),
                        Held::Buffer(buffer) => buffer.buffer.as_entire_binding(),
                        Held::Srv(texture, kind) => wgpu::BindingResource::TextureView(texture.srv(*kind)?),
                        Held::Uav(texture, mip) => wgpu::BindingResource::TextureView(texture.uav(*mip)?),
                        Held::Sampler(sampler) => wgpu::BindingResource::Sampler(sampler),
                    };

                    entries.push(wgpu::BindGroupEntry {
                        binding: *binding,
                        resource,
                    });
                }

                let layout = pipeline.get_bind_group_layout(group);
                bind_groups.push(this.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&command.shader),
                    layout: &layout,
                    entries: &entries,
                }));
            }

            let mut recording = this.begin(&command.shader);
            {
                let mut pass = recording.encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&command.shader),
                    timestamp_writes: None,
                });

                pass.set_pipeline(pipeline);

                for (index, bind_group) in bind_groups.iter().enumerate() {
                    pass.set_bind_group(index as u32, bind_group, &[]);
                }

                let [x, y, z] = command.dispatch;
                pass.dispatch_workgroups(x, y, z);
            }

            this.submit(recording)
        })??;

        Ok(())
    }

    fn install_shader_impl(&mut self, shader: ShaderSource) -> Result<()> {
        let pipeline = self.scoped("load_shader", |this| {
            let module = this.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&shader.name),
                source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(&shader.source)),
            });

            this.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&shader.name),
                layout: None,
                module: &module,
                entry_point: Some(ENTRY_POINT),
                compilation_options: Default::default(),
                cache: None,
            })
        })?;

        self.pipelines.insert(shader.name.clone(), pipeline);
        self.shaders.insert(shader);
        Ok(())
    }
}

impl RenderDevice for ImmediateDevice {
    fn kind(&self) -> RendererKind {
        RendererKind::Immediate
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn check_feature_support(&self, feature: DeviceFeature) -> bool {
        let features = self.device.features();

        match feature {
            DeviceFeature::SubgroupOperations => features.contains(wgpu::Features::SUBGROUP),
            DeviceFeature::Float32Filterable => features.contains(wgpu::Features::FLOAT32_FILTERABLE),
            DeviceFeature::Storage16BitNorm => features.contains(wgpu::Features::TEXTURE_FORMAT_16BIT_NORM),
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
        let released = self.tracker.release_all();

        if released > 0 {
            log::warn!("{} resource(s) were still alive at finalize", released);
        }

        self.constant_buffers.clear();
        self.pipelines.clear();

        if let Err(e) = self.device.poll(wgpu::PollType::Wait) {
            log::warn!("Failed to drain the queue at finalize: {}", e);
        }
    }
}
