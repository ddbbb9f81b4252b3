mod common;

use std::sync::Arc;

use common::{for_each_backend, for_each_backend_kind, half_pixels};
use cubemill::image::{read_subresource, GenericImage, Image};
use cubemill::process::Processor;
use cubemill::{
    BufferParam, ComputeCommand, CopyBufferParam, CopyTextureSubresourceParam, DeviceError, Format, RenderDevice,
    RendererKind, TextureParam, ViewFlags,
};

const DOUBLE_WORDS: &str = r#"
@group(0) @binding(0) var<storage, read> srcBuffer: array<u32>;
@group(0) @binding(1) var<storage, read_write> dstBuffer: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&dstBuffer)) {
        dstBuffer[id.x] = srcBuffer[id.x] * 2u;
    }
}
"#;

const SPARSE_WRITE: &str = r#"
@group(0) @binding(0) var<storage, read> unusedInput: array<u32>;
@group(0) @binding(1) var<storage, read_write> dstBuffer: array<u32>;
@group(1) @binding(0) var unusedTex: texture_2d<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&dstBuffer)) {
        dstBuffer[id.x] = id.x + 7u;
    }
}
"#;

fn fill_command<'a>(buffer: &'a cubemill::BufferObject, name: &str) -> ComputeCommand<'a> {
    ComputeCommand::new("fill_buffer")
        .uav(name, buffer.uav().unwrap())
        .dispatch(1, 1, 1)
}

#[test]
fn filled_buffer_clones_with_contents() {
    for_each_backend(|device| {
        let filled = Processor::new(device).fill_buffer(40, 4).unwrap();

        assert_eq!(filled.data().len(), 40);
        for (i, word) in filled.data().iter().enumerate() {
            assert_eq!(*word, i as u32 * 3 + 1);
        }

        let checksum: u64 = filled.data().iter().map(|w| *w as u64).sum();
        assert_eq!(checksum, (0..40u64).map(|i| i * 3 + 1).sum());
    });
}

#[test]
fn mapping_is_scoped() {
    for_each_backend(|device| {
        let param = Arc::new(BufferParam::new(16, 4, ViewFlags::UAV));
        let gpu = device.create_buffer(&param).unwrap();
        device.dispatch(&fill_command(&gpu, "dstBuffer")).unwrap();

        let readback = device
            .create_buffer(&Arc::new(BufferParam::new(16, 4, ViewFlags::CPU_READ)))
            .unwrap();
        device
            .copy_buffer_resource(&CopyBufferParam {
                src: &gpu,
                dst: &readback,
            })
            .unwrap();

        {
            let mapped = device.map_buffer(&readback).unwrap();
            assert_eq!(mapped.to_vec::<u32>()[..4], [1, 4, 7, 10]);
            assert!(device.map_buffer(&readback).is_err());
        }

        let again = device.map_buffer(&readback).unwrap();
        assert_eq!(again.to_vec::<u32>()[15], 46);

        assert!(device.map_buffer(&gpu).is_err());
    });
}

#[test]
fn buffers_start_with_initial_data() {
    for_each_backend(|device| {
        device
            .load_shader_from_memory("double_words", DOUBLE_WORDS.as_bytes())
            .unwrap();

        let words: Vec<u32> = (0..100).collect();
        let src = device
            .create_buffer(&Arc::new(BufferParam::new(100, 4, ViewFlags::SRV).with_data(words)))
            .unwrap();
        let dst = device
            .create_buffer(&Arc::new(BufferParam::new(100, 4, ViewFlags::UAV)))
            .unwrap();

        let command = ComputeCommand::new("double_words")
            .srv("srcBuffer", src.srv().unwrap())
            .uav("dstBuffer", dst.uav().unwrap())
            .dispatch(2, 1, 1);
        device.dispatch(&command).unwrap();

        let result = device.create_buffer_from(&dst).unwrap();
        assert_eq!(result.data()[0], 0);
        assert_eq!(result.data()[99], 198);
    });
}

#[test]
fn failed_binding_changes_nothing() {
    for_each_backend(|device| {
        let buffer = device
            .create_buffer(&Arc::new(BufferParam::new(64, 4, ViewFlags::UAV)))
            .unwrap();

        let err = device.dispatch(&fill_command(&buffer, "notThere")).unwrap_err();
        assert!(matches!(err, DeviceError::UnresolvedBinding { .. }), "{:?}", err);

        let err = device
            .dispatch(&ComputeCommand::new("fill_buffer").dispatch(1, 1, 1))
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnboundSlot { .. }), "{:?}", err);

        let err = device
            .dispatch(&ComputeCommand::new("no_such_shader").dispatch(1, 1, 1))
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownShader(_)), "{:?}", err);

        device.dispatch(&fill_command(&buffer, "dstBuffer")).unwrap();
        let filled = device.create_buffer_from(&buffer).unwrap();
        assert_eq!(filled.data()[63], 190);
    });
}

#[test]
fn views_must_match_the_slot() {
    for_each_backend(|device| {
        let buffer = device
            .create_buffer(&Arc::new(BufferParam::new(4, 4, ViewFlags::UAV)))
            .unwrap();
        let cube = device
            .create_texture(&Arc::new(TextureParam::new_cube(
                8,
                1,
                Format::Rgba16Float,
                ViewFlags::SRV | ViewFlags::UAV,
            )))
            .unwrap();

        let command = ComputeCommand::new("color_mips")
            .cbuffer("CBGlobal")
            .uav("dstTex", buffer.uav().unwrap());
        device.update_constant_buffer("CBGlobal", &0i32.to_ne_bytes()).unwrap();

        let err = device.dispatch(&command).unwrap_err();
        assert!(matches!(err, DeviceError::BindingMismatch { .. }), "{:?}", err);

        let command = ComputeCommand::new("fill_buffer").uav("dstBuffer", cube.uav(0).unwrap());
        let err = device.dispatch(&command).unwrap_err();
        assert!(matches!(err, DeviceError::BindingMismatch { .. }), "{:?}", err);
    });
}

#[test]
fn constant_buffer_size_is_fixed_by_first_update() {
    for_each_backend(|device| {
        device.update_constant_buffer("CBGlobal", &2i32.to_ne_bytes()).unwrap();
        device.update_constant_buffer("CBGlobal", &3i32.to_ne_bytes()).unwrap();

        let err = device.update_constant_buffer("CBGlobal", &[0u8; 8]).unwrap_err();
        assert!(
            matches!(err, DeviceError::ConstantBufferSizeMismatch { expected: 4, actual: 8, .. }),
            "{:?}",
            err
        );

        let err = device.update_constant_buffer("CBMissing", &[0u8; 4]).unwrap_err();
        assert!(matches!(err, DeviceError::UnknownConstantBuffer(_)), "{:?}", err);
    });
}

#[test]
fn cube_textures_expose_every_view() {
    for_each_backend(|device| {
        let cube = device
            .create_texture(&Arc::new(TextureParam::new_cube(
                16,
                3,
                Format::Rgba16Float,
                ViewFlags::SRV | ViewFlags::UAV,
            )))
            .unwrap();

        assert!(cube.srv_default().is_none());
        assert!(cube.srv_cube().is_some());
        assert!(cube.srv_array_with_mips().is_some());
        assert!((0..3).all(|mip| cube.srv_array(mip).is_some() && cube.uav(mip).is_some()));
        assert!(cube.srv_array(3).is_none());
        assert_eq!(cube.uavs().len(), 3);

        let flat = device
            .create_texture(&Arc::new(TextureParam::new_2d(4, 4, Format::Rgba8Unorm, ViewFlags::SRV)))
            .unwrap();
        assert!(flat.srv_default().is_some());
        assert!(flat.uav(0).is_none());
        assert_eq!(flat.srvs().count(), 1);
    });
}

#[test]
fn textures_copy_and_read_back() {
    for_each_backend(|device| {
        let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
        let mut image = GenericImage::default();
        image.load_raw(&pixels, 4, 4, Format::Rgba8Unorm).unwrap();

        let src = device
            .create_texture(&Arc::new(image.create_texture_param(ViewFlags::SRV)))
            .unwrap();
        let dst = device
            .create_texture(&Arc::new(TextureParam::new_2d(4, 4, Format::Rgba8Unorm, ViewFlags::SRV)))
            .unwrap();

        let (from, to) = device
            .copy_texture_subresource(&CopyTextureSubresourceParam::new(&src, &dst, 0, 0))
            .unwrap();
        assert_eq!((from, to), (0, 0));

        assert_eq!(read_subresource(device, &dst, 0, 0).unwrap(), pixels);

        let mut back = GenericImage::default();
        back.initialize_from_texture_object(device, &src).unwrap();
        assert_eq!(back.data(), &pixels[..]);
        assert_eq!((back.width(), back.height()), (4, 4));
    });
}

#[test]
fn copies_check_their_subresources() {
    for_each_backend(|device| {
        let small = device
            .create_texture(&Arc::new(TextureParam::new_2d(4, 4, Format::Rgba8Unorm, ViewFlags::SRV)))
            .unwrap();
        let large = device
            .create_texture(&Arc::new(TextureParam::new_2d(8, 8, Format::Rgba8Unorm, ViewFlags::SRV)))
            .unwrap();

        assert!(device
            .copy_texture_subresource(&CopyTextureSubresourceParam::new(&small, &large, 0, 0))
            .is_err());
        assert!(device
            .copy_texture_subresource(&CopyTextureSubresourceParam::new(&small, &small, 1, 0))
            .is_err());
    });
}

#[test]
fn half_float_cube_faces_read_back_per_face() {
    for_each_backend(|device: &mut dyn RenderDevice| {
        let cube = Processor::new(device).color_mips(4).unwrap();
        let face = read_subresource(device, &cube, 5, 0).unwrap();

        assert_eq!(face.len(), 4 * 4 * 8);
        assert!(half_pixels(&face).iter().all(|p| *p == [1.0, 0.0, 0.0, 1.0]));
    });
}

#[test]
fn declared_but_unused_bindings_need_no_resource() {
    for_each_backend(|device| {
        device
            .load_shader_from_memory("sparse_write", SPARSE_WRITE.as_bytes())
            .unwrap();

        let dst = device
            .create_buffer(&Arc::new(BufferParam::new(32, 4, ViewFlags::UAV)))
            .unwrap();

        let command = ComputeCommand::new("sparse_write")
            .uav("dstBuffer", dst.uav().unwrap())
            .dispatch(1, 1, 1);
        device.dispatch(&command).unwrap();

        let result = device.create_buffer_from(&dst).unwrap();
        assert_eq!(result.data()[0], 7);
        assert_eq!(result.data()[31], 38);

        let src = device
            .create_buffer(&Arc::new(BufferParam::new(32, 4, ViewFlags::SRV)))
            .unwrap();
        let command = ComputeCommand::new("sparse_write")
            .srv("unusedInput", src.srv().unwrap())
            .uav("dstBuffer", dst.uav().unwrap())
            .dispatch(1, 1, 1);
        let err = device.dispatch(&command).unwrap_err();
        assert!(matches!(err, DeviceError::UnresolvedBinding { .. }), "{:?}", err);
    });
}

#[test]
fn dispatch_succeeds_after_a_rejected_one() {
    for_each_backend(|device| {
        let buffer = device
            .create_buffer(&Arc::new(BufferParam::new(4, 4, ViewFlags::UAV)))
            .unwrap();
        let cube = device
            .create_texture(&Arc::new(TextureParam::new_cube(
                8,
                1,
                Format::Rgba16Float,
                ViewFlags::SRV | ViewFlags::UAV,
            )))
            .unwrap();
        device.update_constant_buffer("CBGlobal", &1i32.to_ne_bytes()).unwrap();

        let wrong_view = ComputeCommand::new("color_mips")
            .cbuffer("CBGlobal")
            .uav("dstTex", buffer.uav().unwrap())
            .dispatch(1, 1, 6);
        let err = device.dispatch(&wrong_view).unwrap_err();
        assert!(matches!(err, DeviceError::BindingMismatch { .. }), "{:?}", err);

        let no_cbuffer = ComputeCommand::new("color_mips")
            .uav("dstTex", cube.uav(0).unwrap())
            .dispatch(1, 1, 6);
        let err = device.dispatch(&no_cbuffer).unwrap_err();
        assert!(matches!(err, DeviceError::UnboundSlot { .. }), "{:?}", err);

        let corrected = ComputeCommand::new("color_mips")
            .cbuffer("CBGlobal")
            .uav("dstTex", cube.uav(0).unwrap())
            .dispatch(1, 1, 6);
        device.dispatch(&corrected).unwrap();

        let green = [0.0, 1.0, 0.0, 1.0];
        let face = read_subresource(device, &cube, 3, 0).unwrap();
        assert!(half_pixels(&face).iter().all(|p| *p == green));

        // The texture is still usable by later copies
        let other = device
            .create_texture(&Arc::new(TextureParam::new_cube(8, 1, Format::Rgba16Float, ViewFlags::SRV)))
            .unwrap();
        device
            .copy_texture_subresource(&CopyTextureSubresourceParam {
                src_face: 3,
                dst_face: 0,
                ..CopyTextureSubresourceParam::new(&cube, &other, 0, 0)
            })
            .unwrap();
        let copied = read_subresource(device, &other, 0, 0).unwrap();
        assert!(half_pixels(&copied).iter().all(|p| *p == green));
    });
}

#[test]
fn only_cpu_read_textures_map() {
    for_each_backend_kind(|kind, device| {
        let pixels: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
        let mut image = GenericImage::default();
        image.load_raw(&pixels, 4, 4, Format::Rgba8Unorm).unwrap();

        let src = device
            .create_texture(&Arc::new(image.create_texture_param(ViewFlags::SRV)))
            .unwrap();

        let err = device.map_texture(&src, 0).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidDescriptor(_)), "{:?}", err);

        let readback = Arc::new(TextureParam::new_2d(4, 4, Format::Rgba8Unorm, ViewFlags::CPU_READ));

        match kind {
            RendererKind::Immediate => {
                let readback = device.create_texture(&readback).unwrap();
                device
                    .copy_texture_subresource(&CopyTextureSubresourceParam::new(&src, &readback, 0, 0))
                    .unwrap();

                {
                    let mapped = device.map_texture(&readback, 0).unwrap();
                    assert!(mapped.row_pitch() >= 16);
                    for y in 0..4 {
                        assert_eq!(mapped.row(y, 16).unwrap(), &pixels[y as usize * 16..][..16]);
                    }

                    assert!(device.map_texture(&readback, 0).is_err());
                }

                assert!(device.map_texture(&readback, 0).is_ok());
                assert!(device.map_texture(&readback, 1).is_err());
            }
            RendererKind::Explicit => {
                let err = device.create_texture(&readback).unwrap_err();
                assert!(matches!(err, DeviceError::Unsupported(_)), "{:?}", err);
            }
        }
    });
}
