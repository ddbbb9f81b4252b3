// Shared setup for the device integration tests
//
// Each test runs once per backend. A backend that cannot be brought up on
// this machine (no adapter, no Vulkan driver) is skipped with a log line.

#![allow(dead_code)]

use cubemill::{initialize, DeviceConfig, LogLevel, RenderDevice, RendererKind};
use half::f16;

pub const BACKENDS: [RendererKind; 2] = [RendererKind::Immediate, RendererKind::Explicit];

pub fn device(backend: RendererKind) -> Option<Box<dyn RenderDevice>> {
    let mut config = DeviceConfig::new(backend);
    config.debug_layer = false;

    match initialize(&config, LogLevel::WarnError) {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("skipping {} backend: {:#}", backend, e);
            None
        }
    }
}

/// Run `test` against every backend available here
pub fn for_each_backend(mut test: impl FnMut(&mut dyn RenderDevice)) {
    for_each_backend_kind(|_, device| test(device));
}

/// Same as `for_each_backend`, for tests whose expectations differ per backend
pub fn for_each_backend_kind(mut test: impl FnMut(RendererKind, &mut dyn RenderDevice)) {
    for backend in BACKENDS {
        if let Some(mut device) = device(backend) {
            eprintln!("running on {} backend", backend);
            test(backend, device.as_mut());
            cubemill::terminate(device);
        }
    }
}

/// RGBA16F pixel bytes as f32 channels
pub fn half_pixels(bytes: &[u8]) -> Vec<[f32; 4]> {
    bytes
        .chunks_exact(8)
        .map(|p| {
            let c = |i: usize| f16::from_le_bytes([p[i], p[i + 1]]).to_f32();
            [c(0), c(2), c(4), c(6)]
        })
        .collect()
}

pub fn assert_close(actual: [f32; 4], expected: [f32; 4], what: &str) {
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 0.01, "{}: got {:?}, expected {:?}", what, actual, expected);
    }
}
