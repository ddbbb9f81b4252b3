// Render device interface
//
// One trait, two engines. Clients hold a `Box<dyn RenderDevice>` obtained
// from `initialize` and never see which backend is behind it.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{ExplicitDevice, ImmediateDevice};
use crate::config::{DeviceConfig, LogLevel, RendererKind};
use crate::error::{DeviceError, LogFailure, Result};
use crate::logging::init_logging;
use crate::shader::{collect_shader_files, ShaderSource};
use crate::types::{
    BufferObject, BufferParam, ComputeCommand, CopyBufferParam, CopyTextureSubresourceParam,
    CopyTextureSubresourceToBufferParam, MappedResource, Sampler, SamplerState, TextureObject,
    TextureParam,
};

/// Optional capabilities a client may query before relying on them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFeature {
    /// Wave/subgroup intrinsics in compute shaders
    SubgroupOperations,
    /// Linear filtering of 32-bit float textures
    Float32Filterable,
    /// 16-bit normalized formats usable as storage textures
    Storage16BitNorm,
}

/// Labels of the debug markers currently alive, outermost first
#[derive(Debug, Clone, Default)]
pub struct MarkerStack {
    labels: Arc<Mutex<Vec<String>>>,
}

impl MarkerStack {
    pub fn labels(&self) -> Vec<String> {
        self.labels.lock().clone()
    }

    fn push(&self, name: &str) -> usize {
        let mut labels = self.labels.lock();
        labels.push(name.to_string());
        labels.len()
    }
}

/// Scoped debug group. Work recorded while it is alive is labelled with
/// its name when capture is enabled.
#[must_use = "the marker is popped as soon as it is dropped"]
pub struct DebugMarker {
    stack: Option<MarkerStack>,
    depth: usize,
}

impl DebugMarker {
    pub(crate) fn new(stack: &MarkerStack, name: &str, enabled: bool) -> Self {
        if !enabled {
            return Self { stack: None, depth: 0 };
        }

        let depth = stack.push(name);
        log::trace!("Debug marker \"{}\" (depth {})", name, depth);

        Self {
            stack: Some(stack.clone()),
            depth,
        }
    }
}

impl Drop for DebugMarker {
    fn drop(&mut self) {
        if let Some(stack) = &self.stack {
            // Markers are scoped, anything deeper was already dropped
            stack.labels.lock().truncate(self.depth - 1);
        }
    }
}

pub trait RenderDevice: Send {
    fn kind(&self) -> RendererKind;

    fn config(&self) -> &DeviceConfig;

    fn check_feature_support(&self, feature: DeviceFeature) -> bool;

    /// Whole-buffer device copy
    fn copy_buffer_resource(&mut self, params: &CopyBufferParam<'_>) -> Result<()>;

    /// Copy one (face, mip). Returns the (source, destination) subresource
    /// indices.
    fn copy_texture_subresource(&mut self, params: &CopyTextureSubresourceParam<'_>) -> Result<(u32, u32)>;

    /// Copy one (face, mip) into a buffer. Returns the row pitch used in
    /// the buffer.
    fn copy_texture_subresource_to_buffer(
        &mut self,
        params: &CopyTextureSubresourceToBufferParam<'_>,
    ) -> Result<u32>;

    fn create_buffer(&mut self, params: &Arc<BufferParam>) -> Result<BufferObject>;

    /// New buffer with the contents of `src`, whose `data()` is already
    /// populated on return
    fn create_buffer_from(&mut self, src: &BufferObject) -> Result<BufferObject>;

    fn create_texture(&mut self, params: &Arc<TextureParam>) -> Result<TextureObject>;

    fn create_debug_marker(&self, name: &str) -> DebugMarker;

    /// Resolve every binding of `command`, run it and wait for completion
    fn dispatch(&mut self, command: &ComputeCommand<'_>) -> Result<()>;

    /// Register a parsed shader, replacing any shader of the same name
    fn install_shader(&mut self, shader: ShaderSource) -> Result<()>;

    /// Load a .wgsl file, or every .wgsl file under a directory
    fn load_shader(&mut self, path: &Path) -> Result<()> {
        let result = (|| -> Result<()> {
            let files = collect_shader_files(path)?;

            if files.is_empty() {
                log::warn!("No shader found under {:?}", path);
            }

            for file in files {
                self.install_shader(ShaderSource::from_path(&file)?)?;
            }

            Ok(())
        })();

        result.log_failure("load_shader")
    }

    /// Load a shader from WGSL source bytes
    fn load_shader_from_memory(&mut self, name: &str, blob: &[u8]) -> Result<()> {
        let result = std::str::from_utf8(blob)
            .map_err(|e| DeviceError::ShaderCompilation {
                name: name.to_string(),
                reason: e.to_string(),
            })
            .and_then(|source| ShaderSource::parse(name, source))
            .and_then(|shader| self.install_shader(shader));

        result.log_failure("load_shader_from_memory")
    }

    fn map_buffer(&mut self, buffer: &BufferObject) -> Result<MappedResource>;

    fn map_texture(&mut self, texture: &TextureObject, subresource: u32) -> Result<MappedResource>;

    /// Write a constant buffer. Its size is fixed by the first call.
    fn update_constant_buffer(&mut self, name: &str, data: &[u8]) -> Result<()>;

    fn get_sampler(&self, state: SamplerState) -> Sampler {
        Sampler { state }
    }

    /// Release every tracked allocation and cached object
    fn finalize(&mut self);
}

/// Create the device described by `config` and load its shader paths
pub fn initialize(config: &DeviceConfig, level: LogLevel) -> Result<Box<dyn RenderDevice>> {
    init_logging(level);

    log::info!("Initializing {} render device", config.backend);

    let mut device: Box<dyn RenderDevice> = match config.backend {
        RendererKind::Immediate => Box::new(ImmediateDevice::new(config.clone()).log_failure("initialize")?),
        RendererKind::Explicit => Box::new(ExplicitDevice::new(config.clone()).log_failure("initialize")?),
    };

    for path in &config.shader_paths {
        device.load_shader(path)?;
    }

    Ok(device)
}

/// Tear the device down, releasing every allocation it still tracks
pub fn terminate(mut device: Box<dyn RenderDevice>) {
    log::info!("Terminating {} render device", device.kind());
    device.finalize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_nest_and_pop() {
        let stack = MarkerStack::default();

        let outer = DebugMarker::new(&stack, "outer", true);
        {
            let _inner = DebugMarker::new(&stack, "inner", true);
            assert_eq!(stack.labels(), vec!["outer", "inner"]);
        }
        assert_eq!(stack.labels(), vec!["outer"]);

        drop(outer);
        assert!(stack.labels().is_empty());
    }

    #[test]
    fn disabled_markers_record_nothing() {
        let stack = MarkerStack::default();
        let _marker = DebugMarker::new(&stack, "ignored", false);
        assert!(stack.labels().is_empty());
    }
}
