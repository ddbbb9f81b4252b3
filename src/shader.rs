// Shader loading and reflection
//
// Compute shaders are WGSL with a `main` entry point. Parsing and
// validation go through naga; the binding table (variable name -> slot)
// is read straight from the globals the entry point uses, so shaders need
// no side-car metadata.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use naga::valid::{Capabilities, ValidationFlags, Validator};

use crate::error::{DeviceError, Result};
use crate::types::ViewDimension;

pub const ENTRY_POINT: &str = "main";
pub const SHADER_EXTENSION: &str = "wgsl";

/// What a reflected slot expects to be bound to it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Constant buffer of `size` bytes
    UniformBuffer { size: u32 },
    StorageBuffer { read_only: bool },
    SampledTexture { dimension: ViewDimension },
    StorageTexture { dimension: ViewDimension, read_only: bool },
    Sampler,
}

impl SlotKind {
    /// Bound from the SRV map of a command
    pub fn is_srv(&self) -> bool {
        matches!(
            self,
            SlotKind::SampledTexture { .. } | SlotKind::StorageBuffer { read_only: true }
        )
    }

    /// Bound from the UAV map of a command
    pub fn is_uav(&self) -> bool {
        matches!(
            self,
            SlotKind::StorageTexture { .. } | SlotKind::StorageBuffer { read_only: false }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    pub name: String,
    pub group: u32,
    pub binding: u32,
    pub kind: SlotKind,
}

/// Name -> slot table of one shader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    slots: BTreeMap<String, BindingSlot>,
}

impl BindingTable {
    pub fn get(&self, name: &str) -> Option<&BindingSlot> {
        self.slots.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BindingSlot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of bind groups (descriptor sets) the shader spans
    pub fn group_count(&self) -> u32 {
        self.slots.values().map(|s| s.group + 1).max().unwrap_or(0)
    }

    /// Slots of `group`, ordered by binding index
    pub fn group(&self, group: u32) -> Vec<&BindingSlot> {
        let mut slots: Vec<_> = self.slots.values().filter(|s| s.group == group).collect();
        slots.sort_by_key(|s| s.binding);
        slots
    }

    /// Constant buffers declared by the shader, with their size in bytes
    pub fn constant_buffers(&self) -> impl Iterator<Item = (&str, u32)> {
        self.slots.values().filter_map(|slot| match slot.kind {
            SlotKind::UniformBuffer { size } => Some((slot.name.as_str(), size)),
            _ => None,
        })
    }

    fn insert(&mut self, slot: BindingSlot) {
        self.slots.insert(slot.name.clone(), slot);
    }
}

/// A parsed, validated and reflected compute shader
#[derive(Debug)]
pub struct ShaderSource {
    pub name: String,
    pub source: String,
    pub bindings: BindingTable,
    pub workgroup_size: [u32; 3],
    module: naga::Module,
    info: naga::valid::ModuleInfo,
}

impl ShaderSource {
    pub fn parse(name: &str, source: &str) -> Result<Self> {
        let compile_error = |reason: String| DeviceError::ShaderCompilation {
            name: name.to_string(),
            reason,
        };

        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| compile_error(e.emit_to_string(source)))?;

        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| compile_error(e.emit_to_string(source)))?;

        let entry_index = module
            .entry_points
            .iter()
            .position(|ep| ep.name == ENTRY_POINT && ep.stage == naga::ShaderStage::Compute)
            .ok_or_else(|| compile_error(format!("no compute entry point named \"{}\"", ENTRY_POINT)))?;
        let workgroup_size = module.entry_points[entry_index].workgroup_size;

        let bindings = reflect(&module, info.get_entry_point(entry_index)).map_err(compile_error)?;

        log::debug!(
            "Reflected shader \"{}\": {} binding(s), workgroup {:?}",
            name,
            bindings.len(),
            workgroup_size
        );

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            bindings,
            workgroup_size,
            module,
            info,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let name = shader_name(path)?;
        let source = std::fs::read_to_string(path)?;
        Self::parse(&name, &source)
    }

    /// SPIR-V words for the compute entry point
    pub fn spirv(&self) -> Result<Vec<u32>> {
        let options = naga::back::spv::Options::default();
        let pipeline = naga::back::spv::PipelineOptions {
            shader_stage: naga::ShaderStage::Compute,
            entry_point: ENTRY_POINT.to_string(),
        };

        naga::back::spv::write_vec(&self.module, &self.info, &options, Some(&pipeline)).map_err(|e| {
            DeviceError::ShaderCompilation {
                name: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }
}

fn shader_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| DeviceError::invalid(format!("shader path {:?} has no file name", path)))
}

fn image_dimension(dim: naga::ImageDimension, arrayed: bool) -> ViewDimension {
    match (dim, arrayed) {
        (naga::ImageDimension::D1, false) => ViewDimension::D1,
        (naga::ImageDimension::D1, true) => ViewDimension::D1Array,
        (naga::ImageDimension::D2, false) => ViewDimension::D2,
        (naga::ImageDimension::D2, true) => ViewDimension::D2Array,
        (naga::ImageDimension::D3, _) => ViewDimension::D3,
        (naga::ImageDimension::Cube, false) => ViewDimension::Cube,
        (naga::ImageDimension::Cube, true) => ViewDimension::CubeArray,
    }
}

/// Slots of every bound global `entry` actually touches. Declared but
/// unused globals are left out, as pipeline layouts never see them.
fn reflect(module: &naga::Module, entry: &naga::valid::FunctionInfo) -> std::result::Result<BindingTable, String> {
    let mut table = BindingTable::default();

    for (handle, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };

        if entry[handle].is_empty() {
            log::trace!("Skipping unused binding {:?}", var.name);
            continue;
        }

        let name = var
            .name
            .clone()
            .ok_or_else(|| format!("binding @group({}) @binding({}) has no name", binding.group, binding.binding))?;

        let ty = &module.types[var.ty];

        let kind = match var.space {
            naga::AddressSpace::Uniform => SlotKind::UniformBuffer {
                size: ty.inner.size(module.to_ctx()),
            },
            naga::AddressSpace::Storage { access } => SlotKind::StorageBuffer {
                read_only: !access.contains(naga::StorageAccess::STORE),
            },
            naga::AddressSpace::Handle => match ty.inner {
                naga::TypeInner::Sampler { .. } => SlotKind::Sampler,
                naga::TypeInner::Image { dim, arrayed, class } => match class {
                    naga::ImageClass::Storage { access, .. } => SlotKind::StorageTexture {
                        dimension: image_dimension(dim, arrayed),
                        read_only: !access.contains(naga::StorageAccess::STORE),
                    },
                    _ => SlotKind::SampledTexture {
                        dimension: image_dimension(dim, arrayed),
                    },
                },
                _ => return Err(format!("binding \"{}\" has an unsupported handle type", name)),
            },
            _ => return Err(format!("binding \"{}\" has an unsupported address space", name)),
        };

        table.insert(BindingSlot {
            name,
            group: binding.group,
            binding: binding.binding,
            kind,
        });
    }

    Ok(table)
}

/// Every `.wgsl` file under `path`, or `path` itself if it is a file
pub fn collect_shader_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();

    for entry in std::fs::read_dir(path)? {
        let entry_path = entry?.path();

        if entry_path.is_dir() {
            files.extend(collect_shader_files(&entry_path)?);
        } else if entry_path.extension().and_then(|e| e.to_str()) == Some(SHADER_EXTENSION) {
            files.push(entry_path);
        }
    }

    files.sort();
    Ok(files)
}

/// Name-indexed table of loaded shaders
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    shaders: HashMap<String, Arc<ShaderSource>>,
}

impl ShaderLibrary {
    /// Register `shader`, returning the version it replaced
    pub fn insert(&mut self, shader: ShaderSource) -> (Arc<ShaderSource>, Option<Arc<ShaderSource>>) {
        let shader = Arc::new(shader);
        let previous = self.shaders.insert(shader.name.clone(), shader.clone());

        if previous.is_some() {
            log::info!("Reloaded shader \"{}\"", shader.name);
        } else {
            log::debug!("Loaded shader \"{}\"", shader.name);
        }

        (shader, previous)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<ShaderSource>> {
        self.shaders
            .get(name)
            .ok_or_else(|| DeviceError::UnknownShader(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Size declared for the constant buffer `name` by any loaded shader
    pub fn constant_buffer_size(&self, name: &str) -> Option<u32> {
        self.shaders
            .values()
            .flat_map(|shader| shader.bindings.constant_buffers())
            .find(|(cb, _)| *cb == name)
            .map(|(_, size)| size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOWNSAMPLE: &str = r#"
struct Globals {
    targetMip: i32,
}

@group(0) @binding(0) var<uniform> CBGlobal: Globals;
@group(0) @binding(1) var srcMip: texture_2d_array<f32>;
@group(0) @binding(2) var dstMipSlice: texture_storage_2d_array<rgba16float, write>;
@group(0) @binding(3) var ssPoint: sampler;
@group(1) @binding(0) var<storage, read_write> counters: array<u32>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let c = textureSampleLevel(srcMip, ssPoint, vec2<f32>(0.5), i32(id.z), 0.0);
    textureStore(dstMipSlice, id.xy, id.z, c + f32(CBGlobal.targetMip));
    counters[0] = id.x;
}
"#;

    #[test]
    fn reflects_named_slots() {
        let shader = ShaderSource::parse("downsample", DOWNSAMPLE).unwrap();
        let table = &shader.bindings;

        assert_eq!(shader.workgroup_size, [8, 8, 1]);
        assert_eq!(table.len(), 5);
        assert_eq!(table.group_count(), 2);

        let src = table.get("srcMip").unwrap();
        assert_eq!((src.group, src.binding), (0, 1));
        assert_eq!(src.kind, SlotKind::SampledTexture { dimension: ViewDimension::D2Array });
        assert!(src.kind.is_srv());

        let dst = table.get("dstMipSlice").unwrap();
        assert!(dst.kind.is_uav());

        assert_eq!(table.get("ssPoint").unwrap().kind, SlotKind::Sampler);
        assert_eq!(
            table.get("counters").unwrap().kind,
            SlotKind::StorageBuffer { read_only: false }
        );

        let cbuffers: Vec<_> = table.constant_buffers().collect();
        assert_eq!(cbuffers, vec![("CBGlobal", 4)]);

        let group0: Vec<_> = table.group(0).iter().map(|s| s.binding).collect();
        assert_eq!(group0, vec![0, 1, 2, 3]);
    }

    #[test]
    fn unused_bindings_are_not_reflected() {
        let source = r#"
@group(0) @binding(0) var<storage, read_write> out: array<u32>;
@group(0) @binding(1) var<storage, read> unused: array<u32>;
@group(1) @binding(0) var spare: texture_2d<f32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    out[id.x] = id.x;
}
"#;
        let shader = ShaderSource::parse("sparse", source).unwrap();
        let table = &shader.bindings;

        assert_eq!(table.len(), 1);
        assert!(table.get("out").is_some());
        assert!(table.get("unused").is_none());
        assert!(table.get("spare").is_none());
        assert_eq!(table.group_count(), 1);
    }

    #[test]
    fn produces_spirv() {
        let shader = ShaderSource::parse("downsample", DOWNSAMPLE).unwrap();
        let words = shader.spirv().unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn rejects_missing_entry_point() {
        let source = "@compute @workgroup_size(1) fn other() {}";
        let err = ShaderSource::parse("other", source).unwrap_err();
        assert!(matches!(err, DeviceError::ShaderCompilation { .. }));
    }

    #[test]
    fn rejects_invalid_wgsl() {
        let err = ShaderSource::parse("broken", "fn main( {").unwrap_err();
        assert!(matches!(err, DeviceError::ShaderCompilation { .. }));
    }

    #[test]
    fn library_replaces_by_name() {
        let mut library = ShaderLibrary::default();
        let (_, previous) = library.insert(ShaderSource::parse("downsample", DOWNSAMPLE).unwrap());
        assert!(previous.is_none());

        let (_, previous) = library.insert(ShaderSource::parse("downsample", DOWNSAMPLE).unwrap());
        assert!(previous.is_some());
        assert_eq!(library.len(), 1);

        assert_eq!(library.constant_buffer_size("CBGlobal"), Some(4));
        assert!(library.constant_buffer_size("CBOther").is_none());
        assert!(matches!(library.get("nope"), Err(DeviceError::UnknownShader(_))));
    }

    #[test]
    fn collects_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.wgsl"), "").unwrap();
        std::fs::write(dir.path().join("nested/b.wgsl"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = collect_shader_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| shader_name(p).unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
