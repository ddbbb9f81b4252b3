// Build script to validate the built-in WGSL shaders
//
// Shaders are compiled at load time; this only makes a broken shader a
// build error instead of a runtime one.

use std::fs;
use std::path::Path;

use naga::valid::{Capabilities, ValidationFlags, Validator};

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    let dir = Path::new("shaders");
    let Ok(entries) = fs::read_dir(dir) else {
        println!("cargo:warning=No shaders/ directory, skipping shader validation");
        return;
    };

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("wgsl"))
        .collect();
    paths.sort();

    for path in paths {
        println!("cargo:rerun-if-changed={}", path.display());
        validate_shader(&path);
    }
}

fn validate_shader(path: &Path) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => panic!("Failed to read {}: {}", path.display(), e),
    };

    let module = match naga::front::wgsl::parse_str(&source) {
        Ok(module) => module,
        Err(e) => panic!("{}: {}", path.display(), e.emit_to_string(&source)),
    };

    if let Err(e) = Validator::new(ValidationFlags::all(), Capabilities::all()).validate(&module) {
        panic!("{}: {}", path.display(), e.emit_to_string(&source));
    }

    if !module.entry_points.iter().any(|ep| ep.name == "main") {
        panic!("{} has no \"main\" entry point", path.display());
    }
}
