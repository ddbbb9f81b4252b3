// cubemill - GPU compute over an immediate and an explicit backend
//
// Clients describe resources with `BufferParam`/`TextureParam`, create them
// through a `RenderDevice`, bind them by name in a `ComputeCommand` and
// dispatch. `initialize` picks the backend from the configuration.

pub mod backend;
pub mod binding;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod logging;
pub mod process;
pub mod shader;
pub mod tracker;
pub mod types;

pub use config::{Config, DeviceConfig, LogLevel, RendererKind};
pub use device::{initialize, terminate, DebugMarker, DeviceFeature, RenderDevice};
pub use error::{DeviceError, Result};
pub use shader::ShaderSource;
pub use types::*;
