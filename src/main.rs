// =============================================================================
// CUBEMILL - cubemap and mip processing on the GPU
// =============================================================================
//
// Command-line front-end over the render device. Every subcommand follows
// the same shape:
//
// 1. Load config.toml (device + logging settings)
// 2. Initialize the device of the requested backend
// 3. Run one processing flow
// 4. Read the result back and write one EXR per face and mip
// 5. Terminate the device
//
// The backend in config.toml can be overridden per run with --backend.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use cubemill::image::{CubeImage, GenericImage, Image};
use cubemill::process::Processor;
use cubemill::{initialize, terminate, Config, RenderDevice, RendererKind};

#[derive(Parser)]
#[command(version, about = "Cubemap projection and mip generation on the GPU")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,

    /// Backend to use instead of the one in the configuration
    #[arg(long, short)]
    backend: Option<Backend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Immediate,
    Explicit,
}

impl From<Backend> for RendererKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Immediate => RendererKind::Immediate,
            Backend::Explicit => RendererKind::Explicit,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Project an equirectangular panorama onto a cubemap and build its mips
    Cubemap {
        /// Panorama image (HDR, EXR or PNG)
        input: PathBuf,

        /// Output directory
        #[arg(long, short, default_value = "out")]
        output: PathBuf,

        /// Face size, defaults to half the panorama height
        #[arg(long, short)]
        size: Option<u32>,

        /// Skip mip generation
        #[arg(long)]
        no_mips: bool,
    },
    /// Write a cubemap whose mips are each filled with one flat color
    ColorMips {
        /// Output directory
        #[arg(long, short, default_value = "out")]
        output: PathBuf,

        /// Face size
        #[arg(long, short, default_value_t = 256)]
        size: u32,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config);
    if let Some(backend) = args.backend {
        config.device.backend = backend.into();
    }

    let mut device = initialize(&config.device, config.log.level).context("Failed to initialize render device")?;

    let result = run(device.as_mut(), &args.command);
    terminate(device);

    let written = result?;
    println!("Wrote {} file(s)", written.len());
    Ok(())
}

fn run(device: &mut dyn RenderDevice, command: &Command) -> Result<Vec<PathBuf>> {
    match command {
        Command::Cubemap {
            input,
            output,
            size,
            no_mips,
        } => cubemap(device, input, output, *size, *no_mips),
        Command::ColorMips { output, size } => {
            let mut processor = Processor::new(device);
            let cube = processor.color_mips(*size)?;
            let image = processor.image_from_texture_object(&cube)?;
            Ok(image.save(output, "color_mips")?)
        }
    }
}

fn cubemap(device: &mut dyn RenderDevice, input: &Path, output: &Path, size: Option<u32>, no_mips: bool) -> Result<Vec<PathBuf>> {
    let panorama = GenericImage::open(input)?;
    log::info!(
        "Loaded {:?}: {}x{} {:?}",
        input,
        panorama.width(),
        panorama.height(),
        panorama.format()
    );

    let mut processor = Processor::new(device);
    let mut source = processor.upload(&panorama)?;

    let fix = panorama.is_requiring_fix();
    if fix.needs_fix {
        log::warn!(
            "Panorama extent {}x{} is not a power of two, resizing to {}x{}",
            panorama.width(),
            panorama.height(),
            fix.width,
            fix.height
        );
        source = processor.resize(&source, fix)?;
    }

    let face_size = size.unwrap_or_else(|| (source.desc().height / 2).max(1));
    let mut cube = processor.equirect_to_cube(&source, face_size)?;

    if !no_mips {
        cube = processor.generate_mips(&cube)?;
    }

    let image: CubeImage = processor.image_from_texture_object(&cube)?;
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("cubemap");

    Ok(image.save(output, stem)?)
}
