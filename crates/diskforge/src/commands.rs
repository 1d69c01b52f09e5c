//! CLI subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use diskforge::image::inspect;
use diskforge::report::BuildReport;
use diskforge::{ForgeConfig, HostToolchain, Pipeline, Stage, TargetProfile};
use std::path::{Path, PathBuf};

/// Build commands for the CLI.
#[derive(Subcommand)]
pub enum BuildCommands {
    /// Build everything and assemble the image
    All,
    /// Build stale runtime layers in dependency order
    Runtime,
    /// Build a single runtime layer (prerequisites must be built)
    RuntimeLayer {
        /// Layer name (core, alloc, alloc_system, collections)
        name: String,
    },
    /// Compile and link the kernel against the built runtime
    Kernel,
    /// Build standalone programs against the built runtime
    Programs {
        /// Build only this program
        #[arg(long)]
        only: Option<String>,
    },
    /// Generate the filesystem manifest
    Manifest {
        /// Print the id listing
        #[arg(long)]
        list: bool,
    },
    /// Assemble the image from already-built artifacts
    Image,
    /// Decode the segment table and manifest of an image
    Inspect {
        image: PathBuf,
        /// Segment table offset inside the loader region
        /// (default: `image.table_offset` from the config)
        #[arg(long)]
        table_offset: Option<u64>,
    },
    /// Show the last build report
    Status,
    /// Remove build artifacts and the output image
    Clean,
}

pub fn run(command: BuildCommands, config: Option<&Path>) -> Result<()> {
    if let BuildCommands::Inspect {
        image,
        table_offset,
    } = &command
    {
        let table_offset = match table_offset {
            Some(offset) => *offset,
            None => {
                ForgeConfig::load(config)
                    .context("Failed to load configuration")?
                    .image
                    .table_offset
            }
        };
        return inspect_image(image, table_offset);
    }

    let config = ForgeConfig::load(config).context("Failed to load configuration")?;
    let toolchain = HostToolchain::new(TargetProfile::from_config(&config.target));
    let pipeline = Pipeline::new(config, &toolchain);

    match command {
        BuildCommands::All => build_all(&pipeline)?,
        BuildCommands::Runtime => {
            println!("=== Building runtime stack ===");
            let build = pipeline.build_runtime()?;
            for layer in build.stack.layer_names() {
                let state = if build.rebuilt.iter().any(|l| l == layer) {
                    "built"
                } else {
                    "up to date"
                };
                println!("  {layer:<14} {state}");
            }
        }
        BuildCommands::RuntimeLayer { name } => {
            let path = pipeline.build_runtime_layer(&name)?;
            println!("  Built: {}", path.display());
        }
        BuildCommands::Kernel => {
            let kernel = pipeline.build_kernel()?;
            println!("  Built: {} ({} bytes)", kernel.path.display(), kernel.len());
        }
        BuildCommands::Programs { only } => {
            let built = pipeline.build_programs(only.as_deref())?;
            for program in &built {
                println!("  Built: {} ({} bytes)", program.path.display(), program.len());
            }
        }
        BuildCommands::Manifest { list } => {
            let assets = pipeline.generate_manifest()?;
            let manifest = assets.manifest();
            let dir = pipeline.context().prepare_stage(Stage::Filesystem)?;
            let path = dir.join("manifest.bin");
            std::fs::write(&path, manifest.encode()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if list {
                print!("{}", manifest.listing());
            } else {
                println!(
                    "  Manifest: {} ({} asset(s), {} bytes)",
                    path.display(),
                    manifest.len(),
                    manifest.total_size()
                );
            }
        }
        BuildCommands::Image => {
            let image = pipeline.assemble_image()?;
            println!("  Image: {} ({} bytes)", image.path.display(), image.size);
            println!("  SHA-256: {}", image.sha256);
        }
        BuildCommands::Status => status(&pipeline)?,
        BuildCommands::Clean => clean(&pipeline)?,
        BuildCommands::Inspect { .. } => {}
    }

    Ok(())
}

fn build_all(pipeline: &Pipeline<'_>) -> Result<()> {
    println!("=== Building disk image ===\n");
    let output = pipeline.run()?;

    println!("\n=== Build complete ===");
    println!("  Kernel:   {} bytes", output.kernel.len());
    println!("  Programs: {}", output.programs.len());
    println!("  Assets:   {}", output.assets.manifest().len());
    println!("  Image:    {} ({} bytes)", output.image.path.display(), output.image.size);
    if !output.report.skipped_programs.is_empty() {
        println!("  Skipped:  {}", output.report.skipped_programs.join(", "));
    }
    Ok(())
}

fn inspect_image(path: &Path, table_offset: u64) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let summary = inspect(&bytes, table_offset)
        .with_context(|| format!("{} is not a diskforge image", path.display()))?;
    let t = &summary.table;

    println!("=== {} ({} bytes) ===", path.display(), summary.size);
    println!("  kernel    offset {:#010x}  size {:>10}  entry {:#010x}", t.kernel_offset, t.kernel_size, t.kernel_entry);
    println!("  manifest  offset {:#010x}  size {:>10}", t.manifest_offset, t.manifest_size);
    println!("  assets    offset {:#010x}  size {:>10}", t.assets_offset, t.assets_size);
    println!();
    print!("{}", summary.manifest.listing());
    Ok(())
}

fn status(pipeline: &Pipeline<'_>) -> Result<()> {
    let path = pipeline.context().report_path();
    if !path.exists() {
        println!("No build report at {}. Run: diskforge all", path.display());
        return Ok(());
    }
    let report = BuildReport::load(&path)?;

    println!("=== Last build ({}) ===", report.finished_at.to_rfc3339());
    for stage in &report.stages {
        println!("  {:<12} {:>7} ms", stage.stage, stage.duration_ms);
        for artifact in &stage.artifacts {
            println!("    {:<20} {:>10} bytes", artifact.name, artifact.size);
        }
    }
    println!(
        "  image: {} ({} bytes, {} asset(s))",
        report.image.path.display(),
        report.image.size,
        report.image.assets
    );
    println!("  sha256: {}", report.image.sha256);
    Ok(())
}

fn clean(pipeline: &Pipeline<'_>) -> Result<()> {
    let root = pipeline.context().artifact_root();
    if root.exists() {
        std::fs::remove_dir_all(root)
            .with_context(|| format!("Failed to remove {}", root.display()))?;
        println!("Removed {}", root.display());
    }
    let output = &pipeline.config().image.output;
    if output.exists() {
        std::fs::remove_file(output)
            .with_context(|| format!("Failed to remove {}", output.display()))?;
        println!("Removed {}", output.display());
    }
    Ok(())
}
