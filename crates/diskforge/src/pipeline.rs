//! Whole-image build orchestration.
//!
//! The runtime stack is built first, on its own. Kernel, programs and the
//! asset scan only read the finished stack and write to disjoint stage
//! directories, so they run at the same time. Their results meet at a single
//! join point; manifest ids are assigned there and the image is assembled
//! from the joined results.
//!
//! Each stage can also be run by itself. Later stages then find earlier
//! artifacts on disk by their stable names.

use crate::config::ForgeConfig;
use crate::context::BuildContext;
use crate::error::{BuildError, IoContext, Result, Stage};
use crate::graph::BuildGraph;
use crate::harness::Harness;
use crate::image::{ImageAssembler, ImageLayout, ImageOutput};
use crate::kernel::KernelLinker;
use crate::layout::{LayoutScript, LinkedBinary};
use crate::manifest::{AssetSource, AssetTable, FilesystemManifestGenerator, Manifest};
use crate::programs::{self, Program, ProgramCompiler, ProgramPolicy};
use crate::report::{timed, ArtifactReport, BuildReport, ImageReport, StageReport};
use crate::runtime::{runtime_graph, RuntimeBuild, RuntimeStack, RuntimeStackBuilder};
use crate::toolchain::Toolchain;
use log::{info, warn};
use std::path::PathBuf;
use std::thread::ScopedJoinHandle;

/// Everything a full build produced.
#[derive(Debug)]
pub struct BuildOutput {
    pub runtime: RuntimeBuild,
    pub kernel: LinkedBinary,
    pub programs: Vec<LinkedBinary>,
    pub assets: AssetTable,
    pub image: ImageOutput,
    pub report: BuildReport,
}

pub struct Pipeline<'a> {
    config: ForgeConfig,
    ctx: BuildContext,
    toolchain: &'a dyn Toolchain,
}

fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
}

impl<'a> Pipeline<'a> {
    pub fn new(config: ForgeConfig, toolchain: &'a dyn Toolchain) -> Self {
        let ctx = BuildContext::from_config(&config);
        Pipeline {
            config,
            ctx,
            toolchain,
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn runtime_graph(&self) -> Result<BuildGraph> {
        runtime_graph(&self.config.runtime)
    }

    fn kernel_linker(&self) -> KernelLinker<'_> {
        let kernel = &self.config.kernel;
        KernelLinker::new(
            &self.ctx,
            self.toolchain,
            &kernel.source,
            LayoutScript::new(&kernel.layout)
                .with_capacity(kernel.capacity)
                .with_entry_offset(kernel.entry_offset),
        )
    }

    fn program_compiler(&self) -> Result<ProgramCompiler<'_>> {
        let cfg = &self.config.programs;
        Ok(ProgramCompiler::new(
            &self.ctx,
            self.toolchain,
            Harness::load(cfg.harness.as_deref())?,
            LayoutScript::new(&cfg.layout)
                .with_capacity(cfg.capacity)
                .with_entry_offset(cfg.entry_offset),
        ))
    }

    fn policy(&self) -> ProgramPolicy {
        ProgramPolicy::new(
            &self.config.programs.optional,
            self.config.programs.tolerate_optional,
        )
    }

    fn assembler(&self) -> ImageAssembler<'_> {
        let image = &self.config.image;
        ImageAssembler::new(
            &self.ctx,
            &image.loader,
            ImageLayout {
                loader_region: image.loader_region,
                table_offset: image.table_offset,
                kernel_capacity: self.config.kernel.capacity,
            },
            &image.output,
        )
    }

    /// Programs found under the configured directory, sorted by name.
    pub fn programs(&self) -> Result<Vec<Program>> {
        let exclude: Vec<PathBuf> = self.config.programs.harness.iter().cloned().collect();
        programs::discover(&self.config.programs.dir, &exclude)
    }

    /// Filesystem path a program binary is installed at, if installing.
    pub fn install_path(&self, program: &str) -> Option<String> {
        let prefix = self.config.programs.install_prefix.trim_matches('/');
        if prefix.is_empty() {
            None
        } else {
            Some(format!("{prefix}/{program}.bin"))
        }
    }

    fn installed(&self, binaries: &[LinkedBinary]) -> Result<Vec<AssetSource>> {
        binaries
            .iter()
            .filter_map(|b| self.install_path(&b.name).map(|path| (path, b)))
            .map(|(path, b)| AssetSource::from_file(Stage::Programs, path, &b.path))
            .collect()
    }

    pub fn build_runtime(&self) -> Result<RuntimeBuild> {
        info!("=== Building runtime stack ===");
        let graph = self.runtime_graph()?;
        RuntimeStackBuilder::new(&self.ctx, &graph, self.toolchain).build_all()
    }

    /// Build a single runtime layer against already-built prerequisites.
    pub fn build_runtime_layer(&self, name: &str) -> Result<PathBuf> {
        let graph = self.runtime_graph()?;
        RuntimeStackBuilder::new(&self.ctx, &graph, self.toolchain).build_layer(name)
    }

    fn load_stack(&self, consumer: Stage) -> Result<RuntimeStack> {
        RuntimeStack::load(&self.ctx, &self.runtime_graph()?, consumer)
    }

    /// Build the kernel against the runtime stack on disk.
    pub fn build_kernel(&self) -> Result<LinkedBinary> {
        info!("=== Building kernel ===");
        let stack = self.load_stack(Stage::Kernel)?;
        self.kernel_linker().build(&stack)
    }

    /// Build every program, or just `only`, against the runtime stack on disk.
    pub fn build_programs(&self, only: Option<&str>) -> Result<Vec<LinkedBinary>> {
        info!("=== Building programs ===");
        let stack = self.load_stack(Stage::Programs)?;
        let mut programs = self.programs()?;
        if let Some(name) = only {
            programs.retain(|p| p.name == name);
            if programs.is_empty() {
                return Err(BuildError::UnknownDependency {
                    stage: Stage::Programs,
                    unit: "programs".to_string(),
                    dependency: name.to_string(),
                });
            }
        }
        self.program_compiler()?
            .build_all(&programs, &stack, self.config.jobs())
            .into_result(&self.policy())
    }

    /// Program binaries from an earlier run; tolerated optional programs
    /// that were never built are left out.
    fn built_programs(&self) -> Result<Vec<LinkedBinary>> {
        let programs = self.programs()?;
        if programs.is_empty() {
            return Ok(Vec::new());
        }
        let stack = self.load_stack(Stage::Programs)?;
        let compiler = self.program_compiler()?;
        let policy = self.policy();
        let mut built = Vec::new();
        for program in programs {
            match compiler.load(&program, &stack) {
                Ok(binary) => built.push(binary),
                Err(e) if policy.tolerates(&program.name) => {
                    warn!("[filesystem] leaving out optional program {}: {e}", program.name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(built)
    }

    /// Scan the asset tree and add already-built program binaries.
    pub fn generate_manifest(&self) -> Result<AssetTable> {
        info!("=== Generating filesystem manifest ===");
        let installed = self.installed(&self.built_programs()?)?;
        FilesystemManifestGenerator::new(&self.config.filesystem.root).generate(installed)
    }

    /// Assemble the image from artifacts already on disk.
    pub fn assemble_image(&self) -> Result<ImageOutput> {
        let assets = self.generate_manifest()?;
        info!("=== Assembling image ===");
        let stack = self.load_stack(Stage::Kernel)?;
        let kernel = self.kernel_linker().load(&stack)?;
        self.assembler().assemble(&kernel, &assets)
    }

    /// Build everything and write the image and the report.
    pub fn run(&self) -> Result<BuildOutput> {
        info!("=== Building {} image ===", self.ctx.profile().arch());
        let output = &self.config.image.output;
        if output.exists() {
            std::fs::remove_file(output).at(Stage::Image, output)?;
        }

        let (runtime, runtime_time) = timed(|| self.build_runtime());
        let runtime = runtime?;
        let stack = &runtime.stack;

        let programs = self.programs()?;
        let kernel_linker = self.kernel_linker();
        let compiler = self.program_compiler()?;
        let policy = self.policy();
        let jobs = self.config.jobs();
        let generator = FilesystemManifestGenerator::new(&self.config.filesystem.root);

        info!("=== Building kernel, programs and filesystem ===");
        let (kernel, programs_built, scanned) = std::thread::scope(|s| {
            let k = s.spawn(|| timed(|| kernel_linker.build(stack)));
            let p = s.spawn(|| timed(|| compiler.build_all(&programs, stack, jobs)));
            let f = s.spawn(|| timed(|| generator.scan()));
            (join(k), join(p), join(f))
        });

        // Report the first failure in stage order.
        let (kernel, kernel_time) = kernel;
        let kernel = kernel?;
        let (outcomes, programs_time) = programs_built;
        let skipped: Vec<String> = outcomes
            .failed
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let programs = outcomes.into_result(&policy)?;
        let (scanned, scan_time) = scanned;
        let mut sources = scanned?;

        let (assets, manifest_time) = timed(|| -> Result<AssetTable> {
            sources.extend(self.installed(&programs)?);
            Manifest::assign(sources)
        });
        let assets = assets?;

        let (image, image_time) = timed(|| self.assembler().assemble(&kernel, &assets));
        let image = image?;

        let stages = vec![
            StageReport::new(
                Stage::Runtime,
                runtime_time,
                stack
                    .externs()
                    .into_iter()
                    .map(|(name, path)| ArtifactReport {
                        name,
                        size: std::fs::metadata(&path).map_or(0, |m| m.len()),
                        path,
                    })
                    .collect(),
            ),
            StageReport::new(Stage::Kernel, kernel_time, vec![ArtifactReport::from(&kernel)]),
            StageReport::new(
                Stage::Programs,
                programs_time,
                programs.iter().map(ArtifactReport::from).collect(),
            ),
            StageReport::new(Stage::Filesystem, scan_time + manifest_time, Vec::new()),
            StageReport::new(Stage::Image, image_time, Vec::new()),
        ];
        let report = BuildReport::new(
            self.ctx.profile().arch(),
            stages,
            skipped,
            ImageReport::new(&image, assets.manifest().len()),
        );
        report.write(&self.ctx.report_path())?;

        info!("=== Build complete: {} ===", image.path.display());
        Ok(BuildOutput {
            runtime,
            kernel,
            programs,
            assets,
            image,
            report,
        })
    }
}
