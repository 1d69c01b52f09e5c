//! Kernel compile and link.

use crate::context::BuildContext;
use crate::error::{BuildError, Result, Stage};
use crate::graph::UnitKind;
use crate::layout::{link_flat, LayoutScript, LinkedBinary};
use crate::runtime::RuntimeStack;
use crate::toolchain::{CompileRequest, Toolchain};
use log::info;
use std::path::{Path, PathBuf};

pub const KERNEL_UNIT: &str = "kernel";

/// Turns the kernel source into a single flat binary.
pub struct KernelLinker<'a> {
    ctx: &'a BuildContext,
    toolchain: &'a dyn Toolchain,
    source: PathBuf,
    layout: LayoutScript,
}

impl<'a> KernelLinker<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        toolchain: &'a dyn Toolchain,
        source: impl Into<PathBuf>,
        layout: LayoutScript,
    ) -> Self {
        KernelLinker {
            ctx,
            toolchain,
            source: source.into(),
            layout,
        }
    }

    /// Path of the flat kernel once built.
    pub fn output_path(&self) -> PathBuf {
        self.ctx
            .stage_dir(Stage::Kernel)
            .join(format!("{KERNEL_UNIT}.bin"))
    }

    /// Compile against every runtime layer with LTO, then link flat.
    pub fn build(&self, stack: &RuntimeStack) -> Result<LinkedBinary> {
        let dir = self.ctx.prepare_stage(Stage::Kernel)?;
        let object = dir.join(format!("{KERNEL_UNIT}.o"));
        let output = self.output_path();

        // Never leave a previous kernel around if this build fails.
        remove_stale(&output)?;

        info!("[kernel] compiling {}", self.source.display());
        self.toolchain
            .compile(&CompileRequest {
                crate_name: KERNEL_UNIT.to_string(),
                source: self.source.clone(),
                output: object.clone(),
                kind: UnitKind::Object,
                externs: stack.externs(),
                search_dirs: vec![stack.search_dir().to_path_buf()],
                lto: true,
                flags: Vec::new(),
            })
            .map_err(|e| BuildError::CompileError {
                stage: Stage::Kernel,
                unit: KERNEL_UNIT.to_string(),
                source_path: self.source.clone(),
                detail: e.to_string(),
            })?;

        link_flat(
            self.toolchain,
            Stage::Kernel,
            KERNEL_UNIT,
            &object,
            &self.layout,
            &output,
        )
    }

    /// The kernel binary left by an earlier run, which must be newer than
    /// its source, its layout script and every runtime layer.
    pub fn load(&self, stack: &RuntimeStack) -> Result<LinkedBinary> {
        let mut inputs = vec![self.source.clone()];
        inputs.extend(stack.externs().into_iter().map(|(_, rlib)| rlib));
        LinkedBinary::load(
            Stage::Kernel,
            KERNEL_UNIT,
            &self.output_path(),
            &self.layout,
            &inputs,
        )
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(BuildError::io(Stage::Kernel, path, e))
        }
        _ => Ok(()),
    }
}
