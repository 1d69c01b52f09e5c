//! Layered freestanding runtime libraries.
//!
//! The stack is `core`, `alloc` (core), `alloc_system` (core) and
//! `collections` (core, alloc, alloc_system). Layers are built one at a time
//! in graph order; there is no parallelism inside this stage.

use crate::config::RuntimeConfig;
use crate::context::BuildContext;
use crate::error::{BuildError, IoContext, Result, Stage};
use crate::freshness::{check_dependency, is_fresh};
use crate::graph::{BuildGraph, CompilationUnit};
use crate::toolchain::{CompileRequest, Toolchain};
use log::info;
use std::path::{Path, PathBuf};

pub const CORE: &str = "core";
pub const ALLOC: &str = "alloc";
pub const ALLOC_SYSTEM: &str = "alloc_system";
pub const COLLECTIONS: &str = "collections";

/// Declare the runtime layers.
pub fn runtime_graph(config: &RuntimeConfig) -> Result<BuildGraph> {
    BuildGraph::new(
        Stage::Runtime,
        vec![
            CompilationUnit::library(CORE, &config.core),
            CompilationUnit::library(ALLOC, &config.alloc).depends_on(&[CORE]),
            CompilationUnit::library(ALLOC_SYSTEM, &config.alloc_system).depends_on(&[CORE]),
            CompilationUnit::library(COLLECTIONS, &config.collections)
                .depends_on(&[CORE, ALLOC, ALLOC_SYSTEM]),
        ],
    )
}

/// Built runtime libraries, in build order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStack {
    search_dir: PathBuf,
    layers: Vec<(String, PathBuf)>,
}

impl RuntimeStack {
    /// Resolve an already-built stack from its persisted artifacts.
    ///
    /// Used by stages that run without building the runtime themselves.
    pub fn load(ctx: &BuildContext, graph: &BuildGraph, consumer: Stage) -> Result<Self> {
        let mut layers = Vec::with_capacity(graph.len());
        for unit in graph.order() {
            let artifact = ctx.library_artifact(&unit.name);
            check_dependency(
                consumer,
                consumer.dir_name(),
                &unit.name,
                &artifact,
                &layer_inputs(ctx, graph, unit),
            )?;
            layers.push((unit.name.clone(), artifact));
        }
        Ok(RuntimeStack {
            search_dir: ctx.stage_dir(Stage::Runtime),
            layers,
        })
    }

    /// `--extern` pairs for a unit compiled against the whole stack.
    pub fn externs(&self) -> Vec<(String, PathBuf)> {
        self.layers.clone()
    }

    pub fn search_dir(&self) -> &Path {
        &self.search_dir
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(name, _)| name.as_str())
    }
}

/// Outcome of [`RuntimeStackBuilder::build_all`].
#[derive(Debug, Clone)]
pub struct RuntimeBuild {
    pub stack: RuntimeStack,
    /// Layers that were compiled this run; the others were already fresh.
    pub rebuilt: Vec<String>,
}

/// Source plus every dependency artifact of `unit`.
fn layer_inputs(ctx: &BuildContext, graph: &BuildGraph, unit: &CompilationUnit) -> Vec<PathBuf> {
    let mut inputs = vec![unit.source.clone()];
    inputs.extend(
        graph
            .transitive_deps(&unit.name)
            .into_iter()
            .map(|dep| ctx.library_artifact(&dep.name)),
    );
    inputs
}

pub struct RuntimeStackBuilder<'a> {
    ctx: &'a BuildContext,
    graph: &'a BuildGraph,
    toolchain: &'a dyn Toolchain,
}

impl<'a> RuntimeStackBuilder<'a> {
    pub fn new(ctx: &'a BuildContext, graph: &'a BuildGraph, toolchain: &'a dyn Toolchain) -> Self {
        RuntimeStackBuilder {
            ctx,
            graph,
            toolchain,
        }
    }

    /// Build every stale layer in dependency order.
    pub fn build_all(&self) -> Result<RuntimeBuild> {
        self.ctx.prepare_stage(Stage::Runtime)?;
        let mut rebuilt = Vec::new();

        for unit in self.graph.order() {
            let artifact = self.ctx.library_artifact(&unit.name);
            if is_fresh(&artifact, &layer_inputs(self.ctx, self.graph, unit)) {
                info!("[runtime] {} is up to date", unit.name);
                continue;
            }
            self.build_layer(&unit.name)?;
            rebuilt.push(unit.name.clone());
        }

        let stack = RuntimeStack::load(self.ctx, self.graph, Stage::Runtime)?;
        Ok(RuntimeBuild { stack, rebuilt })
    }

    /// Build exactly one layer.
    ///
    /// Every prerequisite must already be built and fresh; nothing is
    /// compiled otherwise.
    pub fn build_layer(&self, name: &str) -> Result<PathBuf> {
        let unit = self.graph.unit(name).ok_or_else(|| BuildError::UnknownDependency {
            stage: Stage::Runtime,
            unit: "runtime".to_string(),
            dependency: name.to_string(),
        })?;

        let deps = self.graph.transitive_deps(name);
        for dep in &deps {
            check_dependency(
                Stage::Runtime,
                name,
                &dep.name,
                &self.ctx.library_artifact(&dep.name),
                &layer_inputs(self.ctx, self.graph, dep),
            )?;
        }

        if !unit.source.exists() {
            return Err(BuildError::io(
                Stage::Runtime,
                &unit.source,
                std::io::Error::new(std::io::ErrorKind::NotFound, "layer source not found"),
            ));
        }

        let dir = self.ctx.prepare_stage(Stage::Runtime)?;
        let output = self.ctx.library_artifact(name);
        info!("[runtime] compiling {name}");

        self.toolchain
            .compile(&CompileRequest {
                crate_name: name.to_string(),
                source: unit.source.clone(),
                output: output.clone(),
                kind: unit.kind,
                externs: deps
                    .iter()
                    .map(|d| (d.name.clone(), self.ctx.library_artifact(&d.name)))
                    .collect(),
                search_dirs: vec![dir],
                lto: false,
                flags: unit.flags.clone(),
            })
            .map_err(|e| BuildError::CompileError {
                stage: Stage::Runtime,
                unit: name.to_string(),
                source_path: unit.source.clone(),
                detail: e.to_string(),
            })?;

        if !output.exists() {
            return Err(BuildError::CompileError {
                stage: Stage::Runtime,
                unit: name.to_string(),
                source_path: unit.source.clone(),
                detail: "compiler produced no artifact".to_string(),
            });
        }
        let len = std::fs::metadata(&output).at(Stage::Runtime, &output)?.len();
        info!("[runtime] built {} ({len} bytes)", output.display());
        Ok(output)
    }
}
