//! Build error taxonomy.
//!
//! Every error names the stage that produced it and the artifact or path
//! involved. No stage recovers from another stage's error.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage identity, used for reporting and for per-stage namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Config,
    Runtime,
    Kernel,
    Programs,
    Filesystem,
    Image,
}

impl Stage {
    /// Directory name of the stage inside the artifact root.
    pub const fn dir_name(self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Runtime => "runtime",
            Stage::Kernel => "kernel",
            Stage::Programs => "programs",
            Stage::Filesystem => "filesystem",
            Stage::Image => "image",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("[{stage}] {unit}: dependency '{dependency}' unsatisfied: {reason}")]
    DependencyUnsatisfied {
        stage: Stage,
        unit: String,
        dependency: String,
        reason: String,
    },

    #[error("[{stage}] {unit}: failed to compile {}: {detail}", source_path.display())]
    CompileError {
        stage: Stage,
        unit: String,
        source_path: PathBuf,
        detail: String,
    },

    #[error("[{stage}] {unit}: failed to link with {}: {detail}", script.display())]
    LinkError {
        stage: Stage,
        unit: String,
        script: PathBuf,
        detail: String,
    },

    #[error("[{stage}] I/O error on {}: {source}", path.display())]
    Io {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] {segment} is {size} bytes, exceeding its reserved {capacity} bytes")]
    LayoutOverflow {
        stage: Stage,
        segment: String,
        size: u64,
        capacity: u64,
    },

    #[error("[{stage}] dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { stage: Stage, cycle: Vec<String> },

    #[error("[{stage}] {unit} depends on unknown unit '{dependency}'")]
    UnknownDependency {
        stage: Stage,
        unit: String,
        dependency: String,
    },

    #[error("[{stage}] unit '{unit}' declared twice")]
    DuplicateUnit { stage: Stage, unit: String },

    #[error("[{stage}] asset path '{path}' provided twice")]
    ConflictingAsset { stage: Stage, path: String },

    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("malformed image: {0}")]
    MalformedImage(String),

    #[error("configuration error in {}: {detail}", path.display())]
    Config { path: PathBuf, detail: String },
}

impl BuildError {
    /// Wrap an I/O error with the stage and path it happened on.
    pub fn io(stage: Stage, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            stage,
            path: path.into(),
            source,
        }
    }

    /// The stage that failed, when the error is attributable to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BuildError::DependencyUnsatisfied { stage, .. }
            | BuildError::CompileError { stage, .. }
            | BuildError::LinkError { stage, .. }
            | BuildError::Io { stage, .. }
            | BuildError::LayoutOverflow { stage, .. }
            | BuildError::CyclicDependency { stage, .. }
            | BuildError::UnknownDependency { stage, .. }
            | BuildError::DuplicateUnit { stage, .. }
            | BuildError::ConflictingAsset { stage, .. } => Some(*stage),
            BuildError::Config { .. } => Some(Stage::Config),
            BuildError::MalformedManifest(_) | BuildError::MalformedImage(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Attach stage and path to `std::io::Result`s.
pub(crate) trait IoContext<T> {
    fn at(self, stage: Stage, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, stage: Stage, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| BuildError::io(stage, path, source))
    }
}
