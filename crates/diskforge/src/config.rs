//! Configuration file support.
//!
//! Reads `diskforge.toml` from the project root. A missing default file means
//! every setting takes its default; relative paths resolve against the
//! directory holding the config file.

use crate::error::{BuildError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "diskforge.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ForgeConfig {
    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub kernel: KernelConfig,

    #[serde(default)]
    pub programs: ProgramsConfig,

    #[serde(default)]
    pub filesystem: FilesystemConfig,

    #[serde(default)]
    pub image: ImageConfig,

    /// Directory the config was loaded from.
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_dir")]
    pub dir: PathBuf,

    /// Worker count for program builds; 0 picks the available parallelism.
    #[serde(default)]
    pub jobs: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            dir: default_build_dir(),
            jobs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_arch")]
    pub arch: String,

    /// Target triple, or a path to a target description ending in `.json`.
    #[serde(default = "default_target_spec")]
    pub spec: String,

    #[serde(default = "default_rustc")]
    pub rustc: String,

    #[serde(default = "default_linker")]
    pub linker: String,

    #[serde(default)]
    pub rustc_flags: Vec<String>,

    #[serde(default)]
    pub linker_args: Vec<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            arch: default_arch(),
            spec: default_target_spec(),
            rustc: default_rustc(),
            linker: default_linker(),
            rustc_flags: Vec::new(),
            linker_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_core")]
    pub core: PathBuf,
    #[serde(default = "default_alloc")]
    pub alloc: PathBuf,
    #[serde(default = "default_alloc_system")]
    pub alloc_system: PathBuf,
    #[serde(default = "default_collections")]
    pub collections: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            core: default_core(),
            alloc: default_alloc(),
            alloc_system: default_alloc_system(),
            collections: default_collections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_kernel_source")]
    pub source: PathBuf,

    #[serde(default = "default_kernel_layout")]
    pub layout: PathBuf,

    /// Bytes reserved for the flat kernel by its layout script.
    #[serde(default)]
    pub capacity: Option<u64>,

    #[serde(default)]
    pub entry_offset: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            source: default_kernel_source(),
            layout: default_kernel_layout(),
            capacity: None,
            entry_offset: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramsConfig {
    #[serde(default = "default_programs_dir")]
    pub dir: PathBuf,

    /// Replaces the built-in harness preamble.
    #[serde(default)]
    pub harness: Option<PathBuf>,

    #[serde(default = "default_program_layout")]
    pub layout: PathBuf,

    #[serde(default)]
    pub capacity: Option<u64>,

    #[serde(default)]
    pub entry_offset: u64,

    /// Filesystem directory the binaries are installed under; empty skips installing.
    #[serde(default = "default_install_prefix")]
    pub install_prefix: String,

    /// Programs whose failure may be tolerated.
    #[serde(default)]
    pub optional: Vec<String>,

    #[serde(default)]
    pub tolerate_optional: bool,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        ProgramsConfig {
            dir: default_programs_dir(),
            harness: None,
            layout: default_program_layout(),
            capacity: None,
            entry_offset: 0,
            install_prefix: default_install_prefix(),
            optional: Vec::new(),
            tolerate_optional: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    #[serde(default = "default_filesystem_root")]
    pub root: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        FilesystemConfig {
            root: default_filesystem_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_loader")]
    pub loader: PathBuf,

    /// Size of the loader region; the kernel starts right after it.
    #[serde(default = "default_loader_region")]
    pub loader_region: u64,

    /// Offset of the segment table inside the loader region.
    #[serde(default = "default_table_offset")]
    pub table_offset: u64,

    #[serde(default = "default_output")]
    pub output: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            loader: default_loader(),
            loader_region: default_loader_region(),
            table_offset: default_table_offset(),
            output: default_output(),
        }
    }
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}
fn default_arch() -> String {
    "i386".to_string()
}
fn default_target_spec() -> String {
    "i386-unknown-none.json".to_string()
}
fn default_rustc() -> String {
    "rustc".to_string()
}
fn default_linker() -> String {
    "ld".to_string()
}
fn default_core() -> PathBuf {
    PathBuf::from("rust/libcore/lib.rs")
}
fn default_alloc() -> PathBuf {
    PathBuf::from("rust/liballoc/lib.rs")
}
fn default_alloc_system() -> PathBuf {
    PathBuf::from("rust/liballoc_system/lib.rs")
}
fn default_collections() -> PathBuf {
    PathBuf::from("rust/libcollections/lib.rs")
}
fn default_kernel_source() -> PathBuf {
    PathBuf::from("kernel/main.rs")
}
fn default_kernel_layout() -> PathBuf {
    PathBuf::from("kernel/kernel.ld")
}
fn default_programs_dir() -> PathBuf {
    PathBuf::from("programs")
}
fn default_program_layout() -> PathBuf {
    PathBuf::from("programs/program.ld")
}
fn default_install_prefix() -> String {
    "apps".to_string()
}
fn default_filesystem_root() -> PathBuf {
    PathBuf::from("filesystem")
}
fn default_loader() -> PathBuf {
    PathBuf::from("loader/loader.bin")
}
fn default_loader_region() -> u64 {
    512
}
fn default_table_offset() -> u64 {
    crate::image::DEFAULT_TABLE_OFFSET
}
fn default_output() -> PathBuf {
    PathBuf::from("build/harddrive.bin")
}

impl ForgeConfig {
    /// Load config from `path`, or from `diskforge.toml` in the current
    /// directory (using defaults if that file doesn't exist).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::with_root(PathBuf::from(".")))
                }
            }
        }
    }

    /// Defaults for a project rooted at `root`.
    pub fn with_root(root: PathBuf) -> Self {
        let mut config = ForgeConfig::default();
        config.root = root;
        config.resolve_paths();
        config
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| BuildError::Config {
            path: path.to_path_buf(),
            detail: format!("failed to read: {e}"),
        })?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::parse(&content, root).map_err(|detail| BuildError::Config {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Parse config text; relative paths resolve against `root`.
    pub fn parse(content: &str, root: PathBuf) -> std::result::Result<Self, String> {
        let mut config: ForgeConfig = toml::from_str(content).map_err(|e| e.to_string())?;
        config.root = root;
        config.validate()?;
        config.resolve_paths();
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.image.loader_region == 0 {
            return Err("image.loader_region must be non-zero".to_string());
        }
        if self.image.table_offset + crate::image::SegmentTable::LEN as u64
            > self.image.loader_region
        {
            return Err(format!(
                "image.table_offset {:#x} leaves no room for the segment table inside the {}-byte loader region",
                self.image.table_offset, self.image.loader_region
            ));
        }
        if self.programs.install_prefix.starts_with('/') {
            return Err("programs.install_prefix must be relative".to_string());
        }
        Ok(())
    }

    fn resolve_paths(&mut self) {
        let root = self.root.clone();
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        };

        resolve(&mut self.build.dir);
        resolve(&mut self.runtime.core);
        resolve(&mut self.runtime.alloc);
        resolve(&mut self.runtime.alloc_system);
        resolve(&mut self.runtime.collections);
        resolve(&mut self.kernel.source);
        resolve(&mut self.kernel.layout);
        resolve(&mut self.programs.dir);
        if let Some(harness) = self.programs.harness.as_mut() {
            resolve(harness);
        }
        resolve(&mut self.programs.layout);
        resolve(&mut self.filesystem.root);
        resolve(&mut self.image.loader);
        resolve(&mut self.image.output);

        if Path::new(&self.target.spec)
            .extension()
            .is_some_and(|ext| ext == "json")
        {
            self.target.spec = root.join(&self.target.spec).to_string_lossy().into_owned();
        }
    }

    /// Number of program workers to run.
    pub fn jobs(&self) -> usize {
        if self.build.jobs > 0 {
            self.build.jobs
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1)
        }
    }
}
