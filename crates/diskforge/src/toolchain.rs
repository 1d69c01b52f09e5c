//! Compiler and linker invocation.
//!
//! Stages talk to the toolchain through [`Toolchain`] so the pipeline can be
//! driven by the host `rustc`/`ld` or by any other implementation.

use crate::graph::UnitKind;
use crate::target::TargetProfile;
use log::debug;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub crate_name: String,
    pub source: PathBuf,
    pub output: PathBuf,
    pub kind: UnitKind,
    /// `(crate name, artifact path)` pairs passed as `--extern`.
    pub externs: Vec<(String, PathBuf)>,
    pub search_dirs: Vec<PathBuf>,
    /// Cross-crate (link-time) optimisation. Only meaningful for objects.
    pub lto: bool,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub object: PathBuf,
    pub script: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}:\n{stderr}")]
    Exit {
        tool: String,
        status: String,
        stderr: String,
    },
}

pub trait Toolchain: Send + Sync {
    fn compile(&self, request: &CompileRequest) -> Result<(), ToolFailure>;

    /// Link `request.object` into a flat binary at `request.output`.
    fn link(&self, request: &LinkRequest) -> Result<(), ToolFailure>;
}

/// Runs the host `rustc` and linker configured in the target profile.
pub struct HostToolchain {
    profile: TargetProfile,
}

impl HostToolchain {
    pub fn new(profile: TargetProfile) -> Self {
        HostToolchain { profile }
    }

    fn rustc_command(&self, request: &CompileRequest) -> Command {
        let mut cmd = Command::new(self.profile.rustc());
        cmd.args(["--crate-name", &request.crate_name])
            .args(["--target", self.profile.target()])
            .args(self.profile.rustc_flags())
            .args(&request.flags);

        match request.kind {
            UnitKind::Library => {
                cmd.args(["--crate-type", "lib"]);
            }
            UnitKind::Object => {
                cmd.args(["--crate-type", "staticlib", "--emit", "obj"]);
                if request.lto {
                    cmd.args(["-C", "lto"]);
                }
            }
        }

        for dir in &request.search_dirs {
            cmd.arg("-L").arg(dir);
        }
        for (name, path) in &request.externs {
            cmd.arg("--extern")
                .arg(format!("{name}={}", path.display()));
        }
        cmd.arg("-o").arg(&request.output).arg(&request.source);
        cmd
    }

    fn link_command(&self, request: &LinkRequest) -> Command {
        let mut cmd = Command::new(self.profile.linker());
        cmd.args(self.profile.linker_args())
            .arg("-T")
            .arg(&request.script)
            .args(["--oformat", "binary"])
            .arg("-o")
            .arg(&request.output)
            .arg(&request.object);
        cmd
    }
}

fn run(tool: &str, mut cmd: Command) -> Result<(), ToolFailure> {
    debug!("running {cmd:?}");
    let output = cmd.output().map_err(|source| ToolFailure::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(ToolFailure::Exit {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

impl Toolchain for HostToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<(), ToolFailure> {
        run(self.profile.rustc(), self.rustc_command(request))
    }

    fn link(&self, request: &LinkRequest) -> Result<(), ToolFailure> {
        run(self.profile.linker(), self.link_command(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_library_command_line() {
        let tc = HostToolchain::new(TargetProfile::freestanding("i386", "i386.json"));
        let cmd = tc.rustc_command(&CompileRequest {
            crate_name: "alloc".to_string(),
            source: PathBuf::from("rust/liballoc/lib.rs"),
            output: PathBuf::from("build/liballoc.rlib"),
            kind: UnitKind::Library,
            externs: vec![("core".to_string(), PathBuf::from("build/libcore.rlib"))],
            search_dirs: vec![PathBuf::from("build")],
            lto: true,
            flags: Vec::new(),
        });
        let args = args(&cmd);
        assert_eq!(cmd.get_program(), "rustc");
        assert!(args.windows(2).any(|w| w == ["--crate-type", "lib"]));
        assert!(args.windows(2).any(|w| w == ["--extern", "core=build/libcore.rlib"]));
        assert!(!args.iter().any(|a| a == "lto"));
        assert_eq!(args.last().map(String::as_str), Some("rust/liballoc/lib.rs"));
    }

    #[test]
    fn test_object_command_enables_lto() {
        let tc = HostToolchain::new(TargetProfile::freestanding("i386", "i386.json"));
        let cmd = tc.rustc_command(&CompileRequest {
            crate_name: "kernel".to_string(),
            source: PathBuf::from("kernel/main.rs"),
            output: PathBuf::from("kernel.o"),
            kind: UnitKind::Object,
            externs: Vec::new(),
            search_dirs: Vec::new(),
            lto: true,
            flags: Vec::new(),
        });
        let args = args(&cmd);
        assert!(args.windows(2).any(|w| w == ["--emit", "obj"]));
        assert!(args.windows(2).any(|w| w == ["-C", "lto"]));
    }

    #[test]
    fn test_link_command_emits_flat_binary() {
        let tc = HostToolchain::new(TargetProfile::freestanding("i386", "i386.json"));
        let cmd = tc.link_command(&LinkRequest {
            object: PathBuf::from("kernel.o"),
            script: PathBuf::from("kernel.ld"),
            output: PathBuf::from("kernel.bin"),
        });
        let args = args(&cmd);
        assert_eq!(cmd.get_program(), "ld");
        assert_eq!(&args[..2], ["-m", "elf_i386"]);
        assert!(args.windows(2).any(|w| w == ["-T", "kernel.ld"]));
        assert!(args.windows(2).any(|w| w == ["--oformat", "binary"]));
    }

    #[test]
    fn test_missing_tool_is_spawn_failure() {
        let tc = HostToolchain::new(
            TargetProfile::freestanding("i386", "i386.json")
                .with_tools("diskforge-no-such-rustc", "diskforge-no-such-ld"),
        );
        let err = tc
            .link(&LinkRequest {
                object: PathBuf::from("a.o"),
                script: PathBuf::from("a.ld"),
                output: PathBuf::from("a.bin"),
            })
            .unwrap_err();
        assert!(matches!(err, ToolFailure::Spawn { .. }));
    }
}
