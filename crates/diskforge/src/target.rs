//! Freestanding compilation environment.

use crate::config::TargetConfig;

/// Static description of how every unit is compiled and linked.
///
/// Created once at process start and shared read-only by all stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    arch: String,
    target: String,
    rustc: String,
    linker: String,
    rustc_flags: Vec<String>,
    linker_args: Vec<String>,
}

/// Flags that strip host-runtime assumptions from generated code.
const FREESTANDING_FLAGS: &[&str] = &[
    "-C",
    "opt-level=2",
    "-C",
    "no-vectorize-loops",
    "-C",
    "no-vectorize-slp",
    "-C",
    "relocation-model=static",
    "-C",
    "code-model=kernel",
    "-C",
    "panic=abort",
    "-C",
    "force-unwind-tables=no",
    "-Z",
    "stack-protector=none",
];

impl TargetProfile {
    pub fn freestanding(arch: &str, target: &str) -> Self {
        let emulation = match arch {
            "x86_64" => "elf_x86_64",
            _ => "elf_i386",
        };
        TargetProfile {
            arch: arch.to_string(),
            target: target.to_string(),
            rustc: "rustc".to_string(),
            linker: "ld".to_string(),
            rustc_flags: FREESTANDING_FLAGS.iter().map(ToString::to_string).collect(),
            linker_args: vec!["-m".to_string(), emulation.to_string()],
        }
    }

    pub fn from_config(config: &TargetConfig) -> Self {
        Self::freestanding(&config.arch, &config.spec)
            .with_tools(&config.rustc, &config.linker)
            .with_extra_flags(&config.rustc_flags, &config.linker_args)
    }

    #[must_use]
    pub fn with_tools(mut self, rustc: &str, linker: &str) -> Self {
        self.rustc = rustc.to_string();
        self.linker = linker.to_string();
        self
    }

    #[must_use]
    pub fn with_extra_flags(mut self, rustc_flags: &[String], linker_args: &[String]) -> Self {
        self.rustc_flags.extend(rustc_flags.iter().cloned());
        self.linker_args.extend(linker_args.iter().cloned());
        self
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn rustc(&self) -> &str {
        &self.rustc
    }

    pub fn linker(&self) -> &str {
        &self.linker
    }

    pub fn rustc_flags(&self) -> &[String] {
        &self.rustc_flags
    }

    pub fn linker_args(&self) -> &[String] {
        &self.linker_args
    }
}
