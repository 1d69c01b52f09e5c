//! Entry-unit generation for standalone programs.
//!
//! Each program is a plain source file exposing `main()`. The harness wraps
//! it in a freestanding compilation unit: crate attributes, the runtime
//! externs, memory intrinsics, a panic handler and an exported `_start`.
//! The program's path is spliced in as an escaped string literal, never by
//! textual substitution into a template.

use crate::error::{BuildError, Result};
use std::path::{Path, PathBuf};

const DEFAULT_PREAMBLE: &str = r#"#![no_std]
#![no_main]
#![allow(dead_code)]

extern crate alloc;
extern crate alloc_system;
extern crate collections;

use core::arch::asm;
use core::panic::PanicInfo;

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {
        unsafe {
            // exit(-1)
            asm!("int 0x80", in("eax") 1, in("ebx") -1i32);
            asm!("sti; hlt");
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn memcmp(a: *const u8, b: *const u8, len: usize) -> i32 {
    let mut i = 0;
    while i < len {
        let (x, y) = (*a.add(i), *b.add(i));
        if x != y {
            return i32::from(x) - i32::from(y);
        }
        i += 1;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn memmove(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    if (src as usize) < (dst as usize) {
        let mut i = len;
        while i > 0 {
            i -= 1;
            *dst.add(i) = *src.add(i);
        }
    } else {
        let mut i = 0;
        while i < len {
            *dst.add(i) = *src.add(i);
            i += 1;
        }
    }
    dst
}

#[no_mangle]
pub unsafe extern "C" fn memcpy(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    let mut i = 0;
    while i < len {
        *dst.add(i) = *src.add(i);
        i += 1;
    }
    dst
}

#[no_mangle]
pub unsafe extern "C" fn memset(dst: *mut u8, c: i32, len: usize) -> *mut u8 {
    let mut i = 0;
    while i < len {
        *dst.add(i) = c as u8;
        i += 1;
    }
    dst
}
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harness {
    preamble: String,
    source: Option<PathBuf>,
}

impl Default for Harness {
    fn default() -> Self {
        Harness {
            preamble: DEFAULT_PREAMBLE.to_string(),
            source: None,
        }
    }
}

impl Harness {
    /// Use a custom preamble in place of the built-in one.
    pub fn with_preamble(preamble: impl Into<String>) -> Result<Self> {
        let preamble = preamble.into();
        if declares(&preamble, "mod application") {
            return Err(invalid("harness preamble already declares `mod application`"));
        }
        if declares(&preamble, "fn _start") {
            return Err(invalid("harness preamble already defines `_start`"));
        }
        Ok(Harness {
            preamble,
            source: None,
        })
    }

    /// Load the preamble from `path`, or the built-in one if `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let preamble = std::fs::read_to_string(path).map_err(|e| BuildError::Config {
            path: path.to_path_buf(),
            detail: format!("failed to read harness preamble: {e}"),
        })?;
        let mut harness = Self::with_preamble(preamble).map_err(|e| match e {
            BuildError::Config { detail, .. } => BuildError::Config {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })?;
        harness.source = Some(path.to_path_buf());
        Ok(harness)
    }

    /// File the preamble was read from; `None` for the built-in one.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Full entry unit for the program at `program_source`.
    pub fn generate(&self, program_source: &Path) -> Result<String> {
        let path = program_source.to_str().ok_or_else(|| BuildError::Config {
            path: program_source.to_path_buf(),
            detail: "program path is not valid UTF-8".to_string(),
        })?;

        let mut unit = String::with_capacity(self.preamble.len() + 256);
        unit.push_str(&self.preamble);
        if !unit.ends_with('\n') {
            unit.push('\n');
        }
        // `{:?}` on a str yields a valid Rust string literal with escapes.
        unit.push_str(&format!(
            "\n#[path = {path:?}]\nmod application;\n\n\
             #[no_mangle]\n\
             pub unsafe extern \"C\" fn _start() {{\n    application::main();\n}}\n"
        ));
        Ok(unit)
    }
}

fn declares(preamble: &str, item: &str) -> bool {
    preamble
        .lines()
        .map(str::trim_start)
        .filter(|line| !line.starts_with("//"))
        .any(|line| {
            line.strip_prefix("pub ")
                .unwrap_or(line)
                .trim_start_matches("unsafe ")
                .trim_start_matches("extern \"C\" ")
                .starts_with(item)
        })
}

fn invalid(detail: &str) -> BuildError {
    BuildError::Config {
        path: PathBuf::from("<harness>"),
        detail: detail.to_string(),
    }
}
