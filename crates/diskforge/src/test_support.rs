//! Deterministic stand-in for rustc and ld.
//!
//! Objects and binaries are text: the crate name, the externs it was given,
//! an `lto` marker and the source (with `#[path]` modules inlined). Sources
//! containing `compile_error!` fail to compile; objects mentioning
//! `undefined_symbol` fail to link. A `sleep_ms:<n>` marker delays the
//! compile.

use crate::toolchain::{CompileRequest, LinkRequest, ToolFailure, Toolchain};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
pub struct FakeToolchain {
    compiled: Mutex<Vec<String>>,
}

impl FakeToolchain {
    /// Crate names compiled so far, in call order.
    pub fn compiled(&self) -> Vec<String> {
        self.compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn read(path: &Path) -> Result<String, ToolFailure> {
    std::fs::read_to_string(path).map_err(|source| ToolFailure::Spawn {
        tool: "fake".to_string(),
        source,
    })
}

fn write(tool: &str, path: &Path, body: String) -> Result<(), ToolFailure> {
    std::fs::write(path, body).map_err(|source| ToolFailure::Spawn {
        tool: tool.to_string(),
        source,
    })
}

fn exit(tool: &str, stderr: &str) -> ToolFailure {
    ToolFailure::Exit {
        tool: tool.to_string(),
        status: "exit status: 1".to_string(),
        stderr: stderr.to_string(),
    }
}

impl Toolchain for FakeToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<(), ToolFailure> {
        let mut source = read(&request.source)?;
        // Pull in `#[path = "..."]` modules the way rustc would.
        if let Some(rest) = source.split("#[path = \"").nth(1) {
            if let Some(path) = rest.split('"').next() {
                let module = read(Path::new(path))?;
                source.push_str(&module);
            }
        }
        if let Some(ms) = source
            .split("sleep_ms:")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse().ok())
        {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if source.contains("compile_error!") {
            return Err(exit("rustc", "error: compile_error! invoked"));
        }

        let mut out = format!("OBJ {}\n", request.crate_name);
        for (name, _) in &request.externs {
            out.push_str(&format!("extern {name}\n"));
        }
        if request.lto {
            out.push_str("lto\n");
        }
        out.push_str(&source);
        write("rustc", &request.output, out)?;
        self.compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.crate_name.clone());
        Ok(())
    }

    fn link(&self, request: &LinkRequest) -> Result<(), ToolFailure> {
        let object = read(&request.object)?;
        if object.contains("undefined_symbol") {
            return Err(exit("ld", "undefined reference to `undefined_symbol'"));
        }
        write("ld", &request.output, format!("BIN\n{object}"))
    }
}
