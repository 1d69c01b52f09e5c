//! Link stage shared by the kernel and programs.

use crate::error::{BuildError, IoContext, Result, Stage};
use crate::freshness::check_dependency;
use crate::toolchain::{LinkRequest, Toolchain};
use log::info;
use std::path::{Path, PathBuf};

/// A linker script plus the facts the pipeline needs about it.
///
/// The script itself is opaque; its reserved region size and entry offset
/// come from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutScript {
    pub path: PathBuf,
    pub capacity: Option<u64>,
    pub entry_offset: u64,
}

impl LayoutScript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LayoutScript {
            path: path.into(),
            capacity: None,
            entry_offset: 0,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: Option<u64>) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_entry_offset(mut self, entry_offset: u64) -> Self {
        self.entry_offset = entry_offset;
        self
    }
}

/// Flat binary produced by linking a unit against a layout script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedBinary {
    pub name: String,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub entry_offset: u64,
}

impl LinkedBinary {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reload a previously linked binary from disk for use by `stage`.
    ///
    /// The binary must be at least as new as the layout script and every
    /// path in `inputs`.
    pub fn load(
        stage: Stage,
        name: &str,
        path: &Path,
        layout: &LayoutScript,
        inputs: &[PathBuf],
    ) -> Result<Self> {
        let mut inputs = inputs.to_vec();
        inputs.push(layout.path.clone());
        check_dependency(stage, stage.dir_name(), name, path, &inputs)?;
        let bytes = std::fs::read(path).at(stage, path)?;
        check_capacity(stage, name, bytes.len() as u64, layout)?;
        Ok(LinkedBinary {
            name: name.to_string(),
            path: path.to_path_buf(),
            bytes,
            entry_offset: layout.entry_offset,
        })
    }
}

fn check_capacity(stage: Stage, name: &str, size: u64, layout: &LayoutScript) -> Result<()> {
    match layout.capacity {
        Some(capacity) if size > capacity => Err(BuildError::LayoutOverflow {
            stage,
            segment: name.to_string(),
            size,
            capacity,
        }),
        _ => Ok(()),
    }
}

/// Link `object` into a flat binary at `output`.
///
/// An output that exceeds the script's reserved region is deleted before
/// the overflow is reported, so no oversized binary is left behind.
pub fn link_flat(
    toolchain: &dyn Toolchain,
    stage: Stage,
    unit: &str,
    object: &Path,
    layout: &LayoutScript,
    output: &Path,
) -> Result<LinkedBinary> {
    let link_error = |detail: String| BuildError::LinkError {
        stage,
        unit: unit.to_string(),
        script: layout.path.clone(),
        detail,
    };

    if !layout.path.exists() {
        return Err(link_error("layout script not found".to_string()));
    }

    toolchain
        .link(&LinkRequest {
            object: object.to_path_buf(),
            script: layout.path.clone(),
            output: output.to_path_buf(),
        })
        .map_err(|e| link_error(e.to_string()))?;

    if !output.exists() {
        return Err(link_error("linker produced no output".to_string()));
    }
    let bytes = std::fs::read(output).at(stage, output)?;
    if bytes.is_empty() {
        return Err(link_error("linker produced an empty binary".to_string()));
    }

    if let Err(e) = check_capacity(stage, unit, bytes.len() as u64, layout) {
        std::fs::remove_file(output).at(stage, output)?;
        return Err(e);
    }

    if layout.entry_offset >= bytes.len() as u64 {
        return Err(link_error(format!(
            "entry offset {:#x} lies outside the {}-byte binary",
            layout.entry_offset,
            bytes.len()
        )));
    }

    info!("[{stage}] linked {unit}: {} bytes", bytes.len());
    Ok(LinkedBinary {
        name: unit.to_string(),
        path: output.to_path_buf(),
        bytes,
        entry_offset: layout.entry_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeToolchain;

    fn setup(object_body: &str) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let object = tmp.path().join("unit.o");
        let script = tmp.path().join("unit.ld");
        std::fs::write(&object, object_body).unwrap();
        std::fs::write(&script, "ENTRY(start)\n").unwrap();
        (tmp, object, script)
    }

    #[test]
    fn test_link_reads_flat_output() {
        let (tmp, object, script) = setup("OBJ unit\n");
        let output = tmp.path().join("unit.bin");
        let binary = link_flat(
            &FakeToolchain::default(),
            Stage::Kernel,
            "unit",
            &object,
            &LayoutScript::new(script).with_entry_offset(2),
            &output,
        )
        .unwrap();
        assert_eq!(binary.bytes, b"BIN\nOBJ unit\n");
        assert_eq!(binary.entry_offset, 2);
    }

    #[test]
    fn test_overflow_removes_output() {
        let (tmp, object, script) = setup(&"x".repeat(100));
        let output = tmp.path().join("unit.bin");
        let err = link_flat(
            &FakeToolchain::default(),
            Stage::Programs,
            "unit",
            &object,
            &LayoutScript::new(script).with_capacity(Some(50)),
            &output,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::LayoutOverflow { size: 104, capacity: 50, .. }
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_missing_script_and_bad_entry() {
        let (tmp, object, script) = setup("OBJ unit\n");
        let output = tmp.path().join("unit.bin");
        let tc = FakeToolchain::default();

        let err = link_flat(
            &tc,
            Stage::Kernel,
            "unit",
            &object,
            &LayoutScript::new(tmp.path().join("missing.ld")),
            &output,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::LinkError { ref detail, .. } if detail.contains("not found")));

        let err = link_flat(
            &tc,
            Stage::Kernel,
            "unit",
            &object,
            &LayoutScript::new(script).with_entry_offset(4096),
            &output,
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::LinkError { ref detail, .. } if detail.contains("entry offset")));
    }

    #[test]
    fn test_load_missing_binary_is_unsatisfied() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = LinkedBinary::load(
            Stage::Image,
            "kernel",
            &tmp.path().join("kernel.bin"),
            &LayoutScript::new("kernel.ld"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BuildError::DependencyUnsatisfied { stage: Stage::Image, ref dependency, .. }
                if dependency == "kernel"
        ));
    }

    #[test]
    fn test_load_binary_older_than_script_is_unsatisfied() {
        let (tmp, object, script) = setup("OBJ unit\n");
        let output = tmp.path().join("unit.bin");
        let layout = LayoutScript::new(&script);
        link_flat(&FakeToolchain::default(), Stage::Kernel, "unit", &object, &layout, &output)
            .unwrap();
        let built = std::fs::metadata(&output).unwrap().modified().unwrap();

        assert!(LinkedBinary::load(Stage::Image, "unit", &output, &layout, &[object.clone()]).is_ok());

        std::fs::File::options()
            .write(true)
            .open(&script)
            .unwrap()
            .set_modified(built + std::time::Duration::from_secs(60))
            .unwrap();
        let err = LinkedBinary::load(Stage::Image, "unit", &output, &layout, &[object]).unwrap_err();
        assert!(matches!(
            err,
            BuildError::DependencyUnsatisfied { ref reason, .. } if reason.contains("older")
        ));
    }
}
