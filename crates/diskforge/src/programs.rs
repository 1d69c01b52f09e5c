//! Standalone program builds.
//!
//! Programs are independent of each other: each one is generated, compiled
//! and linked inside its own `programs/<name>/` directory, so any number of
//! them can be built at once. A failure in one program never stops the
//! others from being attempted.

use crate::context::BuildContext;
use crate::error::{BuildError, IoContext, Result, Stage};
use crate::graph::UnitKind;
use crate::harness::Harness;
use crate::layout::{link_flat, LayoutScript, LinkedBinary};
use crate::runtime::RuntimeStack;
use crate::toolchain::{CompileRequest, Toolchain};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

/// A program source file and the stable name derived from its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub name: String,
    pub source: PathBuf,
}

/// Find every `*.rs` file below `dir`, skipping hidden entries and `exclude`.
///
/// `editor/main.rs` becomes program `editor-main`. A missing directory
/// means there are no programs.
pub fn discover(dir: &Path, exclude: &[PathBuf]) -> Result<Vec<Program>> {
    let mut found = BTreeMap::new();
    if dir.exists() {
        walk(dir, dir, exclude, &mut found)?;
    }
    Ok(found.into_values().collect())
}

fn walk(
    root: &Path,
    dir: &Path,
    exclude: &[PathBuf],
    found: &mut BTreeMap<String, Program>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .at(Stage::Programs, dir)?
        .collect::<std::io::Result<_>>()
        .at(Stage::Programs, dir)?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') || exclude.contains(&path) {
            continue;
        }
        let file_type = entry.file_type().at(Stage::Programs, &path)?;
        if file_type.is_dir() {
            walk(root, &path, exclude, found)?;
            continue;
        }
        if path.extension().is_none_or(|ext| ext != "rs") {
            continue;
        }

        let name = program_name(root, &path)?;
        if found.contains_key(&name) {
            return Err(BuildError::DuplicateUnit {
                stage: Stage::Programs,
                unit: name,
            });
        }
        found.insert(name.clone(), Program { name, source: path });
    }
    Ok(())
}

fn program_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("-")).ok_or_else(|| {
        BuildError::io(
            Stage::Programs,
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "program path is not valid UTF-8"),
        )
    })
}

/// `--crate-name` for a program: non-identifier characters become `_` and
/// a leading digit gets a `_` prefix.
fn crate_name(program: &str) -> String {
    let mut name: String = program
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Which program failures a build may shrug off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramPolicy {
    pub optional: BTreeSet<String>,
    pub tolerate_optional: bool,
}

impl ProgramPolicy {
    pub fn new(optional: &[String], tolerate_optional: bool) -> Self {
        ProgramPolicy {
            optional: optional.iter().cloned().collect(),
            tolerate_optional,
        }
    }

    pub fn tolerates(&self, name: &str) -> bool {
        self.tolerate_optional && self.optional.contains(name)
    }
}

/// Per-program results of a pool run, both lists ordered by name.
#[derive(Debug, Default)]
pub struct ProgramOutcomes {
    pub built: Vec<LinkedBinary>,
    pub failed: Vec<(String, BuildError)>,
}

impl ProgramOutcomes {
    /// Apply `policy`: the first intolerable failure wins, tolerated ones
    /// are logged and dropped.
    pub fn into_result(self, policy: &ProgramPolicy) -> Result<Vec<LinkedBinary>> {
        for (name, err) in self.failed {
            if policy.tolerates(&name) {
                warn!("[programs] skipping optional program {name}: {err}");
                continue;
            }
            return Err(err);
        }
        Ok(self.built)
    }
}

pub struct ProgramCompiler<'a> {
    ctx: &'a BuildContext,
    toolchain: &'a dyn Toolchain,
    harness: Harness,
    layout: LayoutScript,
}

impl<'a> ProgramCompiler<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        toolchain: &'a dyn Toolchain,
        harness: Harness,
        layout: LayoutScript,
    ) -> Self {
        ProgramCompiler {
            ctx,
            toolchain,
            harness,
            layout,
        }
    }

    pub fn output_path(&self, name: &str) -> PathBuf {
        self.ctx
            .unit_dir(Stage::Programs, name)
            .join(format!("{name}.bin"))
    }

    /// Generate, compile and link one program inside its own directory.
    pub fn build_one(&self, program: &Program, stack: &RuntimeStack) -> Result<LinkedBinary> {
        let dir = self.ctx.prepare_unit(Stage::Programs, &program.name)?;
        let entry = dir.join("entry.rs");
        let object = dir.join(format!("{}.o", program.name));
        let output = self.output_path(&program.name);

        if output.exists() {
            std::fs::remove_file(&output).at(Stage::Programs, &output)?;
        }

        let source = self.harness.generate(&program.source)?;
        std::fs::write(&entry, source).at(Stage::Programs, &entry)?;

        info!("[programs] compiling {}", program.name);
        self.toolchain
            .compile(&CompileRequest {
                crate_name: crate_name(&program.name),
                source: entry,
                output: object.clone(),
                kind: UnitKind::Object,
                externs: stack.externs(),
                search_dirs: vec![stack.search_dir().to_path_buf()],
                lto: true,
                flags: Vec::new(),
            })
            .map_err(|e| BuildError::CompileError {
                stage: Stage::Programs,
                unit: program.name.clone(),
                source_path: program.source.clone(),
                detail: e.to_string(),
            })?;

        link_flat(
            self.toolchain,
            Stage::Programs,
            &program.name,
            &object,
            &self.layout,
            &output,
        )
    }

    /// Build every program with at most `jobs` workers.
    ///
    /// Every program is attempted; results come back ordered by name no
    /// matter which worker finished first.
    pub fn build_all(
        &self,
        programs: &[Program],
        stack: &RuntimeStack,
        jobs: usize,
    ) -> ProgramOutcomes {
        let workers = jobs.clamp(1, programs.len().max(1));
        info!(
            "[programs] building {} program(s) with {workers} worker(s)",
            programs.len()
        );

        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(program) = programs.get(i) else {
                        break;
                    };
                    let result = self.build_one(program, stack);
                    if tx.send((program.name.clone(), result)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let results: BTreeMap<String, Result<LinkedBinary>> = rx.into_iter().collect();
        let mut outcomes = ProgramOutcomes::default();
        for (name, result) in results {
            match result {
                Ok(binary) => outcomes.built.push(binary),
                Err(err) => outcomes.failed.push((name, err)),
            }
        }
        outcomes
    }

    /// Binary left by an earlier run, for stages run on their own.
    ///
    /// It must be newer than the program source, a custom harness preamble,
    /// the layout script and every runtime layer.
    pub fn load(&self, program: &Program, stack: &RuntimeStack) -> Result<LinkedBinary> {
        let mut inputs = vec![program.source.clone()];
        inputs.extend(self.harness.source().map(Path::to_path_buf));
        inputs.extend(stack.externs().into_iter().map(|(_, rlib)| rlib));
        LinkedBinary::load(
            Stage::Programs,
            &program.name,
            &self.output_path(&program.name),
            &self.layout,
            &inputs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn test_discover_names_and_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path();
        write(&dir.join("shell.rs"), "");
        write(&dir.join("editor/main.rs"), "");
        write(&dir.join("notes.txt"), "");
        write(&dir.join(".hidden/secret.rs"), "");
        write(&dir.join("harness.rs"), "");

        let programs = discover(dir, &[dir.join("harness.rs")]).unwrap();
        let names: Vec<_> = programs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["editor-main", "shell"]);
        assert_eq!(programs[1].source, dir.join("shell.rs"));
    }

    #[test]
    fn test_discover_rejects_colliding_names() {
        let tmp = tempfile::TempDir::new().unwrap();
        write(&tmp.path().join("a-b.rs"), "");
        write(&tmp.path().join("a/b.rs"), "");
        let err = discover(tmp.path(), &[]).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateUnit { ref unit, .. } if unit == "a-b"));
    }

    #[test]
    fn test_missing_dir_has_no_programs() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(discover(&tmp.path().join("none"), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_crate_names_are_identifiers() {
        assert_eq!(crate_name("shell"), "shell");
        assert_eq!(crate_name("editor-main"), "editor_main");
        assert_eq!(crate_name("my.app"), "my_app");
        assert_eq!(crate_name("2048"), "_2048");
        assert_eq!(crate_name("games-2048"), "games_2048");
    }

    fn failure(name: &str) -> (String, BuildError) {
        (
            name.to_string(),
            BuildError::CompileError {
                stage: Stage::Programs,
                unit: name.to_string(),
                source_path: PathBuf::from(format!("{name}.rs")),
                detail: "boom".to_string(),
            },
        )
    }

    #[test]
    fn test_policy_tolerates_only_listed_optionals() {
        let outcomes = || ProgramOutcomes {
            built: Vec::new(),
            failed: vec![failure("game")],
        };

        let strict = ProgramPolicy::new(&["game".to_string()], false);
        assert!(outcomes().into_result(&strict).is_err());

        let lenient = ProgramPolicy::new(&["game".to_string()], true);
        assert!(outcomes().into_result(&lenient).unwrap().is_empty());

        let other = ProgramPolicy::new(&["editor".to_string()], true);
        assert!(outcomes().into_result(&other).is_err());
    }

    #[test]
    fn test_first_failure_by_name_is_reported() {
        let outcomes = ProgramOutcomes {
            built: Vec::new(),
            failed: vec![failure("alpha"), failure("beta")],
        };
        let err = outcomes.into_result(&ProgramPolicy::default()).unwrap_err();
        assert!(matches!(err, BuildError::CompileError { ref unit, .. } if unit == "alpha"));
    }
}
