//! Artifact staleness policy.
//!
//! Timestamps, with make semantics: an artifact is fresh iff it exists and
//! its modification time is not older than any of its inputs (its source
//! plus the artifacts it was built against). A missing input makes the
//! artifact stale, so the stage that owns it gets to report the real error.

use crate::error::{BuildError, Result, Stage};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Whether `artifact` is up to date with respect to `inputs`.
pub fn is_fresh<P: AsRef<Path>>(artifact: &Path, inputs: &[P]) -> bool {
    let Some(built) = modified(artifact) else {
        return false;
    };
    inputs
        .iter()
        .all(|input| modified(input.as_ref()).is_some_and(|changed| changed <= built))
}

/// Require a prerequisite artifact to exist and be fresh.
pub fn check_dependency(
    stage: Stage,
    unit: &str,
    dependency: &str,
    artifact: &Path,
    inputs: &[PathBuf],
) -> Result<()> {
    let unsatisfied = |reason: String| BuildError::DependencyUnsatisfied {
        stage,
        unit: unit.to_string(),
        dependency: dependency.to_string(),
        reason,
    };

    if !artifact.exists() {
        return Err(unsatisfied(format!(
            "artifact {} is missing",
            artifact.display()
        )));
    }
    if !is_fresh(artifact, inputs) {
        return Err(unsatisfied(format!(
            "artifact {} is older than its inputs",
            artifact.display()
        )));
    }
    Ok(())
}
