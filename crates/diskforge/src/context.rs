//! Explicit build context.
//!
//! Replaces process-wide state (working directory, shared intermediate file
//! names) with a value passed to every stage. Each stage, and each program
//! within the programs stage, writes only below its own directory.

use crate::config::ForgeConfig;
use crate::error::{IoContext, Result, Stage};
use crate::target::TargetProfile;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BuildContext {
    artifact_root: PathBuf,
    profile: TargetProfile,
}

impl BuildContext {
    /// Artifacts go to `<build_dir>/<arch>`.
    pub fn new(build_dir: &Path, profile: TargetProfile) -> Self {
        BuildContext {
            artifact_root: build_dir.join(profile.arch()),
            profile,
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        Self::new(&config.build.dir, TargetProfile::from_config(&config.target))
    }

    pub fn profile(&self) -> &TargetProfile {
        &self.profile
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.artifact_root.join(stage.dir_name())
    }

    /// Namespace owned by a single unit of a stage.
    pub fn unit_dir(&self, stage: Stage, unit: &str) -> PathBuf {
        self.stage_dir(stage).join(unit)
    }

    /// Persisted artifact of a runtime library, located by its stable name.
    pub fn library_artifact(&self, name: &str) -> PathBuf {
        self.stage_dir(Stage::Runtime).join(format!("lib{name}.rlib"))
    }

    /// Create (if needed) and return the stage directory.
    pub fn prepare_stage(&self, stage: Stage) -> Result<PathBuf> {
        let dir = self.stage_dir(stage);
        std::fs::create_dir_all(&dir).at(stage, &dir)?;
        Ok(dir)
    }

    /// Create (if needed) and return a unit's private directory.
    pub fn prepare_unit(&self, stage: Stage, unit: &str) -> Result<PathBuf> {
        let dir = self.unit_dir(stage, unit);
        std::fs::create_dir_all(&dir).at(stage, &dir)?;
        Ok(dir)
    }

    pub fn report_path(&self) -> PathBuf {
        self.artifact_root.join("report.json")
    }
}
