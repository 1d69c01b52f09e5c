//! Build report written next to the artifacts after a full build.
//!
//! The report is a side artifact: nothing in it feeds back into the image.

use crate::error::{BuildError, IoContext, Result, Stage};
use crate::image::{ImageOutput, SegmentTable};
use crate::layout::LinkedBinary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

impl From<&LinkedBinary> for ArtifactReport {
    fn from(binary: &LinkedBinary) -> Self {
        ArtifactReport {
            name: binary.name.clone(),
            path: binary.path.clone(),
            size: binary.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub artifacts: Vec<ArtifactReport>,
}

impl StageReport {
    pub fn new(stage: Stage, elapsed: Duration, artifacts: Vec<ArtifactReport>) -> Self {
        StageReport {
            stage: stage.to_string(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            artifacts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReport {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub assets: usize,
    pub segments: SegmentTable,
}

impl ImageReport {
    pub fn new(image: &ImageOutput, assets: usize) -> Self {
        ImageReport {
            path: image.path.clone(),
            size: image.size,
            sha256: image.sha256.clone(),
            assets,
            segments: image.table,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub finished_at: DateTime<Utc>,
    pub arch: String,
    pub stages: Vec<StageReport>,
    /// Optional programs whose failure was tolerated.
    #[serde(default)]
    pub skipped_programs: Vec<String>,
    pub image: ImageReport,
}

impl BuildReport {
    pub fn new(
        arch: &str,
        stages: Vec<StageReport>,
        skipped_programs: Vec<String>,
        image: ImageReport,
    ) -> Self {
        BuildReport {
            finished_at: Utc::now(),
            arch: arch.to_string(),
            stages,
            skipped_programs,
            image,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            BuildError::io(Stage::Image, path, std::io::Error::other(e))
        })?;
        std::fs::write(path, json).at(Stage::Image, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).at(Stage::Image, path)?;
        serde_json::from_str(&content).map_err(|e| {
            BuildError::io(
                Stage::Image,
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        let name = stage.to_string();
        self.stages.iter().find(|s| s.stage == name)
    }
}

/// Run `f` and return its value with the elapsed time.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}
