//! Build run records.
//!
//! Every architecture build gets a run directory
//! `<annex>/staging/<arch>/<run_id>/` holding `run-manifest.json`, the
//! staged output (`rpms/`) and, while the VM lives, its work directory.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::annex::{self, Artifact};
use crate::error::ForgeError;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
/// Subdirectory of a run directory receiving the guest output.
pub const STAGED_OUTPUT_DIR: &str = "rpms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub arch: String,
    pub status: RunStatus,
    pub emulated: bool,
    pub image: PathBuf,
    pub created_at_utc: String,
    #[serde(default)]
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn running(run_id: &str, arch: &str, emulated: bool, image: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            arch: arch.to_string(),
            status: RunStatus::Running,
            emulated,
            image: image.to_path_buf(),
            created_at_utc: annex::now_utc_compact(),
            finished_at_utc: None,
            artifacts: Vec::new(),
            error_kind: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, artifacts: &[Artifact]) {
        self.status = RunStatus::Success;
        self.artifacts = artifacts.to_vec();
        self.finished_at_utc = Some(annex::now_utc_compact());
    }

    pub fn fail(&mut self, err: &ForgeError) {
        self.status = match err {
            ForgeError::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        self.error_kind = Some(err.kind().to_string());
        self.error = Some(format!("{err:#}"));
        self.finished_at_utc = Some(annex::now_utc_compact());
    }

    pub fn write(&self, run_dir: &Path) -> Result<()> {
        let path = manifest_path(run_dir);
        annex::write_json_atomic(&path, self)
            .with_context(|| format!("writing run manifest '{}'", path.display()))
    }
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn load_manifest(run_dir: &Path) -> Result<RunManifest> {
    let path = manifest_path(run_dir);
    let bytes =
        fs::read(&path).with_context(|| format!("reading run manifest '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing run manifest '{}'", path.display()))
}

/// Manifests of every run under `arch_root` (`<annex>/staging/<arch>`).
pub fn load_runs(arch_root: &Path) -> Result<Vec<RunManifest>> {
    if !arch_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(arch_root)
        .with_context(|| format!("reading runs directory '{}'", arch_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", arch_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() || !manifest_path(&run_dir).is_file() {
            continue;
        }
        runs.push(load_manifest(&run_dir)?);
    }
    Ok(runs)
}

/// Most recent successful run for one architecture.
pub fn latest_successful_run(arch_root: &Path) -> Result<Option<RunManifest>> {
    let mut runs = load_runs(arch_root)?;
    runs.retain(|run| run.status == RunStatus::Success);
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs.into_iter().next())
}

fn run_sort_key(run: &RunManifest) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.created_at_utc.clone()),
        run.run_id.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn manifest_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("x86_64/r1");
        let mut manifest = RunManifest::running("r1", "x86_64", false, Path::new("/img.qcow2"));
        manifest.write(&run_dir).unwrap();
        assert_eq!(load_manifest(&run_dir).unwrap().status, RunStatus::Running);

        manifest.fail(&ForgeError::BuildFailed {
            code: 1,
            output: "boom".to_string(),
        });
        manifest.write(&run_dir).unwrap();
        let loaded = load_manifest(&run_dir).unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error_kind.as_deref(), Some("BuildFailed"));
        assert!(loaded.finished_at_utc.is_some());
    }

    #[test]
    fn latest_success_ignores_failures() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        let mut ok = RunManifest::running("a1", "x86_64", false, Path::new("/i"));
        ok.succeed(&[]);
        ok.finished_at_utc = Some("20260101T000000Z".to_string());
        ok.write(&root.join("a1")).unwrap();

        let mut newer_ok = ok.clone();
        newer_ok.run_id = "a2".to_string();
        newer_ok.finished_at_utc = Some("20260102T000000Z".to_string());
        newer_ok.write(&root.join("a2")).unwrap();

        let mut failed = ok.clone();
        failed.run_id = "a3".to_string();
        failed.fail(&ForgeError::Cancelled);
        failed.write(&root.join("a3")).unwrap();

        let latest = latest_successful_run(root).unwrap().unwrap();
        assert_eq!(latest.run_id, "a2");
        assert!(latest_successful_run(&root.join("missing")).unwrap().is_none());
    }
}
