//! Annex storage helpers.
//!
//! The annex is the root directory holding staged build output
//! (`staging/<arch>/<run_id>/`), published repositories (`repos/<name>/`)
//! and, by default, mirrored upstream repositories (`mirror/`).

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use walkdir::WalkDir;

const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A package produced by a build and staged in the annex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub filename: String,
    /// Architecture of the build that produced it.
    pub arch: String,
    pub sha256: String,
    #[serde(default)]
    pub signed: bool,
}

impl Artifact {
    pub fn from_file(path: &Path, arch: &str) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("artifact path without file name '{}'", path.display()))?
            .to_string();
        let (sha256, _) = sha256_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            filename,
            arch: arch.to_string(),
            sha256,
            signed: false,
        })
    }

    pub fn is_source(&self) -> bool {
        self.filename.ends_with(".src.rpm")
    }

    /// Repository subdirectory the package is published into.
    pub fn repo_subdir(&self) -> &str {
        if self.is_source() {
            "SRPMS"
        } else {
            &self.arch
        }
    }

    /// Recompute the checksum after the file was modified in place.
    pub fn refresh_checksum(&mut self) -> Result<()> {
        self.sha256 = sha256_file(&self.path)?.0;
        Ok(())
    }
}

/// Every `*.rpm` under `dir`, in path order.
pub fn collect_artifacts(dir: &Path, arch: &str) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    if !dir.is_dir() {
        return Ok(artifacts);
    }
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_rpm = entry
            .path()
            .extension()
            .is_some_and(|ext| ext == "rpm");
        if is_rpm {
            artifacts.push(Artifact::from_file(entry.path(), arch)?);
        }
    }
    Ok(artifacts)
}

pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing '{}'", path.display()))?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Sortable, collision-resistant identifier for a build run.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128) << (RUN_ID_SALT_BITS - 16);
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    let id = id.trim_start_matches('0');
    Ok(if id.is_empty() { "0".to_string() } else { id.to_string() })
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn artifact_checksum_and_subdir() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello-1.0-1.el9.src.rpm");
        fs::write(&path, b"abc").unwrap();

        let artifact = Artifact::from_file(&path, "aarch64").unwrap();
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(artifact.is_source());
        assert_eq!(artifact.repo_subdir(), "SRPMS");
        assert!(!artifact.signed);
    }

    #[test]
    fn collect_only_rpms() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("x86_64")).unwrap();
        fs::write(tmp.path().join("x86_64/a-1-1.x86_64.rpm"), b"a").unwrap();
        fs::write(tmp.path().join("b-1-1.noarch.rpm"), b"b").unwrap();
        fs::write(tmp.path().join("build.log"), b"log").unwrap();

        let artifacts = collect_artifacts(tmp.path(), "x86_64").unwrap();
        let names: Vec<_> = artifacts.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["b-1-1.noarch.rpm", "a-1-1.x86_64.rpm"]);
        assert!(artifacts.iter().all(|a| a.repo_subdir() == "x86_64"));
    }

    #[test]
    fn json_is_written_atomically() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/run-manifest.json");
        write_json_atomic(&path, &serde_json::json!({ "status": "running" })).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("running"));
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn run_ids_are_unique_and_sortable() {
        let a = generate_run_id().unwrap();
        let b = generate_run_id().unwrap();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
