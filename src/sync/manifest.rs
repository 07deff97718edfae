//! Record of the last synchronized file set of a repository.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::annex;
use crate::config::SyncMethod;

pub const MANIFESTS_DIR: &str = ".manifests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    /// Upstream timestamp (index based methods) or local mtime.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    pub repo: String,
    pub method: SyncMethod,
    pub source: String,
    #[serde(default)]
    pub synced_at_utc: Option<String>,
    /// Keyed by path relative to the repository output directory.
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

impl SyncManifest {
    pub fn new(repo: &str, method: SyncMethod, source: &str) -> Self {
        Self {
            repo: repo.to_string(),
            method,
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn path(output_root: &Path, repo: &str) -> PathBuf {
        output_root.join(MANIFESTS_DIR).join(format!("{repo}.json"))
    }

    /// The stored manifest, or an empty one on first sync.
    pub fn load_or_new(output_root: &Path, repo: &str, method: SyncMethod, source: &str) -> Result<Self> {
        let path = Self::path(output_root, repo);
        if !path.is_file() {
            return Ok(Self::new(repo, method, source));
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading sync manifest '{}'", path.display()))?;
        let mut manifest: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing sync manifest '{}'", path.display()))?;
        // A changed source or method invalidates the recorded state.
        if manifest.source != source || manifest.method != method {
            manifest = Self::new(repo, method, source);
        }
        Ok(manifest)
    }

    pub fn save(&mut self, output_root: &Path) -> Result<()> {
        self.synced_at_utc = Some(annex::now_utc_compact());
        annex::write_json_atomic(&Self::path(output_root, &self.repo), self)
    }

    /// True when `local` exists and still looks like what was recorded.
    pub fn is_current(&self, relpath: &str, record: &FileRecord, local: &Path) -> bool {
        match (self.files.get(relpath), fs::metadata(local)) {
            (Some(stored), Ok(meta)) => stored == record && meta.len() == stored.size,
            _ => false,
        }
    }
}

/// Seconds since the epoch of the file's mtime.
pub fn mtime(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

/// Size and mtime of every file under `dir`, keyed by relative path.
pub fn scan_tree(dir: &Path) -> Result<BTreeMap<String, FileRecord>> {
    let mut files = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("walking '{}'", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let meta = entry.metadata().with_context(|| format!("stat '{}'", entry.path().display()))?;
        files.insert(
            rel.to_string_lossy().into_owned(),
            FileRecord {
                size: meta.len(),
                timestamp: mtime(entry.path()).unwrap_or(0),
            },
        );
    }
    Ok(files)
}
