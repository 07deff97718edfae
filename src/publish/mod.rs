//! Signing and publishing of build artifacts into served repositories.
//!
//! A published repository is laid out as:
//!
//! ```text
//! <repo>/
//!   current -> .generations/<id>     served path, swapped atomically
//!   .generations/<id>/SRPMS/         source packages + repodata
//!   .generations/<id>/<arch>/        binary packages + repodata
//!   .publish.lock
//! ```
//!
//! Every publish builds a complete new generation next to the served one
//! and only then renames a fresh symlink over `current`. Readers resolve
//! `current` once and see either the old or the new package set.

pub mod lock;
pub mod sign;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

use crate::annex::{self, Artifact};
use crate::config::{BuildConfig, GpgConfig, DEFAULT_CREATEREPO};
use crate::error::{ForgeError, ForgeResult};
use crate::process::{Cmd, ToolRunner};

pub use lock::RepoLock;

pub const GENERATIONS_DIR: &str = ".generations";
pub const CURRENT_LINK: &str = "current";
pub const SRPMS_DIR: &str = "SRPMS";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// Superseded generations kept for readers still inside them.
pub const DEFAULT_KEEP_GENERATIONS: usize = 1;

#[derive(Debug, Default)]
pub struct PublishResult {
    pub repo_dir: PathBuf,
    /// Generation now served, `None` when nothing was published.
    pub generation: Option<PathBuf>,
    pub published: Vec<Artifact>,
    /// Artifacts left out, one [`ForgeError::SigningFailed`] each.
    pub failed: Vec<ForgeError>,
    pub pruned: Vec<PathBuf>,
}

impl PublishResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Directory currently served for `repo_dir`, if any.
pub fn served_generation(repo_dir: &Path) -> Result<Option<PathBuf>> {
    let link = repo_dir.join(CURRENT_LINK);
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = fs::read_link(&link)
                .with_context(|| format!("reading link {}", link.display()))?;
            Ok(Some(repo_dir.join(target)))
        }
        Ok(_) => bail!("{} exists and is not a symlink", link.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("inspecting {}", link.display())),
    }
}

fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if dest.exists() {
        fs::remove_file(dest)
            .with_context(|| format!("Failed to remove existing {}", dest.display()))?;
    }
    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

/// Populate `dest` with the content of `src`.
fn clone_generation(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let target = dest.join(entry.path().strip_prefix(src)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
        } else if entry.file_type().is_file() {
            hardlink_or_copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Point `<repo_dir>/current` at `generation` with a single rename.
fn swap_current(repo_dir: &Path, generation: &Path) -> Result<()> {
    let target = generation
        .strip_prefix(repo_dir)
        .unwrap_or(generation)
        .to_path_buf();
    let tmp = repo_dir.join(format!(".{CURRENT_LINK}.tmp-{}", std::process::id()));
    let _ = fs::remove_file(&tmp);
    std::os::unix::fs::symlink(&target, &tmp)
        .with_context(|| format!("creating link {}", tmp.display()))?;
    fs::rename(&tmp, repo_dir.join(CURRENT_LINK))
        .with_context(|| format!("swapping {}", repo_dir.join(CURRENT_LINK).display()))?;
    Ok(())
}

/// Publishes artifacts into repositories under the annex.
pub struct Publisher {
    runner: Arc<dyn ToolRunner>,
    createrepo: String,
    lock_timeout: Duration,
    keep_generations: usize,
}

impl Publisher {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            createrepo: DEFAULT_CREATEREPO.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            keep_generations: DEFAULT_KEEP_GENERATIONS,
        }
    }

    pub fn from_config(runner: Arc<dyn ToolRunner>, config: &BuildConfig) -> Self {
        Self::new(runner).with_createrepo(&config.createrepo)
    }

    pub fn with_createrepo(mut self, createrepo: &str) -> Self {
        self.createrepo = createrepo.to_string();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_keep_generations(mut self, keep: usize) -> Self {
        self.keep_generations = keep;
        self
    }

    /// Sign (when `gpg` is set) and publish `artifacts` into `repo_dir`.
    ///
    /// Artifacts that fail to sign are reported and left out; the others
    /// are still published.
    pub fn publish(
        &self,
        artifacts: Vec<Artifact>,
        repo_dir: &Path,
        gpg: Option<&GpgConfig>,
    ) -> ForgeResult<PublishResult> {
        let mut result = PublishResult {
            repo_dir: repo_dir.to_path_buf(),
            ..Default::default()
        };

        let artifacts = match gpg {
            Some(gpg) => {
                let (signed, failed) = sign::sign_all(self.runner.as_ref(), gpg, artifacts)?;
                result.failed = failed;
                signed
            }
            None => {
                tracing::debug!("no signing key configured, publishing unsigned");
                artifacts
            }
        };
        if artifacts.is_empty() {
            tracing::warn!(repo = %repo_dir.display(), "nothing to publish");
            return Ok(result);
        }

        let _lock = RepoLock::acquire(repo_dir, self.lock_timeout)?;
        let generations = repo_dir.join(GENERATIONS_DIR);
        let previous = served_generation(repo_dir)?;
        let generation = generations.join(format!(
            "{}-{}",
            annex::now_utc_compact(),
            annex::generate_run_id()?
        ));

        if let Err(e) = self.assemble(previous.as_deref(), &generation, &artifacts) {
            let _ = fs::remove_dir_all(&generation);
            return Err(e.into());
        }
        swap_current(repo_dir, &generation)?;
        tracing::info!(
            repo = %repo_dir.display(),
            generation = %generation.display(),
            packages = artifacts.len(),
            "repository published"
        );

        result.pruned = self.prune(&generations, &generation)?;
        result.generation = Some(generation);
        result.published = artifacts;
        Ok(result)
    }

    fn assemble(&self, previous: Option<&Path>, generation: &Path, artifacts: &[Artifact]) -> Result<()> {
        fs::create_dir_all(generation)
            .with_context(|| format!("creating {}", generation.display()))?;
        if let Some(previous) = previous {
            clone_generation(previous, generation)?;
        }

        let mut subdirs = vec![SRPMS_DIR.to_string()];
        for artifact in artifacts {
            let subdir = artifact.repo_subdir().to_string();
            hardlink_or_copy(&artifact.path, &generation.join(&subdir).join(&artifact.filename))?;
            if !subdirs.contains(&subdir) {
                subdirs.push(subdir);
            }
        }
        for entry in fs::read_dir(generation)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !subdirs.contains(&name) {
                subdirs.push(name);
            }
        }

        for subdir in &subdirs {
            let dir = generation.join(subdir);
            fs::create_dir_all(&dir)?;
            Cmd::new(&self.createrepo)
                .args(["-q", "--update"])
                .arg_path(&dir)
                .error_msg(format!("{} failed on {}", self.createrepo, dir.display()))
                .run_with(self.runner.as_ref())?;
        }
        Ok(())
    }

    /// Remove superseded generations beyond the retention count.
    fn prune(&self, generations: &Path, current: &Path) -> Result<Vec<PathBuf>> {
        let mut older = Vec::new();
        for entry in fs::read_dir(generations)? {
            let path = entry?.path();
            if path != current && path.is_dir() {
                older.push(path);
            }
        }
        older.sort();
        let excess = older.len().saturating_sub(self.keep_generations);
        let mut pruned = Vec::new();
        for path in older.into_iter().take(excess) {
            tracing::debug!(path = %path.display(), "pruning generation");
            fs::remove_dir_all(&path).with_context(|| format!("removing {}", path.display()))?;
            pruned.push(path);
        }
        Ok(pruned)
    }
}
