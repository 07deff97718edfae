//! Mirroring through the repository metadata, using `dnf repoquery`.
//!
//! A throwaway metadata cache forces dnf to fetch fresh metadata on every
//! run. The `repodata/` directory it downloads is then installed into the
//! mirror as is.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::{RemoteFile, SyncRun};
use crate::process::Cmd;

/// `dnf repoquery` listing every package location of the source.
pub fn repoquery_cmd(repo: &str, source_url: &str, cache_dir: &Path) -> Cmd {
    Cmd::new("dnf")
        .arg("--quiet")
        .arg("--assumeyes")
        .arg(format!("--setopt=cachedir={}", cache_dir.display()))
        .arg("--setopt=reposdir=/dev/null")
        .arg(format!("--repofrompath={repo},{source_url}"))
        .arg(format!("--repo={repo}"))
        .args(["repoquery", "--location", "--available"])
        .error_msg(format!("Unable to download repository metadata from URL {source_url}"))
}

/// Package URLs printed by `repoquery --location`, one per line.
pub fn parse_locations(run: &SyncRun<'_>, stdout: &str) -> Vec<RemoteFile> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|url| match run.source.relative(url) {
            Some(rel) if !rel.is_empty() => Some(RemoteFile {
                relpath: rel.to_string(),
                url: url.to_string(),
                size: None,
                timestamp: None,
            }),
            _ => {
                tracing::debug!(url, "location outside of source, skipping");
                None
            }
        })
        .collect()
}

/// The single `<repo>-*/repodata` directory of the dnf cache.
fn cached_repodata(cache_dir: &Path, repo: &str) -> Result<PathBuf> {
    let prefix = format!("{repo}-");
    let mut found = Vec::new();
    for entry in fs::read_dir(cache_dir)
        .with_context(|| format!("reading dnf cache {}", cache_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let repodata = entry.path().join("repodata");
        if name.starts_with(&prefix) && repodata.is_dir() {
            found.push(repodata);
        }
    }
    if found.len() != 1 {
        bail!("Unexpected number of repodata directories in dnf cache: {found:?}");
    }
    Ok(found.remove(0))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Replace `<output>/repodata` with the freshly downloaded metadata.
fn install_repodata(run: &mut SyncRun<'_>, cached: &Path) -> Result<()> {
    let repodata = run.output.join("repodata");
    let staging = run.output.join(".repodata.new");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    copy_tree(cached, &staging)?;
    if repodata.exists() {
        tracing::info!(path = %repodata.display(), "removing existing repository metadata");
        fs::remove_dir_all(&repodata)
            .with_context(|| format!("removing {}", repodata.display()))?;
    }
    fs::rename(&staging, &repodata)
        .with_context(|| format!("installing {}", repodata.display()))?;
    run.log.write(&format!("download {}repodata/", run.source.url));
    Ok(())
}

pub fn run(run: &mut SyncRun<'_>) -> Result<()> {
    let cache = TempDir::with_prefix("rpm-forge-dnf-").context("creating dnf cache directory")?;

    let mut cmd = repoquery_cmd(run.repo, &run.source.url, cache.path());
    for (key, value) in run.sync.proxy_env() {
        cmd = cmd.env(key, value);
    }
    let listing = cmd.run_with(run.sync.runner())?;
    let files = parse_locations(run, &listing.stdout);
    tracing::info!(repo = run.repo, packages = files.len(), "repository indexed");

    let indexed = run.transfer_indexed(&files, true)?;
    if run.report.cancelled {
        return Ok(());
    }
    run.clean_output(&indexed, true)?;

    let cached = cached_repodata(cache.path(), run.repo)?;
    install_repodata(run, &cached)
}
