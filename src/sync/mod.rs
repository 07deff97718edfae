//! Upstream repository mirroring.
//!
//! Three strategies share one contract: after a completed run the mirror
//! directory `<output_root>/<repo>[/<subdir>]` holds exactly the filtered
//! upstream file set, and `<output_root>/.manifests/<repo>.json` records
//! it so the next run only transfers what changed.
//!
//! - [`SyncMethod::Dnf`]: enumerate packages from the repository metadata
//! - [`SyncMethod::Lftp`]: mirror the directory tree with `lftp`
//! - [`SyncMethod::Epel`]: walk the `fullfiletimelist-epel` index
//!
//! Individual transfer failures are retried, then reported in
//! [`SyncReport::failed`] without stopping the run.

pub mod dnf;
pub mod epel;
pub mod fetch;
pub mod filter;
pub mod lftp;
pub mod manifest;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;
use walkdir::WalkDir;

use crate::config::{BuildConfig, RepoDef, SyncDef, SyncMethod};
use crate::error::{ForgeError, ForgeResult};
use crate::process::{CancelToken, ToolRunner};

pub use fetch::{Fetcher, HttpFetcher, RetryPolicy};
pub use filter::PathFilter;
pub use manifest::{FileRecord, SyncManifest};

/// Outcome of one repository synchronization.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub repo: String,
    pub method: SyncMethod,
    pub output: PathBuf,
    /// Relative paths transferred during this run.
    pub downloaded: Vec<String>,
    /// Files already up to date.
    pub unchanged: usize,
    pub removed: Vec<PathBuf>,
    /// One [`ForgeError::TransferFailed`] per file given up on.
    pub failed: Vec<ForgeError>,
    pub cancelled: bool,
    pub log_file: PathBuf,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Append-only action log of one run (`mkdir`, `download`, `rm`, `rmdir`).
pub struct ActionLog {
    path: PathBuf,
    file: Option<File>,
}

impl ActionLog {
    pub fn new(output_root: &Path, repo: &str) -> Self {
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!("[year]-[month]-[day]_[hour]:[minute]"))
            .unwrap_or_default();
        Self {
            path: output_root.join(format!("sync_{repo}_{stamp}.log")),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, entry: &str) {
        if self.file.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "cannot open sync log: {e}");
                    return;
                }
            }
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{entry}") {
                tracing::warn!(path = %self.path.display(), "cannot write sync log: {e}");
            }
        }
    }
}

/// Source URL split the way the strategies need it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    /// Full source URL, subdir included, with a trailing slash.
    pub url: String,
    /// `scheme://host[:port]`
    pub base: String,
    /// Path component, subdir included, with a trailing slash.
    pub path: String,
}

impl SourceUrl {
    pub fn parse(source: &str, subdir: Option<&str>) -> Result<Self> {
        let mut joined = source.trim_end_matches('/').to_string();
        if let Some(subdir) = subdir.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
            joined.push('/');
            joined.push_str(subdir);
        }
        joined.push('/');

        let url = Url::parse(&joined).with_context(|| format!("invalid source URL '{joined}'"))?;
        let base = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}://{host}:{port}", url.scheme()),
            (Some(host), None) => format!("{}://{host}", url.scheme()),
            (None, _) => format!("{}://", url.scheme()),
        };
        Ok(Self {
            path: url.path().to_string(),
            url: url.to_string(),
            base,
        })
    }

    /// Path of `url` relative to the source, if it lies under it.
    pub fn relative<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.url.as_str())
            .or_else(|| url.strip_prefix(self.url.trim_end_matches('/')))
            .map(|rel| rel.trim_start_matches('/'))
    }
}

/// One file advertised by an upstream index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub relpath: String,
    pub url: String,
    pub size: Option<u64>,
    /// Upstream modification time, when the index provides one.
    pub timestamp: Option<i64>,
}

/// State of one run, handed to the strategy.
pub struct SyncRun<'a> {
    pub sync: &'a Synchronizer,
    pub repo: &'a str,
    pub def: &'a SyncDef,
    pub source: SourceUrl,
    pub output_root: PathBuf,
    /// Mirror directory of this repository.
    pub output: PathBuf,
    pub filter: PathFilter,
    pub log: ActionLog,
    pub previous: SyncManifest,
    pub manifest: SyncManifest,
    pub report: SyncReport,
}

impl SyncRun<'_> {
    pub fn cancelled(&self) -> bool {
        self.sync.cancel.is_cancelled()
    }

    fn create_parent(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                self.log.write(&format!("mkdir {}", parent.display()));
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        Ok(())
    }

    /// Bring every filtered file of `files` up to date.
    ///
    /// `skip_when_present` keeps any existing local file (dnf: package
    /// files are immutable by name). Otherwise a file is refreshed unless
    /// the manifest says it is current or its mtime is newer than the
    /// upstream timestamp.
    pub fn transfer_indexed(
        &mut self,
        files: &[RemoteFile],
        skip_when_present: bool,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut indexed = BTreeSet::new();
        for file in files {
            if self.cancelled() {
                self.report.cancelled = true;
                break;
            }
            if !self.filter.matches(&file.relpath) {
                continue;
            }
            let local = self.output.join(&file.relpath);
            indexed.insert(local.clone());

            if local.exists() {
                let record = FileRecord {
                    size: file
                        .size
                        .or_else(|| fs::metadata(&local).ok().map(|m| m.len()))
                        .unwrap_or(0),
                    timestamp: file.timestamp.unwrap_or(0),
                };
                let newer_locally = match (file.timestamp, manifest::mtime(&local)) {
                    (Some(upstream), Some(local_mtime)) => local_mtime > upstream,
                    _ => false,
                };
                if skip_when_present
                    || self.previous.is_current(&file.relpath, &record, &local)
                    || newer_locally
                {
                    tracing::trace!(path = %file.relpath, "unchanged");
                    self.report.unchanged += 1;
                    self.manifest.files.insert(file.relpath.clone(), record);
                    continue;
                }
                tracing::info!(path = %local.display(), "removing updated file");
                fs::remove_file(&local)
                    .with_context(|| format!("removing {}", local.display()))?;
            }

            self.create_parent(&local)?;
            self.log.write(&format!("download {}", file.url));
            tracing::info!(url = %file.url, "downloading");
            match fetch::fetch_with_retry(
                self.sync.fetcher.as_ref(),
                &file.url,
                &local,
                self.sync.retry,
                &self.sync.cancel,
            ) {
                Ok(size) => {
                    self.manifest.files.insert(
                        file.relpath.clone(),
                        FileRecord {
                            size,
                            timestamp: file.timestamp.unwrap_or(0),
                        },
                    );
                    self.report.downloaded.push(file.relpath.clone());
                }
                Err(ForgeError::Cancelled) => {
                    self.report.cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::error!(url = %file.url, "giving up: {e}");
                    self.report.failed.push(e);
                }
            }
        }
        Ok(indexed)
    }

    /// Remove files not in `indexed` and directories left empty. With
    /// `keep_repodata`, top level `repodata*` entries are left alone.
    pub fn clean_output(&mut self, indexed: &BTreeSet<PathBuf>, keep_repodata: bool) -> Result<()> {
        let output = self.output.clone();
        let walker = WalkDir::new(&output).min_depth(1).contents_first(true);
        for entry in walker.into_iter().filter_entry(|e| {
            !(keep_repodata
                && e.depth() == 1
                && e.file_name().to_string_lossy().starts_with("repodata"))
        }) {
            let entry = entry.with_context(|| format!("walking {}", output.display()))?;
            let path = entry.path();
            if entry.file_type().is_dir() {
                let empty = fs::read_dir(path)
                    .map(|mut it| it.next().is_none())
                    .unwrap_or(false);
                if empty {
                    self.log.write(&format!("rmdir {}", path.display()));
                    tracing::info!(path = %path.display(), "removing empty directory");
                    fs::remove_dir(path).with_context(|| format!("removing {}", path.display()))?;
                }
            } else if !indexed.contains(path) {
                self.log.write(&format!("rm {}", path.display()));
                tracing::info!(path = %path.display(), "removing unindexed file");
                fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
                self.report.removed.push(path.to_path_buf());
            }
        }
        Ok(())
    }

    /// Persist the manifest. A cancelled run keeps the previous entries
    /// and only adds those completed before the cancellation.
    fn finish(mut self, started: Instant) -> Result<SyncReport> {
        if self.report.cancelled {
            let mut merged = self.previous.clone();
            merged.files.extend(self.manifest.files);
            self.manifest = merged;
        }
        self.manifest.save(&self.output_root)?;
        self.report.log_file = self.log.path().to_path_buf();
        self.report.elapsed = started.elapsed();
        Ok(self.report)
    }
}

/// Runs repository synchronizations.
pub struct Synchronizer {
    runner: Arc<dyn ToolRunner>,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancelToken,
    retry: RetryPolicy,
    proxy: Option<String>,
    no_proxy: Option<String>,
}

impl Synchronizer {
    pub fn new(runner: Arc<dyn ToolRunner>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            runner,
            fetcher,
            cancel: CancelToken::new(),
            retry: RetryPolicy::default(),
            proxy: None,
            no_proxy: None,
        }
    }

    /// Synchronizer for `repo` honoring its proxy settings: a repository
    /// proxy replaces the global one, `no_proxy` is global.
    pub fn for_repo(runner: Arc<dyn ToolRunner>, config: &BuildConfig, repo: &RepoDef) -> Result<Self> {
        let proxy = repo.effective_proxy(config.proxy.as_deref());
        let no_proxy = config.no_proxy.as_deref();
        let fetcher = HttpFetcher::new(proxy, no_proxy)?;
        Ok(Self::new(runner, Arc::new(fetcher)).with_proxy(proxy, no_proxy))
    }

    pub fn with_proxy(mut self, proxy: Option<&str>, no_proxy: Option<&str>) -> Self {
        self.proxy = proxy.map(str::to_string);
        self.no_proxy = no_proxy.map(str::to_string);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    pub fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    /// Proxy environment for external sync tools.
    pub fn proxy_env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(proxy) = &self.proxy {
            for var in ["http_proxy", "https_proxy", "ftp_proxy"] {
                env.push((var, proxy.clone()));
            }
        }
        if let Some(no_proxy) = &self.no_proxy {
            env.push(("no_proxy", no_proxy.clone()));
        }
        env
    }

    /// Mirror `repo_name` as described by `def` under `output_root`.
    pub fn sync(&self, repo_name: &str, def: &SyncDef, output_root: &Path) -> ForgeResult<SyncReport> {
        let started = Instant::now();
        if repo_name.is_empty() || repo_name.contains('/') {
            return Err(anyhow!("invalid repository name '{repo_name}'").into());
        }
        let source = SourceUrl::parse(&def.source, def.subdir.as_deref())?;
        let mut output = output_root.join(repo_name);
        if let Some(subdir) = def.subdir.as_deref().map(|s| s.trim_matches('/')) {
            if !subdir.is_empty() {
                output = output.join(subdir);
            }
        }
        fs::create_dir_all(&output).with_context(|| format!("creating {}", output.display()))?;

        let previous = SyncManifest::load_or_new(output_root, repo_name, def.method, &source.url)?;
        let manifest = SyncManifest::new(repo_name, def.method, &source.url);
        tracing::info!(repo = repo_name, method = %def.method, source = %source.url, "synchronizing");

        let mut run = SyncRun {
            sync: self,
            repo: repo_name,
            def,
            filter: PathFilter::new(&def.include, &def.exclude)?,
            log: ActionLog::new(output_root, repo_name),
            output_root: output_root.to_path_buf(),
            report: SyncReport {
                repo: repo_name.to_string(),
                method: def.method,
                output: output.clone(),
                ..Default::default()
            },
            source,
            output,
            previous,
            manifest,
        };

        let strategy: fn(&mut SyncRun<'_>) -> Result<()> = match def.method {
            SyncMethod::Dnf => dnf::run,
            SyncMethod::Lftp => lftp::run,
            SyncMethod::Epel => epel::run,
        };
        strategy(&mut run).map_err(ForgeError::from_anyhow)?;

        let report = run.finish(started)?;
        tracing::info!(
            repo = repo_name,
            downloaded = report.downloaded.len(),
            unchanged = report.unchanged,
            removed = report.removed.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "repository synchronized"
        );
        Ok(report)
    }
}
