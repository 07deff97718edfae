//! File downloads.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use crate::error::{ForgeError, ForgeResult};
use crate::process::CancelToken;

/// Downloads one URL to a local path.
pub trait Fetcher: Send + Sync {
    /// Write the body of `url` to `dest`, returning the number of bytes.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// [`Fetcher`] over HTTP(S), with `file://` URLs copied locally.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(proxy: Option<&str>, no_proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(concat!("rpm-forge/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(3600));
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .with_context(|| format!("invalid proxy URL '{proxy}'"))?
                .no_proxy(no_proxy.and_then(reqwest::NoProxy::from_string));
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(path) = url.strip_prefix("file://") {
            return fs::copy(path, dest)
                .with_context(|| format!("copying {path} to {}", dest.display()));
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting {url}"))?;
        if !response.status().is_success() {
            bail!("HTTP {}", response.status());
        }
        let mut file =
            File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
        let size = response
            .copy_to(&mut file)
            .with_context(|| format!("reading body of {url}"))?;
        Ok(size)
    }
}

/// Retry schedule for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Download `url` to `dest` through a `.part` file, retrying on failure.
///
/// `dest` only ever appears complete.
pub fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    dest: &Path,
    retry: RetryPolicy,
    cancel: &CancelToken,
) -> ForgeResult<u64> {
    let part = dest.with_file_name(format!(
        "{}.part",
        dest.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    let attempts = retry.attempts.max(1);
    let mut delay = retry.delay;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }
        match fetcher.fetch(url, &part) {
            Ok(size) => {
                fs::rename(&part, dest).with_context(|| {
                    format!("renaming {} to {}", part.display(), dest.display())
                })?;
                return Ok(size);
            }
            Err(e) => {
                let _ = fs::remove_file(&part);
                last_error = format!("{e:#}");
                tracing::warn!(url, attempt, attempts, "download failed: {last_error}");
                if attempt < attempts {
                    if !cancel.sleep(delay) {
                        return Err(ForgeError::Cancelled);
                    }
                    delay *= 2;
                }
            }
        }
    }

    Err(ForgeError::TransferFailed {
        url: url.to_string(),
        attempts,
        message: last_error,
    })
}
