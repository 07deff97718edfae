//! Project configuration.
//!
//! A project is described by `project.toml`, optionally completed by a
//! `local.toml` holding host-specific values (keyring paths, proxies).
//! Both are layered with [`merge::deep_merge`]. Per-architecture overrides
//! live under `[arch_overrides.<arch>]` and are applied by
//! [`BuildConfig::effective_for`].

pub mod merge;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const PROJECT_FILE: &str = "project.toml";
pub const LOCAL_FILE: &str = "local.toml";

pub const DEFAULT_CREATEREPO: &str = "createrepo_c";
pub const DEFAULT_ARCH: &str = "x86_64";

/// Macros always defined in the guest; `rpm_macros` entries take precedence.
pub const DEFAULT_RPM_MACROS: &[(&str, &str)] = &[
    ("_topdir", "/root/rpmbuild"),
    ("_build_id_links", "none"),
];

/// Closed interval of host ports usable for SSH forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u16, u16)", into = "(u16, u16)")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl From<(u16, u16)> for PortRange {
    fn from((start, end): (u16, u16)) -> Self {
        Self { start, end }
    }
}

impl From<PortRange> for (u16, u16) {
    fn from(range: PortRange) -> Self {
        (range.start, range.end)
    }
}

/// Package signing settings. Absent means artifacts are published unsigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpgConfig {
    /// GnuPG home directory holding the key.
    pub keyring: PathBuf,
    /// Key identifier passed as `%_gpg_name`.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Dnf,
    #[default]
    Lftp,
    Epel,
}

impl std::fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Dnf => "dnf",
            Self::Lftp => "lftp",
            Self::Epel => "epel",
        };
        f.write_str(name)
    }
}

/// Where and how a repository is mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncDef {
    pub source: String,
    #[serde(default)]
    pub method: SyncMethod,
    /// Sub-path appended to both the source URL and the local output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoDef {
    /// Repository URL, `$arch` is substituted per build architecture.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default)]
    pub modules_hotfixes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludepkgs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncDef>,
}

impl RepoDef {
    pub fn url_for(&self, arch: &str) -> String {
        self.url.replace("$arch", arch)
    }

    /// A per-repository proxy fully replaces the global one.
    pub fn effective_proxy<'a>(&'a self, global: Option<&'a str>) -> Option<&'a str> {
        self.proxy.as_deref().or(global)
    }

    /// Local directory of a `file://` or absolute URL, exported to the
    /// guest over 9p.
    pub fn local_path(&self, arch: &str) -> Option<PathBuf> {
        let url = self.url_for(arch);
        if let Some(path) = url.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if url.starts_with('/') {
            return Some(PathBuf::from(url));
        }
        None
    }
}

fn default_port_range() -> PortRange {
    PortRange::new(10022, 10122)
}

fn default_vm_cpus() -> u32 {
    4
}

fn default_vm_memory_mb() -> u32 {
    8192
}

fn default_boot_timeout() -> u64 {
    300
}

fn default_build_timeout() -> u64 {
    7200
}

fn default_arch() -> Vec<String> {
    vec![DEFAULT_ARCH.to_string()]
}

fn default_createrepo() -> String {
    DEFAULT_CREATEREPO.to_string()
}

fn default_concurrency() -> usize {
    1
}

/// Process-wide build configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Artifact storage root.
    pub annex: PathBuf,
    pub vm_image: PathBuf,
    /// Copy the base image instead of creating a qcow2 overlay.
    #[serde(default)]
    pub vm_image_copy: bool,
    #[serde(default = "default_port_range")]
    pub vm_port_range: PortRange,
    #[serde(default = "default_vm_cpus")]
    pub vm_cpus: u32,
    #[serde(default = "default_vm_memory_mb")]
    pub vm_memory_mb: u32,
    /// CPU model; defaults per architecture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_firmware: Option<PathBuf>,
    #[serde(default)]
    pub vm_additional_rpms: Vec<PathBuf>,
    #[serde(default = "default_boot_timeout")]
    pub vm_boot_timeout_secs: u64,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    /// Keep the working disk after teardown (debugging).
    #[serde(default)]
    pub vm_keep_disk: bool,
    /// Hypervisor binary override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu: Option<String>,
    #[serde(default = "default_arch")]
    pub arch: Vec<String>,
    #[serde(default)]
    pub rpm_macros: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpg: Option<GpgConfig>,
    #[serde(default = "default_createrepo")]
    pub createrepo: String,
    #[serde(default)]
    pub repos: BTreeMap<String, RepoDef>,
    /// Mirror root for synchronized repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_output: Option<PathBuf>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub fail_fast: bool,
    /// Partial configurations applied when building for one architecture.
    #[serde(default)]
    pub arch_overrides: BTreeMap<String, toml::Table>,
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

impl BuildConfig {
    /// Load `project.toml` (required) and `local.toml` (optional) from
    /// `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project = project_dir.join(PROJECT_FILE);
        let mut value = read_toml(&project)?;

        let local = project_dir.join(LOCAL_FILE);
        if local.is_file() {
            value = merge::deep_merge(value, read_toml(&local)?);
        }

        let mut config: BuildConfig = value
            .try_into()
            .with_context(|| format!("invalid configuration '{}'", project.display()))?;
        config.project_dir = Some(project_dir.to_path_buf());
        config.resolve_paths(project_dir);
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string, resolving relative paths
    /// against `project_dir`.
    pub fn from_toml_str(raw: &str, project_dir: &Path) -> Result<Self> {
        let mut config: BuildConfig = toml::from_str(raw).context("invalid configuration")?;
        config.project_dir = Some(project_dir.to_path_buf());
        config.resolve_paths(project_dir);
        config.validate()?;
        Ok(config)
    }

    /// Effective configuration for `arch`: the base record with that
    /// architecture's override merged on top. Override keys win,
    /// unspecified keys inherit.
    pub fn effective_for(&self, arch: &str) -> Result<Self> {
        let Some(overlay) = self.arch_overrides.get(arch) else {
            return Ok(self.clone());
        };

        let mut base = toml::Value::try_from(self)
            .context("serializing base configuration for override merge")?;
        if let Some(table) = base.as_table_mut() {
            table.remove("arch_overrides");
        }
        let mut overlay = overlay.clone();
        overlay.remove("arch_overrides");
        overlay.remove("arch");

        let merged = merge::deep_merge(base, toml::Value::Table(overlay));
        let mut effective: BuildConfig = merged
            .try_into()
            .with_context(|| format!("invalid override for architecture '{arch}'"))?;
        effective.project_dir = self.project_dir.clone();
        if let Some(dir) = self.project_dir.clone() {
            effective.resolve_paths(&dir);
        }
        Ok(effective)
    }

    /// `DEFAULT_RPM_MACROS` overridden by `rpm_macros`.
    pub fn effective_rpm_macros(&self) -> BTreeMap<String, String> {
        let mut macros: BTreeMap<String, String> = DEFAULT_RPM_MACROS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        macros.extend(self.rpm_macros.clone());
        macros
    }

    pub fn sync_output(&self) -> PathBuf {
        self.sync_output
            .clone()
            .unwrap_or_else(|| self.annex.join("mirror"))
    }

    pub fn staging_dir(&self, arch: &str) -> PathBuf {
        self.annex.join("staging").join(arch)
    }

    pub fn repository_dir(&self, name: &str) -> PathBuf {
        self.annex.join("repos").join(name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.annex.as_os_str().is_empty() {
            bail!("'annex' must not be empty");
        }
        if self.vm_image.as_os_str().is_empty() {
            bail!("'vm_image' must not be empty");
        }
        if self.arch.is_empty() {
            bail!("'arch' must list at least one architecture");
        }
        let mut seen = BTreeSet::new();
        for arch in &self.arch {
            if !seen.insert(arch.as_str()) {
                bail!("duplicate architecture '{arch}' in 'arch'");
            }
        }
        for arch in self.arch_overrides.keys() {
            if !seen.contains(arch.as_str()) {
                bail!("override for architecture '{arch}' which is not listed in 'arch'");
            }
        }
        if self.vm_port_range.is_empty() || self.vm_port_range.start == 0 {
            bail!(
                "invalid vm_port_range [{}, {}]",
                self.vm_port_range.start,
                self.vm_port_range.end
            );
        }
        if self.concurrency == 0 {
            bail!("'concurrency' must be >= 1");
        }
        for (name, repo) in &self.repos {
            if let Some(sync) = &repo.sync {
                for pattern in sync.include.iter().chain(&sync.exclude) {
                    Regex::new(pattern).with_context(|| {
                        format!("invalid sync pattern '{pattern}' in repository '{name}'")
                    })?;
                }
            }
        }
        for arch in &self.arch {
            let effective = self.effective_for(arch)?;
            if effective.vm_image.as_os_str().is_empty() {
                bail!("no VM image configured for architecture '{arch}'");
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, root: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() && !path.as_os_str().is_empty() {
                *path = root.join(&*path);
            }
        };
        resolve(&mut self.annex);
        resolve(&mut self.vm_image);
        if let Some(firmware) = self.vm_firmware.as_mut() {
            resolve(firmware);
        }
        for rpm in &mut self.vm_additional_rpms {
            resolve(rpm);
        }
        if let Some(gpg) = self.gpg.as_mut() {
            resolve(&mut gpg.keyring);
        }
        if let Some(output) = self.sync_output.as_mut() {
            resolve(output);
        }
    }
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading configuration '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing configuration '{}'", path.display()))
}
