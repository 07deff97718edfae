//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a build needs, and whether a
//! foreign architecture can be emulated. This prevents cryptic errors in
//! the middle of a VM boot.
//!
//! # Example
//!
//! ```rust
//! use rpm_forge::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("qemu-img") {
//!     println!("qemu-img not installed");
//! }
//!
//! let tools = &[("ssh", "openssh-clients"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::arch::{self, ArchProfile};

/// Where the kernel exposes registered binary-format handlers.
pub const BINFMT_MISC_DIR: &str = "/proc/sys/fs/binfmt_misc";

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools needed to boot and drive build VMs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("qemu-img", "qemu-img"),
    ("ssh", "openssh-clients"),
    ("scp", "openssh-clients"),
    ("ssh-keygen", "openssh"),
    ("xorriso", "xorriso"),
];

/// Host tools needed to sign and index repositories.
pub const PUBLISH_TOOLS: &[(&str, &str)] = &[("rpmsign", "rpm-sign")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check everything booting build VMs for `archs` needs.
pub fn check_host_tools(archs: &[String]) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = REQUIRED_TOOLS.to_vec();
    for name in archs {
        match arch::profile(name) {
            Some(profile) => tools.push((profile.qemu_system, "qemu-system")),
            None => bail!("unsupported architecture '{name}'"),
        }
    }
    check_required_tools(&tools)
}

/// Check the repository indexer, and `rpmsign` when packages get signed.
pub fn check_publish_tools(createrepo: &str, signing: bool) -> Result<()> {
    let mut tools = vec![(createrepo, "createrepo_c")];
    if signing {
        tools.extend_from_slice(PUBLISH_TOOLS);
    }
    check_required_tools(&tools)
}

/// A parsed `/proc/sys/fs/binfmt_misc/<name>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinfmtEntry {
    pub enabled: bool,
    pub interpreter: Option<PathBuf>,
}

pub fn parse_binfmt_entry(content: &str) -> BinfmtEntry {
    let mut lines = content.lines();
    let enabled = lines.next().map(str::trim) == Some("enabled");
    let interpreter = content
        .lines()
        .find_map(|line| line.strip_prefix("interpreter "))
        .map(|path| PathBuf::from(path.trim()));
    BinfmtEntry {
        enabled,
        interpreter,
    }
}

/// Why `profile` cannot be emulated from `binfmt_dir`, if it cannot.
fn emulation_problem(profile: &ArchProfile, binfmt_dir: &Path) -> Option<String> {
    if !command_exists(profile.qemu_system) {
        return Some(format!("'{}' not found in PATH", profile.qemu_system));
    }

    let entry_path = binfmt_dir.join(profile.binfmt_name);
    let content = match fs::read_to_string(&entry_path) {
        Ok(content) => content,
        Err(_) => {
            return Some(format!(
                "no binfmt handler registered at {}",
                entry_path.display()
            ))
        }
    };

    let entry = parse_binfmt_entry(&content);
    if !entry.enabled {
        return Some(format!("binfmt handler {} is disabled", entry_path.display()));
    }
    match entry.interpreter {
        Some(interpreter) if interpreter.exists() => None,
        Some(interpreter) => Some(format!(
            "binfmt interpreter {} does not exist",
            interpreter.display()
        )),
        None => Some(format!(
            "binfmt handler {} has no interpreter",
            entry_path.display()
        )),
    }
}

/// Whether `arch` can be built on this host: natively, or through a
/// registered user-mode emulator and the matching system emulator.
pub fn verify_emulation_available(arch: &str) -> bool {
    emulation_status(arch).is_ok()
}

/// Like [`verify_emulation_available`], with the reason on failure.
pub fn emulation_status(arch: &str) -> Result<(), String> {
    let Some(profile) = arch::profile(arch) else {
        return Err(format!("unsupported architecture '{arch}'"));
    };
    if profile.name == arch::host_arch() {
        return Ok(());
    }
    match emulation_problem(profile, Path::new(BINFMT_MISC_DIR)) {
        None => Ok(()),
        Some(reason) => Err(reason),
    }
}

/// Host facts the build coordinator depends on.
pub trait HostCapabilities: Send + Sync {
    fn host_arch(&self) -> String;

    /// `Err(reason)` when `arch` cannot be emulated.
    fn emulation(&self, arch: &str) -> Result<(), String>;

    fn kvm_available(&self) -> bool;

    fn firmware(&self, profile: &ArchProfile) -> Option<PathBuf>;
}

/// [`HostCapabilities`] of the machine we run on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostCapabilities for SystemHost {
    fn host_arch(&self) -> String {
        arch::host_arch().to_string()
    }

    fn emulation(&self, arch: &str) -> Result<(), String> {
        emulation_status(arch)
    }

    fn kvm_available(&self) -> bool {
        Path::new("/dev/kvm").exists()
    }

    fn firmware(&self, profile: &ArchProfile) -> Option<PathBuf> {
        arch::find_firmware(profile)
    }
}
