//! Working disk materialization.
//!
//! Either a full copy of the base image, or a qcow2 overlay backed by it.
//! The base image is never written to in overlay mode.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, ToolRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDisk {
    pub path: PathBuf,
    /// Format passed to the hypervisor (`qcow2`, `raw`...).
    pub format: String,
}

#[derive(Deserialize)]
struct ImageInfo {
    format: String,
}

/// Format of `image` as reported by `qemu-img info`.
pub fn image_format(runner: &dyn ToolRunner, image: &Path) -> Result<String> {
    let result = Cmd::new("qemu-img")
        .args(["info", "--output=json"])
        .arg_path(image)
        .error_msg(format!("qemu-img info failed for {}", image.display()))
        .run_with(runner)?;
    let info: ImageInfo = serde_json::from_str(&result.stdout)
        .with_context(|| format!("parsing qemu-img info output for {}", image.display()))?;
    Ok(info.format)
}

/// Create the session disk for `base` inside `work_dir`.
pub fn materialize(
    runner: &dyn ToolRunner,
    base: &Path,
    work_dir: &Path,
    copy: bool,
) -> Result<WorkingDisk> {
    if !base.is_file() {
        bail!("VM image not found: {}", base.display());
    }
    let base = base
        .canonicalize()
        .with_context(|| format!("resolving VM image path {}", base.display()))?;
    let format = image_format(runner, &base)?;

    if copy {
        let path = work_dir.join(format!("disk.{format}"));
        tracing::debug!(base = %base.display(), disk = %path.display(), "copying base image");
        fs::copy(&base, &path).with_context(|| {
            format!("copying {} to {}", base.display(), path.display())
        })?;
        return Ok(WorkingDisk { path, format });
    }

    let path = work_dir.join("disk.qcow2");
    tracing::debug!(base = %base.display(), disk = %path.display(), "creating overlay");
    Cmd::new("qemu-img")
        .args(["create", "-f", "qcow2", "-F", &format, "-b"])
        .arg_path(&base)
        .arg_path(&path)
        .error_msg("Failed to create overlay disk")
        .run_with(runner)?;
    Ok(WorkingDisk {
        path,
        format: "qcow2".to_string(),
    })
}
