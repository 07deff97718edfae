//! Error taxonomy for build, sync and publish operations.
//!
//! Plumbing code returns `anyhow::Result`; the operations callers need to
//! tell apart (port exhaustion, boot timeout, remote build failure...) are
//! surfaced as [`ForgeError`] variants. Anything else is carried in
//! [`ForgeError::Other`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Stage of a VM session whose deadline ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for SSH to answer.
    Boot,
    /// Waiting for cloud-init to finish.
    Provision,
    /// Running the build script or a test.
    Build,
    /// Copying the guest output back.
    Collect,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Boot => "VM did not become reachable",
            Self::Provision => "guest provisioning did not finish",
            Self::Build => "remote build did not finish",
            Self::Collect => "copying build output did not finish",
        })
    }
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("no free SSH port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("emulation unavailable for '{arch}': {reason}")]
    EmulationUnavailable { arch: String, reason: String },

    #[error("{phase} within {secs}s")]
    BootTimeout { phase: TimeoutPhase, secs: u64 },

    #[error("guest provisioning failed with code {code}\n{output}")]
    ProvisioningFailed { code: i32, output: String },

    #[error("remote build exited with code {code}\n{output}")]
    BuildFailed { code: i32, output: String },

    #[error("transfer of '{url}' failed after {attempts} attempt(s): {message}")]
    TransferFailed {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("signing '{}' failed: {message}", path.display())]
    SigningFailed { path: PathBuf, message: String },

    #[error("repository '{}' is locked by another publish", path.display())]
    PublishConflict { path: PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    /// Short stable name used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "ResourceExhausted",
            Self::EmulationUnavailable { .. } => "EmulationUnavailable",
            Self::BootTimeout { .. } => "BootTimeout",
            Self::ProvisioningFailed { .. } => "ProvisioningFailed",
            Self::BuildFailed { .. } => "BuildFailed",
            Self::TransferFailed { .. } => "TransferFailed",
            Self::SigningFailed { .. } => "SigningFailed",
            Self::PublishConflict { .. } => "PublishConflict",
            Self::Cancelled => "Cancelled",
            Self::Other(_) => "Error",
        }
    }

    /// Recover a typed error that travelled through `anyhow`.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<ForgeError>() {
            Ok(forge) => forge,
            Err(other) => Self::Other(other),
        }
    }
}

impl From<std::io::Error> for ForgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.into())
    }
}

pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_failed_message_carries_code_and_output() {
        let err = ForgeError::BuildFailed {
            code: 2,
            output: "error: Bad exit status".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("code 2"));
        assert!(msg.contains("Bad exit status"));
        assert_eq!(err.kind(), "BuildFailed");
    }

    #[test]
    fn timeouts_name_the_phase() {
        let boot = ForgeError::BootTimeout { phase: TimeoutPhase::Boot, secs: 300 };
        assert_eq!(boot.to_string(), "VM did not become reachable within 300s");
        let build = ForgeError::BootTimeout { phase: TimeoutPhase::Build, secs: 60 };
        assert_eq!(build.to_string(), "remote build did not finish within 60s");
        assert_eq!(build.kind(), "BootTimeout");
    }

    #[test]
    fn anyhow_errors_convert_to_other() {
        let err: ForgeError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), "Error");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn typed_errors_survive_anyhow() {
        let wrapped = anyhow::Error::new(ForgeError::Cancelled);
        assert_eq!(ForgeError::from_anyhow(wrapped).kind(), "Cancelled");
    }
}
