//! Package signing with `rpmsign`.

use anyhow::{Context, Result};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::annex::Artifact;
use crate::config::GpgConfig;
use crate::error::ForgeError;
use crate::process::{Cmd, ToolRunner};

/// Write the passphrase to a file only the current user can read.
pub fn passphrase_file(passphrase: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("rpm-forge-gpg-")
        .tempfile()
        .context("creating passphrase file")?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .context("restricting passphrase file")?;
    file.write_all(passphrase.as_bytes())
        .context("writing passphrase file")?;
    file.flush()?;
    Ok(file)
}

pub fn sign_cmd(gpg: &GpgConfig, passphrase: Option<&Path>, rpm: &Path) -> Cmd {
    let mut cmd = Cmd::new("rpmsign")
        .arg("--addsign")
        .arg("--define")
        .arg(format!("_gpg_name {}", gpg.key))
        .arg("--define")
        .arg(format!("_gpg_path {}", gpg.keyring.display()));
    if let Some(passphrase) = passphrase {
        cmd = cmd.arg("--define").arg(format!(
            "__gpg_sign_cmd %{{__gpg}} gpg --no-verbose --no-armor --batch \
             --pinentry-mode loopback --passphrase-file {} \
             %{{?_gpg_digest_algo:--digest-algo %{{_gpg_digest_algo}}}} \
             --no-secmem-warning -u \"%{{_gpg_name}}\" \
             -sbo %{{__signature_filename}} %{{__plaintext_filename}}",
            passphrase.display()
        ));
    }
    cmd.arg_path(rpm)
        .env("GNUPGHOME", gpg.keyring.to_string_lossy())
        .allow_fail()
}

/// Sign every artifact in place.
///
/// Returns the signed artifacts and one [`ForgeError::SigningFailed`] per
/// artifact that could not be signed.
pub fn sign_all(
    runner: &dyn ToolRunner,
    gpg: &GpgConfig,
    artifacts: Vec<Artifact>,
) -> Result<(Vec<Artifact>, Vec<ForgeError>)> {
    let passphrase = gpg.passphrase.as_deref().map(passphrase_file).transpose()?;
    let passphrase_path = passphrase.as_ref().map(NamedTempFile::path);

    let mut signed = Vec::with_capacity(artifacts.len());
    let mut failed = Vec::new();
    for mut artifact in artifacts {
        let cmd = sign_cmd(gpg, passphrase_path, &artifact.path);
        let outcome = cmd.run_with(runner).and_then(|result| {
            if result.success() {
                artifact.refresh_checksum()
            } else {
                let out = format!("{}\n{}", result.stdout_trimmed(), result.stderr_trimmed());
                anyhow::bail!("rpmsign exited with code {}: {}", result.code, out.trim())
            }
        });
        match outcome {
            Ok(()) => {
                tracing::info!(rpm = %artifact.filename, key = %gpg.key, "signed");
                artifact.signed = true;
                signed.push(artifact);
            }
            Err(e) => {
                tracing::error!(rpm = %artifact.filename, "signing failed: {e:#}");
                failed.push(ForgeError::SigningFailed {
                    path: artifact.path.clone(),
                    message: format!("{e:#}"),
                });
            }
        }
    }
    Ok((signed, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn gpg() -> GpgConfig {
        GpgConfig {
            keyring: PathBuf::from("/etc/rpm-forge/gnupg"),
            key: "Release Key".into(),
            passphrase: Some("secret".into()),
        }
    }

    #[test]
    fn command_defines_key_and_keyring() {
        let cmd = sign_cmd(&gpg(), None, Path::new("/out/a-1.x86_64.rpm"));
        assert_eq!(cmd.program(), "rpmsign");
        let args = cmd.arguments();
        assert_eq!(args[0], "--addsign");
        assert!(args.contains(&"_gpg_name Release Key".to_string()));
        assert!(args.contains(&"_gpg_path /etc/rpm-forge/gnupg".to_string()));
        assert_eq!(args.last().unwrap(), "/out/a-1.x86_64.rpm");
    }

    #[test]
    fn passphrase_goes_through_loopback_file() {
        let cmd = sign_cmd(&gpg(), Some(Path::new("/tmp/pass")), Path::new("/out/a.rpm"));
        let sign = cmd
            .arguments()
            .iter()
            .find(|a| a.starts_with("__gpg_sign_cmd"))
            .unwrap();
        assert!(sign.contains("--pinentry-mode loopback --passphrase-file /tmp/pass"));
        assert!(!sign.contains("secret"));
    }

    #[test]
    fn passphrase_file_is_private() {
        let file = passphrase_file("secret").unwrap();
        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "secret");
    }
}
