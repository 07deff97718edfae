//! SSH and SCP command construction for a session's guest.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::process::{Cmd, ToolRunner};

const GUEST_HOST: &str = "root@127.0.0.1";

/// Options shared by ssh and scp: the guest is ephemeral, never record or
/// check its host key, never prompt.
const COMMON_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=10",
];

/// Exit status ssh uses for its own (connection) errors.
pub const SSH_TRANSPORT_ERROR: i32 = 255;

/// Line the guest prints with the remote command's own exit status, so a
/// command exiting 255 is not mistaken for a lost connection.
pub const STATUS_MARKER: &str = "__rpm_forge_rc=";

/// Blocks until cloud-init has run every stage, including `runcmd`.
const CLOUD_INIT_WAIT: &str = "cloud-init status --wait";

/// Generate an ed25519 key pair at `path` / `path.pub`; returns the
/// public key line.
pub fn generate_key(runner: &dyn ToolRunner, path: &Path, comment: &str) -> Result<String> {
    Cmd::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg_path(path)
        .error_msg("Failed to generate session SSH key")
        .run_with(runner)?;
    let public = path.with_extension("pub");
    std::fs::read_to_string(&public)
        .with_context(|| format!("reading public key {}", public.display()))
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub port: u16,
    pub key: PathBuf,
}

impl SshTarget {
    pub fn new(port: u16, key: &Path) -> Self {
        Self {
            port,
            key: key.to_path_buf(),
        }
    }

    fn base(&self, program: &str, port_flag: &str) -> Cmd {
        Cmd::new(program)
            .args(COMMON_OPTIONS)
            .arg("-i")
            .arg_path(&self.key)
            .args([port_flag, &self.port.to_string()])
    }

    /// `ssh ... <command>` without a tty.
    pub fn exec(&self, command: &str) -> Cmd {
        self.base("ssh", "-p").args(["-T", GUEST_HOST, command])
    }

    /// Like [`SshTarget::exec`], reporting the command's exit status on a
    /// [`STATUS_MARKER`] line.
    pub fn exec_with_status(&self, command: &str) -> Cmd {
        self.exec(&format!(
            "{command}; rc=$?; echo {STATUS_MARKER}$rc; exit $rc"
        ))
    }

    /// `ssh` invocation a shell script can prefix a guest command with.
    pub fn ssh_command_line(&self) -> String {
        self.base("ssh", "-p").args(["-T", GUEST_HOST]).command_line()
    }

    /// Login shell on a tty.
    pub fn shell(&self) -> Cmd {
        self.base("ssh", "-p").args(["-t", GUEST_HOST])
    }

    /// Cheap readiness probe.
    pub fn probe(&self) -> Cmd {
        self.exec("true").allow_fail()
    }

    /// Waits for the seed's provisioning to complete.
    pub fn provisioned(&self) -> Cmd {
        self.exec(CLOUD_INIT_WAIT).allow_fail()
    }

    pub fn upload(&self, local: &Path, remote: &str) -> Cmd {
        self.base("scp", "-P")
            .arg_path(local)
            .arg(format!("{GUEST_HOST}:{remote}"))
    }

    /// Recursive copy of local directory `local` to guest path `remote`.
    pub fn upload_dir(&self, local: &Path, remote: &str) -> Cmd {
        self.base("scp", "-P")
            .arg("-r")
            .arg_path(local)
            .arg(format!("{GUEST_HOST}:{remote}"))
    }

    /// Recursive copy of guest directory `remote` to `local`.
    pub fn download_dir(&self, remote: &str, local: &Path) -> Cmd {
        self.base("scp", "-P")
            .arg("-r")
            .arg(format!("{GUEST_HOST}:{remote}"))
            .arg_path(local)
    }
}

/// Exit status carried by a [`STATUS_MARKER`] line.
pub fn parse_status(line: &str) -> Option<i32> {
    line.trim().strip_prefix(STATUS_MARKER)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_targets_forwarded_port() {
        let target = SshTarget::new(10023, Path::new("/w/id_ed25519"));
        let cmd = target.exec("bash -l /root/build.sh");
        assert_eq!(cmd.program(), "ssh");
        let args = cmd.arguments();
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "10023");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(args.last().unwrap(), "bash -l /root/build.sh");
    }

    #[test]
    fn scp_uses_uppercase_port_flag() {
        let target = SshTarget::new(10023, Path::new("/w/id_ed25519"));
        let cmd = target.download_dir("/root/rpmbuild/out", Path::new("/annex/staging/rpms"));
        assert_eq!(cmd.program(), "scp");
        let args = cmd.arguments();
        assert!(args.contains(&"-P".to_string()));
        assert!(args.contains(&"-r".to_string()));
        assert!(args.contains(&"root@127.0.0.1:/root/rpmbuild/out".to_string()));
        assert_eq!(args.last().unwrap(), "/annex/staging/rpms");
    }

    #[test]
    fn status_marker_wraps_command() {
        let target = SshTarget::new(10023, Path::new("/w/id_ed25519"));
        let cmd = target.exec_with_status("bash -l /root/build.sh");
        assert_eq!(
            cmd.arguments().last().unwrap(),
            "bash -l /root/build.sh; rc=$?; echo __rpm_forge_rc=$rc; exit $rc"
        );
        assert_eq!(parse_status("__rpm_forge_rc=255"), Some(255));
        assert_eq!(parse_status("__rpm_forge_rc=0\n"), Some(0));
        assert_eq!(parse_status("rc=3"), None);
    }
}
