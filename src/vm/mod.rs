//! Disposable build VMs.
//!
//! [`VmManager::run_build`] drives one VM through its whole life:
//!
//! 1. lease an SSH port and create the session work directory
//! 2. generate a session key, materialize the working disk, render the seed
//! 3. boot the hypervisor and poll SSH until the guest answers
//! 4. wait for cloud-init to finish provisioning
//! 5. upload and run the build script, streaming its output
//! 6. copy the guest output directory into the staging area
//! 7. tear everything down
//!
//! [`VmManager::start`] stops after step 4 and hands the running
//! [`VmSession`] to the caller for interactive use or package tests.
//!
//! Teardown runs on every path. [`VmSession`] performs it at most once,
//! explicitly or on drop.

pub mod cloudinit;
pub mod disk;
pub mod ports;
pub mod qemu;
pub mod ssh;

use anyhow::{anyhow, Context};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annex::{self, Artifact};
use crate::arch::{self, ArchProfile};
use crate::config::PortRange;
use crate::error::{ForgeError, ForgeResult, TimeoutPhase};
use crate::preflight::HostCapabilities;
use crate::process::{CancelToken, Cmd, CommandResult, ProcessHandle, StreamOutcome, ToolRunner};

pub use cloudinit::{CloudInitVars, GuestRepo, GUEST_OUTPUT_DIR};
pub use ports::{PortLease, PortPool};
pub use qemu::Accel;

use qemu::QemuBuilder;
use ssh::SshTarget;

/// Grace period between SIGTERM and SIGKILL of the hypervisor.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const GUEST_SCRIPT_PATH: &str = "/root/rpm-forge-build.sh";

/// `cloud-init status --wait` exit status for "done, with recoverable
/// errors".
const CLOUD_INIT_DEGRADED: i32 = 2;

/// SSH readiness polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(15),
        }
    }
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current * self.factor).min(self.max)
    }
}

/// What to boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub arch: String,
    pub image: PathBuf,
    /// Full copy instead of an overlay.
    pub copy: bool,
    /// Needs a registered user-mode emulator on this host.
    pub emulated: bool,
    pub accel: Accel,
    pub cpu: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub firmware: Option<PathBuf>,
    /// Hypervisor binary override.
    pub qemu: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub image: ImageSpec,
    /// `ssh_authorized_key` is filled in by the session.
    pub cloud_init: CloudInitVars,
    /// Shell script run as root in the guest.
    pub script: String,
    /// Parent directory of the session work directory.
    pub work_root: PathBuf,
    /// Receives the guest output directory. Must not exist yet.
    pub staging_dir: PathBuf,
    pub port_range: PortRange,
    pub boot_timeout: Duration,
    pub build_timeout: Duration,
    /// Keep the work directory (disk, seed, key) after teardown.
    pub keep_disk: bool,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub artifacts: Vec<Artifact>,
    pub exit_code: i32,
    pub port: u16,
    pub emulated: bool,
    pub elapsed: Duration,
}

/// Runs build VMs. Cheap to share between coordinator threads.
pub struct VmManager {
    runner: Arc<dyn ToolRunner>,
    host: Arc<dyn HostCapabilities>,
    ports: Arc<PortPool>,
    cancel: CancelToken,
    backoff: Backoff,
    terminate_grace: Duration,
}

impl VmManager {
    pub fn new(runner: Arc<dyn ToolRunner>, host: Arc<dyn HostCapabilities>) -> Self {
        Self {
            runner,
            host,
            ports: PortPool::global(),
            cancel: CancelToken::new(),
            backoff: Backoff::default(),
            terminate_grace: TERMINATE_GRACE,
        }
    }

    pub fn with_ports(mut self, ports: Arc<PortPool>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn host(&self) -> &dyn HostCapabilities {
        self.host.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Boot, build, collect, tear down.
    pub fn run_build(&self, request: &BuildRequest) -> ForgeResult<BuildOutcome> {
        let start = Instant::now();
        let mut session = self.start(request)?;
        let port = session.port();

        let result = session
            .execute(&request.script, request.build_timeout)
            .and_then(|()| session.collect(&request.staging_dir, request.build_timeout));
        session.teardown();

        let artifacts = result?;
        Ok(BuildOutcome {
            artifacts,
            exit_code: 0,
            port,
            emulated: request.image.emulated,
            elapsed: start.elapsed(),
        })
    }

    /// Boot a guest and wait until it is reachable and provisioned.
    ///
    /// The returned session is torn down on drop; `request.script` is not
    /// run.
    pub fn start(&self, request: &BuildRequest) -> ForgeResult<VmSession> {
        let arch_name = request.image.arch.as_str();
        let profile = arch::profile(arch_name)
            .ok_or_else(|| anyhow!("unsupported architecture '{arch_name}'"))?;

        if request.image.emulated {
            self.host
                .emulation(arch_name)
                .map_err(|reason| ForgeError::EmulationUnavailable {
                    arch: arch_name.to_string(),
                    reason,
                })?;
        }
        if self.cancel.is_cancelled() {
            return Err(ForgeError::Cancelled);
        }

        let mut session = self.open_session(request)?;
        tracing::info!(
            arch = %arch_name,
            port = session.port(),
            emulated = request.image.emulated,
            "starting VM"
        );
        if let Err(e) = session.boot(&self.backoff, profile, request) {
            session.teardown();
            return Err(e);
        }
        Ok(session)
    }

    /// Lease a port and create the work directory.
    pub fn open_session(&self, request: &BuildRequest) -> ForgeResult<VmSession> {
        let lease = self.ports.allocate(request.port_range)?;
        let id = annex::generate_run_id()?;
        let work_dir = request
            .work_root
            .join(format!("vm-{}-{}", request.image.arch, id));
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating VM work directory {}", work_dir.display()))?;

        Ok(VmSession {
            id,
            arch: request.image.arch.clone(),
            runner: Arc::clone(&self.runner),
            cancel: self.cancel.clone(),
            lease: Some(lease),
            work_dir: Some(work_dir),
            process: None,
            target: None,
            keep_work_dir: request.keep_disk,
            grace: self.terminate_grace,
            torn_down: false,
        })
    }
}

/// One VM, from port lease to teardown.
pub struct VmSession {
    id: String,
    arch: String,
    runner: Arc<dyn ToolRunner>,
    cancel: CancelToken,
    lease: Option<PortLease>,
    work_dir: Option<PathBuf>,
    process: Option<Box<dyn ProcessHandle>>,
    /// Set once the guest answered over SSH.
    target: Option<SshTarget>,
    keep_work_dir: bool,
    grace: Duration,
    torn_down: bool,
}

impl VmSession {
    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn port(&self) -> u16 {
        self.lease.as_ref().map(PortLease::port).unwrap_or(0)
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// SSH endpoint of a booted guest.
    pub fn target(&self) -> ForgeResult<&SshTarget> {
        self.target
            .as_ref()
            .ok_or_else(|| anyhow!("VM session is not running").into())
    }

    fn require_work_dir(&self) -> ForgeResult<PathBuf> {
        self.work_dir
            .clone()
            .ok_or_else(|| anyhow!("VM session already torn down").into())
    }

    fn boot(
        &mut self,
        backoff: &Backoff,
        profile: &ArchProfile,
        request: &BuildRequest,
    ) -> ForgeResult<()> {
        let runner = Arc::clone(&self.runner);
        let work_dir = self.require_work_dir()?;
        let port = self.port();

        let key = work_dir.join("id_ed25519");
        let public_key = ssh::generate_key(runner.as_ref(), &key, &format!("rpm-forge-{}", self.id))?;
        let target = SshTarget::new(port, &key);

        let disk = disk::materialize(
            runner.as_ref(),
            &request.image.image,
            &work_dir,
            request.image.copy,
        )?;

        let mut vars = request.cloud_init.clone();
        vars.ssh_authorized_key = public_key;
        let seed = cloudinit::build_seed(
            runner.as_ref(),
            &vars,
            &format!("rpm-forge-{}", self.id),
            &work_dir,
        )?;

        let firmware = request.image.firmware.as_ref();
        if profile.requires_firmware && firmware.is_none() {
            return Err(anyhow!(
                "no firmware image found for {}; set vm_firmware",
                profile.name
            )
            .into());
        }

        let mut qemu = QemuBuilder::new(profile)
            .accel(request.image.accel)
            .cpu(&request.image.cpu)
            .smp(request.image.cpus)
            .memory_mb(request.image.memory_mb)
            .disk(&disk.path, &disk.format)
            .seed(&seed)
            .ssh_forward(port)
            .hostname(&vars.hostname)
            .serial_log(&work_dir.join("console.log"));
        if let Some(binary) = &request.image.qemu {
            qemu = qemu.binary(binary);
        }
        if let Some(firmware) = firmware {
            qemu = qemu.firmware(firmware);
        }
        for repo in &vars.repos {
            if let Some(share) = &repo.share {
                qemu = qemu.share(&repo.name, share);
            }
        }

        let cmd = qemu.build();
        tracing::debug!(cmd = %cmd.command_line(), "spawning hypervisor");
        self.process = Some(runner.spawn(&cmd)?);

        let deadline = Instant::now() + request.boot_timeout;
        self.wait_ready(backoff, &target, deadline, request.boot_timeout)?;
        tracing::info!(arch = %self.arch, port, "VM reachable over SSH");

        self.wait_provisioned(&target, deadline, request.boot_timeout)?;
        tracing::info!(arch = %self.arch, "guest provisioned");

        self.target = Some(target);
        Ok(())
    }

    fn wait_ready(
        &mut self,
        backoff: &Backoff,
        target: &SshTarget,
        deadline: Instant,
        timeout: Duration,
    ) -> ForgeResult<()> {
        let mut delay = backoff.initial;
        let probe = target.probe();

        loop {
            if self.cancel.is_cancelled() {
                return Err(ForgeError::Cancelled);
            }
            if let Some(process) = self.process.as_mut() {
                if let Some(code) = process.try_exit_code()? {
                    return Err(anyhow!(
                        "hypervisor exited with code {code} before the guest was reachable\n{}",
                        process.stderr_tail()
                    )
                    .into());
                }
            }

            if self.runner.run(&probe)?.success() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ForgeError::BootTimeout {
                    phase: TimeoutPhase::Boot,
                    secs: timeout.as_secs(),
                });
            }
            tracing::debug!(arch = %self.arch, delay_ms = delay.as_millis() as u64, "guest not reachable yet");
            if !self.cancel.sleep(delay.min(deadline - now)) {
                return Err(ForgeError::Cancelled);
            }
            delay = backoff.next(delay);
        }
    }

    /// sshd answers before cloud-init's final stage has installed the
    /// staged RPMs and mounted the shared repositories.
    fn wait_provisioned(
        &self,
        target: &SshTarget,
        deadline: Instant,
        timeout: Duration,
    ) -> ForgeResult<()> {
        let cmd = target
            .provisioned()
            .timeout(deadline.saturating_duration_since(Instant::now()));
        let arch = self.arch.clone();
        let outcome = self.runner.run_streaming(&cmd, &self.cancel, &mut |line| {
            tracing::debug!(target: "rpm_forge::guest", arch = %arch, "{line}");
        })?;

        match outcome {
            StreamOutcome::Exited(result) if result.success() => Ok(()),
            StreamOutcome::Exited(result) if result.code == CLOUD_INIT_DEGRADED => {
                tracing::warn!(
                    arch = %self.arch,
                    "cloud-init finished with recoverable errors: {}",
                    result.stdout_trimmed()
                );
                Ok(())
            }
            StreamOutcome::Exited(result) if result.code == ssh::SSH_TRANSPORT_ERROR => Err(anyhow!(
                "lost SSH connection while waiting for provisioning\n{}",
                result.stderr_trimmed()
            )
            .into()),
            StreamOutcome::Exited(result) => Err(ForgeError::ProvisioningFailed {
                code: result.code,
                output: combined_output(&result),
            }),
            StreamOutcome::TimedOut => Err(ForgeError::BootTimeout {
                phase: TimeoutPhase::Provision,
                secs: timeout.as_secs(),
            }),
            StreamOutcome::Cancelled => Err(ForgeError::Cancelled),
        }
    }

    /// Run `command` in the guest, forwarding its output to `on_line`.
    ///
    /// The result carries the command's own exit status; losing the SSH
    /// connection is an error.
    pub fn run_remote(
        &self,
        command: &str,
        timeout: Option<Duration>,
        on_line: &mut dyn FnMut(&str),
    ) -> ForgeResult<CommandResult> {
        let mut cmd = self.target()?.exec_with_status(command);
        if let Some(timeout) = timeout {
            cmd = cmd.timeout(timeout);
        }

        let mut status = None;
        let outcome = self.runner.run_streaming(&cmd, &self.cancel, &mut |line| {
            match ssh::parse_status(line) {
                Some(code) => status = Some(code),
                None => on_line(line),
            }
        })?;

        match outcome {
            StreamOutcome::Exited(mut result) => {
                let code = match status {
                    Some(code) => code,
                    None if result.code == ssh::SSH_TRANSPORT_ERROR => {
                        return Err(anyhow!(
                            "lost SSH connection to the guest\n{}",
                            result.stderr_trimmed()
                        )
                        .into())
                    }
                    None => result.code,
                };
                result.code = code;
                result.stdout = result
                    .stdout
                    .lines()
                    .filter(|line| ssh::parse_status(line).is_none())
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(result)
            }
            StreamOutcome::TimedOut => Err(ForgeError::BootTimeout {
                phase: TimeoutPhase::Build,
                secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
            StreamOutcome::Cancelled => Err(ForgeError::Cancelled),
        }
    }

    /// Upload and run the build script; a non-zero exit is
    /// [`ForgeError::BuildFailed`].
    pub fn execute(&self, script: &str, timeout: Duration) -> ForgeResult<()> {
        let work_dir = self.require_work_dir()?;
        let local = work_dir.join("build.sh");
        fs::write(&local, script)
            .with_context(|| format!("writing build script {}", local.display()))?;
        self.upload(&local, GUEST_SCRIPT_PATH)?;

        let arch = self.arch.clone();
        let result = self.run_remote(
            &format!("bash -l {GUEST_SCRIPT_PATH}"),
            Some(timeout),
            &mut |line| tracing::info!(target: "rpm_forge::guest", arch = %arch, "{line}"),
        )?;
        if result.success() {
            return Ok(());
        }
        Err(ForgeError::BuildFailed {
            code: result.code,
            output: combined_output(&result),
        })
    }

    /// Copy the guest output directory into `staging_dir`, which must not
    /// exist yet.
    pub fn collect(&self, staging_dir: &Path, timeout: Duration) -> ForgeResult<Vec<Artifact>> {
        if staging_dir.exists() {
            return Err(anyhow!(
                "staging directory {} already exists",
                staging_dir.display()
            )
            .into());
        }
        if let Some(parent) = staging_dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let cmd = self.target()?.download_dir(GUEST_OUTPUT_DIR, staging_dir);
        self.transfer(cmd, Some(timeout), "Failed to copy build output from the guest")?;

        let artifacts = annex::collect_artifacts(staging_dir, &self.arch)?;
        tracing::info!(arch = %self.arch, count = artifacts.len(), "collected artifacts");
        Ok(artifacts)
    }

    /// Copy a local file or directory into the guest.
    pub fn upload(&self, local: &Path, remote: &str) -> ForgeResult<()> {
        let target = self.target()?;
        let cmd = if local.is_dir() {
            target.upload_dir(local, remote)
        } else {
            target.upload(local, remote)
        };
        self.transfer(cmd, None, &format!("Failed to upload {}", local.display()))
    }

    /// Copy a guest file or directory to `local`.
    pub fn download(&self, remote: &str, local: &Path) -> ForgeResult<()> {
        let cmd = self.target()?.download_dir(remote, local);
        self.transfer(cmd, None, &format!("Failed to download {remote}"))
    }

    /// Interactive root shell in the guest; returns its exit status.
    pub fn connect(&self) -> ForgeResult<i32> {
        let cmd = self.target()?.shell();
        Ok(self.runner.run_interactive(&cmd)?)
    }

    fn transfer(&self, cmd: Cmd, timeout: Option<Duration>, what: &str) -> ForgeResult<()> {
        let cmd = match timeout {
            Some(timeout) => cmd.timeout(timeout),
            None => cmd,
        };
        tracing::debug!(cmd = %cmd.command_line(), "copying");
        match self.runner.run_streaming(&cmd, &self.cancel, &mut |_| {})? {
            StreamOutcome::Exited(result) if result.success() => Ok(()),
            StreamOutcome::Exited(result) => Err(anyhow!(
                "{what} (exit code {}):\n{}",
                result.code,
                result.stderr_trimmed()
            )
            .into()),
            StreamOutcome::TimedOut => Err(ForgeError::BootTimeout {
                phase: TimeoutPhase::Collect,
                secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
            StreamOutcome::Cancelled => Err(ForgeError::Cancelled),
        }
    }

    /// Stop the hypervisor, release the port, remove the work directory.
    /// Only the first call does anything.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.target = None;

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.terminate(self.grace) {
                tracing::warn!(arch = %self.arch, "failed to stop hypervisor: {e:#}");
            }
        }
        drop(self.lease.take());
        if let Some(dir) = self.work_dir.take() {
            if self.keep_work_dir {
                tracing::info!(arch = %self.arch, dir = %dir.display(), "keeping VM work directory");
            } else if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(dir = %dir.display(), "failed to remove VM work directory: {e}");
            }
        }
        tracing::debug!(arch = %self.arch, id = %self.id, "VM session torn down");
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Stdout then stderr, for error reports.
fn combined_output(result: &CommandResult) -> String {
    let mut output = result.stdout.clone();
    if !result.stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&result.stderr);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::SystemHost;
    use crate::process::SystemRunner;
    use tempfile::TempDir;

    fn always_free(_: u16) -> bool {
        true
    }

    fn request(work_root: &Path) -> BuildRequest {
        BuildRequest {
            image: ImageSpec {
                arch: "x86_64".to_string(),
                image: work_root.join("base.qcow2"),
                copy: false,
                emulated: false,
                accel: Accel::Tcg,
                cpu: "max".to_string(),
                cpus: 1,
                memory_mb: 512,
                firmware: None,
                qemu: None,
            },
            cloud_init: CloudInitVars::default(),
            script: "true\n".to_string(),
            work_root: work_root.to_path_buf(),
            staging_dir: work_root.join("rpms"),
            port_range: PortRange::new(41000, 41000),
            boot_timeout: Duration::from_secs(1),
            build_timeout: Duration::from_secs(1),
            keep_disk: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        let mut delay = backoff.initial;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_secs());
            delay = backoff.next(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 15, 15]);
    }

    #[test]
    fn teardown_twice_is_noop() {
        let tmp = TempDir::new().unwrap();
        let pool = Arc::new(PortPool::with_probe(always_free));
        let manager = VmManager::new(Arc::new(SystemRunner), Arc::new(SystemHost))
            .with_ports(Arc::clone(&pool));

        let mut session = manager.open_session(&request(tmp.path())).unwrap();
        let work_dir = session.work_dir().unwrap().to_path_buf();
        assert!(work_dir.is_dir());
        assert_eq!(pool.leased_count(), 1);

        session.teardown();
        assert!(session.is_torn_down());
        assert!(!work_dir.exists());
        assert_eq!(pool.leased_count(), 0);

        // A second session may now hold the same port; the first teardown
        // must not release it again.
        let other = manager.open_session(&request(tmp.path())).unwrap();
        session.teardown();
        drop(session);
        assert_eq!(pool.leased_count(), 1);
        drop(other);
        assert_eq!(pool.leased_count(), 0);
    }

    #[test]
    fn keep_disk_retains_work_dir() {
        let tmp = TempDir::new().unwrap();
        let manager = VmManager::new(Arc::new(SystemRunner), Arc::new(SystemHost))
            .with_ports(Arc::new(PortPool::with_probe(always_free)));
        let mut req = request(tmp.path());
        req.keep_disk = true;

        let mut session = manager.open_session(&req).unwrap();
        let work_dir = session.work_dir().unwrap().to_path_buf();
        session.teardown();
        assert!(work_dir.is_dir());
    }

    #[test]
    fn exhausted_range_fails_before_work_dir() {
        let tmp = TempDir::new().unwrap();
        let pool = Arc::new(PortPool::with_probe(always_free));
        let manager = VmManager::new(Arc::new(SystemRunner), Arc::new(SystemHost))
            .with_ports(Arc::clone(&pool));

        let _held = pool.allocate(PortRange::new(41000, 41000)).unwrap();
        let err = manager.run_build(&request(tmp.path())).err().unwrap();
        assert!(matches!(err, ForgeError::ResourceExhausted { .. }));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
