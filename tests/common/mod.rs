//! Test doubles for external tools, host capabilities and downloads.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use rpm_forge::arch::ArchProfile;
use rpm_forge::preflight::HostCapabilities;
use rpm_forge::process::{
    CancelToken, Cmd, CommandResult, ProcessHandle, StreamOutcome, ToolRunner,
};
use rpm_forge::sync::Fetcher;
use rpm_forge::vm::ssh::STATUS_MARKER;

pub const KNOWN_ARCHS: &[&str] = &["x86_64", "aarch64", "ppc64le"];

/// Shared counters of hypervisor lifecycles.
#[derive(Debug, Default)]
pub struct VmCounters {
    pub spawned: AtomicUsize,
    pub terminated: AtomicUsize,
}

struct FakeProcess {
    id: u32,
    exit_code: Option<i32>,
    counters: Arc<VmCounters>,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self.exit_code)
    }

    fn terminate(&mut self, _grace: Duration) -> Result<()> {
        if self.exit_code.is_none() {
            self.exit_code = Some(-1);
            self.counters.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stderr_tail(&mut self) -> String {
        match self.exit_code {
            Some(_) => "qemu-system: could not load firmware".to_string(),
            None => String::new(),
        }
    }
}

/// Answers every tool the pipeline drives as if the guest built
/// `hello-1.0-1.<arch>.rpm` and its source package.
#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<String>>,
    pub vms: Arc<VmCounters>,
    /// Exit code of the remote build script.
    pub build_exit: i32,
    /// The SSH channel drops while the build runs.
    pub lose_connection: bool,
    /// Exit code of `cloud-init status --wait`.
    pub provision_exit: i32,
    /// The guest never answers SSH.
    pub unreachable: bool,
    /// Copying the guest output directory runs past its timeout.
    pub stall_collect: bool,
    /// The hypervisor exits right after spawning with this code.
    pub hypervisor_exit: Option<i32>,
    /// Working disks named on hypervisor command lines, and whether they
    /// existed at boot.
    pub disks: Mutex<Vec<(PathBuf, bool)>>,
    /// Stdout of `dnf repoquery`.
    pub repoquery: String,
    /// Files the fake dnf drops in its cache `repodata/`.
    pub repodata: BTreeMap<String, String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.split(' ').next() == Some(program))
            .cloned()
            .collect()
    }

    /// Index of the first recorded call containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c.contains(needle))
    }

    fn record(&self, cmd: &Cmd) {
        self.calls.lock().unwrap().push(cmd.command_line());
    }

    fn respond(&self, cmd: &Cmd) -> Result<CommandResult> {
        let args = cmd.arguments();
        let last = args.last().map(PathBuf::from).unwrap_or_default();
        match cmd.program() {
            "qemu-img" if args.first().map(String::as_str) == Some("info") => {
                Ok(CommandResult::ok(r#"{"format": "qcow2", "virtual-size": 10737418240}"#))
            }
            "ssh" if self.unreachable => Ok(CommandResult::failed(
                255,
                "ssh: connect to host 127.0.0.1: Connection refused",
            )),
            "qemu-img" | "xorriso" | "ssh" | "createrepo_c" | "rpmsign" => {
                if cmd.program() == "createrepo_c" {
                    fs::create_dir_all(last.join("repodata"))?;
                    fs::write(last.join("repodata/repomd.xml"), "<repomd/>")?;
                }
                Ok(CommandResult::ok(""))
            }
            "ssh-keygen" => {
                fs::write(&last, "PRIVATE KEY\n")?;
                fs::write(last.with_extension("pub"), "ssh-ed25519 AAAAfake forge\n")?;
                Ok(CommandResult::ok(""))
            }
            "scp" if args.iter().any(|a| a == "-r") => {
                let arch = arch_of(&last);
                fs::create_dir_all(&last)?;
                fs::write(last.join(format!("hello-1.0-1.{arch}.rpm")), arch)?;
                fs::write(last.join("hello-1.0-1.src.rpm"), "source")?;
                Ok(CommandResult::ok(""))
            }
            "scp" => Ok(CommandResult::ok("")),
            // Host-side test scripts; names containing "-fail" fail.
            "bash" if cmd.command_line().contains("-fail") => {
                Ok(CommandResult::failed(1, "assertion failed"))
            }
            "bash" => Ok(CommandResult::ok("ok")),
            "dnf" => {
                let cache = args
                    .iter()
                    .find_map(|a| a.strip_prefix("--setopt=cachedir="))
                    .map(PathBuf::from);
                let repo = args
                    .iter()
                    .find_map(|a| a.strip_prefix("--repo="))
                    .unwrap_or("repo");
                if let Some(cache) = cache {
                    let repodata = cache.join(format!("{repo}-0123456789abcdef/repodata"));
                    fs::create_dir_all(&repodata)?;
                    for (name, content) in &self.repodata {
                        fs::write(repodata.join(name), content)?;
                    }
                }
                Ok(CommandResult::ok(self.repoquery.clone()))
            }
            other => bail!("unexpected tool '{other}'"),
        }
    }

    /// A guest command: cloud-init wait, build script or test.
    fn guest_command(&self, command: &str, on_line: &mut dyn FnMut(&str)) -> CommandResult {
        if command.contains("cloud-init status --wait") {
            return match self.provision_exit {
                0 => CommandResult::ok("status: done"),
                code => CommandResult {
                    code,
                    stdout: "status: error".to_string(),
                    stderr: "dnf: No match for argument: extra".to_string(),
                },
            };
        }

        on_line("+ rpmbuild -ba hello.spec");
        if self.lose_connection {
            return CommandResult::failed(255, "Connection to 127.0.0.1 closed by remote host.");
        }
        // Guest test scripts with "-fail" in their name fail.
        let code = if command.contains("-fail") { 1 } else { self.build_exit };
        let mut result = if code == 0 {
            CommandResult::ok("Wrote: hello-1.0-1.rpm")
        } else {
            CommandResult {
                code,
                stdout: String::new(),
                stderr: "error: Bad exit status from /var/tmp/rpm-tmp (%build)".to_string(),
            }
        };
        if command.contains(STATUS_MARKER) {
            let marker = format!("{STATUS_MARKER}{code}");
            on_line(&marker);
            if !result.stdout.is_empty() {
                result.stdout.push('\n');
            }
            result.stdout.push_str(&marker);
        }
        result
    }
}

fn arch_of(path: &Path) -> &'static str {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(|c| KNOWN_ARCHS.iter().copied().find(|a| *a == c))
        .unwrap_or("noarch")
}

impl ToolRunner for FakeRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
        self.record(cmd);
        self.respond(cmd)
    }

    fn run_streaming(
        &self,
        cmd: &Cmd,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<StreamOutcome> {
        self.record(cmd);
        if cancel.is_cancelled() {
            return Ok(StreamOutcome::Cancelled);
        }
        if self.stall_collect
            && cmd.program() == "scp"
            && cmd.arguments().iter().any(|a| a.starts_with("root@127.0.0.1:"))
        {
            return Ok(StreamOutcome::TimedOut);
        }
        if cmd.program() != "ssh" {
            return Ok(StreamOutcome::Exited(self.respond(cmd)?));
        }
        let command = cmd.arguments().last().cloned().unwrap_or_default();
        Ok(StreamOutcome::Exited(self.guest_command(&command, on_line)))
    }

    fn spawn(&self, cmd: &Cmd) -> Result<Box<dyn ProcessHandle>> {
        self.record(cmd);
        for arg in cmd.arguments() {
            if let Some(spec) = arg.strip_prefix("file=") {
                let path = PathBuf::from(spec.split(',').next().unwrap_or_default());
                if path.file_stem().is_some_and(|stem| stem == "disk") {
                    let exists = path.is_file();
                    self.disks.lock().unwrap().push((path, exists));
                }
            }
        }
        let id = self.vms.spawned.fetch_add(1, Ordering::SeqCst) as u32 + 1000;
        Ok(Box::new(FakeProcess {
            id,
            exit_code: self.hypervisor_exit,
            counters: Arc::clone(&self.vms),
        }))
    }
}

/// Host of a fixed architecture, with or without user-mode emulation.
pub struct FakeHost {
    pub arch: &'static str,
    pub emulation: bool,
}

impl HostCapabilities for FakeHost {
    fn host_arch(&self) -> String {
        self.arch.to_string()
    }

    fn emulation(&self, arch: &str) -> Result<(), String> {
        if arch == self.arch || self.emulation {
            Ok(())
        } else {
            Err(format!("binfmt handler for {arch} is not registered"))
        }
    }

    fn kvm_available(&self) -> bool {
        false
    }

    fn firmware(&self, profile: &ArchProfile) -> Option<PathBuf> {
        profile.firmware_candidates.first().map(PathBuf::from)
    }
}

/// Serves URLs from an in-memory map and counts downloads.
#[derive(Default)]
pub struct MapFetcher {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub fetched: Mutex<Vec<String>>,
}

impl MapFetcher {
    pub fn insert(&self, url: &str, body: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), body.as_bytes().to_vec());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn reset_count(&self) {
        self.fetched.lock().unwrap().clear();
    }
}

impl Fetcher for MapFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        self.fetched.lock().unwrap().push(url.to_string());
        match self.files.lock().unwrap().get(url) {
            Some(body) => {
                fs::write(dest, body)?;
                Ok(body.len() as u64)
            }
            None => bail!("HTTP 404 Not Found"),
        }
    }
}
