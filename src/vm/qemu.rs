//! Hypervisor command construction.
//!
//! `QemuBuilder` assembles the `qemu-system-<arch>` invocation for a build
//! VM: headless, virtio disk and seed, user-mode NIC with the SSH port
//! forwarded to the guest.

use std::path::{Path, PathBuf};

use crate::arch::ArchProfile;
use crate::process::Cmd;

/// Hardware acceleration mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    Kvm,
    /// Software emulation (TCG).
    Tcg,
}

/// Builder for QEMU commands.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    binary: String,
    machine: String,
    accel: Accel,
    cpu: String,
    cpus: u32,
    memory_mb: u32,
    disk: Option<(PathBuf, String)>,
    seed: Option<PathBuf>,
    firmware: Option<PathBuf>,
    ssh_port: Option<u16>,
    hostname: Option<String>,
    shares: Vec<(String, PathBuf)>,
    serial_log: Option<PathBuf>,
}

impl QemuBuilder {
    pub fn new(profile: &ArchProfile) -> Self {
        Self {
            binary: profile.qemu_system.to_string(),
            machine: profile.machine.to_string(),
            accel: Accel::Tcg,
            cpu: profile.emulated_cpu.to_string(),
            cpus: 1,
            memory_mb: 2048,
            disk: None,
            seed: None,
            firmware: None,
            ssh_port: None,
            hostname: None,
            shares: Vec::new(),
            serial_log: None,
        }
    }

    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    pub fn accel(mut self, accel: Accel) -> Self {
        self.accel = accel;
        self
    }

    pub fn cpu(mut self, model: &str) -> Self {
        self.cpu = model.to_string();
        self
    }

    pub fn smp(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn disk(mut self, path: &Path, format: &str) -> Self {
        self.disk = Some((path.to_path_buf(), format.to_string()));
        self
    }

    pub fn seed(mut self, iso: &Path) -> Self {
        self.seed = Some(iso.to_path_buf());
        self
    }

    pub fn firmware(mut self, path: &Path) -> Self {
        self.firmware = Some(path.to_path_buf());
        self
    }

    pub fn ssh_forward(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    /// Export a host directory to the guest over 9p.
    pub fn share(mut self, tag: &str, path: &Path) -> Self {
        self.shares.push((tag.to_string(), path.to_path_buf()));
        self
    }

    pub fn serial_log(mut self, path: &Path) -> Self {
        self.serial_log = Some(path.to_path_buf());
        self
    }

    pub fn build(self) -> Cmd {
        let mut cmd = Cmd::new(&self.binary)
            .args(["-name", "rpm-forge", "-display", "none", "-no-reboot"])
            .args(["-machine", &self.machine]);

        cmd = match self.accel {
            Accel::Kvm => cmd.args(["-accel", "kvm"]),
            Accel::Tcg => cmd.args(["-accel", "tcg"]),
        };
        cmd = cmd
            .args(["-cpu", &self.cpu])
            .args(["-smp", &self.cpus.to_string()])
            .args(["-m", &self.memory_mb.to_string()]);

        // Firmware first so the pflash unit is 0
        if let Some(firmware) = &self.firmware {
            cmd = cmd.args([
                "-drive",
                &format!(
                    "if=pflash,format=raw,readonly=on,file={}",
                    firmware.display()
                ),
            ]);
        }

        if let Some((disk, format)) = &self.disk {
            cmd = cmd.args([
                "-drive",
                &format!(
                    "file={},if=virtio,format={},cache=unsafe",
                    disk.display(),
                    format
                ),
            ]);
        }

        if let Some(seed) = &self.seed {
            cmd = cmd.args([
                "-drive",
                &format!("file={},if=virtio,format=raw,readonly=on", seed.display()),
            ]);
        }

        let mut netdev = "user,id=net0".to_string();
        if let Some(hostname) = &self.hostname {
            netdev.push_str(&format!(",hostname={hostname}"));
        }
        if let Some(port) = self.ssh_port {
            netdev.push_str(&format!(",hostfwd=tcp:127.0.0.1:{port}-:22"));
        }
        cmd = cmd.args(["-netdev", &netdev, "-device", "virtio-net-pci,netdev=net0"]);

        for (tag, path) in &self.shares {
            cmd = cmd.args([
                "-virtfs",
                &format!(
                    "local,id={tag},path={},mount_tag={tag},security_model=none,readonly=on",
                    path.display()
                ),
            ]);
        }

        match &self.serial_log {
            Some(path) => cmd.args(["-serial", &format!("file:{}", path.display())]),
            None => cmd.args(["-serial", "none"]),
        }
    }
}
