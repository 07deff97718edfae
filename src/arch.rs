//! Per-architecture VM parameters.
//!
//! Each supported build architecture maps to a QEMU system emulator, a
//! machine type, a CPU model used when the host cannot run it natively, the
//! binfmt handler name of its user-mode emulator and the firmware images
//! distros ship for it.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchProfile {
    pub name: &'static str,
    pub qemu_system: &'static str,
    pub machine: &'static str,
    /// CPU model for emulated boots.
    pub emulated_cpu: &'static str,
    /// Entry name under `/proc/sys/fs/binfmt_misc`.
    pub binfmt_name: &'static str,
    /// The guest only boots through EFI firmware.
    pub requires_firmware: bool,
    pub firmware_candidates: &'static [&'static str],
}

const OVMF_CANDIDATES: &[&str] = &[
    // Fedora/RHEL
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/usr/share/OVMF/OVMF_CODE.fd",
    // Debian/Ubuntu
    "/usr/share/OVMF/OVMF_CODE_4M.fd",
    "/usr/share/qemu/OVMF.fd",
    // Arch
    "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
];

const AAVMF_CANDIDATES: &[&str] = &[
    // Fedora/RHEL
    "/usr/share/edk2/aarch64/QEMU_EFI-pflash.raw",
    "/usr/share/AAVMF/AAVMF_CODE.fd",
    // Debian/Ubuntu
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd",
    // Arch
    "/usr/share/edk2/aarch64/QEMU_CODE.fd",
];

pub const PROFILES: &[ArchProfile] = &[
    ArchProfile {
        name: "x86_64",
        qemu_system: "qemu-system-x86_64",
        machine: "q35",
        emulated_cpu: "max",
        binfmt_name: "qemu-x86_64",
        requires_firmware: false,
        firmware_candidates: OVMF_CANDIDATES,
    },
    ArchProfile {
        name: "aarch64",
        qemu_system: "qemu-system-aarch64",
        machine: "virt",
        emulated_cpu: "cortex-a72",
        binfmt_name: "qemu-aarch64",
        requires_firmware: true,
        firmware_candidates: AAVMF_CANDIDATES,
    },
    ArchProfile {
        name: "ppc64le",
        qemu_system: "qemu-system-ppc64",
        machine: "pseries",
        emulated_cpu: "power9",
        binfmt_name: "qemu-ppc64le",
        requires_firmware: false,
        firmware_candidates: &[],
    },
];

/// Look up the profile of a build architecture.
pub fn profile(arch: &str) -> Option<&'static ArchProfile> {
    let arch = normalize(arch);
    PROFILES.iter().find(|p| p.name == arch)
}

/// RPM architecture name of the running host.
pub fn host_arch() -> &'static str {
    normalize(std::env::consts::ARCH)
}

fn normalize(arch: &str) -> &str {
    match arch {
        "amd64" => "x86_64",
        "arm64" => "aarch64",
        "powerpc64" | "ppc64el" => "ppc64le",
        other => other,
    }
}

/// First existing firmware image for `profile`.
pub fn find_firmware(profile: &ArchProfile) -> Option<PathBuf> {
    profile
        .firmware_candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_profiles() {
        let aarch64 = profile("aarch64").unwrap();
        assert_eq!(aarch64.qemu_system, "qemu-system-aarch64");
        assert_eq!(aarch64.machine, "virt");
        assert!(aarch64.requires_firmware);

        assert_eq!(profile("arm64").unwrap().name, "aarch64");
        assert!(profile("sparc").is_none());
    }

    #[test]
    fn host_arch_is_normalized() {
        let host = host_arch();
        assert!(!host.is_empty());
        assert_ne!(host, "amd64");
        assert_ne!(host, "arm64");
    }
}
