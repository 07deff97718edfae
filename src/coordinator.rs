//! Multi-architecture build coordination.
//!
//! For each requested architecture the coordinator resolves the effective
//! configuration, decides between a native and an emulated boot, and runs
//! one VM build. Architectures are independent: a failure is recorded in
//! that architecture's [`BuildResult`] and the others carry on, unless the
//! [`FailurePolicy`] says otherwise.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::annex;
use crate::arch::{self, ArchProfile};
use crate::config::BuildConfig;
use crate::error::{ForgeError, ForgeResult};
use crate::preflight::HostCapabilities;
use crate::runs::{RunManifest, STAGED_OUTPUT_DIR};
use crate::vm::{Accel, BuildOutcome, BuildRequest, CloudInitVars, GuestRepo, ImageSpec, VmManager};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Build every architecture regardless of failures.
    #[default]
    Continue,
    /// After the first failure, skip architectures that have not started.
    FailFast,
}

/// How one architecture is booted on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchPlan {
    pub profile: &'static ArchProfile,
    pub emulated: bool,
    pub accel: Accel,
    pub cpu: String,
    pub firmware: Option<PathBuf>,
}

impl ArchPlan {
    /// Binfmt handler the boot relies on, for emulated architectures.
    pub fn emulator(&self) -> Option<&'static str> {
        self.emulated.then_some(self.profile.binfmt_name)
    }
}

#[derive(Debug)]
pub struct BuildResult {
    pub arch: String,
    pub emulated: bool,
    /// Absent when the architecture was skipped.
    pub run_dir: Option<PathBuf>,
    pub outcome: ForgeResult<BuildOutcome>,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Effective configuration of `arch`: `base` with its override merged on top.
pub fn effective_config(base: &BuildConfig, arch: &str) -> Result<BuildConfig> {
    base.effective_for(arch)
}

/// Decide native vs emulated boot and the CPU/firmware pairing.
pub fn plan_arch(
    config: &BuildConfig,
    arch: &str,
    host: &dyn HostCapabilities,
) -> Result<ArchPlan> {
    let profile = arch::profile(arch)
        .ok_or_else(|| anyhow::anyhow!("unsupported architecture '{arch}'"))?;
    let emulated = profile.name != host.host_arch();
    let accel = if !emulated && host.kvm_available() {
        Accel::Kvm
    } else {
        Accel::Tcg
    };
    let cpu = match (&config.vm_cpu, accel, emulated) {
        (Some(cpu), _, _) => cpu.clone(),
        (None, Accel::Kvm, _) => "host".to_string(),
        (None, Accel::Tcg, false) => "max".to_string(),
        (None, Accel::Tcg, true) => profile.emulated_cpu.to_string(),
    };
    let firmware = match &config.vm_firmware {
        Some(path) => Some(path.clone()),
        None if profile.requires_firmware => host.firmware(profile),
        None => None,
    };
    Ok(ArchPlan {
        profile,
        emulated,
        accel,
        cpu,
        firmware,
    })
}

/// Guest-visible repositories of `config` for `arch`.
pub fn guest_repos(config: &BuildConfig, arch: &str) -> Vec<GuestRepo> {
    config
        .repos
        .iter()
        .map(|(name, repo)| GuestRepo {
            name: name.clone(),
            baseurl: repo.url_for(arch),
            priority: repo.priority,
            modules_hotfixes: repo.modules_hotfixes,
            excludepkgs: repo.excludepkgs.clone(),
            proxy: repo.proxy.clone(),
            share: repo.local_path(arch).filter(|path| path.is_dir()),
        })
        .collect()
}

pub fn build_request(
    config: &BuildConfig,
    arch: &str,
    plan: &ArchPlan,
    script: &str,
    run_dir: PathBuf,
) -> BuildRequest {
    BuildRequest {
        image: ImageSpec {
            arch: arch.to_string(),
            image: config.vm_image.clone(),
            copy: config.vm_image_copy,
            emulated: plan.emulated,
            accel: plan.accel,
            cpu: plan.cpu.clone(),
            cpus: config.vm_cpus,
            memory_mb: config.vm_memory_mb,
            firmware: plan.firmware.clone(),
            qemu: config.qemu.clone(),
        },
        cloud_init: CloudInitVars {
            hostname: format!("rpm-forge-{arch}"),
            ssh_authorized_key: String::new(),
            additional_rpms: config.vm_additional_rpms.clone(),
            repos: guest_repos(config, arch),
            rpm_macros: config.effective_rpm_macros(),
            proxy: config.proxy.clone(),
            no_proxy: config.no_proxy.clone(),
        },
        script: script.to_string(),
        staging_dir: run_dir.join(STAGED_OUTPUT_DIR),
        work_root: run_dir,
        port_range: config.vm_port_range,
        boot_timeout: Duration::from_secs(config.vm_boot_timeout_secs),
        build_timeout: Duration::from_secs(config.build_timeout_secs),
        keep_disk: config.vm_keep_disk,
    }
}

/// Request for a session of `arch` that is not a build: `vm` and `test`
/// boot with it and run their own commands.
pub fn session_request(
    config: &BuildConfig,
    arch: &str,
    host: &dyn HostCapabilities,
    work_root: PathBuf,
) -> Result<BuildRequest> {
    let effective = effective_config(config, arch)?;
    let plan = plan_arch(&effective, arch, host)?;
    Ok(build_request(&effective, arch, &plan, "", work_root))
}

pub struct Coordinator {
    manager: VmManager,
    script: String,
    policy: FailurePolicy,
    run_id: String,
}

impl Coordinator {
    pub fn new(manager: VmManager, script: impl Into<String>) -> Result<Self> {
        Ok(Self {
            manager,
            script: script.into(),
            policy: FailurePolicy::default(),
            run_id: annex::generate_run_id()?,
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Build every architecture of `arch_list`, at most
    /// `config.concurrency` at a time.
    pub fn build_all(
        &self,
        config: &BuildConfig,
        arch_list: &[String],
    ) -> BTreeMap<String, BuildResult> {
        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let workers = config.concurrency.clamp(1, arch_list.len().max(1));

        tracing::info!(
            run_id = %self.run_id,
            archs = ?arch_list,
            workers,
            "starting builds"
        );

        let mut results = BTreeMap::new();
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                handles.push(scope.spawn(|| self.worker(config, arch_list, &next, &failed)));
            }
            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for result in done {
                            results.insert(result.arch.clone(), result);
                        }
                    }
                    Err(_) => tracing::error!("build worker panicked"),
                }
            }
        });

        results
    }

    /// Pull architectures off the shared cursor until none are left.
    fn worker(
        &self,
        config: &BuildConfig,
        arch_list: &[String],
        next: &AtomicUsize,
        failed: &AtomicBool,
    ) -> Vec<BuildResult> {
        let mut done = Vec::new();
        while let Some(arch) = arch_list.get(next.fetch_add(1, Ordering::SeqCst)) {
            let result = if self.policy == FailurePolicy::FailFast && failed.load(Ordering::SeqCst)
            {
                tracing::warn!(arch = %arch, "skipped after earlier failure");
                BuildResult {
                    arch: arch.clone(),
                    emulated: false,
                    run_dir: None,
                    outcome: Err(ForgeError::Cancelled),
                }
            } else {
                self.build_one(config, arch)
            };
            if !result.is_success() {
                failed.store(true, Ordering::SeqCst);
            }
            done.push(result);
        }
        done
    }

    fn build_one(&self, config: &BuildConfig, arch: &str) -> BuildResult {
        let run_dir = config.staging_dir(arch).join(&self.run_id);
        let prepared = effective_config(config, arch).and_then(|effective| {
            let plan = plan_arch(&effective, arch, self.manager.host())?;
            Ok((effective, plan))
        });
        let (effective, plan) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                return BuildResult {
                    arch: arch.to_string(),
                    emulated: false,
                    run_dir: None,
                    outcome: Err(e.into()),
                }
            }
        };

        let mut manifest = RunManifest::running(&self.run_id, arch, plan.emulated, &effective.vm_image);
        if let Err(e) = manifest.write(&run_dir) {
            return BuildResult {
                arch: arch.to_string(),
                emulated: plan.emulated,
                run_dir: Some(run_dir),
                outcome: Err(e.into()),
            };
        }

        tracing::info!(
            arch = %arch,
            emulated = plan.emulated,
            emulator = plan.emulator().unwrap_or("-"),
            cpu = %plan.cpu,
            "building"
        );
        let request = build_request(&effective, arch, &plan, &self.script, run_dir.clone());
        let outcome = self.manager.run_build(&request);

        match &outcome {
            Ok(built) => {
                tracing::info!(arch = %arch, artifacts = built.artifacts.len(), "build succeeded");
                manifest.succeed(&built.artifacts);
            }
            Err(e) => {
                tracing::error!(arch = %arch, kind = e.kind(), "build failed: {e:#}");
                manifest.fail(e);
            }
        }
        if let Err(e) = manifest.write(&run_dir) {
            tracing::warn!(arch = %arch, "failed to update run manifest: {e:#}");
        }

        BuildResult {
            arch: arch.to_string(),
            emulated: plan.emulated,
            run_dir: Some(run_dir),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct FakeHost {
        arch: &'static str,
        kvm: bool,
    }

    impl HostCapabilities for FakeHost {
        fn host_arch(&self) -> String {
            self.arch.to_string()
        }
        fn emulation(&self, _arch: &str) -> Result<(), String> {
            Ok(())
        }
        fn kvm_available(&self) -> bool {
            self.kvm
        }
        fn firmware(&self, profile: &ArchProfile) -> Option<PathBuf> {
            profile.firmware_candidates.first().map(PathBuf::from)
        }
    }

    const CONFIG: &str = r#"
annex = "/srv/annex"
vm_image = "/img/rocky9.qcow2"
arch = ["x86_64", "aarch64"]

[repos.os]
url = "https://mirror.example.org/9/BaseOS/$arch/os/"

[arch_overrides.aarch64]
vm_image = "/img/rocky9-aarch64.qcow2"
"#;

    fn config() -> BuildConfig {
        BuildConfig::from_toml_str(CONFIG, Path::new("/")).unwrap()
    }

    #[test]
    fn native_arch_uses_kvm_when_present() {
        let host = FakeHost { arch: "x86_64", kvm: true };
        let plan = plan_arch(&config(), "x86_64", &host).unwrap();
        assert!(!plan.emulated);
        assert_eq!(plan.accel, Accel::Kvm);
        assert_eq!(plan.cpu, "host");
        assert_eq!(plan.firmware, None);
        assert_eq!(plan.emulator(), None);
    }

    #[test]
    fn foreign_arch_is_emulated_with_firmware() {
        let host = FakeHost { arch: "x86_64", kvm: true };
        let effective = effective_config(&config(), "aarch64").unwrap();
        let plan = plan_arch(&effective, "aarch64", &host).unwrap();
        assert!(plan.emulated);
        assert_eq!(plan.accel, Accel::Tcg);
        assert_eq!(plan.cpu, "cortex-a72");
        assert!(plan.firmware.is_some());
        assert_eq!(plan.emulator(), Some("qemu-aarch64"));
    }

    #[test]
    fn configured_cpu_wins() {
        let host = FakeHost { arch: "x86_64", kvm: false };
        let mut config = config();
        config.vm_cpu = Some("Skylake-Server".to_string());
        let plan = plan_arch(&config, "x86_64", &host).unwrap();
        assert_eq!(plan.accel, Accel::Tcg);
        assert_eq!(plan.cpu, "Skylake-Server");
    }

    #[test]
    fn request_uses_effective_image_and_resolved_repos() {
        let host = FakeHost { arch: "x86_64", kvm: false };
        let effective = effective_config(&config(), "aarch64").unwrap();
        let plan = plan_arch(&effective, "aarch64", &host).unwrap();
        let request = build_request(&effective, "aarch64", &plan, "make\n", PathBuf::from("/run"));

        assert_eq!(request.image.image, PathBuf::from("/img/rocky9-aarch64.qcow2"));
        assert!(!request.image.copy);
        assert_eq!(request.staging_dir, PathBuf::from("/run/rpms"));
        assert_eq!(
            request.cloud_init.repos[0].baseurl,
            "https://mirror.example.org/9/BaseOS/aarch64/os/"
        );
        assert_eq!(request.cloud_init.rpm_macros["_topdir"], "/root/rpmbuild");
        assert_eq!(request.boot_timeout, Duration::from_secs(300));
    }
}
