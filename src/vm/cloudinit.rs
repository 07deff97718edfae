//! Cloud-init NoCloud seed rendering.
//!
//! The seed is an ISO9660 volume labelled `cidata` carrying `user-data`,
//! `meta-data` and the staged RPMs under `rpms/`. `user-data` is emitted as
//! JSON under the `#cloud-config` header, which cloud-init reads as YAML.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{Cmd, ToolRunner};

/// Volume label cloud-init looks for.
pub const SEED_LABEL: &str = "cidata";
/// Where the guest mounts the seed volume.
pub const GUEST_SEED_MOUNT: &str = "/mnt/rpm-forge-seed";
/// Where build output is expected inside the guest.
pub const GUEST_OUTPUT_DIR: &str = "/root/rpmbuild/out";

/// Base priority of generated repositories; each following repository
/// without an explicit priority gets one less.
const BASE_REPO_PRIORITY: u32 = 1000;

/// A yum repository as seen from the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRepo {
    pub name: String,
    pub baseurl: String,
    pub priority: Option<u32>,
    pub modules_hotfixes: bool,
    pub excludepkgs: Option<String>,
    pub proxy: Option<String>,
    /// Host directory exported over 9p and mounted at `/rpm-forge.<name>`.
    pub share: Option<PathBuf>,
}

impl GuestRepo {
    pub fn mount_point(&self) -> String {
        format!("/rpm-forge.{}", self.name)
    }
}

/// Per-session variables of the seed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInitVars {
    pub hostname: String,
    pub ssh_authorized_key: String,
    pub additional_rpms: Vec<PathBuf>,
    pub repos: Vec<GuestRepo>,
    pub rpm_macros: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub no_proxy: Option<String>,
}

#[derive(Serialize)]
struct UserData<'a> {
    hostname: &'a str,
    fqdn: &'a str,
    disable_root: bool,
    ssh_pwauth: bool,
    ssh_authorized_keys: Vec<&'a str>,
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
}

#[derive(Serialize)]
struct WriteFile {
    path: String,
    content: String,
    permissions: &'static str,
}

pub fn repo_file(repos: &[GuestRepo]) -> String {
    let mut out = String::new();
    let mut priority = BASE_REPO_PRIORITY;
    for repo in repos {
        priority = repo.priority.unwrap_or(priority.saturating_sub(1));
        let baseurl = match repo.share {
            Some(_) => format!("file://{}/", repo.mount_point()),
            None => repo.baseurl.clone(),
        };
        out.push_str(&format!(
            "[{name}]\nname={name}\nbaseurl={baseurl}\ngpgcheck=0\npriority={priority}\n",
            name = repo.name
        ));
        if repo.modules_hotfixes {
            out.push_str("module_hotfixes=1\n");
        }
        if let Some(excludepkgs) = &repo.excludepkgs {
            out.push_str(&format!("excludepkgs={excludepkgs}\n"));
        }
        if let Some(proxy) = &repo.proxy {
            out.push_str(&format!("proxy={proxy}\n"));
        }
        out.push('\n');
    }
    out
}

pub fn rpmmacros(macros: &BTreeMap<String, String>) -> String {
    macros
        .iter()
        .map(|(name, value)| format!("%{name} {value}\n"))
        .collect()
}

fn proxy_profile(proxy: &str, no_proxy: Option<&str>) -> String {
    let mut out = String::new();
    for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
        out.push_str(&format!("export {var}={proxy}\n"));
    }
    if let Some(no_proxy) = no_proxy {
        out.push_str(&format!("export no_proxy={no_proxy}\nexport NO_PROXY={no_proxy}\n"));
    }
    out
}

pub fn render_user_data(vars: &CloudInitVars) -> Result<String> {
    let mut write_files = vec![
        WriteFile {
            path: "/etc/yum.repos.d/rpm-forge.repo".to_string(),
            content: repo_file(&vars.repos),
            permissions: "0644",
        },
        WriteFile {
            path: "/root/.rpmmacros".to_string(),
            content: rpmmacros(&vars.rpm_macros),
            permissions: "0644",
        },
    ];
    if let Some(proxy) = &vars.proxy {
        write_files.push(WriteFile {
            path: "/etc/profile.d/rpm-forge-proxy.sh".to_string(),
            content: proxy_profile(proxy, vars.no_proxy.as_deref()),
            permissions: "0644",
        });
    }

    let mut runcmd = vec![format!("mkdir -p {GUEST_OUTPUT_DIR}")];
    let shared: Vec<&GuestRepo> = vars.repos.iter().filter(|r| r.share.is_some()).collect();
    for repo in shared {
        runcmd.push(format!(
            "mkdir -p {mp} && mount -t 9p -o trans=virtio,version=9p2000.L,msize=131096,ro {tag} {mp}",
            mp = repo.mount_point(),
            tag = repo.name
        ));
    }
    if !vars.additional_rpms.is_empty() {
        runcmd.push(format!(
            "mkdir -p {GUEST_SEED_MOUNT} && mount -L {SEED_LABEL} {GUEST_SEED_MOUNT}"
        ));
        runcmd.push(format!("dnf -y install {GUEST_SEED_MOUNT}/rpms/*.rpm"));
    }

    let user_data = UserData {
        hostname: &vars.hostname,
        fqdn: &vars.hostname,
        disable_root: false,
        ssh_pwauth: false,
        ssh_authorized_keys: vec![vars.ssh_authorized_key.trim()],
        write_files,
        runcmd,
    };
    let body = serde_json::to_string_pretty(&user_data).context("serializing user-data")?;
    Ok(format!("#cloud-config\n{body}\n"))
}

pub fn render_meta_data(vars: &CloudInitVars, instance_id: &str) -> String {
    format!(
        "instance-id: {instance_id}\nlocal-hostname: {}\n",
        vars.hostname
    )
}

/// Write the seed tree under `work_dir/seed` and pack it as `seed.iso`.
pub fn build_seed(
    runner: &dyn ToolRunner,
    vars: &CloudInitVars,
    instance_id: &str,
    work_dir: &Path,
) -> Result<PathBuf> {
    let seed_dir = work_dir.join("seed");
    fs::create_dir_all(&seed_dir)
        .with_context(|| format!("creating seed directory {}", seed_dir.display()))?;
    fs::write(seed_dir.join("user-data"), render_user_data(vars)?)?;
    fs::write(
        seed_dir.join("meta-data"),
        render_meta_data(vars, instance_id),
    )?;

    if !vars.additional_rpms.is_empty() {
        let rpms_dir = seed_dir.join("rpms");
        fs::create_dir_all(&rpms_dir)?;
        for rpm in &vars.additional_rpms {
            let Some(name) = rpm.file_name() else {
                bail!("invalid additional RPM path {}", rpm.display());
            };
            fs::copy(rpm, rpms_dir.join(name))
                .with_context(|| format!("staging additional RPM {}", rpm.display()))?;
        }
    }

    let iso = work_dir.join("seed.iso");
    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-output"])
        .arg_path(&iso)
        .args(["-volid", SEED_LABEL, "-joliet", "-rock"])
        .arg_path(&seed_dir)
        .error_msg("Failed to pack cloud-init seed")
        .run_with(runner)?;
    Ok(iso)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> CloudInitVars {
        CloudInitVars {
            hostname: "rpm-forge-aarch64".to_string(),
            ssh_authorized_key: "ssh-ed25519 AAAAC3Nza forge\n".to_string(),
            additional_rpms: vec![PathBuf::from("/srv/extra/tools-1.0-1.noarch.rpm")],
            repos: vec![
                GuestRepo {
                    name: "os".to_string(),
                    baseurl: "https://mirror.example.org/9/BaseOS/aarch64/os/".to_string(),
                    priority: None,
                    modules_hotfixes: false,
                    excludepkgs: None,
                    proxy: Some("http://proxy:3128".to_string()),
                    share: None,
                },
                GuestRepo {
                    name: "local".to_string(),
                    baseurl: "file:///srv/annex/repos/local".to_string(),
                    priority: Some(10),
                    modules_hotfixes: true,
                    excludepkgs: Some("kernel*".to_string()),
                    proxy: None,
                    share: Some(PathBuf::from("/srv/annex/repos/local")),
                },
            ],
            rpm_macros: BTreeMap::from([("dist".to_string(), ".el9".to_string())]),
            proxy: Some("http://proxy:3128".to_string()),
            no_proxy: Some("localhost,.example.org".to_string()),
        }
    }

    #[test]
    fn repo_file_resolves_priorities_and_shares() {
        let repos = repo_file(&vars().repos);
        assert!(repos.contains("[os]\nname=os\nbaseurl=https://mirror.example.org/9/BaseOS/aarch64/os/\ngpgcheck=0\npriority=999\n"));
        assert!(repos.contains("baseurl=file:///rpm-forge.local/"));
        assert!(repos.contains("priority=10\nmodule_hotfixes=1\nexcludepkgs=kernel*\n"));
        assert!(repos.contains("proxy=http://proxy:3128"));
    }

    #[test]
    fn user_data_is_cloud_config() {
        let rendered = render_user_data(&vars()).unwrap();
        let (header, body) = rendered.split_once('\n').unwrap();
        assert_eq!(header, "#cloud-config");

        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["hostname"], "rpm-forge-aarch64");
        assert_eq!(value["disable_root"], false);
        assert_eq!(value["ssh_authorized_keys"][0], "ssh-ed25519 AAAAC3Nza forge");

        let paths: Vec<&str> = value["write_files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["path"].as_str().unwrap())
            .collect();
        assert!(paths.contains(&"/root/.rpmmacros"));
        assert!(paths.contains(&"/etc/profile.d/rpm-forge-proxy.sh"));

        let runcmd = value["runcmd"].to_string();
        assert!(runcmd.contains("mount -L cidata"));
        assert!(runcmd.contains("9p2000.L"));
    }

    #[test]
    fn macros_file_format() {
        let macros = BTreeMap::from([
            ("_topdir".to_string(), "/root/rpmbuild".to_string()),
            ("dist".to_string(), ".el9".to_string()),
        ]);
        assert_eq!(rpmmacros(&macros), "%_topdir /root/rpmbuild\n%dist .el9\n");
    }

    #[test]
    fn meta_data_names_instance() {
        let meta = render_meta_data(&vars(), "rpm-forge-abc");
        assert_eq!(
            meta,
            "instance-id: rpm-forge-abc\nlocal-hostname: rpm-forge-aarch64\n"
        );
    }
}
