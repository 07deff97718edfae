//! Debug sessions and package tests against a running guest.

mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeHost, FakeRunner};
use rpm_forge::config::BuildConfig;
use rpm_forge::coordinator;
use rpm_forge::testsuite::{self, TestResults, TestScript, Verdict};
use rpm_forge::vm::{Backoff, PortPool, VmManager};
use tempfile::TempDir;

fn config(root: &Path) -> BuildConfig {
    fs::write(root.join("base.qcow2"), b"QFI\xfb").unwrap();
    let raw = r#"
annex = "annex"
vm_image = "base.qcow2"
vm_port_range = [43000, 43010]
arch = ["x86_64"]
"#;
    BuildConfig::from_toml_str(raw, root).unwrap()
}

fn manager(runner: &Arc<FakeRunner>, pool: &Arc<PortPool>) -> VmManager {
    VmManager::new(
        runner.clone(),
        Arc::new(FakeHost { arch: "x86_64", emulation: false }),
    )
    .with_ports(Arc::clone(pool))
    .with_backoff(Backoff {
        initial: Duration::from_millis(1),
        factor: 2,
        max: Duration::from_millis(4),
    })
    .with_terminate_grace(Duration::from_millis(10))
}

#[test]
fn started_session_serves_commands_until_stopped() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let runner = Arc::new(FakeRunner::new());
    let pool = Arc::new(PortPool::with_probe(|_| true));
    let manager = manager(&runner, &pool);

    let request =
        coordinator::session_request(&config, "x86_64", manager.host(), tmp.path().join("work"))
            .unwrap();
    let mut session = manager.start(&request).unwrap();
    assert!(runner.position("cloud-init status --wait").is_some());
    // Starting never runs the build script.
    assert!(runner.position("rpm-forge-build.sh").is_none());

    let notes = tmp.path().join("notes.txt");
    fs::write(&notes, "hi").unwrap();
    session.upload(&notes, "/root/notes.txt").unwrap();
    assert!(runner.position(":/root/notes.txt").is_some());

    let mut lines = Vec::new();
    let result = session
        .run_remote("rpm -qa", None, &mut |line| lines.push(line.to_string()))
        .unwrap();
    assert!(result.success());
    assert!(lines.iter().all(|l| !l.contains("__rpm_forge_rc")));

    let out = tmp.path().join("out");
    session.download("/root/rpmbuild/out", &out).unwrap();
    assert!(out.join("hello-1.0-1.src.rpm").is_file());

    assert_eq!(session.connect().unwrap(), 0);
    assert!(runner.calls_to("ssh").iter().any(|c| c.contains(" -t root@127.0.0.1")));

    let work_dir = session.work_dir().unwrap().to_path_buf();
    session.teardown();
    assert!(!work_dir.exists());
    assert!(session.run_remote("true", None, &mut |_| {}).is_err());
    assert_eq!(runner.vms.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(pool.leased_count(), 0);
}

#[test]
fn package_tests_report_each_script() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let runner = Arc::new(FakeRunner::new());
    let pool = Arc::new(PortPool::with_probe(|_| true));
    let manager = manager(&runner, &pool);

    let tests_dir = tmp.path().join("tests");
    fs::create_dir_all(&tests_dir).unwrap();
    let mut scripts = Vec::new();
    for name in ["install.sh", "upgrade-fail.sh", "reboot.local.sh"] {
        let path = tests_dir.join(name);
        fs::write(&path, "true\n").unwrap();
        scripts.push(TestScript::from_path(&path).unwrap());
    }

    let request =
        coordinator::session_request(&config, "x86_64", manager.host(), tmp.path().join("work"))
            .unwrap();
    let mut session = manager.start(&request).unwrap();
    let mut results = TestResults::new("test");
    testsuite::run_tests(
        &session,
        &scripts,
        Some("hello"),
        Duration::from_secs(60),
        &mut results,
    )
    .unwrap();
    session.teardown();

    let verdicts: Vec<_> = results
        .results()
        .iter()
        .map(|r| (r.case.fullname(), r.verdict))
        .collect();
    assert_eq!(
        verdicts,
        [
            ("hello.install".to_string(), Verdict::Success),
            ("hello.upgrade-fail".to_string(), Verdict::Failure),
            ("hello.reboot".to_string(), Verdict::Success),
        ]
    );
    assert!(results.results()[1]
        .output
        .as_deref()
        .unwrap()
        .starts_with("exit code 1"));

    // Guest scripts are copied in, host scripts run through bash locally.
    assert!(runner.position(":/root/rpm-forge-test-install.sh").is_some());
    let host = runner.calls_to("bash");
    assert_eq!(host.len(), 1);
    assert!(host[0].contains("vm_cmd()"));
    assert!(host[0].contains("reboot.local.sh"));

    let junit = tmp.path().join("junit.xml");
    results.write_junit(&junit).unwrap();
    let xml = fs::read_to_string(&junit).unwrap();
    assert!(xml.contains("tests=\"3\" failures=\"1\""));
}
