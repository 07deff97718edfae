//! Package tests run against a booted guest.
//!
//! A test is a shell script. Scripts named `*.local.sh` run on the host with
//! a `vm_cmd` shell function reaching the guest over SSH; every other
//! script is copied into the guest and run there as root. A zero exit is a
//! pass. Results are gathered into a [`TestResults`] that renders a text
//! summary and a JUnit report.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{ForgeError, ForgeResult};
use crate::process::{Cmd, StreamOutcome};
use crate::vm::VmSession;

const LOCAL_SUFFIX: &str = ".local.sh";
const GUEST_TEST_DIR: &str = "/root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScript {
    pub name: String,
    pub path: PathBuf,
    /// Runs on the host instead of inside the guest.
    pub local: bool,
}

impl TestScript {
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("test script not found: {}", path.display());
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("invalid test script path {}", path.display()))?;
        let (name, local) = match file_name.strip_suffix(LOCAL_SUFFIX) {
            Some(stem) => (stem.to_string(), true),
            None => (
                file_name
                    .strip_suffix(".sh")
                    .unwrap_or(&file_name)
                    .to_string(),
                false,
            ),
        };
        Ok(Self {
            name,
            path: path.to_path_buf(),
            local,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub classname: Option<String>,
    pub arch: String,
}

impl TestCase {
    pub fn fullname(&self) -> String {
        match &self.classname {
            Some(class) => format!("{class}.{}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub case: TestCase,
    pub verdict: Verdict,
    pub duration: Duration,
    /// Output tail, kept for failures.
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TestResults {
    pub name: Option<String>,
    results: Vec<TestResult>,
}

impl TestResults {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            results: Vec::new(),
        }
    }

    pub fn add_success(&mut self, case: TestCase, duration: Duration) {
        self.results.push(TestResult {
            case,
            verdict: Verdict::Success,
            duration,
            output: None,
        });
    }

    pub fn add_failure(&mut self, case: TestCase, duration: Duration, output: impl Into<String>) {
        self.results.push(TestResult {
            case,
            verdict: Verdict::Failure,
            duration,
            output: Some(output.into()),
        });
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.verdict == Verdict::Failure)
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }

    /// One line per test: name, arch, duration, verdict.
    pub fn summary(&self) -> String {
        let width = self
            .results
            .iter()
            .map(|r| r.case.fullname().len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for result in &self.results {
            let verdict = match result.verdict {
                Verdict::Success => "Success",
                Verdict::Failure => "FAILURE",
            };
            out.push_str(&format!(
                "{:<width$}  {:<8} {:>5}s  {verdict}\n",
                result.case.fullname(),
                result.case.arch,
                result.duration.as_secs()
            ));
        }
        out
    }

    pub fn junit_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<testsuite");
        if let Some(name) = &self.name {
            xml.push_str(&format!(" name=\"{}\"", xml_escape(name)));
        }
        xml.push_str(&format!(
            " tests=\"{}\" failures=\"{}\">\n",
            self.len(),
            self.failures()
        ));

        for result in &self.results {
            xml.push_str(&format!("  <testcase name=\"{}\"", xml_escape(&result.case.name)));
            if let Some(class) = &result.case.classname {
                xml.push_str(&format!(" classname=\"rpm-forge.{}\"", xml_escape(class)));
            }
            xml.push_str(&format!(" time=\"{:.2}\"", result.duration.as_secs_f64()));
            match (&result.verdict, &result.output) {
                (Verdict::Failure, output) => {
                    xml.push_str(">\n    <failure>");
                    xml.push_str(&xml_escape(output.as_deref().unwrap_or_default()));
                    xml.push_str("</failure>\n  </testcase>\n");
                }
                (Verdict::Success, _) => xml.push_str("/>\n"),
            }
        }
        xml.push_str("</testsuite>\n");
        xml
    }

    /// Write the JUnit report to `path` through a temp file.
    pub fn write_junit(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp, self.junit_xml())
            .with_context(|| format!("writing temp file '{}'", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming '{}' to '{}'", tmp.display(), path.display()))?;
        Ok(())
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Run every script against `session`, in order, appending to `results`.
///
/// A failing or timed out test is recorded and the next one runs;
/// cancellation and a lost guest abort the suite.
pub fn run_tests(
    session: &VmSession,
    scripts: &[TestScript],
    classname: Option<&str>,
    timeout: Duration,
    results: &mut TestResults,
) -> ForgeResult<()> {
    for script in scripts {
        let case = TestCase {
            name: script.name.clone(),
            classname: classname.map(str::to_string),
            arch: session.arch().to_string(),
        };
        tracing::info!(test = %case.fullname(), arch = %case.arch, local = script.local, "running test");

        let start = Instant::now();
        let outcome = if script.local {
            run_on_host(session, script, timeout)
        } else {
            run_in_guest(session, script, timeout)
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok(None) => {
                tracing::info!(test = %case.fullname(), "test passed");
                results.add_success(case, elapsed);
            }
            Ok(Some(output)) => {
                tracing::warn!(test = %case.fullname(), "test failed");
                results.add_failure(case, elapsed, output);
            }
            Err(ForgeError::BootTimeout { secs, .. }) => {
                tracing::warn!(test = %case.fullname(), secs, "test timed out");
                results.add_failure(case, elapsed, format!("timed out after {secs}s"));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// `None` on success, the output tail on failure.
fn run_in_guest(
    session: &VmSession,
    script: &TestScript,
    timeout: Duration,
) -> ForgeResult<Option<String>> {
    let remote = format!("{GUEST_TEST_DIR}/rpm-forge-test-{}.sh", script.name);
    session.upload(&script.path, &remote)?;

    let name = script.name.clone();
    let result = session.run_remote(
        &format!("bash -l {}", shell_quote(&remote)),
        Some(timeout),
        &mut |line| tracing::info!(target: "rpm_forge::guest", test = %name, "{line}"),
    )?;
    if result.success() {
        return Ok(None);
    }
    Ok(Some(format!(
        "exit code {}\n{}\n{}",
        result.code,
        result.stdout.trim_end(),
        result.stderr.trim_end()
    )))
}

/// Host scripts reach the guest through `vm_cmd`.
fn host_wrapper(ssh: &str, script: &Path) -> String {
    format!(
        "vm_cmd() {{ {ssh} \"$@\"; }}; export -f vm_cmd; bash {}",
        shell_quote(&script.to_string_lossy())
    )
}

fn run_on_host(
    session: &VmSession,
    script: &TestScript,
    timeout: Duration,
) -> ForgeResult<Option<String>> {
    let target = session.target()?;
    let cmd = Cmd::new("bash")
        .arg("-c")
        .arg(host_wrapper(&target.ssh_command_line(), &script.path))
        .env("RPM_FORGE_VM_PORT", target.port.to_string())
        .env("RPM_FORGE_VM_KEY", target.key.to_string_lossy())
        .timeout(timeout);

    let name = script.name.clone();
    let outcome = session.runner().run_streaming(&cmd, session.cancel_token(), &mut |line| {
        tracing::info!(target: "rpm_forge::test", test = %name, "{line}");
    })?;
    match outcome {
        StreamOutcome::Exited(result) if result.success() => Ok(None),
        StreamOutcome::Exited(result) => Ok(Some(format!(
            "exit code {}\n{}\n{}",
            result.code,
            result.stdout.trim_end(),
            result.stderr.trim_end()
        ))),
        StreamOutcome::TimedOut => Ok(Some(format!("timed out after {}s", timeout.as_secs()))),
        StreamOutcome::Cancelled => Err(ForgeError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn case(name: &str) -> TestCase {
        TestCase {
            name: name.to_string(),
            classname: Some("hello".to_string()),
            arch: "x86_64".to_string(),
        }
    }

    #[test]
    fn local_suffix_selects_host_tests() {
        let tmp = TempDir::new().unwrap();
        let guest = tmp.path().join("install.sh");
        let host = tmp.path().join("reboot.local.sh");
        fs::write(&guest, "rpm -q hello\n").unwrap();
        fs::write(&host, "vm_cmd reboot\n").unwrap();

        let guest = TestScript::from_path(&guest).unwrap();
        assert_eq!(guest.name, "install");
        assert!(!guest.local);
        let host = TestScript::from_path(&host).unwrap();
        assert_eq!(host.name, "reboot");
        assert!(host.local);

        assert!(TestScript::from_path(&tmp.path().join("missing.sh")).is_err());
    }

    #[test]
    fn junit_marks_failures_and_escapes_output() {
        let mut results = TestResults::new("test");
        results.add_success(case("install"), Duration::from_millis(1500));
        results.add_failure(case("upgrade"), Duration::from_secs(2), "error: <conflict> & more");

        assert!(!results.is_success());
        assert_eq!(results.failures(), 1);
        let xml = results.junit_xml();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<testsuite name=\"test\" tests=\"2\" failures=\"1\">"));
        assert!(xml.contains(
            "<testcase name=\"install\" classname=\"rpm-forge.hello\" time=\"1.50\"/>"
        ));
        assert!(xml.contains("<failure>error: &lt;conflict&gt; &amp; more</failure>"));
    }

    #[test]
    fn summary_lists_every_test() {
        let mut results = TestResults::new("test");
        results.add_success(case("install"), Duration::from_secs(3));
        results.add_failure(case("upgrade"), Duration::from_secs(12), "boom");
        let summary = results.summary();
        let lines: Vec<_> = summary.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("hello.install"));
        assert!(lines[0].ends_with("3s  Success"));
        assert!(lines[1].contains("x86_64"));
        assert!(lines[1].ends_with("12s  FAILURE"));
    }

    #[test]
    fn write_junit_replaces_report() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("reports/junit.xml");
        let mut results = TestResults::new("test");
        results.add_success(case("install"), Duration::from_secs(1));
        results.write_junit(&path).unwrap();
        results.add_failure(case("upgrade"), Duration::from_secs(1), "boom");
        results.write_junit(&path).unwrap();

        let xml = fs::read_to_string(&path).unwrap();
        assert!(xml.contains("tests=\"2\" failures=\"1\""));
        assert_eq!(fs::read_dir(tmp.path().join("reports")).unwrap().count(), 1);
    }

    #[test]
    fn host_wrapper_exports_vm_cmd() {
        let wrapper = host_wrapper("ssh -p 10022 -T root@127.0.0.1", Path::new("/t/it's.local.sh"));
        assert_eq!(
            wrapper,
            "vm_cmd() { ssh -p 10022 -T root@127.0.0.1 \"$@\"; }; export -f vm_cmd; bash '/t/it'\\''s.local.sh'"
        );
    }
}
