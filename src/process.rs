//! External process execution.
//!
//! Every tool this crate drives (qemu, qemu-img, ssh, scp, xorriso,
//! createrepo, rpmsign, lftp, dnf) is described as a [`Cmd`] and executed
//! through a [`ToolRunner`]. The orchestration code never touches
//! `std::process` directly, so alternate backends and test doubles can be
//! swapped in without changing it.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of output lines kept for error reports.
pub const OUTPUT_TAIL_LINES: usize = 40;

/// How often waits re-check for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Result of a command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit code, or -1 if terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// How a streamed command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Exited(CommandResult),
    TimedOut,
    Cancelled,
}

/// Builder describing an external command.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Deadline for [`ToolRunner::run_streaming`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run through `runner`, turning a non-zero exit into an error unless
    /// [`Cmd::allow_fail`] was set.
    pub fn run_with(&self, runner: &dyn ToolRunner) -> Result<CommandResult> {
        tracing::debug!(cmd = %self.command_line(), "running");
        let result = runner.run(self)?;
        if !self.allow_fail && !result.success() {
            let prefix = self
                .error_prefix
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code);
            }
            bail!("{} (exit code {}):\n{}", prefix, result.code, stderr);
        }
        Ok(result)
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    /// Returns `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

/// Handle on a long-running background process (the hypervisor).
pub trait ProcessHandle: Send {
    fn id(&self) -> u32;

    /// `Some(code)` once the process has exited.
    fn try_exit_code(&mut self) -> Result<Option<i32>>;

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    fn terminate(&mut self, grace: Duration) -> Result<()>;

    /// Last lines written to stderr.
    fn stderr_tail(&mut self) -> String;
}

/// Narrow capability over process invocation.
pub trait ToolRunner: Send + Sync {
    /// Run to completion and capture output.
    fn run(&self, cmd: &Cmd) -> Result<CommandResult>;

    /// Run while forwarding every output line to `on_line`, honoring the
    /// command timeout and `cancel`.
    fn run_streaming(
        &self,
        cmd: &Cmd,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<StreamOutcome>;

    /// Start in the background.
    fn spawn(&self, cmd: &Cmd) -> Result<Box<dyn ProcessHandle>>;

    /// Run attached to the caller's terminal; returns the exit code.
    fn run_interactive(&self, cmd: &Cmd) -> Result<i32> {
        Ok(self.run(cmd)?.code)
    }
}

/// [`ToolRunner`] backed by real host processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandResult> {
        let output = cmd.to_command().output().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", cmd.program)
        })?;
        Ok(CommandResult {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_streaming(
        &self,
        cmd: &Cmd,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<StreamOutcome> {
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", cmd.program))?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        // Reader threads; the channel disconnects once both streams close.
        let (tx, rx) = mpsc::channel();
        spawn_line_reader(stdout, tx.clone(), false);
        spawn_line_reader(stderr, tx, true);

        let start = Instant::now();
        let mut out_tail = VecDeque::new();
        let mut err_tail = VecDeque::new();

        loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(StreamOutcome::Cancelled);
            }
            if let Some(limit) = cmd.timeout {
                if start.elapsed() > limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(StreamOutcome::TimedOut);
                }
            }

            match rx.recv_timeout(CANCEL_POLL) {
                Ok((is_err, line)) => {
                    on_line(&line);
                    let tail = if is_err { &mut err_tail } else { &mut out_tail };
                    push_tail(tail, line);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for '{}'", cmd.program))?;
        Ok(StreamOutcome::Exited(CommandResult {
            code: status.code().unwrap_or(-1),
            stdout: join_tail(&out_tail),
            stderr: join_tail(&err_tail),
        }))
    }

    fn spawn(&self, cmd: &Cmd) -> Result<Box<dyn ProcessHandle>> {
        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!("Failed to spawn '{}'. Is it installed?", cmd.program)
            })?;

        let tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&tail);
            std::thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    if let Ok(mut tail) = tail.lock() {
                        push_tail(&mut tail, line);
                    }
                }
            });
        }

        Ok(Box::new(SystemProcess { child, tail }))
    }

    fn run_interactive(&self, cmd: &Cmd) -> Result<i32> {
        let status = cmd
            .to_command()
            .status()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", cmd.program))?;
        Ok(status.code().unwrap_or(-1))
    }
}

struct SystemProcess {
    child: Child,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessHandle for SystemProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()
            .context("Failed to poll background process")?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.try_exit_code()?.is_some() {
            return Ok(());
        }

        let pid = self.child.id() as libc::pid_t;
        tracing::debug!(pid, "sending SIGTERM");
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.try_exit_code()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(200));
        }

        tracing::debug!(pid, "sending SIGKILL");
        let _ = self.child.kill();
        self.child
            .wait()
            .context("Failed to reap background process")?;
        Ok(())
    }

    fn stderr_tail(&mut self) -> String {
        self.tail
            .lock()
            .map(|tail| join_tail(&tail))
            .unwrap_or_default()
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    stream: R,
    tx: mpsc::Sender<(bool, String)>,
    is_err: bool,
) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send((is_err, line)).is_err() {
                break;
            }
        }
    });
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == OUTPUT_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn join_tail(tail: &VecDeque<String>) -> String {
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run_with(&SystemRunner).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .run_with(&SystemRunner)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("No such file") || msg.contains("cannot access"));
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run_with(&SystemRunner).unwrap();
        assert!(!result.success());
        assert_eq!(result.code, 1);
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("createrepo step failed")
            .run_with(&SystemRunner)
            .unwrap_err();
        assert!(err.to_string().contains("createrepo step failed"));
    }

    #[test]
    fn test_streaming_forwards_lines() {
        let mut seen = Vec::new();
        let outcome = SystemRunner
            .run_streaming(
                &Cmd::new("sh").args(["-c", "echo one; echo two >&2; exit 3"]),
                &CancelToken::new(),
                &mut |line| seen.push(line.to_string()),
            )
            .unwrap();

        assert!(seen.contains(&"one".to_string()));
        assert!(seen.contains(&"two".to_string()));
        match outcome {
            StreamOutcome::Exited(result) => {
                assert_eq!(result.code, 3);
                assert_eq!(result.stderr_trimmed(), "two");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_streaming_timeout_kills() {
        let outcome = SystemRunner
            .run_streaming(
                &Cmd::new("sleep")
                    .arg("30")
                    .timeout(Duration::from_millis(300)),
                &CancelToken::new(),
                &mut |_| {},
            )
            .unwrap();
        assert_eq!(outcome, StreamOutcome::TimedOut);
    }

    #[test]
    fn test_streaming_cancelled() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = SystemRunner
            .run_streaming(&Cmd::new("sleep").arg("30"), &cancel, &mut |_| {})
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[test]
    fn test_cancel_wakes_sleep() {
        let cancel = CancelToken::new();
        let waker = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.cancel();
        });
        let start = Instant::now();
        assert!(!cancel.sleep(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
        assert!(CancelToken::new().sleep(Duration::from_millis(1)));
    }

    #[test]
    fn test_spawned_process_terminates() {
        let mut handle = SystemRunner.spawn(&Cmd::new("sleep").arg("30")).unwrap();
        assert_eq!(handle.try_exit_code().unwrap(), None);
        handle.terminate(Duration::from_secs(2)).unwrap();
        assert!(handle.try_exit_code().unwrap().is_some());
    }

    #[test]
    fn test_command_line_rendering() {
        let cmd = Cmd::new("qemu-img").args(["create", "-f", "qcow2"]);
        assert_eq!(cmd.command_line(), "qemu-img create -f qcow2");
    }
}
