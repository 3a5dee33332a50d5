//! Process execution harness
//!
//! Thin layer over OS process creation. A [`ProcessHandle`] is returned as
//! soon as the process exists; callers then wait with a timeout, watch the
//! incrementally captured output, apply CPU affinity or kill it. Handles are
//! killed (whole process group on Unix) when dropped while still running, so
//! an abandoned benchmark never outlives the component that started it.

pub mod affinity;
pub mod output;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DependencyError, EngineError, ProcessError, Result, WorkloadError};
use crate::telemetry::EngineMetrics;

pub use affinity::CpuAffinity;
pub use output::{output_channel, OutputBuffer, OutputWriter};

/// Interval at which captured output is checked for a marker
pub const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for pipe readers after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to launch
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub command: String,
    pub arguments: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub elevated: bool,
    pub environment: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }

    /// Build from a command plus a single argument string
    pub fn with_argument_line(command: &str, arguments: &str) -> Self {
        Self::new(command).args(split_arguments(arguments))
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Command line as it would be typed, without elevation
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            return self.command.clone();
        }

        let arguments: Vec<String> = self
            .arguments
            .iter()
            .map(|argument| {
                if argument.contains(char::is_whitespace) {
                    format!("\"{}\"", argument)
                } else {
                    argument.clone()
                }
            })
            .collect();
        format!("{} {}", self.command, arguments.join(" "))
    }
}

/// Split an argument string on whitespace, honouring double quotes
pub fn split_arguments(line: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    arguments.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        arguments.push(current);
    }
    arguments
}

/// Exit details once a process has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; signal-terminated processes report `-1`
    pub code: i32,
    pub exit_time: DateTime<Utc>,
}

/// Tool-specific success criteria checked by [`ProcessHandle::throw_if_workload_failed`]
#[derive(Debug, Clone)]
pub struct WorkloadExpectation {
    pub success_codes: Vec<i32>,
    pub required_markers: Vec<Regex>,
    pub fail_on_stderr: bool,
}

impl Default for WorkloadExpectation {
    fn default() -> Self {
        Self {
            success_codes: vec![0],
            required_markers: Vec::new(),
            fail_on_stderr: false,
        }
    }
}

enum WaitOutcome {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// A single running or finished OS process
pub struct ProcessHandle {
    pid: u32,
    command_line: String,
    child: Child,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    start_time: DateTime<Utc>,
    exit: Option<ExitInfo>,
    own_group: bool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command_line", &self.command_line)
            .field("exit", &self.exit)
            .finish()
    }
}

impl ProcessHandle {
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Full command line including any elevation prefix
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.map(|exit| exit.code)
    }

    pub fn stdout(&self) -> &OutputBuffer {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputBuffer {
        &self.stderr
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.exit.is_none() {
            self.exit = Some(ExitInfo {
                code: status.code().unwrap_or(-1),
                exit_time: Utc::now(),
            });
        }
    }

    /// Checks the OS for exit without blocking
    pub fn has_exited(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = self.pid, "Unable to query process state: {}", e);
                true
            }
        }
    }

    async fn drain_output(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(pid = self.pid, "Output pipe still open after exit; leaving reader behind");
            }
        }
    }

    /// Wait for exit. On timeout the process is killed and a timeout error is
    /// raised; on cancellation it is killed and cancellation propagates.
    pub async fn wait_for_exit(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<i32> {
        if let Some(exit) = self.exit {
            self.drain_output().await;
            return Ok(exit.code);
        }

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = self.child.wait() => WaitOutcome::Exited(status),
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = deadline => WaitOutcome::TimedOut,
        };

        match outcome {
            WaitOutcome::Exited(status) => {
                let status = status?;
                self.record_exit(status);
                self.drain_output().await;
                debug!(pid = self.pid, code = status.code().unwrap_or(-1), "Process exited");
                Ok(status.code().unwrap_or(-1))
            }
            WaitOutcome::Cancelled => {
                debug!(pid = self.pid, "Cancellation requested; killing process");
                self.kill().await;
                Err(EngineError::Cancelled)
            }
            WaitOutcome::TimedOut => {
                let timeout = timeout.unwrap_or_default();
                warn!(pid = self.pid, command = %self.command_line, ?timeout, "Process timed out; killing");
                self.kill().await;
                Err(ProcessError::Timeout { command: self.command_line.clone(), timeout }.into())
            }
        }
    }

    /// Poll captured output until `pattern` matches. Independent of the overall
    /// process timeout; fails early if the process exits without the marker.
    pub async fn wait_for_output(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.stdout.is_match(pattern) || self.stderr.is_match(pattern) {
                return Ok(());
            }

            if self.has_exited() {
                self.drain_output().await;
                if self.stdout.is_match(pattern) || self.stderr.is_match(pattern) {
                    return Ok(());
                }
                return Err(ProcessError::ExitedBeforeOutput {
                    command: self.command_line.clone(),
                    pattern: pattern.to_string(),
                }
                .into());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::OutputTimeout { pattern: pattern.to_string(), timeout }.into());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(OUTPUT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Bind the process to the given cores. Best-effort: returns whether the
    /// affinity was applied and logs instead of failing.
    pub fn apply_affinity(&mut self, affinity: &CpuAffinity) -> bool {
        if self.has_exited() {
            warn!(
                pid = self.pid,
                cores = %affinity,
                "Process already exited; core affinity not applied"
            );
            return false;
        }

        apply_affinity_to_pid(self.pid, affinity)
    }

    /// Raise a workload failure when the exit code is not a success code
    pub fn throw_if_errored(&self, component: &str, success_codes: &[i32]) -> Result<()> {
        let code = self.exit_code().ok_or_else(|| WorkloadError::Failed {
            component: component.to_string(),
            reason: format!("'{}' has not exited", self.command_line),
        })?;

        if success_codes.contains(&code) {
            return Ok(());
        }

        let detail = match self.stderr.tail(10) {
            tail if tail.trim().is_empty() => self.stdout.tail(10),
            tail => tail,
        };

        Err(WorkloadError::ExitCode {
            component: component.to_string(),
            command: self.command_line.clone(),
            exit_code: code,
            detail,
        }
        .into())
    }

    /// Check exit code and output against tool-specific success criteria
    pub fn throw_if_workload_failed(&self, component: &str, expectation: &WorkloadExpectation) -> Result<()> {
        self.throw_if_errored(component, &expectation.success_codes)?;

        if expectation.fail_on_stderr && !self.stderr.is_empty() {
            return Err(WorkloadError::Failed {
                component: component.to_string(),
                reason: format!("standard error was written: {}", self.stderr.tail(5)),
            }
            .into());
        }

        let stdout = self.stdout.contents();
        for marker in &expectation.required_markers {
            if !marker.is_match(&stdout) {
                return Err(WorkloadError::MissingMarker {
                    component: component.to_string(),
                    marker: marker.to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    fn signal_group(&self) {
        #[cfg(unix)]
        if self.own_group {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
                debug!(pid = self.pid, "Process group kill failed: {}", e);
            }
        }
    }

    /// Kill the process (and its process group) and reap it
    pub async fn kill(&mut self) {
        if self.has_exited() {
            return;
        }

        self.signal_group();
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, "Kill signal failed: {}", e);
        }

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => self.record_exit(status),
            Ok(Err(e)) => warn!(pid = self.pid, "Failed to reap killed process: {}", e),
            Err(_) => warn!(pid = self.pid, "Killed process did not exit within 5s"),
        }
        self.drain_output().await;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!(pid = self.pid, command = %self.command_line, "Killing process on drop");
            self.signal_group();
            let _ = self.child.start_kill();
        }
    }
}

#[cfg(target_os = "linux")]
fn apply_affinity_to_pid(pid: u32, affinity: &CpuAffinity) -> bool {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for core in affinity.cores() {
        if let Err(e) = set.set(*core) {
            warn!(pid, core, "Core outside the supported affinity range: {}", e);
            return false;
        }
    }

    match sched_setaffinity(Pid::from_raw(pid as i32), &set) {
        Ok(()) => {
            info!(pid, cores = %affinity, "Applied core affinity");
            true
        }
        Err(e) => {
            warn!(pid, cores = %affinity, "Failed to apply core affinity: {}", e);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_affinity_to_pid(pid: u32, affinity: &CpuAffinity) -> bool {
    warn!(pid, cores = %affinity, "Core affinity is not supported on this platform");
    false
}

fn spawn_reader<R>(mut pipe: R, writer: OutputWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => writer.append(&chunk[..read]),
                Err(e) => {
                    debug!("Output pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// A process launched through the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command_line: String,
    pub working_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

/// Creates processes and remembers what it launched
#[derive(Debug, Default)]
pub struct ProcessManager {
    history: Mutex<Vec<ProcessRecord>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn is_elevated() -> bool {
        #[cfg(unix)]
        {
            nix::unistd::geteuid().is_root()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Start a process and return as soon as it exists
    pub fn start(&self, spec: &ProcessSpec) -> Result<ProcessHandle> {
        let use_sudo = cfg!(unix) && spec.elevated && !Self::is_elevated();
        let (program, arguments): (&str, Vec<&str>) = if use_sudo {
            let mut arguments = vec![spec.command.as_str()];
            arguments.extend(spec.arguments.iter().map(String::as_str));
            ("sudo", arguments)
        } else {
            (spec.command.as_str(), spec.arguments.iter().map(String::as_str).collect())
        };

        let command_line = if use_sudo {
            format!("sudo {}", spec.command_line())
        } else {
            spec.command_line()
        };

        let mut command = Command::new(program);
        command
            .args(&arguments)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| -> EngineError {
            if e.kind() == io::ErrorKind::NotFound {
                DependencyError::CommandNotFound { command: spec.command.clone() }.into()
            } else {
                ProcessError::SpawnFailed { command: command_line.clone(), reason: e.to_string() }.into()
            }
        })?;

        let pid = child.id().unwrap_or_default();
        let (stdout_writer, stdout) = output_channel();
        let (stderr_writer, stderr) = output_channel();

        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_reader(pipe, stdout_writer));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_reader(pipe, stderr_writer));
        }

        let start_time = Utc::now();
        info!(pid, command = %command_line, "Started process");

        {
            let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            history.push(ProcessRecord {
                pid,
                command_line: command_line.clone(),
                working_dir: spec.working_dir.clone(),
                started_at: start_time,
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.process_started();
        }

        Ok(ProcessHandle {
            pid,
            command_line,
            child,
            stdout,
            stderr,
            readers,
            start_time,
            exit: None,
            own_group: cfg!(unix) && !use_sudo,
        })
    }

    /// Start a process and wait for it to exit
    pub async fn execute(
        &self,
        spec: &ProcessSpec,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle> {
        let mut handle = self.start(spec)?;
        handle.wait_for_exit(timeout, cancel).await?;
        Ok(handle)
    }

    /// Every process launched so far, oldest first
    pub fn history(&self) -> Vec<ProcessRecord> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Kill every OS process with the given executable name. Returns how many
    /// were signalled.
    pub fn kill_processes_by_name(&self, name: &str) -> usize {
        let mut system = sysinfo::System::new();
        system.refresh_processes();

        let mut killed = 0;
        for process in system.processes_by_exact_name(name) {
            if process.kill() {
                killed += 1;
            } else {
                warn!(pid = %process.pid(), name, "Failed to kill process");
            }
        }

        if killed > 0 {
            info!(name, killed, "Killed processes by name");
        }
        killed
    }
}
