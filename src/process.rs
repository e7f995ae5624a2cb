//! Subprocess execution
//!
//! Provides:
//! - A description of a program invocation with an optional timeout
//! - The observed outcome (exit code or abnormal termination, captured output)
//! - The [`ProcessRunner`] seam and its host implementation

use crossbeam::channel::{self, Receiver};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program to run (looked up in PATH when not absolute)
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<OsString>,
    /// Give up and kill the process after this long
    pub timeout: Option<Duration>,
    /// Send stderr into the stdout pipe, keeping the order it was written in
    pub merge_output: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
            merge_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Capture stdout and stderr through one pipe; everything lands in
    /// [`ProcessOutcome::stdout`]
    pub fn merged(mut self) -> Self {
        self.merge_output = true;
        self
    }

    /// Program name as shown in error messages
    pub fn display_name(&self) -> String {
        display_name(&self.program)
    }

    /// Arguments as lossy UTF-8, for logs and test assertions
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// File name of a program path, falling back to the whole path
pub fn display_name(program: &Path) -> String {
    program
        .file_name()
        .unwrap_or(program.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// Why a process did not produce an exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    FailedToStart,
    Crashed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
}

/// How a process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub exit_code: Option<i32>,
    pub error: Option<ProcessError>,
}

impl ProcessState {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            error: None,
        }
    }

    pub fn failed(kind: ProcessErrorKind, message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            error: Some(ProcessError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn completed_successfully(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }

    pub fn failed_to_start(&self) -> bool {
        matches!(
            self.error,
            Some(ProcessError {
                kind: ProcessErrorKind::FailedToStart,
                ..
            })
        )
    }

    /// Human-readable reason for an unsuccessful run; empty on success
    pub fn failure_message(&self) -> String {
        if let Some(error) = &self.error {
            return error.message.clone();
        }

        match self.exit_code {
            Some(code) if code != 0 => format!("Process returned exit code: {}", code),
            _ => String::new(),
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::exited(code),
            (None, Some(signo)) => {
                let name = Signal::try_from(signo)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| format!("signal {}", signo));
                Self::failed(
                    ProcessErrorKind::Crashed,
                    format!("Process crashed: terminated by {}", name),
                )
            }
            (None, None) => Self::failed(ProcessErrorKind::Crashed, "Process crashed"),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.completed_successfully() {
            write!(f, "success")
        } else {
            write!(f, "{}", self.failure_message())
        }
    }
}

/// Result of running a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub state: ProcessState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutcome {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// All captured output; for a merged run this is stdout alone, in
    /// write order
    pub fn merged_output(&self) -> String {
        let mut merged = self.stdout.clone();
        merged.extend_from_slice(&self.stderr);
        String::from_utf8_lossy(&merged).into_owned()
    }
}

/// Runs external programs
pub trait ProcessRunner {
    fn run(&self, spec: &ProcessSpec) -> ProcessOutcome;

    /// Standard output of a command, regardless of its exit status
    fn output_of(&self, spec: &ProcessSpec) -> String {
        let outcome = self.run(spec);
        if outcome.state.failed_to_start() {
            tracing::warn!(
                program = %spec.display_name(),
                reason = %outcome.state.failure_message(),
                "Command could not be started"
            );
        }
        outcome.stdout_str()
    }

    /// Whether a command ran and exited with status zero
    fn succeeds(&self, spec: &ProcessSpec) -> bool {
        self.run(spec).state.completed_successfully()
    }
}

/// Runs programs on the host with `std::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl HostRunner {
    pub fn new() -> Self {
        Self
    }
}

/// How long pipe readers may lag behind a killed child
const DRAIN_GRACE: Duration = Duration::from_millis(500);

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = channel::bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn spawn(spec: &ProcessSpec) -> io::Result<(Child, Receiver<Vec<u8>>, Receiver<Vec<u8>>)> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        // own process group so a timeout takes down anything the child forked
        .process_group(0);

    if spec.merge_output {
        let (reader, writer) = io::pipe()?;
        command.stdout(writer.try_clone()?).stderr(writer);
        let child = command.spawn();
        // the parent's write ends must close or the reader never sees EOF
        drop(command);
        let child = child?;
        return Ok((child, drain(Some(reader)), drain(None::<io::PipeReader>)));
    }

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    Ok((child, stdout, stderr))
}

fn kill_group(child: &mut Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = signal::killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
    let _ = child.kill();
    // Reap after kill
    let _ = child.wait();
}

impl ProcessRunner for HostRunner {
    fn run(&self, spec: &ProcessSpec) -> ProcessOutcome {
        tracing::debug!(
            program = %spec.program.display(),
            args = ?spec.args_lossy(),
            timeout = ?spec.timeout,
            "Running process"
        );

        // Pipes drain on their own threads so a chatty child never blocks
        let (mut child, stdout, stderr) = match spawn(spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                return ProcessOutcome {
                    state: ProcessState::failed(
                        ProcessErrorKind::FailedToStart,
                        format!("Process failed to start: {}", e),
                    ),
                    ..Default::default()
                };
            }
        };

        let start = Instant::now();
        let mut killed = false;
        let state = loop {
            match child.try_wait() {
                Ok(Some(status)) => break ProcessState::from_status(status),
                Ok(None) => {
                    if let Some(timeout) = spec.timeout {
                        if start.elapsed() > timeout {
                            kill_group(&mut child);
                            killed = true;
                            break ProcessState::failed(
                                ProcessErrorKind::TimedOut,
                                format!("Process timed out after {} ms", timeout.as_millis()),
                            );
                        }
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    kill_group(&mut child);
                    killed = true;
                    break ProcessState::failed(
                        ProcessErrorKind::Crashed,
                        format!("Failed to wait on process: {}", e),
                    );
                }
            }
        };

        // A killed child may have handed its pipes to something we could not
        // reach; don't wait on it forever
        let collect = |rx: Receiver<Vec<u8>>| {
            if killed {
                rx.recv_timeout(DRAIN_GRACE).unwrap_or_default()
            } else {
                rx.recv().unwrap_or_default()
            }
        };

        let outcome = ProcessOutcome {
            state,
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        tracing::trace!(program = %spec.display_name(), state = %outcome.state, "Process finished");
        outcome
    }
}
