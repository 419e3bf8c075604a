//! One-shot process capture.
//!
//! [`CaptureRunner`] starts a process, drains stdout and stderr into
//! accumulating buffers on two reader units and lets the caller block on a
//! single wait-with-timeout call. The [`run`] convenience wrapper never
//! returns an error; every outcome, including a failure to start the process
//! at all, is folded into a [`ProcessResult`].

use std::{sync::Arc, time::Duration};

use tokio::{process::Child, sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    output::{CapturedOutput, ProcessResult, StreamKind},
    prelude::*,
    process::{self, EXIT_CODE_NOT_STARTED},
    reader,
};

/// Runtime state that only exists once the process has been launched.
struct Running {
    child: Child,
    exit_code: Option<i32>,
    stdout_done: watch::Receiver<bool>,
    stderr_done: watch::Receiver<bool>,
    readers: Vec<JoinHandle<()>>,
}

/// Captures the full output of one process run.
///
/// A runner owns exactly one OS process and cannot be restarted; create a
/// new runner for every run.
///
/// # Examples
///
/// ```rust
/// use procio::capture::CaptureRunner;
///
/// #[tokio::main]
/// async fn main() {
///     let mut runner = CaptureRunner::new("echo", vec!["hello"]);
///     runner.start().unwrap();
///     assert!(runner.wait_for_exit(5000).await.unwrap());
///     assert_eq!(runner.stdout(), "hello\n");
///     assert_eq!(runner.exit_code(), Some(0));
/// }
/// ```
pub struct CaptureRunner {
    /// Command to execute.
    command: String,
    /// Command line arguments.
    args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    envs: Vec<(String, String)>,
    output: Arc<CapturedOutput>,
    running: Option<Running>,
}

impl CaptureRunner {
    /// Create a new runner with command and arguments.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use procio::capture::CaptureRunner;
    ///
    /// let runner = CaptureRunner::new("ls", vec!["-la", "/tmp"]);
    /// ```
    pub fn new(command: impl Into<String>, args: Vec<impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(|a| a.into()).collect(),
            envs: Vec::new(),
            output: CapturedOutput::new(),
            running: None,
        }
    }

    /// Create a new runner with just a command (no arguments).
    pub fn new_without_args(command: impl Into<String>) -> Self {
        Self::new(command, Vec::<String>::new())
    }

    /// Add an environment override for the child process.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((name.into(), value.into()));
        self
    }

    /// Get the full command string with arguments.
    pub fn full_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", &self.command, &self.args.join(" "))
        }
    }

    /// Launch the process and the two stream reader units.
    ///
    /// Fails with [`Error::AlreadyStarted`] on a second call and with
    /// [`Error::Spawn`] when the OS cannot create the process.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let mut child = process::spawn_process(&self.command, &self.args, &self.envs, false)
            .map_err(|source| Error::Spawn {
                command: self.full_command(),
                source,
            })?;
        debug!(command = %self.full_command(), pid = ?child.id(), "process started");

        let (stdout_done_tx, stdout_done) = watch::channel(false);
        let (stderr_done_tx, stderr_done) = watch::channel(false);
        let mut readers = Vec::new();

        match child.stdout.take() {
            Some(stream) => {
                let output = self.output.clone();
                readers.push(reader::spawn_reader(
                    StreamKind::Stdout,
                    stream,
                    move |line| output.append_line(StreamKind::Stdout, &line),
                    stdout_done_tx,
                ));
            }
            None => {
                let _ = stdout_done_tx.send(true);
            }
        }
        match child.stderr.take() {
            Some(stream) => {
                let output = self.output.clone();
                readers.push(reader::spawn_reader(
                    StreamKind::Stderr,
                    stream,
                    move |line| output.append_line(StreamKind::Stderr, &line),
                    stderr_done_tx,
                ));
            }
            None => {
                let _ = stderr_done_tx.send(true);
            }
        }

        self.running = Some(Running {
            child,
            exit_code: None,
            stdout_done,
            stderr_done,
            readers,
        });
        Ok(())
    }

    /// Wait for the process to exit and both streams to drain.
    ///
    /// A `timeout_ms` of `0` waits indefinitely. With a positive bound the
    /// call returns `Ok(false)` as soon as the bound elapses while the
    /// process is still alive. When it returns `Ok(true)` the process has
    /// exited and nothing further will be appended to the output buffers.
    pub async fn wait_for_exit(&mut self, timeout_ms: u64) -> Result<bool> {
        let running = self.running.as_mut().ok_or(Error::NotStarted)?;

        if running.exit_code.is_none() {
            if timeout_ms > 0 {
                let bound = Duration::from_millis(timeout_ms);
                match tokio::time::timeout(bound, running.child.wait()).await {
                    Ok(status) => running.exit_code = Some(process::exit_code_of(status?)),
                    Err(_) => return Ok(false),
                }
            } else {
                let status = running.child.wait().await?;
                running.exit_code = Some(process::exit_code_of(status));
            }
        }

        // The process is gone, so both pipes hit end-of-stream promptly.
        let mut stdout_done = running.stdout_done.clone();
        let mut stderr_done = running.stderr_done.clone();
        let _ = stdout_done.wait_for(|done| *done).await;
        let _ = stderr_done.wait_for(|done| *done).await;
        Ok(true)
    }

    /// Forcibly terminate the process.
    ///
    /// The kill is retried with a bounded wait until the OS confirms the
    /// exit. Calling `kill` on an already-exited process is a no-op that
    /// returns the recorded exit code.
    pub async fn kill(&mut self) -> Result<i32> {
        let running = self.running.as_mut().ok_or(Error::NotStarted)?;

        if let Some(code) = running.exit_code {
            return Ok(code);
        }

        let status = process::kill_and_reap(&mut running.child).await?;
        let code = process::exit_code_of(status);
        running.exit_code = Some(code);

        // Killing closed the pipes; let the readers drain what is buffered.
        let mut stdout_done = running.stdout_done.clone();
        let mut stderr_done = running.stderr_done.clone();
        let _ = stdout_done.wait_for(|done| *done).await;
        let _ = stderr_done.wait_for(|done| *done).await;
        Ok(code)
    }

    /// Stdout captured so far; a partial snapshot while the process runs.
    pub fn stdout(&self) -> String {
        self.output.stdout()
    }

    /// Stderr captured so far; a partial snapshot while the process runs.
    pub fn stderr(&self) -> String {
        self.output.stderr()
    }

    /// Interleaved stdout/stderr captured so far, in arrival order.
    pub fn combined(&self) -> String {
        self.output.combined()
    }

    /// Exit code, available once the process has been observed to exit.
    pub fn exit_code(&self) -> Option<i32> {
        self.running.as_ref().and_then(|running| running.exit_code)
    }

    /// Consume the runner into a terminal result snapshot.
    ///
    /// A runner that was never started reports the
    /// [`EXIT_CODE_NOT_STARTED`] sentinel; a started process whose exit was
    /// never observed reports `-1`.
    pub fn into_result(mut self) -> ProcessResult {
        let exit_code = match self.running.as_mut() {
            None => EXIT_CODE_NOT_STARTED,
            Some(running) => {
                for handle in running.readers.drain(..) {
                    handle.abort();
                }
                running.exit_code.unwrap_or(-1)
            }
        };
        ProcessResult {
            exit_code,
            stdout: self.output.stdout(),
            stderr: self.output.stderr(),
            combined: self.output.combined(),
            start_failure: None,
        }
    }
}

/// Run a process to completion and always return a result, never an error.
///
/// Starts the process, waits up to `timeout_ms` (0 waits indefinitely),
/// kills the process if the bound elapsed and returns the captured output
/// snapshot. A start failure is returned inside the result with the
/// [`EXIT_CODE_NOT_STARTED`] sentinel rather than as an error.
///
/// # Examples
///
/// ```rust
/// use procio::capture::run;
///
/// #[tokio::main]
/// async fn main() {
///     let result = run("echo", vec!["hello"], Vec::new(), 5000).await;
///     assert!(result.success());
///     assert_eq!(result.stdout, "hello\n");
/// }
/// ```
pub async fn run(
    command: impl Into<String>,
    args: Vec<impl Into<String>>,
    envs: Vec<(String, String)>,
    timeout_ms: u64,
) -> ProcessResult {
    let mut runner = CaptureRunner::new(command, args);
    for (name, value) in envs {
        runner = runner.env(name, value);
    }

    if let Err(err) = runner.start() {
        warn!(error = %err, "process could not be started");
        return ProcessResult::from_start_failure(&err);
    }

    let finished = match runner.wait_for_exit(timeout_ms).await {
        Ok(finished) => finished,
        Err(err) => {
            warn!(error = %err, "waiting for process failed");
            false
        }
    };
    if !finished {
        if let Err(err) = runner.kill().await {
            warn!(error = %err, "killing timed-out process failed");
        }
    }
    runner.into_result()
}
