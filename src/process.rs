//! Low-level async process management utilities.

use std::{
    io,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::process::{Child, Command};
use tracing::warn;

/// Sentinel exit code meaning "the process was never actually started".
pub const EXIT_CODE_NOT_STARTED: i32 = i32::MIN;

/// How long each kill attempt waits for the OS to confirm the death.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Current status of a running process.
pub enum ProcessStatus {
    /// Process has completed with exit status.
    Done(ExitStatus),
    /// Process is still running.
    Running,
}

/// Spawn a new async process with piped stdout and stderr.
///
/// The child never inherits the parent's console: stdout and stderr are
/// always piped, stdin is piped only when `pipe_stdin` is set and closed
/// otherwise. Environment overrides are applied on top of the inherited
/// environment.
///
/// # Examples
///
/// ```rust
/// use procio::process::spawn_process;
///
/// #[tokio::main]
/// async fn main() {
///     let mut child = spawn_process("echo", &["Hello".to_string()], &[], false).unwrap();
///     let output = child.stdout.take().unwrap();
/// }
/// ```
pub fn spawn_process(
    cmd: &str,
    args: &[String],
    envs: &[(String, String)],
    pipe_stdin: bool,
) -> Result<Child, io::Error> {
    Command::new(cmd)
        .args(args)
        .envs(envs.iter().map(|(name, value)| (name.as_str(), value.as_str())))
        .stdin(if pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Check process status without blocking.
///
/// # Examples
///
/// ```rust
/// use procio::process::{spawn_process, poll_status, ProcessStatus};
///
/// #[tokio::main]
/// async fn main() {
///     let mut child = spawn_process("echo", &["done".to_string()], &[], false).unwrap();
///     loop {
///         match poll_status(&mut child).unwrap() {
///             ProcessStatus::Done(status) => {
///                 assert!(status.success());
///                 break;
///             }
///             ProcessStatus::Running => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
///         }
///     }
/// }
/// ```
pub fn poll_status(child: &mut Child) -> Result<ProcessStatus, io::Error> {
    match child.try_wait()? {
        Some(status) => Ok(ProcessStatus::Done(status)),
        None => Ok(ProcessStatus::Running),
    }
}

/// Map an exit status to a plain exit code.
///
/// A process killed by a signal has no code; it is reported as `-1`.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Forcibly terminate a child process and wait until the OS confirms it is
/// gone.
///
/// A single kill request does not always end the process immediately, so the
/// kill is retried after each bounded wait until the exit is observed.
/// Kill failures are ignored; an already-dead process is an acceptable
/// terminal state.
///
/// # Examples
///
/// ```rust
/// use procio::process::{spawn_process, kill_and_reap};
///
/// #[tokio::main]
/// async fn main() {
///     let mut child = spawn_process("sleep", &["60".to_string()], &[], false).unwrap();
///     let status = kill_and_reap(&mut child).await.unwrap();
///     assert!(!status.success());
/// }
/// ```
pub async fn kill_and_reap(child: &mut Child) -> Result<ExitStatus, io::Error> {
    loop {
        let _ = child.start_kill();
        match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                warn!(pid = ?child.id(), "process survived kill request, retrying");
            }
        }
    }
}
