//! Captured output buffers and the final process result.

use std::sync::{Arc, Mutex};

use crate::process::EXIT_CODE_NOT_STARTED;

/// Identifies which stream of the child a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Thread-safe accumulators for stdout, stderr and their arrival-order merge.
///
/// The combined buffer always holds the union, in arrival order, of every
/// line appended to either stream buffer. Appends lock the combined buffer
/// first and the stream-specific buffer second; all writers keep this
/// nesting order.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    combined: Mutex<String>,
}

impl CapturedOutput {
    /// Create an empty, shareable output buffer set.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append one fully-read line to the combined buffer and to its stream's
    /// buffer.
    pub fn append_line(&self, stream: StreamKind, line: &str) {
        let mut combined = self.combined.lock().unwrap();
        let mut buffer = match stream {
            StreamKind::Stdout => self.stdout.lock().unwrap(),
            StreamKind::Stderr => self.stderr.lock().unwrap(),
        };
        combined.push_str(line);
        combined.push('\n');
        buffer.push_str(line);
        buffer.push('\n');
    }

    /// Snapshot of the stdout captured so far.
    pub fn stdout(&self) -> String {
        self.stdout.lock().unwrap().clone()
    }

    /// Snapshot of the stderr captured so far.
    pub fn stderr(&self) -> String {
        self.stderr.lock().unwrap().clone()
    }

    /// Snapshot of the interleaved stdout/stderr captured so far.
    pub fn combined(&self) -> String {
        self.combined.lock().unwrap().clone()
    }
}

/// Terminal immutable snapshot of a finished (or failed-to-start) run.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Exit code of the process, or [`EXIT_CODE_NOT_STARTED`] when the
    /// process could not be launched at all.
    pub exit_code: i32,
    /// Everything the process wrote to stdout.
    pub stdout: String,
    /// Everything the process wrote to stderr.
    pub stderr: String,
    /// Stdout and stderr merged in arrival order.
    pub combined: String,
    /// Why the process could not be started, if it never ran.
    pub start_failure: Option<String>,
}

impl ProcessResult {
    /// Result for a process the OS refused to create.
    pub(crate) fn from_start_failure(err: &crate::prelude::Error) -> Self {
        Self {
            exit_code: EXIT_CODE_NOT_STARTED,
            stdout: String::new(),
            stderr: String::new(),
            combined: String::new(),
            start_failure: Some(err.to_string()),
        }
    }

    /// True when the process started and exited with code zero.
    pub fn success(&self) -> bool {
        self.start_failure.is_none() && self.exit_code == 0
    }
}
