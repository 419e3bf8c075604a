//! Error types for process capture and control.

use std::time::Duration;

/// Process capture errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The instance was already started; restarting is not supported.
    #[error("process already started")]
    AlreadyStarted,

    /// The operation requires a started process.
    #[error("process was never started")]
    NotStarted,

    /// The OS refused to create the process.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Full command line that failed to launch.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A wait deadline elapsed and the caller asked for an error.
    #[error("timed out after {0:?} waiting for process")]
    WaitTimeout(Duration),

    /// I/O operation failed.
    #[error(transparent)]
    IO(#[from] std::io::Error),
}
