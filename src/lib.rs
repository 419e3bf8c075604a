//! Process execution and capture for line-oriented child processes.
//!
//! Launches an external process, drains its stdout and stderr concurrently
//! on two reader units so neither pipe can deadlock the other, and exposes
//! the output either as accumulated buffers ([`capture::CaptureRunner`])
//! or as live line events ([`background::BackgroundProcess`]) with stdin
//! access for long-running children.
//!
//! # Usage
//!
//! ```rust
//! use procio::capture::run;
//!
//! #[tokio::main]
//! async fn main() {
//!     // One-shot capture with a 5 second bound; a process that is still
//!     // alive when the bound elapses is killed.
//!     let result = run("echo", vec!["Hello, World!"], Vec::new(), 5000).await;
//!
//!     assert!(result.success());
//!     assert_eq!(result.stdout, "Hello, World!\n");
//!     assert_eq!(result.stderr, "");
//! }
//! ```

pub mod background;
pub mod capture;
pub mod error;
pub mod output;
pub mod prelude;
pub mod process;
mod reader;

pub use background::{BackgroundProcess, ExceptionEvent, ExitEvent, LineEvent, ProcessEvent};
pub use capture::{CaptureRunner, run};
pub use error::Error;
pub use output::{CapturedOutput, ProcessResult, StreamKind};
pub use process::EXIT_CODE_NOT_STARTED;
