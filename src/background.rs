//! Event-driven background process.
//!
//! [`BackgroundProcess`] is built for long-running children: instead of
//! buffering, every output line is delivered to subscribed observers as it
//! arrives, the child's stdin is writable and the exit is reported as an
//! event. Within one stream the line order is preserved; across the two
//! streams no ordering is guaranteed, because the two reader units feed the
//! observers independently.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    output::StreamKind,
    prelude::*,
    process::{self, EXIT_CODE_NOT_STARTED, ProcessStatus},
    reader,
};

/// How often the exit watcher probes the child for termination.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often a wait loop probes the caller's cancellation callback.
const WAIT_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// One line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    /// Stream the line was read from.
    pub stream: StreamKind,
    /// Line content without the trailing newline.
    pub text: String,
}

/// Process termination notice, emitted exactly once per lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    /// Exit code of the process.
    pub exit_code: i32,
}

/// A failure encountered while draining a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEvent {
    /// Stream whose reader failed.
    pub stream: StreamKind,
    /// Description of the failure.
    pub message: String,
}

/// Events delivered to background-process observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout or stderr.
    Line(LineEvent),
    /// The process exited. Suppressed when the owner closes the process.
    Exited(ExitEvent),
    /// A stream reader failed; at most one per stream.
    ReadFailed(ExceptionEvent),
}

/// Registered observers; each gets its own unbounded event channel.
#[derive(Debug, Default)]
struct Observers {
    senders: Mutex<Vec<mpsc::UnboundedSender<ProcessEvent>>>,
}

impl Observers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    /// Deliver to every live observer, dropping the ones that went away.
    fn emit(&self, event: ProcessEvent) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle and exit bookkeeping, one-way Created -> Running -> Terminated.
#[derive(Debug)]
struct ProcState {
    /// Present while the process handle is owned here; taken exactly once
    /// by whichever path terminates the lifecycle.
    child: Option<Child>,
    exit_code: Option<i32>,
    /// Set once the exit has been notified or suppressed.
    exit_handled: bool,
}

/// State shared between the owner, the reader units and the exit watcher.
#[derive(Debug)]
struct Shared {
    state: Mutex<ProcState>,
    stdout_done: watch::Receiver<bool>,
    stderr_done: watch::Receiver<bool>,
}

impl Shared {
    /// Idempotent exit gate.
    ///
    /// Emits the exit event once the process has died and both readers have
    /// drained. All notification paths (exit watcher, reader end-of-stream,
    /// reader failure) funnel through this one guard, so the event fires
    /// exactly once. Returns `true` when the lifecycle is terminal and no
    /// further probing is needed.
    fn try_notify_exit(&self, observers: &Observers) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.exit_handled {
            return true;
        }
        if !(*self.stdout_done.borrow() && *self.stderr_done.borrow()) {
            return false;
        }

        let status = match state.child.as_mut() {
            None => {
                state.exit_handled = true;
                return true;
            }
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status),
                Ok(None) => return false,
                Err(err) => {
                    warn!(error = %err, "could not query child status");
                    None
                }
            },
        };

        let exit_code = status.map(process::exit_code_of).unwrap_or(-1);
        state.exit_handled = true;
        state.exit_code = Some(exit_code);
        state.child = None;
        drop(state);

        debug!(exit_code, "background process exited");
        observers.emit(ProcessEvent::Exited(ExitEvent { exit_code }));
        true
    }
}

/// Runtime state that only exists once the process has been launched.
struct Inner {
    shared: Arc<Shared>,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
}

/// A long-lived child process observed through line, exit and failure
/// events.
///
/// # Examples
///
/// ```rust
/// use procio::background::{BackgroundProcess, ProcessEvent};
///
/// #[tokio::main]
/// async fn main() {
///     let mut process = BackgroundProcess::new("echo", vec!["hello"]);
///     let mut events = process.subscribe();
///     process.start().unwrap();
///     process.wait(Some(std::time::Duration::from_secs(5))).await.unwrap();
///
///     match events.recv().await.unwrap() {
///         ProcessEvent::Line(line) => assert_eq!(line.text, "hello"),
///         other => panic!("unexpected event: {other:?}"),
///     }
/// }
/// ```
pub struct BackgroundProcess {
    /// Command to execute.
    command: String,
    /// Command line arguments.
    args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment.
    envs: Vec<(String, String)>,
    observers: Arc<Observers>,
    inner: Option<Inner>,
}

impl BackgroundProcess {
    /// Create a new background process description without starting it.
    pub fn new(command: impl Into<String>, args: Vec<impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(|a| a.into()).collect(),
            envs: Vec::new(),
            observers: Arc::new(Observers::default()),
            inner: None,
        }
    }

    /// Create a new background process description with just a command.
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

    /// Register an observer.
    ///
    /// Any number of observers may subscribe, before or after `start`; each
    /// receives every event from the moment of registration. Per-stream
    /// line order is preserved within one observer, delivery order across
    /// observers is unspecified. Observer code runs on the observer's own
    /// task and should not block for long.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        self.observers.subscribe()
    }

    /// Launch the process with full stdin/stdout/stderr redirection.
    ///
    /// Spawns the two reader units and the exit watcher. Fails with
    /// [`Error::AlreadyStarted`] when called more than once on the same
    /// instance and with [`Error::Spawn`] when the OS cannot create the
    /// process.
    pub fn start(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let mut child = process::spawn_process(&self.command, &self.args, &self.envs, true)
            .map_err(|source| Error::Spawn {
                command: self.full_command(),
                source,
            })?;
        info!(command = %self.full_command(), pid = ?child.id(), "background process started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout_done_tx, stdout_done) = watch::channel(false);
        let (stderr_done_tx, stderr_done) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(ProcState {
                child: Some(child),
                exit_code: None,
                exit_handled: false,
            }),
            stdout_done,
            stderr_done,
        });

        let mut readers = Vec::new();
        match stdout {
            Some(stream) => readers.push(self.spawn_event_reader(
                StreamKind::Stdout,
                stream,
                stdout_done_tx,
                shared.clone(),
            )),
            None => {
                let _ = stdout_done_tx.send(true);
            }
        }
        match stderr {
            Some(stream) => readers.push(self.spawn_event_reader(
                StreamKind::Stderr,
                stream,
                stderr_done_tx,
                shared.clone(),
            )),
            None => {
                let _ = stderr_done_tx.send(true);
            }
        }

        tokio::spawn(Self::watch_exit(shared.clone(), self.observers.clone()));

        self.inner = Some(Inner {
            shared,
            stdin,
            readers,
        });
        Ok(())
    }

    /// Spawn one reader unit that emits line events and feeds the exit gate
    /// when its stream ends.
    fn spawn_event_reader<R>(
        &self,
        kind: StreamKind,
        stream: R,
        done: watch::Sender<bool>,
        shared: Arc<Shared>,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let observers = self.observers.clone();
        tokio::spawn(async move {
            let line_observers = observers.clone();
            let result = reader::drain_lines(stream, move |text| {
                line_observers.emit(ProcessEvent::Line(LineEvent { stream: kind, text }));
            })
            .await;

            if let Err(err) = result {
                debug!(stream = ?kind, error = %err, "stream read failed");
                observers.emit(ProcessEvent::ReadFailed(ExceptionEvent {
                    stream: kind,
                    message: err.to_string(),
                }));
            }
            let _ = done.send(true);
            shared.try_notify_exit(&observers);
        })
    }

    /// Probe the child at a short interval until the exit has been notified
    /// or suppressed.
    async fn watch_exit(shared: Arc<Shared>, observers: Arc<Observers>) {
        loop {
            if shared.try_notify_exit(&observers) {
                return;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Write raw text to the child's stdin.
    ///
    /// Unlike the reader paths, failures here surface directly to the
    /// caller.
    pub async fn write(&mut self, text: &str) -> Result<()> {
        let stdin = self.stdin_mut()?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Write one line (text plus newline) to the child's stdin.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        let stdin = self.stdin_mut()?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn stdin_mut(&mut self) -> Result<&mut ChildStdin> {
        let inner = self.inner.as_mut().ok_or(Error::NotStarted)?;
        inner.stdin.as_mut().ok_or_else(|| {
            Error::IO(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ))
        })
    }

    /// Wait until both stream readers have completed.
    ///
    /// Returns `Ok(false)` when the timeout elapses first; `None` waits
    /// indefinitely.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.wait_with(timeout, || false, false).await
    }

    /// Wait until both stream readers have completed, with a cooperative
    /// cancellation probe.
    ///
    /// The wait wakes immediately once both readers are done. `poll` is
    /// invoked roughly every millisecond; returning `true` stops the wait
    /// early with `Ok(false)`. The probe must not block. On timeout the
    /// call either returns `Ok(false)` or fails with
    /// [`Error::WaitTimeout`], per `error_on_timeout`.
    pub async fn wait_with<F>(
        &mut self,
        timeout: Option<Duration>,
        mut poll: F,
        error_on_timeout: bool,
    ) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        let inner = self.inner.as_ref().ok_or(Error::NotStarted)?;
        let mut stdout_done = inner.shared.stdout_done.clone();
        let mut stderr_done = inner.shared.stderr_done.clone();

        let deadline = timeout.map(|bound| tokio::time::Instant::now() + bound);
        let mut probe = tokio::time::interval(WAIT_PROBE_INTERVAL);

        let drained = async move {
            let _ = stdout_done.wait_for(|done| *done).await;
            let _ = stderr_done.wait_for(|done| *done).await;
        };
        tokio::pin!(drained);

        loop {
            let until_deadline = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut drained => return Ok(true),
                _ = until_deadline => {
                    return if error_on_timeout {
                        Err(Error::WaitTimeout(timeout.unwrap_or_default()))
                    } else {
                        Ok(false)
                    };
                }
                _ = probe.tick() => {
                    if poll() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Exit code, once the process has been observed to exit or was closed.
    pub fn exit_code(&self) -> Option<i32> {
        let inner = self.inner.as_ref()?;
        let state = inner.shared.state.lock().unwrap();
        state.exit_code
    }

    /// Tear the process down.
    ///
    /// Suppresses the exit event (an owner-initiated close is not an
    /// externally interesting exit), kills the process if it is still alive
    /// (failures ignored), waits for both reader units and returns the exit
    /// code. Repeated calls return the recorded code, or
    /// [`EXIT_CODE_NOT_STARTED`] when the handle was already gone.
    pub async fn close(&mut self) -> Result<i32> {
        let inner = self.inner.as_mut().ok_or(Error::NotStarted)?;

        // Claim the handle and mark the exit handled in one step so neither
        // the watcher nor a reader can emit an exit event from here on.
        let child = {
            let mut state = inner.shared.state.lock().unwrap();
            state.exit_handled = true;
            state.child.take()
        };

        // Closing stdin unblocks children reading from it.
        drop(inner.stdin.take());

        let exit_code = match child {
            Some(mut child) => {
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "kill failed, process already gone");
                }
                match child.wait().await {
                    Ok(status) => process::exit_code_of(status),
                    Err(err) => {
                        warn!(error = %err, "failed to reap closed process");
                        EXIT_CODE_NOT_STARTED
                    }
                }
            }
            None => {
                let state = inner.shared.state.lock().unwrap();
                state.exit_code.unwrap_or(EXIT_CODE_NOT_STARTED)
            }
        };

        {
            let mut state = inner.shared.state.lock().unwrap();
            state.exit_code.get_or_insert(exit_code);
        }

        for handle in inner.readers.drain(..) {
            let _ = handle.await;
        }
        Ok(exit_code)
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        let mut state = inner.shared.state.lock().unwrap();
        match state.child.as_mut().map(process::poll_status) {
            Some(Ok(ProcessStatus::Running)) => true,
            Some(Ok(ProcessStatus::Done(_))) | Some(Err(_)) | None => false,
        }
    }
}
