//! Line-oriented stream draining.
//!
//! One reader unit owns exactly one stream and runs on its own task, so a
//! blocking read on one stream never stalls draining of the other.

use std::io;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::watch,
    task::JoinHandle,
};
use tracing::debug;

use crate::output::StreamKind;

/// Read complete lines from `stream` until end-of-stream, forwarding each
/// one to `sink`.
///
/// End-of-stream ends the loop normally. An I/O failure ends the loop and is
/// returned exactly once; it is never raised on another task.
pub(crate) async fn drain_lines<R, F>(stream: R, mut sink: F) -> Result<(), io::Error>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        sink(line);
    }
    Ok(())
}

/// Spawn one reader unit draining `stream` into `sink`.
///
/// The completion flag flips exactly once, on normal or abnormal
/// termination; waiters watch it to know the stream is fully drained. Read
/// failures end the drain and are logged, not propagated.
pub(crate) fn spawn_reader<R, F>(
    kind: StreamKind,
    stream: R,
    sink: F,
    done: watch::Sender<bool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = drain_lines(stream, sink).await {
            debug!(stream = ?kind, error = %err, "stream read failed");
        }
        let _ = done.send(true);
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{AsyncRead, ReadBuf};

    /// Stream that yields one line and then fails with a broken pipe.
    #[derive(Default)]
    pub(crate) struct BrokenStream {
        line_fed: bool,
    }

    impl AsyncRead for BrokenStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if this.line_fed {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke")))
            } else {
                this.line_fed = true;
                buf.put_slice(b"partial\n");
                Poll::Ready(Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{testing::BrokenStream, *};

    #[tokio::test]
    async fn test_drain_lines_until_eof() {
        let data: &[u8] = b"alpha\nbeta\ngamma\n";
        let mut lines = Vec::new();

        drain_lines(data, |line| lines.push(line)).await.unwrap();

        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_drain_lines_keeps_last_unterminated_line() {
        let data: &[u8] = b"alpha\nbeta";
        let mut lines = Vec::new();

        drain_lines(data, |line| lines.push(line)).await.unwrap();

        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_spawn_reader_flips_done_flag() {
        let data: &[u8] = b"only\n";
        let (done_tx, mut done_rx) = watch::channel(false);

        let handle = spawn_reader(StreamKind::Stdout, data, |_| {}, done_tx);
        handle.await.unwrap();

        assert!(*done_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_read_failure_is_returned_once() {
        let mut lines = Vec::new();

        let err = drain_lines(BrokenStream::default(), |line| lines.push(line))
            .await
            .unwrap_err();

        // Everything read before the failure is delivered; the failure ends
        // the loop instead of being retried.
        assert_eq!(lines, vec!["partial"]);
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_spawn_reader_flips_done_flag_on_read_failure() {
        let (done_tx, mut done_rx) = watch::channel(false);

        let handle = spawn_reader(StreamKind::Stderr, BrokenStream::default(), |_| {}, done_tx);
        handle.await.unwrap();

        assert!(*done_rx.borrow_and_update());
    }
}
