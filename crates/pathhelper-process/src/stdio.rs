//! Stdio routing for child processes
//!
//! Each stream of a [`Process`](crate::Process) is routed independently.
//! Streams that need copying (in-memory capture, arbitrary readers/writers)
//! get a forwarding task spawned at start; `wait()` joins those tasks so all
//! output is in place once the process is reported finished.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;

/// Where a child's stdin comes from
#[derive(Default)]
pub enum Input {
    /// Empty input (`/dev/null`)
    #[default]
    Null,
    /// Share the caller's stdin
    Inherit,
    /// Pipe, taken with [`Process::take_stdin`](crate::Process::take_stdin)
    Piped,
    /// Written to the child, then closed
    Bytes(Vec<u8>),
    /// Copied to the child until EOF, then closed
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// An OS handle passed through as-is
    Stdio(Stdio),
}

/// Where a child's stdout or stderr goes
#[derive(Default)]
pub enum Output {
    /// Discarded (`/dev/null`)
    #[default]
    Null,
    /// Share the caller's stream
    Inherit,
    /// Pipe, taken with [`Process::take_stdout`](crate::Process::take_stdout)
    /// or [`Process::take_stderr`](crate::Process::take_stderr)
    Piped,
    /// Accumulated in memory
    Capture(CaptureBuffer),
    /// Copied into any async writer
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    /// An OS handle passed through as-is
    Stdio(Stdio),
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Inherit => f.write_str("Inherit"),
            Self::Piped => f.write_str("Piped"),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Reader(_) => f.write_str("Reader"),
            Self::Stdio(_) => f.write_str("Stdio"),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Inherit => f.write_str("Inherit"),
            Self::Piped => f.write_str("Piped"),
            Self::Capture(buffer) => f.debug_tuple("Capture").field(&buffer.len()).finish(),
            Self::Writer(_) => f.write_str("Writer"),
            Self::Stdio(_) => f.write_str("Stdio"),
        }
    }
}

pub(crate) enum Feed {
    Bytes(Vec<u8>),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

pub(crate) type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle of a spawned copy task
pub(crate) type Forwarder = JoinHandle<io::Result<()>>;

impl Input {
    pub(crate) fn into_parts(self) -> (Stdio, Option<Feed>) {
        match self {
            Self::Null => (Stdio::null(), None),
            Self::Inherit => (Stdio::inherit(), None),
            Self::Piped => (Stdio::piped(), None),
            Self::Bytes(bytes) => (Stdio::piped(), Some(Feed::Bytes(bytes))),
            Self::Reader(reader) => (Stdio::piped(), Some(Feed::Reader(reader))),
            Self::Stdio(stdio) => (stdio, None),
        }
    }
}

impl Output {
    pub(crate) fn into_parts(self) -> (Stdio, Option<Sink>) {
        match self {
            Self::Null => (Stdio::null(), None),
            Self::Inherit => (Stdio::inherit(), None),
            Self::Piped => (Stdio::piped(), None),
            Self::Capture(buffer) => (Stdio::piped(), Some(Box::new(buffer))),
            Self::Writer(writer) => (Stdio::piped(), Some(writer)),
            Self::Stdio(stdio) => (stdio, None),
        }
    }
}

/// Shared, growable in-memory byte buffer
///
/// There is no size cap: a chatty process grows it without bound.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes captured so far
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Take the captured bytes, leaving the buffer empty
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock())
    }

    /// Number of bytes captured
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing was captured
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Write `feed` into the child's stdin, then close it
pub(crate) fn feed_stdin(mut stdin: ChildStdin, feed: Feed) -> Forwarder {
    tokio::spawn(async move {
        let fed = match feed {
            Feed::Bytes(bytes) => stdin.write_all(&bytes).await,
            Feed::Reader(mut reader) => tokio::io::copy(&mut reader, &mut stdin).await.map(|_| ()),
        };
        // a child may exit without reading all of its input
        match fed {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    })
}

/// Copy a child's output stream into `sink` until EOF
pub(crate) fn drain<R>(mut reader: R, mut sink: Sink) -> Forwarder
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        tokio::io::copy(&mut reader, &mut sink).await?;
        sink.flush().await
    })
}
