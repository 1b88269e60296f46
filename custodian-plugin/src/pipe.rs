//! In-memory byte pipe between a producing and a consuming operation.
//!
//! A plain duplex stream reports a clean EOF when the writer goes away, which
//! would let a consumer mistake a truncated stream for a complete one. The
//! writer here records whether the producer succeeded before closing, and the
//! reader turns EOF into an error unless it did.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

const PENDING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (w, r) = tokio::io::duplex(capacity);
    let state = Arc::new(AtomicU8::new(PENDING));
    (
        PipeWriter { inner: w, state: state.clone() },
        PipeReader { inner: r, state },
    )
}

pub struct PipeWriter {
    inner: DuplexStream,
    state: Arc<AtomicU8>,
}

impl PipeWriter {
    /// Records the producer outcome, then closes the pipe.
    pub fn finish(self, ok: bool) {
        self.state
            .store(if ok { SUCCEEDED } else { FAILED }, Ordering::Release);
        drop(self.inner);
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    // Closing is deferred to `finish` so the outcome is always visible first.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
}

pub struct PipeReader {
    inner: DuplexStream,
    state: Arc<AtomicU8>,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let eof = buf.filled().len() == before && buf.remaining() > 0;
        if eof && self.state.load(Ordering::Acquire) != SUCCEEDED {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "upstream producer failed before completing the stream",
            )));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_successful_stream_reads_to_eof() {
        let (mut w, mut r) = pipe(16);
        let writer = tokio::spawn(async move {
            w.write_all(b"hello, world, this is longer than the buffer").await.unwrap();
            w.shutdown().await.unwrap();
            w.finish(true);
        });
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, b"hello, world, this is longer than the buffer");
    }

    #[tokio::test]
    async fn test_failed_producer_surfaces_as_read_error() {
        let (mut w, mut r) = pipe(64);
        w.write_all(b"partial").await.unwrap();
        w.finish(false);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(out, b"partial");
    }

    #[tokio::test]
    async fn test_dropped_writer_is_a_failure() {
        let (w, mut r) = pipe(64);
        drop(w);
        let mut out = Vec::new();
        assert!(r.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_reader_unblocks_writer() {
        let (mut w, r) = pipe(4);
        drop(r);
        let err = w.write_all(b"more than four bytes").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
