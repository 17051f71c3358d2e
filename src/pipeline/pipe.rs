//! Bounded in-memory byte pipe between the blocking archive producer and
//! the async upload consumer.
//!
//! The write half is a synchronous `io::Write` that blocks when the
//! buffer is full; the read half is a tokio `AsyncRead`. EOF is observed
//! exactly when the producer calls [`PipeWriter::finish`]; a producer
//! failure travels through the pipe as a read error so the consumer can
//! never mistake a dead producer for a complete stream.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::constants::{PIPE_BUFFER_CHUNKS, PIPE_CHUNK_SIZE};

/// Create a connected pipe. The writer must be used from a blocking
/// context (`spawn_blocking` or a plain thread).
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_BUFFER_CHUNKS);
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            current: Bytes::new(),
        },
    )
}

pub struct PipeWriter {
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
}

impl PipeWriter {
    /// Close the write end cleanly. The reader drains buffered bytes and
    /// then observes EOF.
    pub fn finish(mut self) {
        self.tx.take();
    }

    /// Propagate a producer failure. The reader observes it as an I/O
    /// error after draining buffered bytes.
    pub fn fail(mut self, message: String) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, message)));
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer is closed"))?;

        let n = buf.len().min(PIPE_CHUNK_SIZE);
        tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
            .map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader was dropped")
            })?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        // A writer dropped without finish() means the producer died
        // without sealing the stream; the reader must see an error, not
        // EOF.
        if let Some(tx) = self.tx.take() {
            let _ = tx.blocking_send(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive producer terminated unexpectedly",
            )));
        }
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                let bytes = self.current.split_to(n);
                buf.put_slice(&bytes);
                return Poll::Ready(Ok(()));
            }

            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.current = bytes,
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                // Sender dropped after finish(): clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
