//! Drives one multipart upload from a byte source.
//!
//! A single reader loop cuts the source into fixed-size chunks and feeds
//! a bounded queue; worker tasks upload chunks concurrently and report
//! `(part number, ETag)` pairs back; the coordinator collects results,
//! sorts them and completes the upload. Any failure after init aborts the
//! upload exactly once. The first observed error wins; later ones are
//! dropped, and the cancellation token is triggered so the reader, the
//! remaining workers and the producer feeding the source all unwind.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, S3_MAX_PARTS, S3_MIN_PART_SIZE};
use crate::progress::{self, Reporter};
use crate::storage::{CompletedPart, StorageBackend, UploadOptions};
use crate::uploader::buffer::{get_buffer, put_buffer};

/// One chunk handed from the reader to the workers.
struct Chunk {
    part_number: i64,
    buffer: Vec<u8>,
    size: usize,
}

pub struct Uploader {
    backend: Arc<dyn StorageBackend>,
    chunk_size: usize,
    concurrency: usize,
    reporter: Arc<dyn Reporter>,
}

impl Uploader {
    /// Create an uploader. Zero inputs are clamped to the defaults and a
    /// chunk size below the S3 part minimum is raised to it.
    pub fn new(backend: Arc<dyn StorageBackend>, chunk_size: usize, concurrency: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else if chunk_size < S3_MIN_PART_SIZE {
            warn!(
                "Chunk size {} below the S3 minimum part size, using {}",
                chunk_size, S3_MIN_PART_SIZE
            );
            S3_MIN_PART_SIZE
        } else {
            chunk_size
        };
        let concurrency = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency
        };

        Self {
            backend,
            chunk_size,
            concurrency,
            reporter: progress::silent(),
        }
    }

    pub fn set_reporter(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporter = reporter;
    }

    /// Upload everything `source` yields as one object under `key`.
    ///
    /// On success the multipart upload is completed with the parts sorted
    /// by part number. On any failure after a successful init, `cancel`
    /// is triggered and the upload is aborted (best-effort) before the
    /// error is returned.
    pub async fn upload<R>(
        &self,
        key: &str,
        source: R,
        opts: UploadOptions,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        // The stream length is unknown: the source is compressed (and
        // possibly encrypted) on the fly.
        self.reporter.init(0);

        let result = self.run(key, source, opts, cancel).await;
        if result.is_err() {
            self.reporter.close();
        }
        result
    }

    async fn run<R>(
        &self,
        key: &str,
        source: R,
        opts: UploadOptions,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let upload_id = self
            .backend
            .init_multipart_upload(key, &opts)
            .await
            .context("failed to init multipart upload")?;
        debug!("Started multipart upload {} for {}", upload_id, key);

        // Chunks queue to the workers; results and the first error flow
        // back to the coordinator.
        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(self.concurrency * 2);
        let (result_tx, mut result_rx) = mpsc::channel::<CompletedPart>(self.concurrency);
        let (error_tx, mut error_rx) = mpsc::channel::<anyhow::Error>(1);
        let chunk_rx = Arc::new(Mutex::new(chunk_rx));

        let mut workers = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            workers.push(tokio::spawn(worker(
                Arc::clone(&self.backend),
                key.to_string(),
                upload_id.clone(),
                Arc::clone(&chunk_rx),
                result_tx.clone(),
                error_tx.clone(),
                Arc::clone(&self.reporter),
                cancel.clone(),
            )));
        }
        // The coordinator keeps no result/error senders of its own, so the
        // channels close once the workers and the reader are done.
        drop(result_tx);

        let reader = tokio::spawn(read_chunks(
            source,
            self.chunk_size,
            chunk_tx,
            error_tx,
            cancel.clone(),
        ));

        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut first_error: Option<anyhow::Error> = None;
        // The error channel closes when every sender is gone; that alone
        // is not a reason to stop draining results.
        let mut error_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    first_error = Some(CancelToken::error());
                    break;
                }
                err = error_rx.recv(), if error_open => {
                    match err {
                        Some(err) => {
                            first_error = Some(err);
                            break;
                        }
                        None => error_open = false,
                    }
                }
                result = result_rx.recv() => {
                    match result {
                        Some(part) => parts.push(part),
                        // All workers exited; the reader finished first.
                        None => break,
                    }
                }
            }
        }

        // The result channel can close before a pending error is observed;
        // the error slot is the source of truth.
        if first_error.is_none() {
            if let Ok(err) = error_rx.try_recv() {
                first_error = Some(err);
            }
        }

        if let Some(err) = first_error {
            // The first observed failure wins; cancelling stops the
            // reader, the remaining workers and the producer side before
            // the upload is torn down.
            cancel.cancel();
            self.abort(key, &upload_id).await;
            // A worker blocked on a full result channel only unblocks
            // when the receiver goes away.
            drop(result_rx);
            let _ = reader.await;
            join_workers(workers).await;
            return Err(err);
        }

        // Join the producer-side tasks before completing; they have all
        // signalled completion through the channels already.
        let _ = reader.await;
        join_workers(workers).await;

        parts.sort_by_key(|part| part.part_number);

        if let Err(err) = self
            .backend
            .complete_multipart_upload(key, &upload_id, &parts)
            .await
            .context("failed to complete multipart upload")
        {
            cancel.cancel();
            self.abort(key, &upload_id).await;
            return Err(err);
        }

        debug!(
            "Completed multipart upload {} for {} ({} parts)",
            upload_id,
            key,
            parts.len()
        );
        self.reporter.complete();
        self.reporter.close();
        Ok(())
    }

    /// Best-effort abort: failures are logged, not surfaced, so the
    /// original error stays visible.
    async fn abort(&self, key: &str, upload_id: &str) {
        if let Err(err) = self.backend.abort_multipart_upload(key, upload_id).await {
            warn!("Failed to abort multipart upload {}: {:#}", upload_id, err);
        } else {
            debug!("Aborted multipart upload {}", upload_id);
        }
    }
}

/// Reader loop: fill a pooled buffer to the brim (or EOF), assign the
/// next part number, hand it to the workers.
async fn read_chunks<R>(
    mut source: R,
    chunk_size: usize,
    chunk_tx: mpsc::Sender<Chunk>,
    error_tx: mpsc::Sender<anyhow::Error>,
    cancel: CancelToken,
) where
    R: AsyncRead + Unpin,
{
    let mut part_number: i64 = 0;

    loop {
        let mut buffer = get_buffer(chunk_size);

        let read_result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = read_full(&mut source, &mut buffer) => Some(result),
        };

        let size = match read_result {
            None => {
                put_buffer(buffer);
                return;
            }
            Some(Err(err)) => {
                put_buffer(buffer);
                let _ = error_tx.try_send(anyhow::Error::new(err).context("failed to read data"));
                return;
            }
            Some(Ok(0)) => {
                // Clean EOF; dropping the sender closes the queue.
                put_buffer(buffer);
                return;
            }
            Some(Ok(size)) => size,
        };

        part_number += 1;
        if part_number > S3_MAX_PARTS {
            let _ = error_tx.try_send(anyhow::anyhow!(
                "source exceeds {} parts at the configured chunk size",
                S3_MAX_PARTS
            ));
            return;
        }

        let chunk = Chunk {
            part_number,
            buffer,
            size,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = chunk_tx.send(chunk) => {
                if sent.is_err() {
                    // Workers are gone; the coordinator already has the error.
                    return;
                }
            }
        }
    }
}

/// Read until the buffer is full or the source reaches EOF.
async fn read_full<R>(source: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = source.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Worker: pull chunks off the shared queue and upload them until the
/// queue closes, an error occurs, or the run is cancelled.
#[allow(clippy::too_many_arguments)]
async fn worker(
    backend: Arc<dyn StorageBackend>,
    key: String,
    upload_id: String,
    chunk_rx: Arc<Mutex<mpsc::Receiver<Chunk>>>,
    result_tx: mpsc::Sender<CompletedPart>,
    error_tx: mpsc::Sender<anyhow::Error>,
    reporter: Arc<dyn Reporter>,
    cancel: CancelToken,
) {
    loop {
        let chunk = {
            let mut rx = chunk_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => return,
                },
            }
        };

        let result = {
            let upload =
                backend.upload_part(&key, &upload_id, chunk.part_number, &chunk.buffer[..chunk.size]);
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = upload => Some(result),
            }
        };
        let result = match result {
            Some(result) => result,
            None => {
                put_buffer(chunk.buffer);
                return;
            }
        };

        match result.with_context(|| format!("failed to upload part {}", chunk.part_number)) {
            Ok(etag) => {
                reporter.add(chunk.size as u64);
                put_buffer(chunk.buffer);
                let part = CompletedPart {
                    part_number: chunk.part_number,
                    etag,
                };
                if result_tx.send(part).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                put_buffer(chunk.buffer);
                let _ = error_tx.try_send(err);
                return;
            }
        }
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        let _ = worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockBackend;

    fn uploader_with(backend: Arc<MockBackend>, chunk_size: usize, concurrency: usize) -> Uploader {
        Uploader::new(backend, chunk_size, concurrency)
    }

    #[test]
    fn test_zero_inputs_are_clamped() {
        let backend = Arc::new(MockBackend::new());
        let uploader = uploader_with(backend, 0, 0);
        assert_eq!(uploader.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(uploader.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_small_chunk_size_raised_to_minimum() {
        let backend = Arc::new(MockBackend::new());
        let uploader = uploader_with(backend, 1024, 2);
        assert_eq!(uploader.chunk_size, S3_MIN_PART_SIZE);
    }

    #[tokio::test]
    async fn test_read_full_stops_at_eof() {
        let data = vec![1u8; 100];
        let mut source = &data[..];
        let mut buffer = vec![0u8; 64];
        assert_eq!(read_full(&mut source, &mut buffer).await.unwrap(), 64);
        let mut buffer = vec![0u8; 64];
        assert_eq!(read_full(&mut source, &mut buffer).await.unwrap(), 36);
        let mut buffer = vec![0u8; 64];
        assert_eq!(read_full(&mut source, &mut buffer).await.unwrap(), 0);
    }

}
