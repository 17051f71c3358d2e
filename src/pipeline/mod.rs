//! Pipeline driver: archiver → optional cipher → pipe → uploader.
//!
//! The producer side (walk, tar, gzip, encryption) is synchronous and
//! runs on a blocking task writing into the pipe; the consumer side
//! (chunker, workers, completion) runs on the async runtime reading from
//! it. The sides only meet through the pipe: a producer failure reaches
//! the consumer as a read error, a consumer failure reaches the producer
//! as a broken pipe, and the cancellation token reaches both directly.

mod pipe;

pub use pipe::{pipe, PipeReader, PipeWriter};

use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::task;

use crate::archive::{resolve_includes, Archiver};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::constants::{
    BACKUP_TIMEOUT_SECS, CONTENT_TYPE_ENCRYPTED, CONTENT_TYPE_GZIP, COPY_BUFFER_SIZE,
};
use crate::crypto::{self, StreamEncryptor};
use crate::progress::Reporter;
use crate::storage::{check_storage_class, StorageBackend, StorageClass, UploadOptions};
use crate::uploader::Uploader;

/// Run one backup: pack the includes, optionally encrypt, and upload as a
/// single object. Returns the object name.
///
/// In dry-run mode the producer stream is drained to EOF and no upload is
/// opened.
pub async fn run_backup(
    backend: Arc<dyn StorageBackend>,
    config: &Config,
    includes: &[String],
    object_name: Option<String>,
    dry_run: bool,
    reporter: Arc<dyn Reporter>,
    cancel: CancelToken,
) -> Result<String> {
    let started = Local::now();

    let includes = resolve_includes(includes).context("failed to resolve include paths")?;
    let archiver = Archiver::new(&includes, &config.backup.excludes)
        .context("failed to create archiver")?;

    let storage_class = StorageClass::parse(&config.storage.storage_class)?;
    check_storage_class(backend.as_ref(), storage_class)?;

    let encryptor = if config.encryption.enabled {
        Some(create_encryptor(config)?)
    } else {
        None
    };

    let object_name = object_name.unwrap_or_else(|| {
        let mut name = format!("backup-{}.tar.gz", started.format("%Y%m%d-%H%M%S"));
        if encryptor.is_some() {
            name.push_str(".enc");
        }
        name
    });

    let total = archiver.total_size()?;
    info!(
        "Backing up {} include path(s), ~{} MB of file data, as {}",
        includes.len(),
        total / 1024 / 1024,
        object_name
    );

    // The whole run observes one cancellation token; the end-to-end
    // timeout fires through the same signal.
    let watchdog = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(BACKUP_TIMEOUT_SECS)).await;
            warn!("Backup timed out, cancelling");
            cancel.cancel();
        })
    };

    let (pipe_writer, pipe_reader) = pipe();

    let producer = {
        let cancel = cancel.clone();
        task::spawn_blocking(move || {
            produce_archive(archiver, encryptor, pipe_writer, &cancel)
        })
    };

    let consumer = async {
        if dry_run {
            drain_stream(pipe_reader, &cancel).await
        } else {
            let opts = UploadOptions {
                storage_class: Some(storage_class),
                content_type: Some(
                    if config.encryption.enabled {
                        CONTENT_TYPE_ENCRYPTED
                    } else {
                        CONTENT_TYPE_GZIP
                    }
                    .to_string(),
                ),
                ..Default::default()
            };
            let mut uploader = Uploader::new(
                Arc::clone(&backend),
                config.backup.chunk_size as usize,
                config.backup.concurrency,
            );
            uploader.set_reporter(Arc::clone(&reporter));
            uploader
                .upload(&object_name, pipe_reader, opts, &cancel)
                .await
        }
    };

    let (producer_result, consumer_result) = tokio::join!(producer, consumer);
    watchdog.abort();

    // The first failure wins in either direction: a producer failure
    // travels through the pipe into the consumer error, and a consumer
    // failure triggers the cancellation token so the producer unwinds at
    // its next suspension point instead of archiving to completion. The
    // consumer error therefore carries the full story.
    consumer_result?;
    match producer_result {
        Ok(result) => result?,
        Err(err) => return Err(anyhow!(err).context("archive producer panicked")),
    }

    if dry_run {
        info!("Dry run complete, nothing uploaded");
    } else {
        info!("Backup succeeded: {}", object_name);
    }
    Ok(object_name)
}

/// Producer body: archive (and encrypt) into the pipe, then seal it.
/// Every failure is pushed into the pipe so the consumer cannot mistake
/// it for a complete stream.
fn produce_archive(
    archiver: Archiver,
    encryptor: Option<StreamEncryptor>,
    pipe_writer: PipeWriter,
    cancel: &CancelToken,
) -> Result<()> {
    let mut pipe_writer = pipe_writer;

    let result = (|| -> Result<()> {
        match &encryptor {
            Some(encryptor) => {
                let mut writer = encryptor
                    .wrap_writer(&mut pipe_writer)
                    .context("failed to create encrypt writer")?;
                archiver.archive(&mut writer, cancel)?;
                writer
                    .finish()
                    .context("failed to finalize encrypted container")?;
            }
            None => {
                archiver.archive(&mut pipe_writer, cancel)?;
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            pipe_writer.finish();
            Ok(())
        }
        Err(err) => {
            pipe_writer.fail(format!("archive producer failed: {:#}", err));
            Err(err)
        }
    }
}

/// Dry run: read the producer stream to EOF without opening any upload.
async fn drain_stream(mut reader: PipeReader, cancel: &CancelToken) -> Result<()> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return Err(CancelToken::error()),
            read = reader.read(&mut buffer) => read.context("failed to read data")?,
        };
        if read == 0 {
            break;
        }
        total += read as u64;
    }

    info!("Dry run produced {} bytes", total);
    Ok(())
}

/// Build the stream encryptor from the configured secret: a key file when
/// given, otherwise the password.
fn create_encryptor(config: &Config) -> Result<StreamEncryptor> {
    let (aes_key, hmac_key) = if !config.encryption.key_file.is_empty() {
        let key_data = fs::read(&config.encryption.key_file).with_context(|| {
            format!("failed to read key file {}", config.encryption.key_file)
        })?;
        crypto::derive_key_from_key_file(&key_data)?
    } else {
        let password = config.password();
        crypto::derive_key_from_password(&password)?
    };

    StreamEncryptor::new(&aes_key, &hmac_key)
}

/// Write a fresh random key file, usable as `encryption.key_file`.
pub fn write_key_file(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("refusing to overwrite existing key file {}", path.display());
    }

    let key_data = crypto::generate_key_file();
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create key file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .context("failed to restrict key file permissions")?;
    }

    file.write_all(&key_data)
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    Ok(())
}
