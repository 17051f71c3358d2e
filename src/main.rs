use std::fs;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};

use s3backup::cancel::{self, CancelToken};
use s3backup::cli::{Args, BackupOpts, Commands};
use s3backup::config::{default_config_yaml, Config};
use s3backup::constants::{EXIT_CANCELLED, EXIT_FAILURE};
use s3backup::pipeline;
use s3backup::progress::LogReporter;
use s3backup::storage::{AliyunBackend, AwsBackend, QiniuBackend, StorageBackend};

fn main() {
    let args = Args::parse();

    if let Err(err) = initialize_logging(args.verbose) {
        eprintln!("Failed to initialize logging: {:#}", err);
        process::exit(EXIT_FAILURE);
    }

    if let Err(err) = run(args) {
        error!("{:#}", err);
        if cancel::is_cancelled(&err) {
            process::exit(EXIT_CANCELLED);
        }
        process::exit(EXIT_FAILURE);
    }
}

fn initialize_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("failed to initialize logger")?;
    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Backup(opts) => {
            let mut config = Config::load(args.config.as_deref())?;
            apply_overrides(&mut config, &opts);
            config.validate().context("invalid config")?;
            run_backup(config, opts)
        }
        Commands::GenerateKey { path } => {
            pipeline::write_key_file(&path)?;
            info!("Wrote encryption key file to {}", path.display());
            Ok(())
        }
        Commands::InitConfig { path } => {
            if path.exists() {
                bail!("refusing to overwrite existing config {}", path.display());
            }
            fs::write(&path, default_config_yaml())
                .with_context(|| format!("failed to write config {}", path.display()))?;
            info!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

/// Command-line flags take precedence over the config file.
fn apply_overrides(config: &mut Config, opts: &BackupOpts) {
    if let Some(provider) = &opts.provider {
        config.storage.provider = provider.clone();
    }
    if let Some(bucket) = &opts.bucket {
        config.storage.bucket = bucket.clone();
    }
    if let Some(endpoint) = &opts.endpoint {
        config.storage.endpoint = endpoint.clone();
    }
    if let Some(region) = &opts.region {
        config.storage.region = region.clone();
    }
    if let Some(access_key) = &opts.access_key {
        config.storage.access_key = access_key.clone();
    }
    if let Some(secret_key) = &opts.secret_key {
        config.storage.secret_key = secret_key.clone();
    }
    if let Some(storage_class) = &opts.storage_class {
        config.storage.storage_class = storage_class.clone();
    }
    if opts.encrypt {
        config.encryption.enabled = true;
    }
    if let Some(password) = &opts.password {
        config.encryption.password = password.clone();
    }
    if let Some(key_file) = &opts.key_file {
        config.encryption.key_file = key_file.to_string_lossy().into_owned();
    }
    if !opts.excludes.is_empty() {
        config.backup.excludes = opts.excludes.clone();
    }
    if let Some(concurrency) = opts.concurrency {
        config.backup.concurrency = concurrency;
    }
    if let Some(chunk_size) = opts.chunk_size {
        config.backup.chunk_size = chunk_size;
    }
}

fn run_backup(config: Config, opts: BackupOpts) -> Result<()> {
    info!("Backup configuration:");
    info!("  provider: {}", config.storage.provider);
    info!("  bucket: {}", config.storage.bucket);
    info!("  storage class: {}", config.storage.storage_class);
    info!("  encryption: {}", config.encryption.enabled);
    info!("  concurrency: {}", config.backup.concurrency);
    info!("  chunk size: {} MB", config.backup.chunk_size / 1024 / 1024);

    let backend = create_backend(&config)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
    runtime.block_on(async {
        let cancel = CancelToken::new();

        // Ctrl-C cancels the run; the uploader aborts the in-flight
        // multipart upload before the error surfaces.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling backup");
                    cancel.cancel();
                }
            });
        }

        pipeline::run_backup(
            backend,
            &config,
            &opts.paths,
            opts.name.clone(),
            opts.dry_run,
            Arc::new(LogReporter::new()),
            cancel,
        )
        .await
    })?;

    Ok(())
}

fn create_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let access_key = config.access_key();
    let secret_key = config.secret_key();
    let storage = &config.storage;

    let backend: Arc<dyn StorageBackend> = match storage.provider.to_lowercase().as_str() {
        "aws" => Arc::new(AwsBackend::new(
            &storage.region,
            &storage.endpoint,
            &storage.bucket,
            &access_key,
            &secret_key,
        )?),
        "qiniu" => Arc::new(QiniuBackend::new(
            &storage.endpoint,
            &storage.bucket,
            &access_key,
            &secret_key,
        )?),
        "aliyun" => Arc::new(AliyunBackend::new(
            &storage.region,
            &storage.endpoint,
            &storage.bucket,
            &access_key,
            &secret_key,
        )?),
        other => bail!("unsupported provider: {}", other),
    };

    Ok(backend)
}
