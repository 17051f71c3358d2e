//! Command-line interface definitions and argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "s3backup", about = "Streaming backups to S3-compatible object storage")]
pub struct Args {
    /// Path to configuration YAML file
    #[clap(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pack the given paths and upload them as one object
    Backup(BackupOpts),

    /// Generate a random 96-byte encryption key file
    GenerateKey {
        /// Where to write the key file
        #[clap(default_value = "s3backup.key")]
        path: PathBuf,
    },

    /// Write a commented default configuration file
    InitConfig {
        /// Where to write the configuration
        #[clap(default_value = ".s3backup.yaml")]
        path: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
pub struct BackupOpts {
    /// Paths to back up; wildcards are expanded
    #[clap(required = true)]
    pub paths: Vec<String>,

    /// Storage provider (aws/qiniu/aliyun)
    #[clap(short, long)]
    pub provider: Option<String>,

    /// Bucket name
    #[clap(short, long)]
    pub bucket: Option<String>,

    /// Custom endpoint; empty uses the provider default
    #[clap(long)]
    pub endpoint: Option<String>,

    /// Region (required for aws and aliyun)
    #[clap(long)]
    pub region: Option<String>,

    /// Access key (also S3BACKUP_ACCESS_KEY)
    #[clap(long)]
    pub access_key: Option<String>,

    /// Secret key (also S3BACKUP_SECRET_KEY)
    #[clap(long)]
    pub secret_key: Option<String>,

    /// Storage class (standard/ia/archive/deep_archive/glacier_ir/intelligent_tiering)
    #[clap(short, long)]
    pub storage_class: Option<String>,

    /// Encrypt the archive before uploading
    #[clap(short, long)]
    pub encrypt: bool,

    /// Encryption password (also S3BACKUP_ENCRYPT_PASSWORD)
    #[clap(long)]
    pub password: Option<String>,

    /// 96-byte key file, alternative to a password
    #[clap(long)]
    pub key_file: Option<PathBuf>,

    /// Exclude glob pattern (may be repeated)
    #[clap(long = "exclude")]
    pub excludes: Vec<String>,

    /// Object name (default: backup-{timestamp}.tar.gz[.enc])
    #[clap(short, long)]
    pub name: Option<String>,

    /// Concurrent part uploads
    #[clap(long)]
    pub concurrency: Option<usize>,

    /// Part size in bytes (minimum 5MB)
    #[clap(long)]
    pub chunk_size: Option<u64>,

    /// Produce the archive stream but upload nothing
    #[clap(long)]
    pub dry_run: bool,
}
