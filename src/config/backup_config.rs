//! YAML configuration with environment-variable fallbacks.
//!
//! Lookup order for the file: an explicit `--config` path, then
//! `.s3backup.yaml` in the working directory, `$HOME/.s3backup.yaml`,
//! and `$HOME/.config/s3backup/config.yaml`. A missing file is not an
//! error; defaults apply. Credentials and the encryption password fall
//! back to `S3BACKUP_`-prefixed environment variables so they can stay
//! out of the file. CLI flags override file values; validation runs
//! before any network I/O.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, S3_MIN_PART_SIZE};
use crate::storage::StorageClass;

const ENV_ACCESS_KEY: &str = "S3BACKUP_ACCESS_KEY";
const ENV_SECRET_KEY: &str = "S3BACKUP_SECRET_KEY";
const ENV_PASSWORD: &str = "S3BACKUP_ENCRYPT_PASSWORD";

const CONFIG_FILE_NAME: &str = ".s3backup.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// aws, qiniu or aliyun
    pub provider: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub storage_class: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Password the keys are derived from
    pub password: String,
    /// Alternative to a password: a 96-byte key file
    pub key_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Part size in bytes, at least 5MB
    pub chunk_size: u64,
    /// Concurrent part-upload workers
    pub concurrency: usize,
}

impl Config {
    /// Load the configuration file, fill defaults and return the result.
    ///
    /// With an explicit path a missing or malformed file is an error;
    /// otherwise the default locations are tried and absence simply means
    /// default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_yaml::from_str(&text)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => match Self::find_default_file() {
                Some(path) => {
                    debug!("Loading config from {}", path.display());
                    let text = fs::read_to_string(&path).with_context(|| {
                        format!("failed to read config file {}", path.display())
                    })?;
                    serde_yaml::from_str(&text).with_context(|| {
                        format!("failed to parse config file {}", path.display())
                    })?
                }
                None => Config::default(),
            },
        };

        config.apply_defaults();
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Ok(home) = env::var("HOME") {
            candidates.push(Path::new(&home).join(CONFIG_FILE_NAME));
            candidates.push(
                Path::new(&home)
                    .join(".config")
                    .join("s3backup")
                    .join("config.yaml"),
            );
        }
        candidates.into_iter().find(|p| p.is_file())
    }

    /// Fill in defaults for everything left unset.
    pub fn apply_defaults(&mut self) {
        if self.storage.provider.is_empty() {
            self.storage.provider = "aws".to_string();
        }
        if self.storage.region.is_empty() {
            self.storage.region = "us-east-1".to_string();
        }
        if self.storage.storage_class.is_empty() {
            self.storage.storage_class = "standard".to_string();
        }
        if self.backup.chunk_size == 0 {
            self.backup.chunk_size = DEFAULT_CHUNK_SIZE as u64;
        }
        if self.backup.concurrency == 0 {
            self.backup.concurrency = DEFAULT_CONCURRENCY;
        }
    }

    /// Access key from the config file or the environment.
    pub fn access_key(&self) -> String {
        if !self.storage.access_key.is_empty() {
            self.storage.access_key.clone()
        } else {
            env::var(ENV_ACCESS_KEY).unwrap_or_default()
        }
    }

    /// Secret key from the config file or the environment.
    pub fn secret_key(&self) -> String {
        if !self.storage.secret_key.is_empty() {
            self.storage.secret_key.clone()
        } else {
            env::var(ENV_SECRET_KEY).unwrap_or_default()
        }
    }

    /// Encryption password from the config file or the environment.
    pub fn password(&self) -> String {
        if !self.encryption.password.is_empty() {
            self.encryption.password.clone()
        } else {
            env::var(ENV_PASSWORD).unwrap_or_default()
        }
    }

    /// Check everything that can be checked before network I/O.
    pub fn validate(&self) -> Result<()> {
        match self.storage.provider.to_lowercase().as_str() {
            "aws" | "qiniu" | "aliyun" => {}
            other => bail!("unsupported provider: {}", other),
        }

        if self.storage.bucket.is_empty() {
            bail!("storage bucket is required");
        }
        if self.access_key().is_empty() {
            bail!("storage access_key is required (config or {})", ENV_ACCESS_KEY);
        }
        if self.secret_key().is_empty() {
            bail!("storage secret_key is required (config or {})", ENV_SECRET_KEY);
        }

        let provider = self.storage.provider.to_lowercase();
        if (provider == "aws" || provider == "aliyun") && self.storage.region.is_empty() {
            bail!("region is required for provider {}", provider);
        }

        StorageClass::parse(&self.storage.storage_class)
            .context("invalid storage_class in config")?;

        if (self.backup.chunk_size as usize) < S3_MIN_PART_SIZE {
            bail!(
                "chunk_size must be at least {} bytes, got {}",
                S3_MIN_PART_SIZE,
                self.backup.chunk_size
            );
        }

        if self.encryption.enabled && self.password().is_empty() && self.encryption.key_file.is_empty()
        {
            bail!("encryption password or key_file is required when encryption is enabled");
        }

        Ok(())
    }
}

/// The commented template written by `init-config`.
pub fn default_config_yaml() -> &'static str {
    r#"# s3backup configuration
storage:
  # aws, qiniu or aliyun
  provider: aws
  # Custom endpoint, e.g. for S3-compatible services. Empty uses the
  # provider default.
  endpoint: ""
  region: us-east-1
  bucket: ""
  # Credentials may also come from S3BACKUP_ACCESS_KEY /
  # S3BACKUP_SECRET_KEY environment variables.
  access_key: ""
  secret_key: ""
  # standard, ia, archive, deep_archive, glacier_ir, intelligent_tiering
  storage_class: standard

encryption:
  enabled: false
  # Password may also come from S3BACKUP_ENCRYPT_PASSWORD.
  password: ""
  # Alternative to a password: a 96-byte key file (see `s3backup generate-key`).
  key_file: ""

backup:
  includes: []
  excludes: []
  # Part size in bytes; minimum 5242880 (5MB)
  chunk_size: 5242880
  concurrency: 4
"#
}
