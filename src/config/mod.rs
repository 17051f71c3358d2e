//! Configuration loading and validation.

mod backup_config;

pub use backup_config::{
    default_config_yaml, BackupConfig, Config, EncryptionConfig, StorageConfig,
};
