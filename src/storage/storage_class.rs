//! Abstract storage-class tiers shared by all providers.
//!
//! Each backend translates these into its own concrete encoding at
//! init-upload time; the abstract set is a superset and backends advertise
//! the subset they honour via `supported_storage_classes`.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Service-defined durability/latency/cost tier for a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    Standard,
    /// Infrequent access
    Ia,
    Archive,
    DeepArchive,
    /// AWS-only: Glacier Instant Retrieval
    GlacierIr,
    /// AWS-only: Intelligent-Tiering
    IntelligentTiering,
}

impl StorageClass {
    /// Parse the user-facing spelling, case-insensitively.
    ///
    /// Unknown spellings are a configuration error rather than a silent
    /// fallback to standard.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(StorageClass::Standard),
            "ia" | "infrequent" | "infrequent_access" => Ok(StorageClass::Ia),
            "archive" => Ok(StorageClass::Archive),
            "deep_archive" => Ok(StorageClass::DeepArchive),
            "glacier_ir" => Ok(StorageClass::GlacierIr),
            "intelligent_tiering" | "intelligent" => Ok(StorageClass::IntelligentTiering),
            other => bail!("unknown storage class: {}", other),
        }
    }

    /// The canonical user-facing name.
    pub fn name(&self) -> &'static str {
        match self {
            StorageClass::Standard => "standard",
            StorageClass::Ia => "ia",
            StorageClass::Archive => "archive",
            StorageClass::DeepArchive => "deep_archive",
            StorageClass::GlacierIr => "glacier_ir",
            StorageClass::IntelligentTiering => "intelligent_tiering",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
