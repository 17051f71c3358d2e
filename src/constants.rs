//! Global constants for the s3backup application.
//!
//! This module centralizes all hardcoded values to improve maintainability
//! and make configuration changes easier.

// Upload sizing constants
/// S3 minimum part size for multipart uploads (5MB)
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default chunk size for multipart uploads; also the canonical
/// buffer-pool block size
pub const DEFAULT_CHUNK_SIZE: usize = S3_MIN_PART_SIZE;

/// Default number of concurrent part-upload workers
pub const DEFAULT_CONCURRENCY: usize = 4;

/// S3 maximum parts per multipart upload
pub const S3_MAX_PARTS: i64 = 10_000;

// Pipe constants
/// Size of a single chunk travelling through the in-memory byte pipe (64KB)
pub const PIPE_CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks the in-memory byte pipe buffers before writes block
pub const PIPE_BUFFER_CHUNKS: usize = 16;

// Timeout constants
/// End-to-end timeout applied to a backup run (24 hours)
pub const BACKUP_TIMEOUT_SECS: u64 = 24 * 60 * 60;

// Buffer sizes
/// Scratch buffer size for stream copies (decryption, dry-run drain)
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

// Content types
/// Content-Type for plain tar.gz archives
pub const CONTENT_TYPE_GZIP: &str = "application/gzip";

/// Content-Type for encrypted archives
pub const CONTENT_TYPE_ENCRYPTED: &str = "application/octet-stream";

// Exit codes
/// Exit code for generic unrecoverable failures
pub const EXIT_FAILURE: i32 = 1;

/// Exit code for cancellation (user interrupt or timeout)
pub const EXIT_CANCELLED: i32 = 130;
