//! Storage-backend abstraction over S3-compatible object stores.
//!
//! All providers speak the S3 multipart upload protocol; the differences
//! are credentials, endpoints and how the storage class is carried on the
//! create request. `StorageBackend` is the seam the uploader drives, and
//! [`MockBackend`] implements it in-memory for tests.

mod aliyun;
mod aws;
pub mod mock;
mod qiniu;
mod storage_class;

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;

pub use aliyun::AliyunBackend;
pub use aws::AwsBackend;
pub use mock::MockBackend;
pub use qiniu::QiniuBackend;
pub use storage_class::StorageClass;

/// Options applied when a multipart upload is created.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub storage_class: Option<StorageClass>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// A part that finished uploading, identified by its 1-based number and
/// the ETag the backend returned for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i64,
    pub etag: String,
}

/// Provider adapter implementing the S3 multipart upload protocol.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Start a multipart upload and return its opaque upload id.
    async fn init_multipart_upload(&self, key: &str, opts: &UploadOptions) -> Result<String>;

    /// Upload one part and return its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i64,
        data: &[u8],
    ) -> Result<String>;

    /// Finalize the upload. `parts` must be sorted ascending by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// Discard an in-flight upload. Idempotent, best-effort.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// The subset of the abstract storage-class set this backend honours.
    fn supported_storage_classes(&self) -> &'static [StorageClass];

    /// Change the class of an existing object via copy-in-place. Fallback
    /// for providers that ignore the class on the create request.
    async fn set_storage_class(&self, key: &str, class: StorageClass) -> Result<()>;
}

/// Rejects a requested storage class the backend does not support.
///
/// Called by the driver before any network I/O so that the AWS-only
/// classes never reach a provider that would silently ignore them.
pub fn check_storage_class(backend: &dyn StorageBackend, class: StorageClass) -> Result<()> {
    if backend.supported_storage_classes().contains(&class) {
        Ok(())
    } else {
        bail!("storage class {} is not supported by this provider", class)
    }
}

/// Normalize an endpoint so it always carries a scheme.
///
/// Surrounding whitespace is trimmed and `https://` is prepended unless a
/// case-insensitive `http://` or `https://` prefix already exists. The
/// original case of an existing prefix is preserved. Empty input stays
/// empty, meaning "use the provider default".
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return String::new();
    }
    let lower = endpoint.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint_adds_scheme() {
        assert_eq!(
            normalize_endpoint("s3.example.com"),
            "https://s3.example.com"
        );
    }

    #[test]
    fn test_normalize_endpoint_keeps_existing_scheme() {
        assert_eq!(
            normalize_endpoint("http://s3.example.com"),
            "http://s3.example.com"
        );
        assert_eq!(
            normalize_endpoint("https://s3.example.com"),
            "https://s3.example.com"
        );
    }

    #[test]
    fn test_normalize_endpoint_preserves_prefix_case() {
        // Case-insensitive detection, original spelling preserved.
        assert_eq!(normalize_endpoint("HTTP://host"), "HTTP://host");
        assert_eq!(normalize_endpoint("HttpS://host"), "HttpS://host");
    }

    #[test]
    fn test_normalize_endpoint_trims_whitespace() {
        assert_eq!(normalize_endpoint("  host.com  "), "https://host.com");
        assert_eq!(normalize_endpoint("\thttp://host\n"), "http://host");
    }

    #[test]
    fn test_normalize_endpoint_empty() {
        assert_eq!(normalize_endpoint(""), "");
        assert_eq!(normalize_endpoint("   "), "");
    }

    #[test]
    fn test_normalize_endpoint_idempotent() {
        for input in ["", "host", "http://host", "HTTPS://host", "  spaced  "] {
            let once = normalize_endpoint(input);
            assert_eq!(normalize_endpoint(&once), once);
        }
    }

    #[tokio::test]
    async fn test_check_storage_class() {
        let backend = MockBackend::new();
        assert!(check_storage_class(&backend, StorageClass::Standard).is_ok());
    }
}
