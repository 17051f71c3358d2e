//! AWS S3 backend.
//!
//! AWS is the reference implementation of the multipart protocol and the
//! only provider with a first-class storage-class field on the create
//! request.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use rusoto_core::{ByteStream, HttpClient, Region};
use rusoto_credential::StaticProvider;
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CopyObjectRequest, CreateMultipartUploadRequest, S3Client, UploadPartRequest, S3,
};

use crate::storage::{normalize_endpoint, CompletedPart, StorageBackend, StorageClass, UploadOptions};

const SUPPORTED_CLASSES: &[StorageClass] = &[
    StorageClass::Standard,
    StorageClass::Ia,
    StorageClass::Archive,
    StorageClass::DeepArchive,
    StorageClass::GlacierIr,
    StorageClass::IntelligentTiering,
];

/// Map an abstract class to the S3 StorageClass request value.
fn map_storage_class(class: StorageClass) -> &'static str {
    match class {
        StorageClass::Standard => "STANDARD",
        StorageClass::Ia => "STANDARD_IA",
        StorageClass::Archive => "GLACIER",
        StorageClass::DeepArchive => "DEEP_ARCHIVE",
        StorageClass::GlacierIr => "GLACIER_IR",
        StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
    }
}

pub struct AwsBackend {
    client: S3Client,
    bucket: String,
}

impl AwsBackend {
    /// Create an AWS S3 backend with static credentials.
    ///
    /// An empty endpoint uses the standard AWS endpoint for the region; a
    /// custom endpoint is normalized and used verbatim.
    pub fn new(
        region: &str,
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        let region = resolve_region(region, endpoint);
        let credentials =
            StaticProvider::new_minimal(access_key.to_string(), secret_key.to_string());
        let http = HttpClient::new().context("failed to create HTTP client")?;
        let client = S3Client::new_with(http, credentials, region);

        Ok(Self {
            client,
            bucket: bucket.to_string(),
        })
    }
}

/// Resolve the rusoto region, preferring a custom endpoint when given.
fn resolve_region(region: &str, endpoint: &str) -> Region {
    let endpoint = normalize_endpoint(endpoint);
    if !endpoint.is_empty() {
        return Region::Custom {
            name: if region.is_empty() {
                "us-east-1".to_string()
            } else {
                region.to_string()
            },
            endpoint,
        };
    }
    match region.parse::<Region>() {
        Ok(r) => r,
        Err(_) => {
            warn!("Invalid region '{}', using default", region);
            Region::default()
        }
    }
}

#[async_trait]
impl StorageBackend for AwsBackend {
    async fn init_multipart_upload(&self, key: &str, opts: &UploadOptions) -> Result<String> {
        let request = CreateMultipartUploadRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            storage_class: opts.storage_class.map(|c| map_storage_class(c).to_string()),
            content_type: opts.content_type.clone(),
            metadata: if opts.metadata.is_empty() {
                None
            } else {
                Some(opts.metadata.clone())
            },
            ..Default::default()
        };

        let result = self
            .client
            .create_multipart_upload(request)
            .await
            .context("failed to create multipart upload")?;

        let upload_id = result
            .upload_id
            .ok_or_else(|| anyhow!("no upload ID returned from S3"))?;

        debug!("Started multipart upload {} for {}", upload_id, key);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i64,
        data: &[u8],
    ) -> Result<String> {
        let request = UploadPartRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_number,
            content_length: Some(data.len() as i64),
            body: Some(ByteStream::from(data.to_vec())),
            ..Default::default()
        };

        let result = self
            .client
            .upload_part(request)
            .await
            .with_context(|| format!("upload of part {} was rejected", part_number))?;

        result
            .e_tag
            .ok_or_else(|| anyhow!("no ETag returned for part {}", part_number))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let completed = parts
            .iter()
            .map(|p| rusoto_s3::CompletedPart {
                e_tag: Some(p.etag.clone()),
                part_number: Some(p.part_number),
            })
            .collect();

        let request = CompleteMultipartUploadRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            multipart_upload: Some(CompletedMultipartUpload {
                parts: Some(completed),
            }),
            ..Default::default()
        };

        self.client
            .complete_multipart_upload(request)
            .await
            .context("complete request was rejected")?;

        debug!("Completed multipart upload for {}", key);
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let request = AbortMultipartUploadRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            ..Default::default()
        };

        self.client
            .abort_multipart_upload(request)
            .await
            .context("abort request was rejected")?;

        debug!("Aborted multipart upload for {}", key);
        Ok(())
    }

    fn supported_storage_classes(&self) -> &'static [StorageClass] {
        SUPPORTED_CLASSES
    }

    async fn set_storage_class(&self, key: &str, class: StorageClass) -> Result<()> {
        // S3 changes the class of an existing object via copy-in-place.
        let request = CopyObjectRequest {
            bucket: self.bucket.clone(),
            copy_source: format!("{}/{}", self.bucket, key),
            key: key.to_string(),
            storage_class: Some(map_storage_class(class).to_string()),
            metadata_directive: Some("REPLACE".to_string()),
            ..Default::default()
        };

        self.client
            .copy_object(request)
            .await
            .with_context(|| format!("failed to set storage class for {}", key))?;

        Ok(())
    }
}
