//! Aliyun OSS backend.
//!
//! OSS speaks the S3 protocol; the storage class travels in the
//! `x-oss-storage-class` header on the create request. The AWS-only
//! classes have no OSS equivalent and are not advertised.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use rusoto_core::{ByteStream, HttpClient, Region};
use rusoto_credential::StaticProvider;
use rusoto_s3::{
    AbortMultipartUploadRequest, CompleteMultipartUploadRequest, CompletedMultipartUpload,
    CopyObjectRequest, CreateMultipartUploadRequest, S3Client, UploadPartRequest, S3,
};

use crate::storage::{normalize_endpoint, CompletedPart, StorageBackend, StorageClass, UploadOptions};

/// Header OSS reads the storage class from at create time.
const STORAGE_CLASS_HEADER: &str = "x-oss-storage-class";

const SUPPORTED_CLASSES: &[StorageClass] = &[
    StorageClass::Standard,
    StorageClass::Ia,
    StorageClass::Archive,
    StorageClass::DeepArchive,
];

/// OSS storage types: Standard, IA, Archive, ColdArchive.
fn map_storage_class(class: StorageClass) -> &'static str {
    match class {
        StorageClass::Standard => "Standard",
        StorageClass::Ia => "IA",
        StorageClass::Archive => "Archive",
        StorageClass::DeepArchive => "ColdArchive",
        // No OSS equivalents; rejected by the caller before dispatch.
        StorageClass::GlacierIr | StorageClass::IntelligentTiering => "Standard",
    }
}

pub struct AliyunBackend {
    client: S3Client,
    bucket: String,
}

impl AliyunBackend {
    pub fn new(
        region: &str,
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self> {
        let endpoint = normalize_endpoint(endpoint);
        let region_name = if region.is_empty() {
            "oss-cn-hangzhou".to_string()
        } else {
            region.to_string()
        };
        let region = Region::Custom {
            endpoint: if endpoint.is_empty() {
                format!("https://{}.aliyuncs.com", region_name)
            } else {
                endpoint
            },
            name: region_name,
        };
        let credentials =
            StaticProvider::new_minimal(access_key.to_string(), secret_key.to_string());
        let http = HttpClient::new().context("failed to create HTTP client")?;
        let client = S3Client::new_with(http, credentials, region);

        Ok(Self {
            client,
            bucket: bucket.to_string(),
        })
    }

    fn metadata_for(&self, opts: &UploadOptions) -> Option<HashMap<String, String>> {
        let mut metadata = opts.metadata.clone();
        if let Some(class) = opts.storage_class {
            metadata.insert(
                STORAGE_CLASS_HEADER.to_string(),
                map_storage_class(class).to_string(),
            );
        }
        if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        }
    }
}

#[async_trait]
impl StorageBackend for AliyunBackend {
    async fn init_multipart_upload(&self, key: &str, opts: &UploadOptions) -> Result<String> {
        let request = CreateMultipartUploadRequest {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            content_type: opts.content_type.clone(),
            metadata: self.metadata_for(opts),
            ..Default::default()
        };

        let result = self
            .client
            .create_multipart_upload(request)
            .await
            .context("failed to create multipart upload")?;

        let upload_id = result
            .upload_id
            .ok_or_else(|| anyhow!("no upload ID returned from OSS"))?;

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
        let mut metadata = HashMap::new();
        metadata.insert(
            STORAGE_CLASS_HEADER.to_string(),
            map_storage_class(class).to_string(),
        );

        let request = CopyObjectRequest {
            bucket: self.bucket.clone(),
            copy_source: format!("{}/{}", self.bucket, key),
            key: key.to_string(),
            metadata: Some(metadata),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_storage_class_mapping() {
        assert_eq!(map_storage_class(StorageClass::Standard), "Standard");
        assert_eq!(map_storage_class(StorageClass::Ia), "IA");
        assert_eq!(map_storage_class(StorageClass::Archive), "Archive");
        assert_eq!(map_storage_class(StorageClass::DeepArchive), "ColdArchive");
    }

    #[test]
    fn test_storage_class_mapping_is_injective() {
        let mapped: HashSet<_> = SUPPORTED_CLASSES
            .iter()
            .map(|c| map_storage_class(*c))
            .collect();
        assert_eq!(mapped.len(), SUPPORTED_CLASSES.len());
    }

    #[test]
    fn test_aws_only_classes_not_supported() {
        assert!(!SUPPORTED_CLASSES.contains(&StorageClass::GlacierIr));
        assert!(!SUPPORTED_CLASSES.contains(&StorageClass::IntelligentTiering));
    }

    #[test]
    fn test_metadata_carries_class_header() {
        let backend = AliyunBackend::new("oss-cn-shanghai", "", "bucket", "ak", "sk").unwrap();
        let opts = UploadOptions {
            storage_class: Some(StorageClass::DeepArchive),
            ..Default::default()
        };
        let metadata = backend.metadata_for(&opts).unwrap();
        assert_eq!(metadata.get(STORAGE_CLASS_HEADER).unwrap(), "ColdArchive");
    }
}
