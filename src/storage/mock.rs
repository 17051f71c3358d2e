//! In-memory storage backend used by the uploader and pipeline test
//! suites.
//!
//! Records every protocol call, can inject failures at each step, and
//! tracks peak in-flight part bytes so tests can check the uploader's
//! memory ceiling.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::storage::{CompletedPart, StorageBackend, StorageClass, UploadOptions};

const SUPPORTED_CLASSES: &[StorageClass] = &[
    StorageClass::Standard,
    StorageClass::Ia,
    StorageClass::Archive,
    StorageClass::DeepArchive,
];

#[derive(Default)]
struct State {
    upload_id: Option<String>,
    parts: Vec<(i64, Vec<u8>)>,
    completed: Option<Vec<CompletedPart>>,
    last_options: Option<UploadOptions>,
    storage_class_calls: Vec<(String, StorageClass)>,
}

#[derive(Default)]
pub struct MockBackend {
    fail_init: bool,
    fail_part: Option<i64>,
    fail_complete: bool,
    part_delay: Option<Duration>,

    init_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    abort_calls: AtomicUsize,
    in_flight_bytes: AtomicI64,
    max_in_flight_bytes: AtomicI64,
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `init_multipart_upload`.
    pub fn with_fail_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Fail the upload of the given part number.
    pub fn with_fail_part(mut self, part_number: i64) -> Self {
        self.fail_part = Some(part_number);
        self
    }

    /// Fail `complete_multipart_upload`.
    pub fn with_fail_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    /// Delay each part upload, useful for cancellation tests.
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = Some(delay);
        self
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    /// Number of parts that were uploaded successfully.
    pub fn uploaded_parts(&self) -> usize {
        self.state.lock().unwrap().parts.len()
    }

    /// Sizes of uploaded parts, ordered by part number.
    pub fn part_sizes(&self) -> Vec<usize> {
        let mut state = self.state.lock().unwrap();
        state.parts.sort_by_key(|(n, _)| *n);
        state.parts.iter().map(|(_, d)| d.len()).collect()
    }

    /// The part list passed to a successful complete call, if any.
    pub fn completed_parts(&self) -> Option<Vec<CompletedPart>> {
        self.state.lock().unwrap().completed.clone()
    }

    /// The options passed to the most recent init call.
    pub fn last_options(&self) -> Option<UploadOptions> {
        self.state.lock().unwrap().last_options.clone()
    }

    pub fn storage_class_calls(&self) -> Vec<(String, StorageClass)> {
        self.state.lock().unwrap().storage_class_calls.clone()
    }

    /// The object as the store would assemble it: all uploaded parts
    /// concatenated in part-number order.
    pub fn object_bytes(&self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        state.parts.sort_by_key(|(n, _)| *n);
        let mut bytes = Vec::new();
        for (_, data) in &state.parts {
            bytes.extend_from_slice(data);
        }
        bytes
    }

    /// Peak bytes concurrently inside `upload_part` calls.
    pub fn max_in_flight_bytes(&self) -> i64 {
        self.max_in_flight_bytes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    async fn init_multipart_upload(&self, _key: &str, opts: &UploadOptions) -> Result<String> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            bail!("mock: init multipart upload failed");
        }
        let upload_id = "mock-upload-id".to_string();
        let mut state = self.state.lock().unwrap();
        state.upload_id = Some(upload_id.clone());
        state.last_options = Some(opts.clone());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i64,
        data: &[u8],
    ) -> Result<String> {
        let size = data.len() as i64;
        self.in_flight_bytes.fetch_add(size, Ordering::SeqCst);
        self.max_in_flight_bytes
            .fetch_max(self.in_flight_bytes.load(Ordering::SeqCst), Ordering::SeqCst);

        let result = async {
            if let Some(delay) = self.part_delay {
                tokio::time::sleep(delay).await;
            }
            if upload_id != "mock-upload-id" {
                bail!("mock: unknown upload id {}", upload_id);
            }
            if self.fail_part == Some(part_number) {
                return Err(anyhow!("mock: upload part failed"));
            }
            self.state
                .lock()
                .unwrap()
                .parts
                .push((part_number, data.to_vec()));
            Ok(format!("etag-{}", part_number))
        }
        .await;

        self.in_flight_bytes.fetch_sub(size, Ordering::SeqCst);
        result
    }

    async fn complete_multipart_upload(
        &self,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_complete {
            bail!("mock: complete multipart upload failed");
        }
        if upload_id != "mock-upload-id" {
            bail!("mock: unknown upload id {}", upload_id);
        }
        self.state.lock().unwrap().completed = Some(parts.to_vec());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, _upload_id: &str) -> Result<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supported_storage_classes(&self) -> &'static [StorageClass] {
        SUPPORTED_CLASSES
    }

    async fn set_storage_class(&self, key: &str, class: StorageClass) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .storage_class_calls
            .push((key.to_string(), class));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_protocol_calls() {
        let backend = MockBackend::new();
        let id = backend
            .init_multipart_upload("key", &UploadOptions::default())
            .await
            .unwrap();

        let etag = backend.upload_part("key", &id, 1, b"data").await.unwrap();
        assert_eq!(etag, "etag-1");

        let parts = vec![CompletedPart {
            part_number: 1,
            etag,
        }];
        backend
            .complete_multipart_upload("key", &id, &parts)
            .await
            .unwrap();

        assert_eq!(backend.init_calls(), 1);
        assert_eq!(backend.uploaded_parts(), 1);
        assert_eq!(backend.completed_parts().unwrap(), parts);
        assert_eq!(backend.object_bytes(), b"data");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MockBackend::new().with_fail_init();
        assert!(backend
            .init_multipart_upload("key", &UploadOptions::default())
            .await
            .is_err());

        let backend = MockBackend::new().with_fail_part(2);
        let id = backend
            .init_multipart_upload("key", &UploadOptions::default())
            .await
            .unwrap();
        assert!(backend.upload_part("key", &id, 1, b"ok").await.is_ok());
        assert!(backend.upload_part("key", &id, 2, b"no").await.is_err());
    }

    #[tokio::test]
    async fn test_set_storage_class_recorded() {
        let backend = MockBackend::new();
        backend
            .set_storage_class("key", StorageClass::Archive)
            .await
            .unwrap();
        assert_eq!(
            backend.storage_class_calls(),
            vec![("key".to_string(), StorageClass::Archive)]
        );
    }

    #[tokio::test]
    async fn test_object_bytes_in_part_order() {
        let backend = MockBackend::new();
        let id = backend
            .init_multipart_upload("key", &UploadOptions::default())
            .await
            .unwrap();
        backend.upload_part("key", &id, 2, b"world").await.unwrap();
        backend.upload_part("key", &id, 1, b"hello ").await.unwrap();
        assert_eq!(backend.object_bytes(), b"hello world");
    }
}
