//! Caller-facing operations on the configured bucket.
//!
//! `FileService` is what handlers and library users hold: it owns the
//! coordinator for uploads and talks to the backend directly for downloads
//! and deletes, which are single calls with no retry.

use crate::{
    backend::ObjectBackend,
    config::{ConfigError, TransferConfig},
    errors::TransferError,
    models::{ObjectDownload, ObjectKey, UploadRequest},
    services::{
        archive::{self, BundleEntry},
        listing::ListingEnumerator,
        transfer::TransferCoordinator,
        validation::Scanner,
    },
};
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

#[derive(Clone)]
pub struct FileService {
    backend: Arc<dyn ObjectBackend>,
    coordinator: Arc<TransferCoordinator>,
    listing: ListingEnumerator,
    bucket: String,
}

impl FileService {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        bucket: impl Into<String>,
        transfer: TransferConfig,
        scanner: Arc<dyn Scanner>,
        max_list_pages: usize,
    ) -> Result<Self, ConfigError> {
        transfer.validate()?;
        let bucket = bucket.into();
        Ok(Self {
            coordinator: Arc::new(TransferCoordinator::new(
                backend.clone(),
                bucket.clone(),
                transfer,
                scanner,
            )),
            listing: ListingEnumerator::new(backend.clone(), bucket.clone(), max_list_pages),
            backend,
            bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn upload(&self, request: UploadRequest<'_>) -> Result<ObjectKey, TransferError> {
        self.coordinator.transfer(request).await
    }

    pub async fn upload_with_cancel(
        &self,
        request: UploadRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<ObjectKey, TransferError> {
        self.coordinator.transfer_with_cancel(request, cancel).await
    }

    /// Keys in the bucket; see [`ListingEnumerator::list`].
    pub fn list(&self) -> BoxStream<'static, Result<ObjectKey, TransferError>> {
        self.listing.list()
    }

    /// Open `key` for streaming. Not retried.
    pub async fn download(&self, key: &str) -> Result<ObjectDownload, TransferError> {
        debug!(key, bucket = %self.bucket, "opening object");
        Ok(self.backend.get_object(&self.bucket, key).await?)
    }

    /// Remove `key`. A key that does not exist counts as deleted, whatever
    /// the backend reports for it.
    pub async fn delete(&self, key: &str) -> Result<(), TransferError> {
        match self.backend.delete_object(&self.bucket, key).await {
            Ok(()) => {
                info!(key, bucket = %self.bucket, "object deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(key, bucket = %self.bucket, "delete of missing object");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Zip `entries` and upload the archive as one object named
    /// `archive_name`.
    pub async fn bundle_and_upload(
        &self,
        archive_name: &str,
        entries: Vec<BundleEntry>,
    ) -> Result<ObjectKey, TransferError> {
        let count = entries.len();
        let request = UploadRequest::new(archive_name, archive::bundle(entries))
            .with_content_type(ARCHIVE_CONTENT_TYPE);
        match self.coordinator.transfer(request).await {
            Ok(key) => {
                info!(key = %key, entries = count, "bundle uploaded");
                Ok(key)
            }
            Err(TransferError::Source(err)) => Err(TransferError::Archive(err.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Direct URL of `key`, for backends that expose one.
    pub fn object_url(&self, key: &ObjectKey) -> Option<String> {
        self.backend.object_url(&self.bucket, key.as_str())
    }

    /// Readiness of the backend for this bucket.
    pub async fn probe(&self) -> Result<(), TransferError> {
        Ok(self.backend.probe(&self.bucket).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BackendError, Fault, MemoryBackend, memory::Call},
        services::validation::ValidationGate,
    };
    use bytes::Bytes;
    use futures::{StreamExt, TryStreamExt, stream};
    use std::io;

    fn service(backend: Arc<MemoryBackend>) -> FileService {
        FileService::new(
            backend,
            "uploads",
            TransferConfig::default(),
            Arc::new(ValidationGate::new(["virus", ".exe"])),
            100,
        )
        .unwrap()
    }

    fn body(data: &'static [u8]) -> crate::models::ByteStream<'static> {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    #[test]
    fn invalid_transfer_config_is_refused() {
        let cfg = TransferConfig {
            max_part_attempts: 0,
            ..TransferConfig::default()
        };
        let result = FileService::new(
            Arc::new(MemoryBackend::new()),
            "uploads",
            cfg,
            Arc::new(ValidationGate::new(Vec::<String>::new())),
            10,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn upload_then_download_and_list() {
        let backend = Arc::new(MemoryBackend::new());
        let files = service(backend.clone());

        let key = files
            .upload(UploadRequest::new("notes.txt", body(b"hello")).with_content_type("text/plain"))
            .await
            .unwrap();

        let download = files.download(key.as_str()).await.unwrap();
        assert_eq!(download.content_type.as_deref(), Some("text/plain"));
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");

        let keys: Vec<ObjectKey> = files.list().try_collect().await.unwrap();
        assert_eq!(keys, vec![key]);
    }

    #[tokio::test]
    async fn missing_download_is_not_found() {
        let files = service(Arc::new(MemoryBackend::new()));
        let err = files.download("nope").await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(ref key) if key == "nope"));
    }

    #[tokio::test]
    async fn download_failure_is_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("uploads", "1_flaky.bin", Bytes::from_static(b"data"));
        backend.inject(Fault::Get(BackendError::Transient("connection reset".into())));
        let files = service(backend.clone());

        let err = files.download("1_flaky.bin").await.unwrap_err();
        assert!(matches!(err, TransferError::TransientBackend(_)));
        let gets = backend
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Get { .. }))
            .count();
        assert_eq!(gets, 1);
    }

    #[test]
    fn object_url_comes_from_backend() {
        let files = service(Arc::new(
            MemoryBackend::new().with_public_base("https://cdn.example"),
        ));
        assert_eq!(
            files.object_url(&ObjectKey::new("7_a.txt")).as_deref(),
            Some("https://cdn.example/uploads/7_a.txt")
        );
    }

    #[tokio::test]
    async fn delete_twice_succeeds() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed("uploads", "1_a.txt", "x");
        let files = service(backend.clone());

        files.delete("1_a.txt").await.unwrap();
        files.delete("1_a.txt").await.unwrap();
        assert!(!backend.contains("uploads", "1_a.txt"));
        let deletes = backend
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Delete { .. }))
            .count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn bundle_is_uploaded_as_zip() {
        let backend = Arc::new(MemoryBackend::new());
        let files = service(backend.clone());

        let key = files
            .bundle_and_upload(
                "docs.zip",
                vec![
                    BundleEntry::new("a.txt", body(b"aaa")),
                    BundleEntry::new("b.txt", body(b"bbb")),
                ],
            )
            .await
            .unwrap();

        assert!(key.as_str().ends_with("_docs.zip"));
        let download = files.download(key.as_str()).await.unwrap();
        assert_eq!(download.content_type.as_deref(), Some(ARCHIVE_CONTENT_TYPE));
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(&chunks.concat()[..4], b"PK\x03\x04");
    }

    #[tokio::test]
    async fn broken_bundle_input_is_an_archive_error() {
        let backend = Arc::new(MemoryBackend::new());
        let files = service(backend.clone());

        let broken: Vec<io::Result<Bytes>> =
            vec![Err(io::Error::other("read failed"))];
        let err = files
            .bundle_and_upload(
                "broken.zip",
                vec![BundleEntry::new("x.txt", stream::iter(broken).boxed())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Archive(_)));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn probe_reports_ready_backend() {
        let files = service(Arc::new(MemoryBackend::new()));
        files.probe().await.unwrap();
    }
}
