//! Object-storage backends.
//!
//! The uploader only ever talks to storage through [`ObjectBackend`]. Three
//! implementations ship with the crate:
//!
//! - [`MemoryBackend`] keeps everything in process memory and can inject
//!   faults; used by tests and `--backend memory`.
//! - [`LocalBackend`] stores payloads on local disk with SQLite metadata.
//! - [`S3Backend`] forwards to an S3-compatible service through `aws-sdk-s3`.

use crate::models::{CompletedPart, ListingPage, MultipartSession, ObjectDownload};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

pub mod local;
pub mod memory;
pub mod s3;

pub use local::LocalBackend;
pub use memory::{Fault, MemoryBackend};
pub use s3::S3Backend;

/// Conventional ceiling on parts per multipart upload for S3-like services.
pub const MAX_PARTS_PER_UPLOAD: u32 = 10_000;

/// Smallest part S3-like services accept for every part but the last (5 MiB).
pub const MIN_PART_SIZE_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("multipart upload `{0}` does not exist")]
    NoSuchSession(String),
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => BackendError::Transient(err.to_string()),
            _ => BackendError::Permanent(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                BackendError::Transient(err.to_string())
            }
            other => BackendError::Permanent(other.to_string()),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// The storage service the uploader drives.
///
/// Every method is a single remote call. Implementations must make an object
/// visible at its key only after `put_object` or `complete_multipart`
/// succeeds, and `abort_multipart` must release every staged part.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> BackendResult<()>;

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<MultipartSession>;

    /// Upload one part and return its entity tag.
    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        bytes: Bytes,
    ) -> BackendResult<String>;

    /// `parts` is ordered by ascending part number.
    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> BackendResult<()>;

    async fn abort_multipart(&self, session: &MultipartSession) -> BackendResult<()>;

    /// Open an object for streaming. Fails with `NotFound` if absent.
    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectDownload>;

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> BackendResult<ListingPage>;

    /// Remove an object. Backends may report a missing key either way.
    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()>;

    /// Cheap connectivity check used by readiness probes.
    async fn probe(&self, bucket: &str) -> BackendResult<()>;

    /// Address a client can fetch the object from directly, when the
    /// backend has one.
    fn object_url(&self, _bucket: &str, _key: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let timed_out = BackendError::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(timed_out.is_transient());
        let denied =
            BackendError::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(!denied.is_transient());
    }

    #[test]
    fn part_limits_allow_large_objects() {
        const _: () = assert!(MAX_PARTS_PER_UPLOAD as u64 * MIN_PART_SIZE_BYTES > 48 << 30);
        assert_eq!(MIN_PART_SIZE_BYTES, 5_242_880);
    }
}
