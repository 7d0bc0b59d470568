//! Represents an object (file) on its way into, or out of, the bucket.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::{fmt, io};

/// A stream of byte chunks, as read from a caller or handed back on download.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Storage key of an object within the configured bucket.
///
/// Keys are produced by the key generator as `<timestamp>_<sanitized name>`
/// and are never reused within a process run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Wrap an existing key, e.g. one returned by a listing.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for ObjectKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A single upload submitted by a caller.
///
/// The caller owns `source`; the coordinator reads it exactly once, front to
/// back. `declared_size` is a hint only: the bytes actually read decide the
/// transfer strategy.
pub struct UploadRequest<'a> {
    /// Payload bytes.
    pub source: ByteStream<'a>,

    /// Size announced by the caller (e.g. `Content-Length`), if any.
    pub declared_size: Option<u64>,

    /// MIME type preserved on the stored object.
    pub content_type: Option<String>,

    /// Caller-supplied file name the key is derived from.
    pub logical_name: String,
}

impl<'a> UploadRequest<'a> {
    pub fn new(logical_name: impl Into<String>, source: ByteStream<'a>) -> Self {
        Self {
            source,
            declared_size: None,
            content_type: None,
            logical_name: logical_name.into(),
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl fmt::Debug for UploadRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("logical_name", &self.logical_name)
            .field("declared_size", &self.declared_size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// A stored object opened for reading.
pub struct ObjectDownload {
    pub key: ObjectKey,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: ByteStream<'static>,
}

impl fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}
