//! In-process backend.
//!
//! Holds objects and open multipart sessions in memory. Besides serving
//! `--backend memory`, it records every call it receives and can be told to
//! fail specific operations, which is what the transfer tests lean on.

use super::{BackendError, BackendResult, ObjectBackend};
use crate::models::{CompletedPart, ListingPage, MultipartSession, ObjectDownload, ObjectKey};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 1000;
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// A failure to inject into the next matching calls.
#[derive(Clone, Debug)]
pub enum Fault {
    /// Fail uploads of `part_number` with `error`; `times: None` fails forever.
    Part {
        part_number: u32,
        error: BackendError,
        times: Option<u32>,
    },
    PutObject(BackendError),
    Initiate(BackendError),
    Complete(BackendError),
    Abort(BackendError),
    Get(BackendError),
    List(BackendError),
}

/// A call observed by the backend, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    PutObject { key: String, len: usize },
    Initiate { key: String },
    UploadPart { upload_id: String, part_number: u32, len: usize },
    Complete { upload_id: String, part_numbers: Vec<u32> },
    Abort { upload_id: String },
    Get { key: String },
    List { continuation_token: Option<String> },
    Delete { key: String },
}

#[derive(Clone, Debug)]
struct StoredObject {
    bytes: Bytes,
    content_type: Option<String>,
}

#[derive(Debug)]
struct PendingUpload {
    content_type: Option<String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    parts: HashMap<u32, (BackendError, Option<u32>)>,
    put: Option<BackendError>,
    initiate: Option<BackendError>,
    complete: Option<BackendError>,
    abort: Option<BackendError>,
    get: Option<BackendError>,
    list: Option<BackendError>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    sessions: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<Call>>,
    page_size: Option<usize>,
    part_delay: Option<Duration>,
    abort_delay: Option<Duration>,
    public_base: Option<String>,
    parts_in_flight: AtomicUsize,
    max_parts_in_flight: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit listing pages to `page_size` keys.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Hold every part upload for `delay`, so concurrent parts overlap.
    pub fn with_part_delay(mut self, delay: Duration) -> Self {
        self.part_delay = Some(delay);
        self
    }

    /// Hold every abort call for `delay` before it takes effect.
    pub fn with_abort_delay(mut self, delay: Duration) -> Self {
        self.abort_delay = Some(delay);
        self
    }

    /// Report `{base}/{bucket}/{key}` as each object's URL.
    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = Some(base.into());
        self
    }

    pub fn inject(&self, fault: Fault) {
        let mut faults = self.faults.lock();
        match fault {
            Fault::Part {
                part_number,
                error,
                times,
            } => {
                faults.parts.insert(part_number, (error, times));
            }
            Fault::PutObject(err) => faults.put = Some(err),
            Fault::Initiate(err) => faults.initiate = Some(err),
            Fault::Complete(err) => faults.complete = Some(err),
            Fault::Abort(err) => faults.abort = Some(err),
            Fault::Get(err) => faults.get = Some(err),
            Fault::List(err) => faults.list = Some(err),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Highest number of part uploads observed running at the same time.
    pub fn max_parts_in_flight(&self) -> usize {
        self.max_parts_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Store an object directly, bypassing the call log.
    pub fn seed(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>) {
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: bytes.into(),
                content_type: None,
            },
        );
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn take_part_fault(&self, part_number: u32) -> Option<BackendError> {
        let mut faults = self.faults.lock();
        let (err, remaining) = faults.parts.get_mut(&part_number)?;
        let err = err.clone();
        match remaining {
            None => Some(err),
            Some(0) => {
                faults.parts.remove(&part_number);
                None
            }
            Some(n) => {
                *n -= 1;
                if *n == 0 {
                    faults.parts.remove(&part_number);
                }
                Some(err)
            }
        }
    }
}

/// Tracks concurrent part uploads for the lifetime of one call.
struct InFlight<'a>(&'a MemoryBackend);

impl<'a> InFlight<'a> {
    fn enter(backend: &'a MemoryBackend) -> Self {
        let now = backend.parts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        backend.max_parts_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(backend)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.parts_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn etag_of(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> BackendResult<()> {
        self.record(Call::PutObject {
            key: key.to_string(),
            len: bytes.len(),
        });
        if let Some(err) = self.faults.lock().put.clone() {
            return Err(err);
        }
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<MultipartSession> {
        self.record(Call::Initiate {
            key: key.to_string(),
        });
        if let Some(err) = self.faults.lock().initiate.clone() {
            return Err(err);
        }
        let upload_id = Uuid::new_v4().to_string();
        self.sessions.lock().insert(
            upload_id.clone(),
            PendingUpload {
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartSession {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        bytes: Bytes,
    ) -> BackendResult<String> {
        self.record(Call::UploadPart {
            upload_id: session.upload_id.clone(),
            part_number,
            len: bytes.len(),
        });
        let _guard = InFlight::enter(self);
        if let Some(delay) = self.part_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.take_part_fault(part_number) {
            return Err(err);
        }
        let mut sessions = self.sessions.lock();
        let pending = sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| BackendError::NoSuchSession(session.upload_id.clone()))?;
        let etag = etag_of(&bytes);
        pending.parts.insert(part_number, (etag.clone(), bytes));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        self.record(Call::Complete {
            upload_id: session.upload_id.clone(),
            part_numbers: parts.iter().map(|p| p.part_number).collect(),
        });
        if let Some(err) = self.faults.lock().complete.clone() {
            return Err(err);
        }
        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::Permanent(
                "parts must be listed in ascending order".into(),
            ));
        }

        let pending = self
            .sessions
            .lock()
            .remove(&session.upload_id)
            .ok_or_else(|| BackendError::NoSuchSession(session.upload_id.clone()))?;

        let mut body = BytesMut::new();
        for part in parts {
            match pending.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => body.extend_from_slice(bytes),
                _ => {
                    return Err(BackendError::Permanent(format!(
                        "part {} missing or etag mismatch",
                        part.part_number
                    )));
                }
            }
        }

        self.objects.lock().insert(
            (session.bucket.clone(), session.key.clone()),
            StoredObject {
                bytes: body.freeze(),
                content_type: pending.content_type,
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> BackendResult<()> {
        self.record(Call::Abort {
            upload_id: session.upload_id.clone(),
        });
        if let Some(delay) = self.abort_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.faults.lock().abort.clone() {
            return Err(err);
        }
        self.sessions
            .lock()
            .remove(&session.upload_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchSession(session.upload_id.clone()))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectDownload> {
        self.record(Call::Get {
            key: key.to_string(),
        });
        if let Some(err) = self.faults.lock().get.clone() {
            return Err(err);
        }
        let stored = self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        let len = stored.bytes.len();
        let chunks: Vec<Bytes> = (0..len)
            .step_by(DOWNLOAD_CHUNK_BYTES)
            .map(|start| stored.bytes.slice(start..(start + DOWNLOAD_CHUNK_BYTES).min(len)))
            .collect();

        Ok(ObjectDownload {
            key: ObjectKey::new(key),
            content_type: stored.content_type,
            content_length: Some(len as u64),
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> BackendResult<ListingPage> {
        self.record(Call::List {
            continuation_token: continuation_token.map(str::to_string),
        });
        if let Some(err) = self.faults.lock().list.clone() {
            return Err(err);
        }
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let objects = self.objects.lock();
        let mut keys = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k)
            .filter(|k| continuation_token.is_none_or(|token| k.as_str() > token));

        let entries: Vec<String> = keys.by_ref().take(page_size).cloned().collect();
        let continuation_token = match (keys.next(), entries.last()) {
            (Some(_), Some(last)) => Some(last.clone()),
            _ => None,
        };
        Ok(ListingPage {
            entries,
            continuation_token,
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()> {
        self.record(Call::Delete {
            key: key.to_string(),
        });
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn probe(&self, _bucket: &str) -> BackendResult<()> {
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> Option<String> {
        self.public_base
            .as_ref()
            .map(|base| format!("{}/{}/{}", base, bucket, key))
    }
}
