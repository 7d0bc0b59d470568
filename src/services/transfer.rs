//! Moves one upload into the bucket.
//!
//! A transfer runs validation, names the object, reads just enough of the
//! source to pick a strategy, and then either issues a single put or drives
//! a multipart session:
//!
//! ```text
//! Initiated -> PartsInFlight -> Completed
//!          \             \
//!           `-------------`-> Aborted
//! ```
//!
//! Parts are read one at a time from the source and handed to at most
//! `max_concurrent_parts` workers. A part that fails transiently is retried
//! with exponential backoff; once any part is out of attempts the session is
//! aborted and the transfer fails. The object only becomes visible when the
//! complete call succeeds.

use crate::{
    backend::{BackendError, MAX_PARTS_PER_UPLOAD, ObjectBackend},
    config::TransferConfig,
    errors::TransferError,
    models::{
        ByteStream, MultipartSession, ObjectKey, PartPlan, UploadRequest, UploadSession,
    },
    services::{
        key_generator::KeyGenerator,
        part_planner::{PartPlanner, Strategy},
        validation::{Candidate, EMPTY_FILE_REASON, Scanner},
    },
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::{io, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry budget for a single part.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Uploads objects into one bucket through one backend.
///
/// Transfers share nothing but the key generator: each call owns its
/// session, its part workers and its buffers.
pub struct TransferCoordinator {
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    config: TransferConfig,
    scanner: Arc<dyn Scanner>,
    planner: PartPlanner,
    keys: KeyGenerator,
}

impl TransferCoordinator {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        bucket: impl Into<String>,
        config: TransferConfig,
        scanner: Arc<dyn Scanner>,
    ) -> Self {
        Self {
            planner: PartPlanner::new(&config),
            backend,
            bucket: bucket.into(),
            config,
            scanner,
            keys: KeyGenerator::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.max_part_attempts.max(1),
            base_backoff: self.config.retry_backoff,
        }
    }

    /// Upload `request` and return the key it was stored under.
    pub async fn transfer(&self, request: UploadRequest<'_>) -> Result<ObjectKey, TransferError> {
        self.transfer_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`transfer`](Self::transfer), but stops when `cancel` fires.
    ///
    /// A cancelled multipart transfer aborts its session before returning
    /// [`TransferError::Cancelled`].
    pub async fn transfer_with_cancel(
        &self,
        request: UploadRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<ObjectKey, TransferError> {
        let UploadRequest {
            source,
            declared_size,
            content_type,
            logical_name,
        } = request;

        let verdict = self
            .scanner
            .scan(&Candidate::new(&logical_name, declared_size))
            .await;
        if !verdict.is_accepted() {
            let reason = verdict.reason.unwrap_or_else(|| "rejected".to_string());
            warn!(name = %logical_name, %reason, "upload rejected");
            return Err(TransferError::ValidationRejected(reason));
        }

        let key = self.keys.generate(&logical_name);
        let threshold = self.config.multipart_threshold_bytes;
        let mut reader = PartReader::new(source);

        // Read one byte past the threshold: hitting EOF first means the
        // whole object is in hand and fits a single put.
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransferError::Cancelled),
            filled = reader.fill(to_usize(threshold.saturating_add(1))) => {
                filled.map_err(TransferError::Source)?
            }
        }

        let observed = if reader.is_exhausted() {
            if reader.buffered() == 0 {
                warn!(name = %logical_name, "upload rejected: source is empty");
                return Err(TransferError::ValidationRejected(
                    EMPTY_FILE_REASON.to_string(),
                ));
            }
            Some(reader.buffered() as u64)
        } else {
            if let Some(declared) = declared_size.filter(|declared| *declared <= threshold) {
                warn!(
                    key = %key,
                    declared,
                    "source is larger than its declared size"
                );
            }
            declared_size.filter(|declared| *declared > threshold)
        };

        match self.planner.plan(observed) {
            Strategy::SingleShot => {
                let bytes = reader.take_buffered();
                self.put_single(key, content_type, bytes).await
            }
            Strategy::Multipart(plan) => {
                self.put_multipart(key, content_type, reader, plan, &cancel)
                    .await
            }
        }
    }

    async fn put_single(
        &self,
        key: ObjectKey,
        content_type: Option<String>,
        bytes: Bytes,
    ) -> Result<ObjectKey, TransferError> {
        let size = bytes.len();
        debug!(key = %key, size, "uploading in a single request");
        self.backend
            .put_object(&self.bucket, key.as_str(), content_type.as_deref(), bytes)
            .await?;
        info!(key = %key, bucket = %self.bucket, size, "upload complete");
        Ok(key)
    }

    async fn put_multipart(
        &self,
        key: ObjectKey,
        content_type: Option<String>,
        mut reader: PartReader<'_>,
        plan: PartPlan,
        cancel: &CancellationToken,
    ) -> Result<ObjectKey, TransferError> {
        let handle = self
            .backend
            .initiate_multipart(&self.bucket, key.as_str(), content_type.as_deref())
            .await?;
        info!(
            key = %key,
            session_id = %handle.upload_id,
            part_size = plan.part_size(),
            planned_parts = ?plan.part_count(),
            "multipart upload started"
        );

        let mut guard = AbortOnDrop::new(self.backend.clone(), handle.clone());
        let mut session = UploadSession::new(handle);
        let mut workers = JoinSet::new();

        let outcome = self
            .run_parts(&mut session, &mut reader, &plan, &mut workers, cancel)
            .await;
        workers.shutdown().await;

        if let Err(cause) = outcome {
            return Err(self.abort(&mut session, &mut guard, cause).await);
        }

        let parts = match session.completed_parts() {
            Ok(parts) => parts,
            Err(err) => return Err(self.abort(&mut session, &mut guard, err.into()).await),
        };
        if let Err(err) = self
            .backend
            .complete_multipart(session.handle(), &parts)
            .await
        {
            return Err(self.abort(&mut session, &mut guard, err.into()).await);
        }
        guard.disarm();
        session.mark_completed()?;

        let uploaded = reader.consumed();
        if let Some(expected) = plan.total_size().filter(|expected| *expected != uploaded) {
            warn!(
                key = %key,
                expected,
                uploaded,
                "source length differed from its declared size"
            );
        }
        info!(
            key = %key,
            bucket = %self.bucket,
            session_id = %session.upload_id(),
            parts = parts.len(),
            size = uploaded,
            "multipart upload complete"
        );
        Ok(key)
    }

    /// Feed parts to workers until the source is drained and every worker
    /// has reported back, or until the first unrecoverable failure.
    async fn run_parts(
        &self,
        session: &mut UploadSession,
        reader: &mut PartReader<'_>,
        plan: &PartPlan,
        workers: &mut JoinSet<PartOutcome>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let part_size = to_usize(plan.part_size());
        let max_in_flight = self.config.max_concurrent_parts.max(1);
        let policy = self.retry_policy();
        let mut next_part: u32 = 1;
        let mut source_done = false;

        loop {
            while !source_done && workers.len() < max_in_flight {
                let part = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(TransferError::Cancelled),
                    part = reader.next_part(part_size) => part.map_err(TransferError::Source)?,
                };
                let Some(bytes) = part else {
                    source_done = true;
                    break;
                };
                if next_part > MAX_PARTS_PER_UPLOAD {
                    return Err(TransferError::ObjectTooLarge {
                        max_parts: MAX_PARTS_PER_UPLOAD,
                        part_size: plan.part_size(),
                    });
                }

                session.dispatch_part(next_part)?;
                debug!(
                    session_id = %session.upload_id(),
                    part_number = next_part,
                    len = bytes.len(),
                    "dispatching part"
                );
                workers.spawn(upload_part_with_retry(
                    self.backend.clone(),
                    session.handle().clone(),
                    next_part,
                    bytes,
                    policy,
                ));
                next_part += 1;
            }

            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransferError::Cancelled),
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else {
                // no workers left and nothing more to read
                return Ok(());
            };

            let PartOutcome {
                part_number,
                attempts,
                result,
            } = joined.map_err(|err| {
                TransferError::PermanentBackend(format!("part worker failed: {}", err))
            })?;
            match result {
                Ok(etag) => {
                    debug!(
                        session_id = %session.upload_id(),
                        part_number,
                        attempts,
                        "part uploaded"
                    );
                    session.mark_part_completed(part_number, etag, attempts)?;
                }
                Err(err) => {
                    session.mark_part_failed(part_number, attempts)?;
                    return Err(TransferError::PermanentBackend(format!(
                        "part {} failed after {} attempt(s): {}",
                        part_number, attempts, err
                    )));
                }
            }
        }
    }

    /// Abort the session and fold the outcome into the error returned to
    /// the caller.
    async fn abort(
        &self,
        session: &mut UploadSession,
        guard: &mut AbortOnDrop,
        cause: TransferError,
    ) -> TransferError {
        if let Err(err) = session.mark_aborted() {
            warn!(session_id = %session.upload_id(), error = %err, "session already closed");
        }

        // The guard stays armed until the abort call returns, so dropping
        // this future mid-abort still cleans up.
        let aborted = self.backend.abort_multipart(session.handle()).await;
        guard.disarm();
        match aborted {
            Ok(()) => {
                warn!(
                    key = %session.handle().key,
                    session_id = %session.upload_id(),
                    error = %cause,
                    "multipart upload aborted"
                );
                cause
            }
            Err(abort_error) => {
                error!(
                    key = %session.handle().key,
                    session_id = %session.upload_id(),
                    error = %abort_error,
                    cause = %cause,
                    "failed to abort multipart upload; staged parts may be orphaned"
                );
                TransferError::SessionAbortFailure {
                    upload_id: session.upload_id().to_string(),
                    key: session.handle().key.clone(),
                    abort_error,
                    cause: Box::new(cause),
                }
            }
        }
    }
}

struct PartOutcome {
    part_number: u32,
    attempts: u32,
    result: Result<String, BackendError>,
}

async fn upload_part_with_retry(
    backend: Arc<dyn ObjectBackend>,
    session: MultipartSession,
    part_number: u32,
    bytes: Bytes,
    policy: RetryPolicy,
) -> PartOutcome {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match backend
            .upload_part(&session, part_number, bytes.clone())
            .await
        {
            Ok(etag) => {
                return PartOutcome {
                    part_number,
                    attempts: attempt,
                    result: Ok(etag),
                };
            }
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    session_id = %session.upload_id,
                    part_number,
                    attempt,
                    ?delay,
                    error = %err,
                    "part upload failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return PartOutcome {
                    part_number,
                    attempts: attempt,
                    result: Err(err),
                };
            }
        }
    }
}

/// Aborts an open session if the transfer future is dropped mid-flight.
struct AbortOnDrop {
    backend: Arc<dyn ObjectBackend>,
    session: Option<MultipartSession>,
}

impl AbortOnDrop {
    fn new(backend: Arc<dyn ObjectBackend>, session: MultipartSession) -> Self {
        Self {
            backend,
            session: Some(session),
        }
    }

    fn disarm(&mut self) {
        self.session = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(session_id = %session.upload_id, "transfer dropped; aborting multipart upload");
                let backend = self.backend.clone();
                runtime.spawn(async move {
                    if let Err(err) = backend.abort_multipart(&session).await {
                        error!(
                            key = %session.key,
                            session_id = %session.upload_id,
                            error = %err,
                            "failed to abort multipart upload of dropped transfer"
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    key = %session.key,
                    session_id = %session.upload_id,
                    "transfer dropped outside a runtime; multipart upload left open"
                );
            }
        }
    }
}

/// Cuts a byte stream into parts without holding more than one part (plus
/// one incoming chunk) in memory.
struct PartReader<'a> {
    source: ByteStream<'a>,
    buffer: BytesMut,
    exhausted: bool,
    consumed: u64,
}

impl<'a> PartReader<'a> {
    fn new(source: ByteStream<'a>) -> Self {
        Self {
            source,
            buffer: BytesMut::new(),
            exhausted: false,
            consumed: 0,
        }
    }

    /// Read until at least `target` bytes are buffered or the source ends.
    async fn fill(&mut self, target: usize) -> io::Result<()> {
        while !self.exhausted && self.buffer.len() < target {
            match self.source.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.consumed += chunk.len() as u64;
                    self.buffer.extend_from_slice(&chunk);
                }
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    async fn next_part(&mut self, part_size: usize) -> io::Result<Option<Bytes>> {
        self.fill(part_size).await?;
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let len = part_size.min(self.buffer.len());
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    fn take_buffered(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}
