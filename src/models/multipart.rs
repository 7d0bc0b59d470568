//! Multipart upload sessions, their parts, and the plan that splits an object into parts.

use std::collections::BTreeMap;
use thiserror::Error;

/// One planned byte range of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartDescriptor {
    /// Part number (1-based, contiguous).
    pub part_number: u32,

    /// Offset of the first byte of this part within the object.
    pub byte_offset: u64,

    /// Number of bytes in this part.
    pub byte_length: u64,
}

/// How an object is split into parts.
///
/// When the object size is known up front, `parts` holds every range and
/// their lengths sum to `total_size`. For a source of unknown size the plan
/// only fixes the part size and parts are cut as the stream is read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartPlan {
    part_size: u64,
    total_size: Option<u64>,
    parts: Vec<PartDescriptor>,
}

impl PartPlan {
    /// Plan contiguous parts of `part_size` bytes covering `total_size` bytes.
    pub fn sized(total_size: u64, part_size: u64) -> Self {
        let part_size = part_size.max(1);
        let mut parts = Vec::with_capacity(total_size.div_ceil(part_size) as usize);
        let mut offset = 0;
        let mut part_number = 1;
        while offset < total_size {
            let byte_length = part_size.min(total_size - offset);
            parts.push(PartDescriptor {
                part_number,
                byte_offset: offset,
                byte_length,
            });
            offset += byte_length;
            part_number += 1;
        }
        Self {
            part_size,
            total_size: Some(total_size),
            parts,
        }
    }

    /// Plan for a stream whose length is only known once it is exhausted.
    pub fn open_ended(part_size: u64) -> Self {
        Self {
            part_size: part_size.max(1),
            total_size: None,
            parts: Vec::new(),
        }
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Planned ranges; empty for an open-ended plan.
    pub fn parts(&self) -> &[PartDescriptor] {
        &self.parts
    }

    /// Number of planned parts, if the size was known.
    pub fn part_count(&self) -> Option<usize> {
        self.total_size.map(|_| self.parts.len())
    }
}

/// Backend handle of an open multipart session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartSession {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A part acknowledged by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Lifecycle of a multipart session.
///
/// `Initiated -> PartsInFlight -> {Completed | Aborted}`; `Aborted` is also
/// reachable straight from `Initiated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    PartsInFlight,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartStatus {
    InFlight,
    Completed,
    Failed,
}

/// Tracking record for a single part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartRecord {
    pub status: PartStatus,
    pub etag: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("session `{upload_id}` cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        upload_id: String,
        from: SessionState,
        to: SessionState,
    },
    #[error("part {0} is not tracked by this session")]
    UnknownPart(u32),
    #[error("part {0} was already dispatched")]
    DuplicatePart(u32),
    #[error("session has no parts to complete")]
    NoParts,
    #[error("part {0} has not completed")]
    PartIncomplete(u32),
}

/// Coordinator-side view of one multipart transfer.
///
/// Owned by exactly one transfer; parts are keyed by part number so that
/// completion order never leaks into the final part list.
#[derive(Debug)]
pub struct UploadSession {
    handle: MultipartSession,
    state: SessionState,
    parts: BTreeMap<u32, PartRecord>,
}

impl UploadSession {
    pub fn new(handle: MultipartSession) -> Self {
        Self {
            handle,
            state: SessionState::Initiated,
            parts: BTreeMap::new(),
        }
    }

    pub fn handle(&self) -> &MultipartSession {
        &self.handle
    }

    pub fn upload_id(&self) -> &str {
        &self.handle.upload_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn part(&self, part_number: u32) -> Option<&PartRecord> {
        self.parts.get(&part_number)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Register a part as dispatched to a worker.
    pub fn dispatch_part(&mut self, part_number: u32) -> Result<(), SessionStateError> {
        self.transition(SessionState::PartsInFlight)?;
        if self.parts.contains_key(&part_number) {
            return Err(SessionStateError::DuplicatePart(part_number));
        }
        self.parts.insert(
            part_number,
            PartRecord {
                status: PartStatus::InFlight,
                etag: None,
                attempts: 0,
            },
        );
        Ok(())
    }

    pub fn mark_part_completed(
        &mut self,
        part_number: u32,
        etag: String,
        attempts: u32,
    ) -> Result<(), SessionStateError> {
        let record = self
            .parts
            .get_mut(&part_number)
            .ok_or(SessionStateError::UnknownPart(part_number))?;
        record.status = PartStatus::Completed;
        record.etag = Some(etag);
        record.attempts = attempts;
        Ok(())
    }

    pub fn mark_part_failed(
        &mut self,
        part_number: u32,
        attempts: u32,
    ) -> Result<(), SessionStateError> {
        let record = self
            .parts
            .get_mut(&part_number)
            .ok_or(SessionStateError::UnknownPart(part_number))?;
        record.status = PartStatus::Failed;
        record.attempts = attempts;
        Ok(())
    }

    /// The acknowledged parts in ascending part-number order, provided every
    /// dispatched part has completed.
    pub fn completed_parts(&self) -> Result<Vec<CompletedPart>, SessionStateError> {
        if self.state != SessionState::PartsInFlight {
            return Err(self.invalid(SessionState::Completed));
        }
        if self.parts.is_empty() {
            return Err(SessionStateError::NoParts);
        }
        self.parts
            .iter()
            .map(|(part_number, record)| match (&record.status, &record.etag) {
                (PartStatus::Completed, Some(etag)) => Ok(CompletedPart {
                    part_number: *part_number,
                    etag: etag.clone(),
                }),
                _ => Err(SessionStateError::PartIncomplete(*part_number)),
            })
            .collect()
    }

    /// Move to `Completed` once the backend has acknowledged completion.
    pub fn mark_completed(&mut self) -> Result<(), SessionStateError> {
        self.completed_parts()?;
        self.state = SessionState::Completed;
        Ok(())
    }

    /// Move to `Aborted`. Only one abort is ever accepted.
    pub fn mark_aborted(&mut self) -> Result<(), SessionStateError> {
        if self.state.is_terminal() {
            return Err(self.invalid(SessionState::Aborted));
        }
        self.state = SessionState::Aborted;
        Ok(())
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionStateError> {
        match (self.state, to) {
            (SessionState::Initiated, SessionState::PartsInFlight)
            | (SessionState::PartsInFlight, SessionState::PartsInFlight) => {
                self.state = to;
                Ok(())
            }
            _ => Err(self.invalid(to)),
        }
    }

    fn invalid(&self, to: SessionState) -> SessionStateError {
        SessionStateError::InvalidTransition {
            upload_id: self.handle.upload_id.clone(),
            from: self.state,
            to,
        }
    }
}
