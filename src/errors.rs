use crate::{backend::BackendError, models::multipart::SessionStateError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Everything a caller of the uploader can get back instead of a result.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The validation gate refused the upload. Never retried.
    #[error("upload rejected: {0}")]
    ValidationRejected(String),

    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    #[error("backend failure: {0}")]
    PermanentBackend(String),

    /// Cleaning up a failed multipart upload failed as well; the session may
    /// still hold staged parts and must be reconciled out of band.
    #[error(
        "could not abort multipart upload `{upload_id}` for `{key}` ({abort_error}) after: {cause}"
    )]
    SessionAbortFailure {
        upload_id: String,
        key: String,
        abort_error: BackendError,
        cause: Box<TransferError>,
    },

    #[error("reading upload source failed: {0}")]
    Source(#[source] io::Error),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("object needs more than {max_parts} parts of {part_size} bytes")]
    ObjectTooLarge { max_parts: u32, part_size: u64 },

    #[error("archive bundling failed: {0}")]
    Archive(String),

    #[error("multipart session out of sync: {0}")]
    Session(#[from] SessionStateError),
}

impl From<BackendError> for TransferError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { key, .. } => TransferError::NotFound(key),
            BackendError::Transient(msg) => TransferError::TransientBackend(msg),
            BackendError::Permanent(msg) => TransferError::PermanentBackend(msg),
            err @ BackendError::NoSuchSession(_) => TransferError::PermanentBackend(err.to_string()),
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        let status = match &err {
            TransferError::ValidationRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::TransientBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            TransferError::PermanentBackend(_) => StatusCode::BAD_GATEWAY,
            TransferError::ObjectTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransferError::Source(_) | TransferError::Cancelled | TransferError::Archive(_) => {
                StatusCode::BAD_REQUEST
            }
            TransferError::SessionAbortFailure { .. } | TransferError::Session(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_class() {
        let transient = TransferError::from(BackendError::Transient("503 slow down".into()));
        assert!(matches!(transient, TransferError::TransientBackend(_)));

        let missing = TransferError::from(BackendError::NotFound {
            bucket: "uploads".into(),
            key: "1_a.txt".into(),
        });
        assert!(matches!(missing, TransferError::NotFound(ref key) if key == "1_a.txt"));

        let session = TransferError::from(BackendError::NoSuchSession("u-9".into()));
        assert!(matches!(session, TransferError::PermanentBackend(ref msg) if msg.contains("u-9")));
    }

    #[test]
    fn abort_failure_names_session_and_cause() {
        let err = TransferError::SessionAbortFailure {
            upload_id: "u-1".into(),
            key: "1_big.bin".into(),
            abort_error: BackendError::Transient("connection reset".into()),
            cause: Box::new(TransferError::PermanentBackend("part 3 failed".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("u-1"));
        assert!(msg.contains("part 3 failed"));
        assert_eq!(AppError::from(err).status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn statuses_follow_error_kind() {
        let cases = [
            (
                TransferError::ValidationRejected("bad".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (TransferError::NotFound("k".into()), StatusCode::NOT_FOUND),
            (
                TransferError::TransientBackend("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (TransferError::Cancelled, StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
