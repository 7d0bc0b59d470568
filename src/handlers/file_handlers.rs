//! HTTP handlers for file operations.
//! Request and response bodies are streamed; nothing here buffers a whole
//! file. Storage concerns are delegated to `FileService`.

use crate::{
    errors::AppError,
    models::{ObjectKey, UploadRequest},
    services::{FileService, archive::BundleEntry},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io::{self, SeekFrom};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

const UPLOAD_FIELD: &str = "file";
const DEFAULT_BUNDLE_NAME: &str = "bundle.zip";

/// Body returned for every successful upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub key: ObjectKey,
    pub bucket: String,
    /// Set when the backend serves objects at a public address (S3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Query params accepted by `POST /bundles`.
#[derive(Debug, Deserialize)]
pub struct BundleQuery {
    pub name: Option<String>,
}

fn content_type_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn created(service: &FileService, key: ObjectKey) -> (StatusCode, Json<UploadResponse>) {
    (
        StatusCode::CREATED,
        Json(UploadResponse {
            url: service.object_url(&key),
            key,
            bucket: service.bucket().to_string(),
        }),
    )
}

/// `POST /files` with a `multipart/form-data` body carrying a `file` field.
pub async fn upload_form(
    State(service): State<FileService>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let logical_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let source = field.map_err(io::Error::other).boxed();

        let mut request = UploadRequest::new(logical_name, source);
        if let Some(content_type) = content_type {
            request = request.with_content_type(content_type);
        }
        let key = service.upload(request).await?;
        return Ok(created(&service, key));
    }

    Err(AppError::bad_request(format!(
        "multipart body has no `{}` field",
        UPLOAD_FIELD
    )))
}

/// `PUT /files/{*name}` with the raw file as body.
pub async fn upload_raw(
    State(service): State<FileService>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let source = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let mut request = UploadRequest::new(name, source);
    if let Some(size) = declared_size {
        request = request.with_declared_size(size);
    }
    if let Some(content_type) = content_type_of(&headers) {
        request = request.with_content_type(content_type);
    }

    let key = service.upload(request).await?;
    Ok(created(&service, key))
}

/// `POST /bundles?name=<archive>`. Every file field of the form
/// becomes one entry of a zip archive, uploaded as a single object.
///
/// Fields are spooled to anonymous temp files first: a multipart body can
/// only be read front to back, while the bundler reads entries one after
/// another once the request has been fully received.
pub async fn upload_bundle(
    State(service): State<FileService>,
    Query(query): Query<BundleQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut entries = Vec::new();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field
            .file_name()
            .or(field.name())
            .map(str::to_string)
            .unwrap_or_else(|| format!("file-{}", entries.len() + 1));

        let spool = tempfile::tempfile()
            .map_err(|err| AppError::internal(format!("creating spool file: {}", err)))?;
        let mut file = tokio::fs::File::from_std(spool);
        let mut written = 0u64;
        while let Some(chunk) = field.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|err| AppError::internal(format!("spooling `{}`: {}", name, err)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| AppError::internal(format!("spooling `{}`: {}", name, err)))?;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|err| AppError::internal(format!("rewinding `{}`: {}", name, err)))?;

        debug!(entry = %name, size = written, "spooled bundle entry");
        entries.push(BundleEntry::new(name, ReaderStream::new(file).boxed()));
    }

    if entries.is_empty() {
        return Err(AppError::bad_request("bundle needs at least one file"));
    }

    let mut archive_name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BUNDLE_NAME.to_string());
    if !archive_name.to_lowercase().ends_with(".zip") {
        archive_name.push_str(".zip");
    }

    let key = service.bundle_and_upload(&archive_name, entries).await?;
    Ok(created(&service, key))
}

/// `GET /files` streams newline-delimited keys, one page at a time.
pub async fn list_files(State(service): State<FileService>) -> Response {
    let lines = service.list().map_ok(|key| format!("{}\n", key));

    let mut response = Response::new(Body::from_stream(lines));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// `GET /files/{*key}` as a streaming response.
pub async fn download_file(
    State(service): State<FileService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let download = service.download(&key).await?;

    let mut response = Response::new(Body::from_stream(download.body));
    let headers = response.headers_mut();
    let content_type = download
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(len) = download.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(response)
}

/// `DELETE /files/{*key}` answers 204 whether or not the key existed.
pub async fn delete_file(
    State(service): State<FileService>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
