//! Defines routes for the file API.
//!
//! ## Structure
//! - `POST   /files`         : upload the `file` field of a multipart form
//! - `GET    /files`         : list keys, one per line
//! - `PUT    /files/{*name}` : upload the raw body under a logical name
//! - `GET    /files/{*key}`  : download an object
//! - `DELETE /files/{*key}`  : delete an object (idempotent)
//! - `POST   /bundles`       : zip every uploaded field into one object
//! - `GET    /healthz`, `GET /readyz`

use crate::{
    handlers::{
        file_handlers::{
            delete_file, download_file, list_files, upload_bundle, upload_form, upload_raw,
        },
        health_handlers::{healthz, readyz},
    },
    services::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for the file API.
///
/// Request bodies are streamed into the uploader, so the default body size
/// limit is lifted.
pub fn routes() -> Router<FileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files", get(list_files).post(upload_form))
        .route(
            "/files/{*key}",
            get(download_file).put(upload_raw).delete(delete_file),
        )
        .route("/bundles", post(upload_bundle))
        .layer(DefaultBodyLimit::disable())
}

#[cfg(test)]
mod tests {
    use super::routes;
    use crate::{
        backend::{MemoryBackend, memory::Call},
        config::TransferConfig,
        handlers::file_handlers::UploadResponse,
        services::{FileService, validation::ValidationGate},
    };
    use axum::{
        Router,
        body::{Body, Bytes, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    const BOUNDARY: &str = "upload-boundary";

    fn app(backend: Arc<MemoryBackend>) -> Router {
        let files = FileService::new(
            backend,
            "uploads",
            TransferConfig::default(),
            Arc::new(ValidationGate::new(["virus", ".exe"])),
            100,
        )
        .expect("service");
        routes().with_state(files)
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.expect("response")
    }

    async fn body_bytes(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX).await.expect("body")
    }

    async fn json_body(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json")
    }

    /// Multipart body with one part per `(field, file name, contents)`.
    fn form(fields: &[(&str, &str, &[u8])]) -> Request<Body> {
        form_to("/files", fields)
    }

    fn form_to(uri: &str, fields: &[(&str, &str, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (field, file_name, contents) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY, field, file_name
                )
                .as_bytes(),
            );
            body.extend_from_slice(contents);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn put(uri: &str, body: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn upload_response(response: Response) -> UploadResponse {
        assert_eq!(response.status(), StatusCode::CREATED);
        serde_json::from_slice(&body_bytes(response).await).expect("upload response")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app(Arc::new(MemoryBackend::new()));
        let response = send(&app, get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn readyz_reports_bucket() {
        let app = app(Arc::new(MemoryBackend::new()));
        let response = send(&app, get("/readyz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["bucket"], "uploads");
        assert_eq!(body["checks"]["backend"]["ok"], true);
    }

    #[tokio::test]
    async fn form_upload_stores_the_file_field() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        let response = send(&app, form(&[("file", "report.pdf", b"0123456789")])).await;
        let uploaded = upload_response(response).await;
        assert!(uploaded.key.as_str().ends_with("_report.pdf"));
        assert_eq!(uploaded.bucket, "uploads");
        assert_eq!(uploaded.url, None);
        assert!(backend.contains("uploads", uploaded.key.as_str()));
    }

    #[tokio::test]
    async fn form_without_file_field_is_bad_request() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        let response = send(&app, form(&[("attachment", "a.txt", b"data")])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("`file`"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_upload_is_unprocessable_with_reason() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        let response = send(&app, form(&[("file", "payload_virus.bin", b"MZ")])).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["status"], 422);
        assert!(body["error"].as_str().unwrap().contains("virus"));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn raw_upload_keeps_content_type_for_download() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        let request = Request::builder()
            .method("PUT")
            .uri("/files/notes.txt")
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::CONTENT_LENGTH, 11)
            .body(Body::from("hello world"))
            .unwrap();
        let uploaded = upload_response(send(&app, request).await).await;
        assert!(matches!(backend.calls()[0], Call::PutObject { len: 11, .. }));

        let response = send(&app, get(&format!("/files/{}", uploaded.key))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(body_bytes(response).await, "hello world");
    }

    #[tokio::test]
    async fn content_length_is_the_declared_size() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        // A zero declared size is refused before the body is read.
        let request = Request::builder()
            .method("PUT")
            .uri("/files/claims-empty.bin")
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::from("not actually empty"))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn raw_upload_named_bundle_is_an_object() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        let uploaded = upload_response(send(&app, put("/files/bundle", b"plain file")).await).await;
        assert!(uploaded.key.as_str().ends_with("_bundle"));

        let response = send(&app, get(&format!("/files/{}", uploaded.key))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "plain file");

        let response = send(&app, get("/files/bundle")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bundle_defaults_its_name_and_zips_every_field() {
        let backend = Arc::new(MemoryBackend::new());
        let app = app(backend.clone());

        let response = send(
            &app,
            form_to("/bundles", &[("a", "a.txt", b"first"), ("b", "b.txt", b"second")]),
        )
        .await;
        let uploaded = upload_response(response).await;
        assert!(uploaded.key.as_str().ends_with("_bundle.zip"));

        let response = send(&app, get(&format!("/files/{}", uploaded.key))).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        let zip = body_bytes(response).await;
        assert_eq!(&zip[..4], b"PK\x03\x04");
        // two entries in the end-of-central-directory record
        assert_eq!(&zip[zip.len() - 12..zip.len() - 10], &[2, 0]);
    }

    #[tokio::test]
    async fn bundle_name_gains_zip_suffix() {
        let app = app(Arc::new(MemoryBackend::new()));

        let response = send(&app, form_to("/bundles?name=logs", &[("f", "a.log", b"x")])).await;
        let uploaded = upload_response(response).await;
        assert!(uploaded.key.as_str().ends_with("_logs.zip"));
    }

    #[tokio::test]
    async fn empty_bundle_is_bad_request() {
        let app = app(Arc::new(MemoryBackend::new()));
        let response = send(&app, form_to("/bundles", &[])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listing_streams_one_key_per_line() {
        let backend = Arc::new(MemoryBackend::new().with_page_size(1));
        let app = app(backend);

        let first = upload_response(send(&app, put("/files/a.txt", b"a")).await).await;
        let second = upload_response(send(&app, put("/files/b.txt", b"b")).await).await;

        let response = send(&app, get("/files")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        let mut keys: Vec<&str> = std::str::from_utf8(&body).unwrap().lines().collect();
        keys.sort();
        let mut expected = vec![first.key.as_str(), second.key.as_str()];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn deleting_a_missing_key_is_no_content() {
        let app = app(Arc::new(MemoryBackend::new()));
        let request = Request::builder()
            .method("DELETE")
            .uri("/files/1_never-uploaded.txt")
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn missing_download_is_not_found_json() {
        let app = app(Arc::new(MemoryBackend::new()));
        let response = send(&app, get("/files/1_missing.bin")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["status"], 404);
    }

    #[tokio::test]
    async fn upload_response_carries_backend_url() {
        let backend = Arc::new(MemoryBackend::new().with_public_base("http://files.local"));
        let app = app(backend);

        let uploaded = upload_response(send(&app, put("/files/pic.png", b"png")).await).await;
        assert_eq!(
            uploaded.url,
            Some(format!("http://files.local/uploads/{}", uploaded.key))
        );
    }
}
