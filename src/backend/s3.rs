//! Backend for S3 and S3-compatible services.
//!
//! Credentials come from the standard AWS provider chain; this module only
//! chooses the region and, for MinIO/LocalStack style deployments, an
//! endpoint override with path-style addressing.

use super::{BackendError, BackendResult, ObjectBackend};
use crate::models::{CompletedPart, ListingPage, MultipartSession, ObjectDownload, ObjectKey};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{Builder as S3ConfigBuilder, Region, http::HttpResponse},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream as SdkByteStream,
    types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart},
};
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio_util::io::ReaderStream;
use tracing::debug;

const DEFAULT_PAGE_SIZE: i32 = 1000;

/// Unreserved characters stay as they are; `/` keeps key segments readable.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

#[derive(Clone, Debug)]
pub struct S3Backend {
    client: Client,
    page_size: i32,
    region: Option<String>,
    endpoint: Option<String>,
}

impl S3Backend {
    pub fn from_client(client: Client) -> Self {
        let region = client.config().region().map(|r| r.to_string());
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
            region,
            endpoint: None,
        }
    }

    /// Build a client for `region`, optionally pointed at a custom endpoint.
    pub async fn connect(region: &str, endpoint: Option<&str>) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            debug!("using S3 endpoint override {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let mut backend = Self::from_client(Client::from_conf(builder.build()));
        backend.endpoint = endpoint.map(|e| e.trim_end_matches('/').to_string());
        backend
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = i32::try_from(page_size.clamp(1, 1000)).unwrap_or(DEFAULT_PAGE_SIZE);
        self
    }
}

/// Sort an SDK failure into retryable and terminal errors.
///
/// Timeouts, dispatch and response failures, throttling and 5xx answers are
/// transient; every other service answer is permanent.
fn classify<E>(err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            BackendError::Transient(message)
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let throttled = matches!(
                ctx.err().code(),
                Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable")
            );
            if status == 429 || status >= 500 || throttled {
                BackendError::Transient(message)
            } else {
                BackendError::Permanent(message)
            }
        }
        _ => BackendError::Permanent(message),
    }
}

/// Like [`classify`], but maps `NoSuchUpload` to a session error.
fn classify_session<E>(err: SdkError<E, HttpResponse>, upload_id: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if err.as_service_error().and_then(|e| e.code()) == Some("NoSuchUpload") {
        return BackendError::NoSuchSession(upload_id.to_string());
    }
    classify(err)
}

fn part_number_i32(part_number: u32) -> BackendResult<i32> {
    i32::try_from(part_number)
        .map_err(|_| BackendError::Permanent(format!("part number {} out of range", part_number)))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> BackendResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .body(SdkByteStream::from(bytes))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<MultipartSession> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(classify)?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| BackendError::Permanent("response carried no upload id".into()))?;
        Ok(MultipartSession {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        bytes: Bytes,
    ) -> BackendResult<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(part_number_i32(part_number)?)
            .body(SdkByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| classify_session(err, &session.upload_id))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Permanent(format!("part {} has no etag", part_number)))
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            completed.push(
                SdkCompletedPart::builder()
                    .part_number(part_number_i32(part.part_number)?)
                    .e_tag(&part.etag)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify_session(err, &session.upload_id))?;
        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await
            .map_err(|err| classify_session(err, &session.upload_id))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectDownload> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing = err.as_service_error().is_some_and(|e| e.is_no_such_key())
                    || err.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if missing {
                    BackendError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    classify(err)
                }
            })?;

        let content_type = output.content_type().map(str::to_string);
        let content_length = output.content_length().and_then(|len| u64::try_from(len).ok());
        let reader = output.body.into_async_read();

        Ok(ObjectDownload {
            key: ObjectKey::new(key),
            content_type,
            content_length,
            body: ReaderStream::new(reader).boxed(),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> BackendResult<ListingPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .max_keys(self.page_size)
            .set_continuation_token(continuation_token.map(str::to_string))
            .send()
            .await
            .map_err(classify)?;

        let entries = output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();
        let continuation_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListingPage {
            entries,
            continuation_token,
        })
    }

    /// S3 answers 204 for a missing key as well.
    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn probe(&self, bucket: &str) -> BackendResult<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> Option<String> {
        public_url(self.endpoint.as_deref(), self.region.as_deref(), bucket, key)
    }
}

/// Path-style under an endpoint override, virtual-hosted on AWS itself.
fn public_url(
    endpoint: Option<&str>,
    region: Option<&str>,
    bucket: &str,
    key: &str,
) -> Option<String> {
    let key = utf8_percent_encode(key, KEY_ENCODE_SET);
    match (endpoint, region) {
        (Some(endpoint), _) => Some(format!("{}/{}/{}", endpoint, bucket, key)),
        (None, Some(region)) => Some(format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            bucket, region, key
        )),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;

    #[test]
    fn timeouts_are_transient() {
        let err = SdkError::<GetObjectError, HttpResponse>::timeout_error("deadline exceeded");
        assert!(classify(err).is_transient());
    }

    #[test]
    fn construction_failures_are_permanent() {
        let err = SdkError::<GetObjectError, HttpResponse>::construction_failure("bad input");
        assert!(!classify(err).is_transient());
    }

    #[test]
    fn urls_follow_addressing_style() {
        assert_eq!(
            public_url(None, Some("eu-west-1"), "uploads", "17_report final.pdf").as_deref(),
            Some("https://uploads.s3.eu-west-1.amazonaws.com/17_report%20final.pdf")
        );
        assert_eq!(
            public_url(Some("http://localhost:9000"), Some("us-east-1"), "uploads", "17_a.txt")
                .as_deref(),
            Some("http://localhost:9000/uploads/17_a.txt")
        );
        assert_eq!(public_url(None, None, "uploads", "17_a.txt"), None);
    }

    #[test]
    fn backend_reports_region_from_client() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(Region::new("eu-central-1"))
            .build();
        let backend = S3Backend::from_client(Client::from_conf(config));
        assert_eq!(
            backend.object_url("uploads", "1_x.bin").as_deref(),
            Some("https://uploads.s3.eu-central-1.amazonaws.com/1_x.bin")
        );
    }

    #[test]
    fn part_numbers_fit_sdk_range() {
        assert_eq!(part_number_i32(10_000).unwrap(), 10_000);
        assert!(part_number_i32(u32::MAX).is_err());
    }
}
