//! LocalBackend: object payloads on local disk, metadata in SQLite.
//!
//! Payloads are sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`.
//! Multipart parts are staged under `base_path/.multipart/{upload_id}/` and
//! only concatenated into the object path when the session completes, so a
//! half-finished upload is never visible through `get_object` or listings.

use super::{BackendError, BackendResult, ObjectBackend};
use crate::models::{CompletedPart, ListingPage, MultipartSession, ObjectDownload, ObjectKey};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const DEFAULT_PAGE_SIZE: usize = 1000;
const STAGING_DIR: &str = ".multipart";

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Metadata row for a stored object.
#[derive(Clone, Debug, FromRow)]
struct ObjectRow {
    content_type: Option<String>,
    size_bytes: i64,
}

/// An open multipart session.
#[derive(Clone, Debug, FromRow)]
struct UploadRow {
    bucket: String,
    key: String,
    content_type: Option<String>,
}

/// A staged part of an open multipart session.
#[derive(Clone, Debug, FromRow)]
struct PartRow {
    part_number: i64,
    size_bytes: i64,
    etag: String,
}

#[derive(Clone, Debug)]
pub struct LocalBackend {
    /// Shared SQLite connection pool used for metadata operations.
    db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    page_size: usize,
}

impl LocalBackend {
    /// Wrap an existing pool. The schema must already be applied.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Open (creating if needed) the metadata database and storage directory,
    /// then apply the embedded schema.
    pub async fn connect(
        database_url: &str,
        base_path: impl Into<PathBuf>,
    ) -> BackendResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let backend = Self::new(Arc::new(pool), base_path);
        backend.migrate().await?;
        Ok(backend)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run the embedded schema statements. Every statement is idempotent.
    pub async fn migrate(&self) -> BackendResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.split('/').any(|segment| segment == ".." || segment == ".")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(BackendError::Permanent(format!("invalid object key `{key}`")));
        }
        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    fn bucket_root(&self, bucket: &str) -> BackendResult<PathBuf> {
        ensure_bucket_name_safe(bucket)?;
        Ok(self.base_path.join(bucket))
    }

    /// Two-level shard identifiers from MD5(bucket/key), keeping the file
    /// count per directory low.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> BackendResult<PathBuf> {
        Self::ensure_key_safe(key)?;
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket)?;
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        Ok(path)
    }

    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.staging_dir(upload_id)
            .join(format!("{:05}", part_number))
    }

    async fn fetch_upload(&self, upload_id: &str) -> BackendResult<UploadRow> {
        sqlx::query_as::<_, UploadRow>(
            "SELECT bucket, key, content_type FROM multipart_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| BackendError::NoSuchSession(upload_id.to_string()))
    }

    /// Upsert the metadata row for a payload that is already in place.
    async fn upsert_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        size_bytes: i64,
        etag: &str,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (bucket, key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Drop the metadata rows of a finished session, logging failures.
    async fn forget_session(&self, upload_id: &str) {
        for stmt in [
            "DELETE FROM multipart_parts WHERE upload_id = ?",
            "DELETE FROM multipart_uploads WHERE upload_id = ?",
        ] {
            if let Err(err) = sqlx::query(stmt).bind(upload_id).execute(&*self.db).await {
                warn!(
                    session_id = %upload_id,
                    error = %err,
                    "failed to clean up multipart session rows"
                );
            }
        }
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write `bytes` next to `dest`, fsync, then rename into place.
async fn write_atomically(dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::other("destination path missing parent directory"))?;
    fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, dest).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// Concatenate staged part files into `dest` in the given order.
async fn concatenate_parts(dest: &Path, parts: &[PathBuf]) -> io::Result<u64> {
    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::other("destination path missing parent directory"))?;
    fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let result = async {
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .await?;
        let mut written = 0;
        for part in parts {
            let mut input = File::open(part).await?;
            written += tokio::io::copy(&mut input, &mut out).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        fs::rename(&tmp_path, dest).await?;
        Ok::<_, io::Error>(written)
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

/// S3-style multipart entity tag: MD5 over the concatenated part digests,
/// suffixed with the part count.
fn multipart_etag(part_etags: &[String]) -> String {
    let mut ctx = md5::Context::new();
    for etag in part_etags {
        for pair in etag.as_bytes().chunks(2) {
            if let Some(byte) = std::str::from_utf8(pair)
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                ctx.consume([byte]);
            }
        }
    }
    format!("{:x}-{}", ctx.compute(), part_etags.len())
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> BackendResult<()> {
        let file_path = self.object_path(bucket, key)?;
        write_atomically(&file_path, &bytes).await?;

        let etag = format!("{:x}", md5::compute(&bytes));
        if let Err(err) = self
            .upsert_object(bucket, key, content_type, bytes.len() as i64, &etag)
            .await
        {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        Ok(())
    }

    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> BackendResult<MultipartSession> {
        // Validate up front so a bad key fails before anything is staged.
        self.object_path(bucket, key)?;

        let upload_id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(self.staging_dir(&upload_id)).await?;
        sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, bucket, key, content_type, initiated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&upload_id)
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

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
        self.fetch_upload(&session.upload_id).await?;

        let etag = format!("{:x}", md5::compute(&bytes));
        write_atomically(&self.part_path(&session.upload_id, part_number), &bytes).await?;

        sqlx::query(
            r#"
            INSERT INTO multipart_parts (upload_id, part_number, size_bytes, etag, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(&session.upload_id)
        .bind(i64::from(part_number))
        .bind(bytes.len() as i64)
        .bind(&etag)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let upload = self.fetch_upload(&session.upload_id).await?;
        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::Permanent(
                "parts must be listed in ascending order".into(),
            ));
        }

        let staged = sqlx::query_as::<_, PartRow>(
            "SELECT part_number, size_bytes, etag FROM multipart_parts
             WHERE upload_id = ? ORDER BY part_number ASC",
        )
        .bind(&session.upload_id)
        .fetch_all(&*self.db)
        .await?;

        let mut paths = Vec::with_capacity(parts.len());
        let mut etags = Vec::with_capacity(parts.len());
        let mut expected_size = 0;
        for part in parts {
            let row = staged
                .iter()
                .find(|row| row.part_number == i64::from(part.part_number))
                .filter(|row| row.etag == part.etag)
                .ok_or_else(|| {
                    BackendError::Permanent(format!(
                        "part {} missing or etag mismatch",
                        part.part_number
                    ))
                })?;
            expected_size += row.size_bytes;
            paths.push(self.part_path(&session.upload_id, part.part_number));
            etags.push(row.etag.clone());
        }

        let file_path = self.object_path(&upload.bucket, &upload.key)?;
        let written = concatenate_parts(&file_path, &paths).await?;
        if written as i64 != expected_size {
            let _ = fs::remove_file(&file_path).await;
            return Err(BackendError::Permanent(format!(
                "assembled {} bytes, parts recorded {}",
                written, expected_size
            )));
        }

        let etag = multipart_etag(&etags);
        if let Err(err) = self
            .upsert_object(
                &upload.bucket,
                &upload.key,
                upload.content_type.as_deref(),
                expected_size,
                &etag,
            )
            .await
        {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        // The object is visible from here on; leftover session rows must not
        // fail the upload.
        self.forget_session(&session.upload_id).await;
        if let Err(err) = fs::remove_dir_all(self.staging_dir(&session.upload_id)).await {
            debug!("failed to remove staging for {}: {}", session.upload_id, err);
        }
        Ok(())
    }

    async fn abort_multipart(&self, session: &MultipartSession) -> BackendResult<()> {
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(&*self.db)
            .await?;
        let result = sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(&*self.db)
            .await?;

        match fs::remove_dir_all(self.staging_dir(&session.upload_id)).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if result.rows_affected() == 0 {
            return Err(BackendError::NoSuchSession(session.upload_id.clone()));
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> BackendResult<ObjectDownload> {
        let not_found = || BackendError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let file_path = self.object_path(bucket, key)?;
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT content_type, size_bytes FROM objects WHERE bucket = ? AND key = ?",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(not_found)?;

        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                not_found()
            } else {
                BackendError::from(err)
            }
        })?;

        Ok(ObjectDownload {
            key: ObjectKey::new(key),
            content_type: row.content_type,
            content_length: u64::try_from(row.size_bytes).ok(),
            body: ReaderStream::new(file).boxed(),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<&str>,
    ) -> BackendResult<ListingPage> {
        let fetch_limit = self.page_size + 1;
        let mut keys = sqlx::query_scalar::<_, String>(
            "SELECT key FROM objects WHERE bucket = ? AND key > ? ORDER BY key ASC LIMIT ?",
        )
        .bind(bucket)
        .bind(continuation_token.unwrap_or(""))
        .bind(fetch_limit as i64)
        .fetch_all(&*self.db)
        .await?;

        let mut continuation_token = None;
        if keys.len() == fetch_limit {
            keys.pop();
            continuation_token = keys.last().cloned();
        }
        Ok(ListingPage {
            entries: keys,
            continuation_token,
        })
    }

    /// Hard-delete the metadata row and the payload. A missing key is not an
    /// error.
    async fn delete_object(&self, bucket: &str, key: &str) -> BackendResult<()> {
        let file_path = self.object_path(bucket, key)?;
        sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;

        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket)?;
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    /// Runs `SELECT 1` and a write/read/delete round trip under the base path.
    async fn probe(&self, bucket: &str) -> BackendResult<()> {
        ensure_bucket_name_safe(bucket)?;
        let one = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(BackendError::Permanent(format!(
                "unexpected probe result: {}",
                one
            )));
        }

        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(BackendError::Permanent("probe file content mismatch".into()));
        }
        Ok(())
    }
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn ensure_bucket_name_safe(name: &str) -> BackendResult<()> {
    let invalid = |reason: &str| {
        Err(BackendError::Permanent(format!(
            "bucket `{}` invalid: {}",
            name, reason
        )))
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
    }
    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return invalid("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen combinations");
    }
    if is_ipv4_like(name) {
        return invalid("must not be formatted like an IP address");
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
