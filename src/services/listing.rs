//! Lazy, paginated enumeration of the keys in a bucket.

use crate::{backend::ObjectBackend, errors::TransferError, models::ObjectKey};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use std::sync::Arc;
use tracing::{debug, warn};

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Walks a bucket one listing page at a time.
#[derive(Clone)]
pub struct ListingEnumerator {
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    max_pages: usize,
}

impl ListingEnumerator {
    pub fn new(backend: Arc<dyn ObjectBackend>, bucket: impl Into<String>, max_pages: usize) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            max_pages: max_pages.max(1),
        }
    }

    /// Every key in the bucket, in backend order.
    ///
    /// Each call starts from the first page. A page is only requested once
    /// the keys of the previous one have been consumed. The stream ends with
    /// an error if the backend hands back the token it was just given, or
    /// if more than `max_pages` pages would be needed.
    pub fn list(&self) -> BoxStream<'static, Result<ObjectKey, TransferError>> {
        let backend = self.backend.clone();
        let bucket = self.bucket.clone();
        let max_pages = self.max_pages;

        stream::try_unfold((Cursor::Start, 0usize), move |(cursor, pages)| {
            let backend = backend.clone();
            let bucket = bucket.clone();
            async move {
                let token = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(token) => Some(token),
                };
                if pages >= max_pages {
                    warn!(bucket = %bucket, pages, "listing page limit reached");
                    return Err(TransferError::PermanentBackend(format!(
                        "listing of `{}` exceeded {} pages",
                        bucket, max_pages
                    )));
                }

                let page = backend.list_objects(&bucket, token.as_deref()).await?;
                debug!(
                    bucket = %bucket,
                    page = pages + 1,
                    entries = page.entries.len(),
                    "fetched listing page"
                );

                let next = match page.continuation_token {
                    Some(next) if token.as_deref() == Some(next.as_str()) => {
                        return Err(TransferError::PermanentBackend(format!(
                            "listing of `{}` repeated continuation token `{}`",
                            bucket, next
                        )));
                    }
                    Some(next) => Cursor::Next(next),
                    None => Cursor::Done,
                };
                Ok::<_, TransferError>(Some((page.entries, (next, pages + 1))))
            }
        })
        .map_ok(|entries| {
            stream::iter(
                entries
                    .into_iter()
                    .map(|key| Ok::<_, TransferError>(ObjectKey::new(key))),
            )
        })
        .try_flatten()
        .boxed()
    }
}
