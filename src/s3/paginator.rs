//! Page-by-page iteration over ListObjectsV2.

use futures::{Stream, TryStreamExt, stream};
use tracing::debug;

use super::client::S3Client;
use super::cursor::ContinuationToken;
use super::error::{Result, StorageError};
use super::types::{ListRequest, ObjectIdentifier, ObjectMetadata, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginatorState {
    /// The next call to `next_page` issues a request
    Ready,
    /// A request is in flight
    Fetching,
    /// The last page has been returned
    Exhausted,
}

/// Holds the paginator in `Fetching` and puts it back to `Ready` when the
/// request ends, including when the `next_page` future is dropped
struct InFlight<'s>(&'s mut PaginatorState);

impl<'s> InFlight<'s> {
    fn start(state: &'s mut PaginatorState) -> Self {
        *state = PaginatorState::Fetching;
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        *self.0 = PaginatorState::Ready;
    }
}

/// Drives repeated `list_objects` calls, carrying the cursor between them.
///
/// A failed page leaves the paginator `Ready` at the same cursor, so calling
/// [`next_page`](Self::next_page) again retries that page. Dropping an
/// in-flight `next_page` future has the same effect.
#[derive(Debug)]
pub struct ListObjectsPaginator<'a> {
    client: &'a S3Client,
    request: ListRequest,
    cursor: Option<ContinuationToken>,
    state: PaginatorState,
    pages: usize,
}

impl<'a> ListObjectsPaginator<'a> {
    /// A cursor already set on `request` is where iteration starts.
    pub fn new(client: &'a S3Client, mut request: ListRequest) -> Self {
        let cursor = request.cursor.take();
        Self {
            client,
            request,
            cursor,
            state: PaginatorState::Ready,
            pages: 0,
        }
    }

    pub fn state(&self) -> PaginatorState {
        self.state
    }

    /// Cursor the next request will carry
    pub fn cursor(&self) -> Option<&ContinuationToken> {
        self.cursor.as_ref()
    }

    /// Pages returned so far
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn request(&self) -> &ListRequest {
        &self.request
    }

    /// Fetch the next page, or `None` once the listing is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Page<ObjectMetadata>>> {
        if self.state == PaginatorState::Exhausted {
            return Ok(None);
        }

        let mut request = self.request.clone();
        request.cursor = self.cursor.clone();

        let in_flight = InFlight::start(&mut self.state);
        let result = self.client.list_objects(&request).await;
        drop(in_flight);
        let page = result?;

        self.pages += 1;
        if page.truncated {
            self.cursor = page.cursor.clone();
        } else {
            self.cursor = None;
            self.state = PaginatorState::Exhausted;
            debug!(bucket = %self.request.bucket, pages = self.pages, "listing exhausted");
        }

        Ok(Some(page))
    }

    /// Start over from the first page
    pub fn reset(&mut self) {
        self.cursor = None;
        self.state = PaginatorState::Ready;
        self.pages = 0;
    }

    /// Continue from a cursor previously returned for this same listing
    pub fn resume_from(&mut self, cursor: ContinuationToken) {
        self.cursor = Some(cursor);
        self.state = PaginatorState::Ready;
    }

    /// Pages as a stream; ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Page<ObjectMetadata>>> + 'a {
        stream::try_unfold(self, |mut paginator| async move {
            Ok::<_, StorageError>(paginator
                .next_page()
                .await?
                .map(|page| (page, paginator)))
        })
    }

    /// Every listed object as an [`ObjectIdentifier`], ready to feed a
    /// [`BatchDeleter`](super::batch::BatchDeleter)
    pub fn into_identifiers(self) -> impl Stream<Item = Result<ObjectIdentifier>> + 'a {
        let bucket = self.request.bucket.clone();
        self.into_stream()
            .map_ok(move |page| {
                let bucket = bucket.clone();
                stream::iter(
                    page.items
                        .into_iter()
                        .map(move |obj| ObjectIdentifier::new(bucket.clone(), obj.key)),
                )
            })
            .try_flatten()
    }

    /// Every listed object's metadata, across all pages
    pub fn into_objects(self) -> impl Stream<Item = Result<ObjectMetadata>> + 'a {
        self.into_stream()
            .map_ok(|page| stream::iter(page.items.into_iter().map(Ok::<_, StorageError>)))
            .try_flatten()
    }
}
