//! Bulk deletion of a stream of objects, one DeleteObjects request per batch.

use std::collections::HashMap;
use std::pin::pin;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::S3Client;
use super::error::{ErrorKind, Result, StorageError};
use super::types::{BatchDeleteResult, DeleteOutcome, MAX_BATCH_SIZE, ObjectIdentifier};

/// Outcome code for keys the service left out of its answer
pub const MISSING_FROM_RESPONSE: &str = "MissingFromResponse";

/// Outcome code for keys consumed from the input but never sent
pub const NOT_ATTEMPTED: &str = "Cancelled";

/// Drains a stream of [`ObjectIdentifier`]s into bulk delete requests.
///
/// Keys are grouped into batches of at most `batch_size` keys of the same
/// bucket. Only one batch is held in memory at a time.
#[derive(Debug, Clone)]
pub struct BatchDeleter<'a> {
    client: &'a S3Client,
    batch_size: usize,
    cancel_token: Option<CancellationToken>,
}

impl<'a> BatchDeleter<'a> {
    /// `batch_size` must be between 1 and 1000
    pub fn new(client: &'a S3Client, batch_size: usize) -> Result<Self> {
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(StorageError::invalid(format!(
                "batch size must be between 1 and {} (got {})",
                MAX_BATCH_SIZE, batch_size
            )));
        }
        Ok(Self {
            client,
            batch_size,
            cancel_token: None,
        })
    }

    /// Stop sending batches once `token` fires; the partial result comes
    /// back with [`BatchDeleteResult::is_cancelled`] set
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Delete every identifier the stream yields.
    ///
    /// Every consumed identifier gets exactly one outcome. A batch the
    /// service could not be reached for (after the client's retries) is
    /// recorded as failed and the drain goes on; any other whole-batch error,
    /// and any error yielded by the input stream, aborts the drain.
    pub async fn delete_all<S>(&self, identifiers: S) -> Result<BatchDeleteResult>
    where
        S: Stream<Item = Result<ObjectIdentifier>>,
    {
        let mut identifiers = pin!(identifiers);
        let mut result = BatchDeleteResult::default();
        let mut batch: Vec<ObjectIdentifier> = Vec::with_capacity(self.batch_size);
        let mut batches = 0usize;

        loop {
            if self.is_cancelled() {
                self.abandon(std::mem::take(&mut batch), &mut result);
                break;
            }

            let Some(next) = identifiers.next().await else {
                break;
            };
            let id = next?;

            if batch.first().is_some_and(|first| first.bucket() != id.bucket()) {
                self.flush(&mut batch, &mut result).await?;
                batches += 1;
                if result.is_cancelled() {
                    // `id` is already consumed and must still get an outcome
                    self.abandon(vec![id], &mut result);
                    break;
                }
            }

            batch.push(id);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch, &mut result).await?;
                batches += 1;
                if result.is_cancelled() {
                    break;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, &mut result).await?;
            batches += 1;
        }

        info!(
            batches,
            deleted = result.deleted_count(),
            failed = result.failures().count(),
            cancelled = result.is_cancelled(),
            "batch delete finished"
        );
        Ok(result)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn abandon(&self, ids: Vec<ObjectIdentifier>, result: &mut BatchDeleteResult) {
        for id in ids {
            result.record(
                id,
                DeleteOutcome::failed(NOT_ATTEMPTED, "batch delete was cancelled before this key was sent"),
            );
        }
        result.mark_cancelled();
    }

    async fn flush(&self, batch: &mut Vec<ObjectIdentifier>, result: &mut BatchDeleteResult) -> Result<()> {
        let ids = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let Some(bucket) = ids.first().map(|id| id.bucket().to_string()) else {
            return Ok(());
        };

        if self.is_cancelled() {
            self.abandon(ids, result);
            return Ok(());
        }

        let keys: Vec<String> = ids.iter().map(|id| id.key().to_string()).collect();
        match self.client.delete_objects(&bucket, &keys).await {
            Ok(output) => {
                let mut outcomes: HashMap<String, DeleteOutcome> =
                    HashMap::with_capacity(output.deleted.len() + output.errors.len());
                for key in output.deleted {
                    outcomes.insert(key, DeleteOutcome::Deleted);
                }
                for err in output.errors {
                    // Already gone counts as deleted
                    let outcome = if err.code == "NoSuchKey" {
                        DeleteOutcome::Deleted
                    } else {
                        DeleteOutcome::failed(err.code, err.message)
                    };
                    outcomes.insert(err.key, outcome);
                }

                for id in ids {
                    let outcome = outcomes.get(id.key()).cloned().unwrap_or_else(|| {
                        DeleteOutcome::failed(
                            MISSING_FROM_RESPONSE,
                            "the service did not report an outcome for this key",
                        )
                    });
                    result.record(id, outcome);
                }
            }
            Err(e) if e.kind().is_transport_level() => {
                warn!(bucket, keys = ids.len(), error = %e, "batch could not be delivered");
                let message = e.to_string();
                for id in ids {
                    result.record(
                        id,
                        DeleteOutcome::failed(ErrorKind::TransportFailure.code(), message.clone()),
                    );
                }
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }
}
