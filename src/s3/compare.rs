use anyhow::{Context, Result};
use md5::{Digest, Md5};
use std::path::Path;

use super::client::S3Client;
use super::error::StorageError;

#[derive(Debug, PartialEq)]
pub enum FileComparison {
    /// File doesn't exist on S3
    NotFound,
    /// Files are identical (same size and ETag)
    Identical,
    /// Files are different
    Different,
}

/// Compare local file with remote S3 object
pub async fn compare_file(
    client: &S3Client,
    bucket: &str,
    s3_key: &str,
    local_path: &Path,
) -> Result<FileComparison> {
    let local_size = tokio::fs::metadata(local_path)
        .await
        .with_context(|| format!("Failed to stat {}", local_path.display()))?
        .len();

    let head = match client.head_object(bucket, s3_key).await {
        Ok(head) => head,
        Err(StorageError::NotFound { .. }) => return Ok(FileComparison::NotFound),
        Err(e) => return Err(e.into()),
    };

    // First quick check: compare sizes
    if local_size != head.size {
        return Ok(FileComparison::Different);
    }

    // Multipart ETags ("<md5>-<parts>") are not a content hash; size has to do
    let Some(etag) = head
        .etag
        .as_deref()
        .map(|e| e.trim_matches('"'))
        .filter(|e| !e.contains('-'))
    else {
        return Ok(FileComparison::Identical);
    };

    let content = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("Failed to read {}", local_path.display()))?;
    let local_md5 = hex::encode(Md5::digest(&content));

    if local_md5.eq_ignore_ascii_case(etag) {
        Ok(FileComparison::Identical)
    } else {
        Ok(FileComparison::Different)
    }
}
