use anyhow::{Context, Result};
use bytes::Bytes;
use indicatif::ProgressBar;
use std::path::Path;
use tracing::debug;

use super::client::S3Client;
use super::compare::{FileComparison, compare_file};
use super::helpers::detect_content_type;
use super::types::PutOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Uploaded { size: u64, etag: Option<String> },
    /// Remote object already matches the local file
    Skipped,
}

/// Upload a file to S3 with progress bar
///
/// The content type is detected from the file extension unless `options`
/// sets one.
pub async fn upload_file(
    client: &S3Client,
    bucket: &str,
    s3_key: &str,
    local_path: &Path,
    options: &PutOptions,
    pb: Option<&ProgressBar>,
) -> Result<UploadResult> {
    let body = tokio::fs::read(local_path)
        .await
        .with_context(|| format!("Failed to read local file {}", local_path.display()))?;
    let file_size = body.len() as u64;

    if let Some(pb) = pb {
        pb.set_length(file_size);
        pb.set_message(format!("Uploading {}", local_path.display()));
    }

    let mut options = options.clone();
    if options.content_type.is_none() {
        options.content_type = Some(detect_content_type(local_path).to_string());
    }

    let output = client
        .put_object(bucket, s3_key, Bytes::from(body), &options)
        .await
        .with_context(|| format!("Failed to upload {} to s3://{}/{}", local_path.display(), bucket, s3_key))?;

    if let Some(pb) = pb {
        pb.set_position(file_size);
        pb.finish_with_message(format!("Uploaded {}", local_path.display()));
    }

    Ok(UploadResult::Uploaded {
        size: file_size,
        etag: output.etag,
    })
}

/// Upload a file unless the remote copy is already identical
pub async fn sync_file(
    client: &S3Client,
    bucket: &str,
    s3_key: &str,
    local_path: &Path,
    options: &PutOptions,
    pb: Option<&ProgressBar>,
) -> Result<UploadResult> {
    if compare_file(client, bucket, s3_key, local_path).await? == FileComparison::Identical {
        debug!(key = s3_key, "remote object is identical, skipping upload");
        if let Some(pb) = pb {
            pb.finish_with_message(format!("Unchanged {}", local_path.display()));
        }
        return Ok(UploadResult::Skipped);
    }

    upload_file(client, bucket, s3_key, local_path, options, pb).await
}

/// Download an object into a local file, returning the number of bytes written
pub async fn download_file(client: &S3Client, bucket: &str, s3_key: &str, local_path: &Path) -> Result<u64> {
    let object = client
        .get_object(bucket, s3_key)
        .await
        .with_context(|| format!("Failed to download s3://{}/{}", bucket, s3_key))?;

    if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    tokio::fs::write(local_path, &object.body)
        .await
        .with_context(|| format!("Failed to write {}", local_path.display()))?;

    Ok(object.body.len() as u64)
}
