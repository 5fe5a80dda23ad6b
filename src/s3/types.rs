//! Value types shared by the client, paginator and batch deleter

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cursor::ContinuationToken;
use super::error::{Result, StorageError};

/// S3 limit on object key length, in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// S3 limit on keys per DeleteObjects request and per list page
pub const MAX_BATCH_SIZE: usize = 1000;

/// Validate S3 bucket name according to AWS rules
pub fn validate_bucket_name(bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(StorageError::invalid("bucket name cannot be empty"));
    }

    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(StorageError::invalid(format!(
            "bucket '{}' must be between 3 and 63 characters (got {})",
            bucket,
            bucket.len()
        )));
    }

    let alnum = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    let bytes = bucket.as_bytes();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(StorageError::invalid(format!(
            "bucket '{}' must start and end with a lowercase letter or number",
            bucket
        )));
    }

    if let Some(c) = bucket
        .chars()
        .find(|&c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '.')
    {
        return Err(StorageError::invalid(format!(
            "bucket '{}' contains invalid character '{}'",
            bucket, c
        )));
    }

    if bucket.contains("..") {
        return Err(StorageError::invalid(format!(
            "bucket '{}' cannot contain consecutive periods",
            bucket
        )));
    }

    let labels: Vec<&str> = bucket.split('.').collect();
    if labels.len() == 4 && labels.iter().all(|part| part.parse::<u8>().is_ok()) {
        return Err(StorageError::invalid(format!(
            "bucket '{}' cannot be formatted as an IP address",
            bucket
        )));
    }

    Ok(())
}

/// Validate an object key: non-empty, at most 1024 bytes of UTF-8.
///
/// `.` and `..` path segments are rejected because URL normalization would
/// silently address a different object.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::invalid("object key cannot be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::invalid(format!(
            "object key is {} bytes (max: {} bytes)",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(StorageError::invalid(format!(
            "object key '{}' contains a '.' or '..' path segment",
            key
        )));
    }
    Ok(())
}

/// Bucket + key pair naming one object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    bucket: String,
    key: String,
}

impl ObjectIdentifier {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let (bucket, key) = (bucket.into(), key.into());
        validate_bucket_name(&bucket)?;
        validate_key(&key)?;
        Ok(Self { bucket, key })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Object metadata as reported by list or head calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    /// STANDARD, STANDARD_IA, GLACIER, etc.
    pub storage_class: Option<String>,
}

impl ObjectMetadata {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
            content_type: None,
            storage_class: None,
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Groups rolled up by the delimiter, e.g. `photos/2024/`
    pub common_prefixes: Vec<String>,
    /// Present when `truncated` is true; pass it back verbatim to continue
    pub cursor: Option<ContinuationToken>,
    pub truncated: bool,
}

impl<T> Page<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parameters of a single ListObjectsV2 call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub cursor: Option<ContinuationToken>,
    /// 1..=1000; the service default (1000) when absent
    pub max_keys: Option<u32>,
}

impl ListRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        self.delimiter = (!delimiter.is_empty()).then_some(delimiter);
        self
    }

    pub fn with_max_keys(mut self, max_keys: u32) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    pub fn with_cursor(mut self, cursor: ContinuationToken) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Optional headers for `put_object`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    /// Canned ACL, e.g. `public-read`
    pub acl: Option<String>,
    /// User metadata, sent as `x-amz-meta-*`
    pub metadata: BTreeMap<String, String>,
    /// Value of the `Expires` header (cache expiry, not object lifecycle)
    pub expires: Option<DateTime<Utc>>,
}

impl PutOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjectOutput {
    pub metadata: ObjectMetadata,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BucketStatus {
    Exists,
    Absent,
}

/// Raw per-key answer of one DeleteObjects request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteObjectsOutput {
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteObjectError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteObjectError {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    Failed { code: String, message: String },
}

impl DeleteOutcome {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

/// Aggregated outcome of a batch delete: one entry per submitted identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDeleteResult {
    outcomes: BTreeMap<ObjectIdentifier, DeleteOutcome>,
    cancelled: bool,
}

impl BatchDeleteResult {
    pub(crate) fn record(&mut self, id: ObjectIdentifier, outcome: DeleteOutcome) {
        self.outcomes.insert(id, outcome);
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, id: &ObjectIdentifier) -> Option<&DeleteOutcome> {
        self.outcomes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectIdentifier, &DeleteOutcome)> {
        self.outcomes.iter()
    }

    pub fn deleted_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_deleted()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ObjectIdentifier, &DeleteOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_deleted())
    }

    /// True when the drain stopped on cancellation before consuming all input
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_validation() {
        // Valid bucket names
        assert!(validate_bucket_name("my-bucket").is_ok());
        assert!(validate_bucket_name("my.bucket.123").is_ok());
        assert!(validate_bucket_name("abc").is_ok());
        assert!(validate_bucket_name("1.2.3").is_ok());

        // Invalid bucket names
        assert!(validate_bucket_name("ab").is_err()); // Too short
        assert!(validate_bucket_name(&"a".repeat(64)).is_err()); // Too long
        assert!(validate_bucket_name("MY-BUCKET").is_err()); // Uppercase
        assert!(validate_bucket_name("my_bucket").is_err()); // Underscore
        assert!(validate_bucket_name("-mybucket").is_err()); // Starts with dash
        assert!(validate_bucket_name("mybucket-").is_err()); // Ends with dash
        assert!(validate_bucket_name("my..bucket").is_err()); // Consecutive periods
        assert!(validate_bucket_name("192.168.1.1").is_err()); // IP address format
        assert!(validate_bucket_name("").is_err()); // Empty
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("a/b.txt").is_ok());
        assert!(validate_key("héllo wörld").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("./b").is_err());
    }

    #[test]
    fn test_identifier_display_and_order() {
        let a = ObjectIdentifier::new("bucket-a", "x").unwrap();
        let b = ObjectIdentifier::new("bucket-a", "y").unwrap();
        assert!(a < b);
        assert_eq!(a.to_string(), "s3://bucket-a/x");
        assert!(ObjectIdentifier::new("bucket-a", "").is_err());
    }

    #[test]
    fn test_list_request_normalizes_empty_values() {
        let request = ListRequest::new("b").with_prefix("").with_delimiter("");
        assert_eq!(request.prefix, None);
        assert_eq!(request.delimiter, None);
    }

    #[test]
    fn test_batch_result_counts() {
        let mut result = BatchDeleteResult::default();
        let a = ObjectIdentifier::new("bkt", "a").unwrap();
        let b = ObjectIdentifier::new("bkt", "b").unwrap();
        result.record(a.clone(), DeleteOutcome::Deleted);
        result.record(b.clone(), DeleteOutcome::failed("AccessDenied", "nope"));
        result.record(a.clone(), DeleteOutcome::Deleted);

        assert_eq!(result.len(), 2);
        assert_eq!(result.deleted_count(), 1);
        assert_eq!(result.failures().count(), 1);
        assert_eq!(result.get(&a), Some(&DeleteOutcome::Deleted));
        assert!(!result.is_cancelled());
    }
}
