//! Retrying client for S3-compatible object storage.
//!
//! [`S3Client`] signs every request with SigV4 and retries throttling and
//! transient failures with jittered backoff. On top of it sit a
//! [`ListObjectsPaginator`], a [`Waiter`] for bucket/object existence and a
//! [`BatchDeleter`] that drains identifier streams into bulk deletes.

pub mod config;
pub mod s3;

pub use config::{ClientConfig, Credentials};
pub use s3::{
    BatchDeleter, ErrorKind, ListObjectsPaginator, ListRequest, ObjectIdentifier, Result,
    S3Client, StorageError, Waiter, WaiterConfig,
};
