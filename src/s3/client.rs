//! S3 client with the core object and bucket operations.
//!
//! Every call is built from the [`ClientConfig`], signed through the
//! [`Signer`] (again on every attempt, since the timestamp is part of the
//! signature), sent through the [`Transport`] under a request timeout, and
//! retried according to the [`RetryPolicy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::Md5;
use reqwest::Method;
use serde::Serialize;
use sha2::Digest;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::cursor::ContinuationToken;
use super::error::{Result, StorageError};
use super::paginator::ListObjectsPaginator;
use super::presign::PresignedRequest;
use super::retry::{RetryDecision, RetryPolicy};
use super::signer::{SigV4Signer, Signer, SigningParams, encode_query};
use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use super::types::{
    BucketStatus, DeleteObjectsOutput, GetObjectOutput, ListRequest, MAX_BATCH_SIZE,
    ObjectMetadata, Page, PutObjectOutput, PutOptions, validate_bucket_name, validate_key,
};
use super::xml;
use crate::config::ClientConfig;

const SERVICE: &str = "s3";

/// Snapshot of the client's request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Attempts sent to the transport, retries included
    pub requests: u64,
    pub retries: u64,
    /// Calls that ended in an error after the retry policy gave up
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    retry: RetryPolicy,
    counters: Counters,
}

/// Cheap to clone; clones share configuration, connections and counters.
#[derive(Debug, Clone)]
pub struct S3Client {
    inner: Arc<ClientInner>,
}

impl S3Client {
    /// Create a client talking HTTP(S) through `reqwest`, signing with SigV4
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::with_parts(
            config,
            Arc::new(transport),
            Arc::new(SigV4Signer::new()),
        ))
    }

    /// Create a client with an explicit transport and signer
    pub fn with_parts(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                signer,
                retry,
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn stats(&self) -> ClientStats {
        let counters = &self.inner.counters;
        ClientStats {
            requests: counters.requests.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Check whether a bucket exists and is reachable with our credentials
    pub async fn head_bucket(&self, bucket: &str) -> Result<BucketStatus> {
        let url = self.config().bucket_url(bucket)?;
        let request = HttpRequest::new(Method::HEAD, url);

        match self.execute(request, &bucket_resource(bucket)).await {
            Ok(_) => Ok(BucketStatus::Exists),
            Err(StorageError::NotFound { .. }) => Ok(BucketStatus::Absent),
            Err(e) => Err(e),
        }
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let url = self.config().bucket_url(bucket)?;
        let mut request = HttpRequest::new(Method::PUT, url);

        // us-east-1 is the implicit location and must not be sent
        let region = self.config().region();
        if region != "us-east-1" {
            request = request
                .with_header("content-type", "application/xml")
                .with_body(Bytes::from(xml::build_create_bucket(region)));
        }

        self.execute(request, &bucket_resource(bucket)).await?;
        debug!(bucket, "bucket created");
        Ok(())
    }

    /// Delete an empty bucket
    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let url = self.config().bucket_url(bucket)?;
        self.execute(HttpRequest::new(Method::DELETE, url), &bucket_resource(bucket))
            .await?;
        Ok(())
    }

    /// Fetch one page of a ListObjectsV2 listing.
    ///
    /// The returned cursor is only valid for the same bucket, prefix and
    /// delimiter; presenting it with any other scope fails with
    /// [`StorageError::InvalidContinuation`].
    pub async fn list_objects(&self, request: &ListRequest) -> Result<Page<ObjectMetadata>> {
        validate_bucket_name(&request.bucket)?;
        if let Some(max_keys) = request.max_keys.filter(|n| !(1..=MAX_BATCH_SIZE as u32).contains(n)) {
            return Err(StorageError::invalid(format!(
                "max_keys must be between 1 and {} (got {})",
                MAX_BATCH_SIZE, max_keys
            )));
        }

        let service_token = request
            .cursor
            .as_ref()
            .map(|cursor| cursor.redeem(request))
            .transpose()?;

        let mut query = String::from("list-type=2");
        if let Some(token) = service_token.as_deref() {
            query.push_str("&continuation-token=");
            query.push_str(&encode_query(token));
        }
        if let Some(delimiter) = request.delimiter.as_deref() {
            query.push_str("&delimiter=");
            query.push_str(&encode_query(delimiter));
        }
        if let Some(max_keys) = request.max_keys {
            query.push_str(&format!("&max-keys={max_keys}"));
        }
        if let Some(prefix) = request.prefix.as_deref() {
            query.push_str("&prefix=");
            query.push_str(&encode_query(prefix));
        }

        let mut url = self.config().bucket_url(&request.bucket)?;
        url.set_query(Some(&query));

        let response = match self
            .execute(HttpRequest::new(Method::GET, url), &bucket_resource(&request.bucket))
            .await
        {
            Ok(response) => response,
            Err(StorageError::Validation { code, message })
                if service_token.is_some() && code == "InvalidArgument" =>
            {
                return Err(StorageError::InvalidContinuation(message));
            }
            Err(e) => return Err(e),
        };

        let listing = xml::parse_list_objects(&response.body)?;
        let cursor = match (listing.is_truncated, listing.next_continuation_token) {
            (true, Some(token)) => Some(ContinuationToken::issue(request, &token)),
            (true, None) => {
                return Err(StorageError::MalformedResponse(
                    "truncated listing without a continuation token".to_string(),
                ));
            }
            (false, _) => None,
        };

        debug!(
            bucket = %request.bucket,
            objects = listing.objects.len(),
            truncated = listing.is_truncated,
            "listed page"
        );

        Ok(Page {
            items: listing.objects,
            common_prefixes: listing.common_prefixes,
            cursor,
            truncated: listing.is_truncated,
        })
    }

    /// Iterate over every page of a listing
    pub fn paginate(&self, request: ListRequest) -> ListObjectsPaginator<'_> {
        ListObjectsPaginator::new(self, request)
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput> {
        let url = self.config().object_url(bucket, key)?;
        let response = self
            .execute(HttpRequest::new(Method::GET, url), &object_resource(bucket, key))
            .await?;

        let metadata = metadata_from_headers(key, &response)?;
        Ok(GetObjectOutput {
            metadata,
            body: response.body,
        })
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let url = self.config().object_url(bucket, key)?;
        let response = self
            .execute(HttpRequest::new(Method::HEAD, url), &object_resource(bucket, key))
            .await?;

        metadata_from_headers(key, &response)
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        options: &PutOptions,
    ) -> Result<PutObjectOutput> {
        let url = self.config().object_url(bucket, key)?;
        let body = body.into();
        let size = body.len();

        let mut request = HttpRequest::new(Method::PUT, url)
            .with_header("content-length", size.to_string())
            .with_body(body);
        if let Some(content_type) = options.content_type.as_deref() {
            request = request.with_header("content-type", content_type);
        }
        if let Some(acl) = options.acl.as_deref() {
            request = request.with_header("x-amz-acl", acl);
        }
        if let Some(expires) = options.expires {
            request = request.with_header("expires", http_date(expires));
        }
        for (name, value) in &options.metadata {
            request = request.with_header(&format!("x-amz-meta-{name}"), value.as_str());
        }

        let response = self.execute(request, &object_resource(bucket, key)).await?;
        debug!(bucket, key, size, "object uploaded");

        Ok(PutObjectOutput {
            etag: response.header("etag").map(str::to_string),
        })
    }

    /// Delete one object. Deleting a missing object succeeds.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let url = self.config().object_url(bucket, key)?;
        match self
            .execute(HttpRequest::new(Method::DELETE, url), &object_resource(bucket, key))
            .await
        {
            Ok(_) | Err(StorageError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete up to 1000 objects of one bucket in a single request.
    ///
    /// The whole request fails only when the service rejects it as a whole;
    /// per-key failures are reported in [`DeleteObjectsOutput::errors`].
    pub async fn delete_objects(&self, bucket: &str, keys: &[String]) -> Result<DeleteObjectsOutput> {
        if keys.is_empty() {
            return Ok(DeleteObjectsOutput::default());
        }
        if keys.len() > MAX_BATCH_SIZE {
            return Err(StorageError::invalid(format!(
                "cannot delete more than {} objects at once (got {})",
                MAX_BATCH_SIZE,
                keys.len()
            )));
        }
        for key in keys {
            validate_key(key)?;
        }

        let body = xml::build_delete_request(keys).into_bytes();
        let content_md5 = STANDARD.encode(Md5::digest(&body));

        // "delete=" (explicit empty value) keeps the canonical query in SigV4 form
        let mut url = self.config().bucket_url(bucket)?;
        url.set_query(Some("delete="));

        let request = HttpRequest::new(Method::POST, url)
            .with_header("content-type", "application/xml")
            .with_header("content-length", body.len().to_string())
            .with_header("content-md5", content_md5)
            .with_body(Bytes::from(body));

        let response = self.execute(request, &bucket_resource(bucket)).await?;
        let output = xml::parse_delete_result(&response.body)?;

        debug!(
            bucket,
            requested = keys.len(),
            deleted = output.deleted.len(),
            errors = output.errors.len(),
            "bulk delete"
        );
        Ok(output)
    }

    /// Pre-sign a request for `method` on one object.
    ///
    /// `expires_in` must be a whole number of seconds between 1 second and
    /// 7 days; it is never clamped or rounded.
    pub fn presign(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<PresignedRequest> {
        let url = self.config().object_url(bucket, key)?;
        let issued_at = Utc::now();
        let request = HttpRequest::new(method.clone(), url);

        let url = self
            .inner
            .signer
            .presign(&request, &self.signing_params(issued_at), expires_in)?;
        let validity = chrono::TimeDelta::from_std(expires_in)
            .map_err(|e| StorageError::invalid(format!("invalid presign expiry: {e}")))?;

        Ok(PresignedRequest {
            method,
            url,
            issued_at,
            expires_at: issued_at + validity,
        })
    }

    fn signing_params(&self, time: DateTime<Utc>) -> SigningParams<'_> {
        SigningParams {
            credentials: self.config().credentials(),
            region: self.config().region(),
            service: SERVICE,
            time,
        }
    }

    /// Sign, send and retry until success or the retry policy gives up
    async fn execute(&self, request: HttpRequest, resource: &str) -> Result<HttpResponse> {
        let inner = &self.inner;
        let timeout = inner.config.request_timeout();
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let signed = inner
                .signer
                .sign(request.clone(), &self.signing_params(Utc::now()))?;

            debug!(method = %signed.method, url = %signed.url, attempt, "sending request");
            inner.counters.requests.fetch_add(1, Ordering::Relaxed);

            let error = match tokio::time::timeout(timeout, inner.transport.send(signed)).await {
                Ok(Ok(response)) if response.status.is_success() => return Ok(response),
                Ok(Ok(response)) => error_from_response(&response, resource),
                Ok(Err(e)) => StorageError::from(e),
                Err(_) => StorageError::Transient {
                    status: None,
                    message: format!("no response within {:?}", timeout),
                },
            };

            let reason = error.to_string();
            match inner.retry.decide(attempt, error, started.elapsed()) {
                RetryDecision::RetryAfter(delay) => {
                    inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        method = %request.method,
                        resource,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(error) => {
                    inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(error.into_terminal(attempt));
                }
            }
        }
    }
}

fn bucket_resource(bucket: &str) -> String {
    format!("bucket '{bucket}'")
}

fn object_resource(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

fn error_from_response(response: &HttpResponse, resource: &str) -> StorageError {
    let (code, message) = xml::parse_error(&response.body);
    StorageError::from_service(
        response.status.as_u16(),
        code.as_deref(),
        message.as_deref(),
        resource,
    )
}

fn metadata_from_headers(key: &str, response: &HttpResponse) -> Result<ObjectMetadata> {
    let size = match response.header("content-length") {
        Some(value) => value.trim().parse().map_err(|e| {
            StorageError::MalformedResponse(format!("invalid content-length '{value}': {e}"))
        })?,
        None => response.body.len() as u64,
    };

    let mut metadata = ObjectMetadata::new(key, size);
    metadata.last_modified = response
        .header("last-modified")
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|t| t.with_timezone(&Utc));
    metadata.etag = response.header("etag").map(str::to_string);
    metadata.content_type = response.header("content-type").map(str::to_string);
    metadata.storage_class = response.header("x-amz-storage-class").map(str::to_string);
    Ok(metadata)
}

/// RFC 7231 IMF-fixdate, as used by `Expires` and `Last-Modified`
pub(crate) fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
