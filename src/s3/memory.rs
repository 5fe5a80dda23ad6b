//! In-process S3-compatible service.
//!
//! [`MemoryTransport`] answers the subset of the S3 REST API the client
//! speaks: bucket head/create/delete, ListObjectsV2, DeleteObjects and object
//! put/get/head/delete, with S3's XML error bodies. Faults can be injected
//! to exercise retries, and signatures are verified when credentials are
//! configured.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use md5::Md5;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use reqwest::{Method, StatusCode};
use sha2::Digest;

use super::client::http_date;
use super::signer::{SigV4Signer, Signer, SigningParams};
use super::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use super::types::{DeleteObjectError, DeleteObjectsOutput, MAX_BATCH_SIZE, ObjectMetadata};
use super::xml::{self, ListEcho, ListObjectsResult};
use crate::config::Credentials;

/// A failure the service produces instead of answering normally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status and S3 error code
    Status { status: u16, code: String },
    /// Drop the connection
    Network,
    /// Hold the request this long, then answer normally
    Delay(Duration),
}

impl Fault {
    pub fn status(status: u16, code: impl Into<String>) -> Self {
        Self::Status {
            status,
            code: code.into(),
        }
    }

    pub fn slow_down() -> Self {
        Self::status(503, "SlowDown")
    }

    pub fn internal_error() -> Self {
        Self::status(500, "InternalError")
    }
}

#[derive(Debug)]
struct PendingFault {
    method: Option<Method>,
    fault: Fault,
    remaining: usize,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    etag: String,
    content_type: Option<String>,
    last_modified: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    faults: VecDeque<PendingFault>,
    /// Keys left out of DeleteObjects answers
    omitted: HashSet<String>,
    /// Keys DeleteObjects refuses with AccessDenied
    protected: HashSet<String>,
    log: Vec<String>,
}

/// In-memory S3 service usable as a [`Transport`]
///
/// Clones share the same buckets, so a test can keep a handle for seeding and
/// inspection while the client owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
    credentials: Option<Credentials>,
    virtual_host: Option<String>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify every request's SigV4 signature against these credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Also accept virtual-hosted requests addressed to `<bucket>.<base_host>`
    pub fn with_virtual_host(mut self, base_host: impl Into<String>) -> Self {
        self.virtual_host = Some(base_host.into());
        self
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Store an object directly, creating the bucket if needed
    pub fn put(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let object = StoredObject::new(body.into(), None, BTreeMap::new());
        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.state.lock().buckets.contains_key(bucket)
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .is_some_and(|objects| objects.contains_key(key))
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.state.lock().buckets.get(bucket).map_or(0, BTreeMap::len)
    }

    pub fn body(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let state = self.state.lock();
        state.buckets.get(bucket)?.get(key).map(|o| o.body.clone())
    }

    /// Fail the next `times` requests (any method) with `fault`
    pub fn inject(&self, fault: Fault, times: usize) {
        self.push_fault(None, fault, times);
    }

    /// Fail the next `times` requests using `method` with `fault`
    pub fn inject_on(&self, method: Method, fault: Fault, times: usize) {
        self.push_fault(Some(method), fault, times);
    }

    fn push_fault(&self, method: Option<Method>, fault: Fault, times: usize) {
        if times == 0 {
            return;
        }
        self.state.lock().faults.push_back(PendingFault {
            method,
            fault,
            remaining: times,
        });
    }

    /// Leave `key` out of DeleteObjects answers (while still deleting it)
    pub fn omit_from_delete_result(&self, key: &str) {
        self.state.lock().omitted.insert(key.to_string());
    }

    /// Refuse to delete `key` through DeleteObjects
    pub fn protect(&self, key: &str) {
        self.state.lock().protected.insert(key.to_string());
    }

    /// Number of requests received, faulted ones included
    pub fn request_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// `METHOD path?query` for every request received, oldest first
    pub fn request_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    fn take_fault(&self, method: &Method) -> Option<Fault> {
        let mut state = self.state.lock();
        let index = state
            .faults
            .iter()
            .position(|f| f.method.as_ref().is_none_or(|m| m == method))?;

        let pending = &mut state.faults[index];
        let fault = pending.fault.clone();
        pending.remaining -= 1;
        if pending.remaining == 0 {
            state.faults.remove(index);
        }
        Some(fault)
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let resource = request.url.path().to_string();

        if let Err(response) = self.authenticate(request) {
            return response;
        }

        let Some((bucket, key)) = self.route(request) else {
            return error_response(StatusCode::BAD_REQUEST, "InvalidURI", "Couldn't parse the specified URI.", &resource);
        };

        let query: BTreeMap<String, String> = request.url.query_pairs().into_owned().collect();
        let mut state = self.state.lock();

        match (key, &request.method) {
            (None, &Method::HEAD) => {
                if state.buckets.contains_key(&bucket) {
                    HttpResponse::new(StatusCode::OK)
                } else {
                    no_such_bucket(&resource)
                }
            }
            (None, &Method::PUT) => {
                if state.buckets.contains_key(&bucket) {
                    return error_response(
                        StatusCode::CONFLICT,
                        "BucketAlreadyOwnedByYou",
                        "Your previous request to create the named bucket succeeded and you already own it.",
                        &resource,
                    );
                }
                state.buckets.insert(bucket, BTreeMap::new());
                HttpResponse::new(StatusCode::OK)
            }
            (None, &Method::DELETE) => match state.buckets.get(&bucket).map(BTreeMap::is_empty) {
                None => no_such_bucket(&resource),
                Some(false) => error_response(
                    StatusCode::CONFLICT,
                    "BucketNotEmpty",
                    "The bucket you tried to delete is not empty",
                    &resource,
                ),
                Some(true) => {
                    state.buckets.remove(&bucket);
                    HttpResponse::new(StatusCode::NO_CONTENT)
                }
            },
            (None, &Method::GET) => match state.buckets.get(&bucket) {
                None => no_such_bucket(&resource),
                Some(objects) => list_objects(&bucket, objects, &query, &resource),
            },
            (None, &Method::POST) if query.contains_key("delete") => {
                let (omitted, protected) = (state.omitted.clone(), state.protected.clone());
                match state.buckets.get_mut(&bucket) {
                    None => no_such_bucket(&resource),
                    Some(objects) => delete_objects(objects, request, &omitted, &protected, &resource),
                }
            }
            (Some(key), method) => {
                let Some(objects) = state.buckets.get_mut(&bucket) else {
                    return no_such_bucket(&resource);
                };
                match *method {
                    Method::PUT => {
                        let metadata = request
                            .headers
                            .iter()
                            .filter_map(|(name, value)| {
                                name.strip_prefix("x-amz-meta-")
                                    .map(|n| (n.to_string(), value.clone()))
                            })
                            .collect();
                        let object = StoredObject::new(
                            request.body.clone(),
                            request.header("content-type").map(str::to_string),
                            metadata,
                        );
                        let etag = object.etag.clone();
                        objects.insert(key, object);
                        HttpResponse::new(StatusCode::OK).with_header("etag", etag)
                    }
                    Method::GET | Method::HEAD => match objects.get(&key) {
                        None => error_response(
                            StatusCode::NOT_FOUND,
                            "NoSuchKey",
                            "The specified key does not exist.",
                            &resource,
                        ),
                        Some(object) => object.response(),
                    },
                    Method::DELETE => {
                        objects.remove(&key);
                        HttpResponse::new(StatusCode::NO_CONTENT)
                    }
                    _ => method_not_allowed(&resource),
                }
            }
            _ => method_not_allowed(&resource),
        }
    }

    /// Split a request URL into (bucket, optional key)
    fn route(&self, request: &HttpRequest) -> Option<(String, Option<String>)> {
        let host = request.url.host_str()?;
        let path = request.url.path().trim_start_matches('/');

        let virtual_bucket = self
            .virtual_host
            .as_deref()
            .and_then(|base| host.strip_suffix(base)?.strip_suffix('.'));

        let (bucket, raw_key) = match virtual_bucket {
            Some(bucket) => (bucket.to_string(), path),
            None => {
                let (bucket, rest) = path.split_once('/').unwrap_or((path, ""));
                (bucket.to_string(), rest)
            }
        };
        if bucket.is_empty() {
            return None;
        }

        let key = if raw_key.is_empty() {
            None
        } else {
            Some(percent_decode_str(raw_key).decode_utf8().ok()?.into_owned())
        };
        Some((bucket, key))
    }

    fn authenticate(&self, request: &HttpRequest) -> Result<(), HttpResponse> {
        let resource = request.url.path();
        let denied = |code: &str, message: &str| {
            Err(error_response(StatusCode::FORBIDDEN, code, message, resource))
        };

        let query: BTreeMap<String, String> = request.url.query_pairs().into_owned().collect();
        let presigned = query.contains_key("X-Amz-Credential");

        let scope = if presigned {
            query.get("X-Amz-Credential").cloned().unwrap_or_default()
        } else {
            match request
                .header("authorization")
                .and_then(|auth| auth.strip_prefix("AWS4-HMAC-SHA256 Credential="))
            {
                Some(rest) => rest.split(',').next().unwrap_or_default().to_string(),
                None => return denied("AccessDenied", "Access Denied"),
            }
        };

        // AKID/date/region/service/aws4_request
        let parts: Vec<&str> = scope.split('/').collect();
        if parts.len() != 5 {
            return denied("AuthorizationQueryParametersError", "Malformed credential scope");
        }
        let (access_key, region, service) = (parts[0], parts[2], parts[3]);

        let timestamp = if presigned {
            query.get("X-Amz-Date").cloned()
        } else {
            request.header("x-amz-date").map(str::to_string)
        };
        let Some(time) = timestamp.as_deref().and_then(parse_amz_date) else {
            return denied("AccessDenied", "Missing or malformed X-Amz-Date");
        };

        if presigned {
            let expires = query
                .get("X-Amz-Expires")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            if Utc::now() > time + chrono::TimeDelta::seconds(expires) {
                return denied("AccessDenied", "Request has expired");
            }
        }

        let Some(credentials) = self.credentials.as_ref() else {
            return Ok(());
        };
        if access_key != credentials.access_key() {
            return denied(
                "InvalidAccessKeyId",
                "The AWS Access Key Id you provided does not exist in our records.",
            );
        }

        let params = SigningParams {
            credentials,
            region,
            service,
            time,
        };
        let signer = SigV4Signer::new();
        let matches = if presigned {
            verify_presigned(&signer, request, &params, &query)
        } else {
            verify_signed(&signer, request, &params)
        };

        if matches {
            Ok(())
        } else {
            denied(
                "SignatureDoesNotMatch",
                "The request signature we calculated does not match the signature you provided.",
            )
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.state
            .lock()
            .log
            .push(match request.url.query() {
                Some(query) => format!("{} {}?{}", request.method, request.url.path(), query),
                None => format!("{} {}", request.method, request.url.path()),
            });

        match self.take_fault(&request.method) {
            Some(Fault::Network) => {
                return Err(TransportError::Connect("connection reset by peer".to_string()));
            }
            Some(Fault::Status { status, code }) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut response = error_response(status, &code, "Injected fault", request.url.path());
                if request.method == Method::HEAD {
                    response.body = Bytes::new();
                }
                return Ok(response);
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let mut response = self.handle(&request);
        // HEAD answers never carry a body
        if request.method == Method::HEAD {
            response.body = Bytes::new();
        }
        Ok(response)
    }
}

impl StoredObject {
    fn new(body: Bytes, content_type: Option<String>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            etag: format!("\"{}\"", hex::encode(Md5::digest(&body))),
            body,
            content_type,
            last_modified: Utc::now().trunc_subsecs(0),
            metadata,
        }
    }

    fn response(&self) -> HttpResponse {
        let mut response = HttpResponse::new(StatusCode::OK)
            .with_header("content-length", self.body.len().to_string())
            .with_header("etag", self.etag.clone())
            .with_header("last-modified", http_date(self.last_modified))
            .with_body(self.body.clone());
        if let Some(content_type) = self.content_type.as_deref() {
            response = response.with_header("content-type", content_type);
        }
        for (name, value) in &self.metadata {
            response = response.with_header(&format!("x-amz-meta-{name}"), value.clone());
        }
        response
    }

    fn metadata(&self, key: &str) -> ObjectMetadata {
        let mut metadata = ObjectMetadata::new(key, self.body.len() as u64);
        metadata.last_modified = Some(self.last_modified);
        metadata.etag = Some(self.etag.clone());
        metadata.storage_class = Some("STANDARD".to_string());
        metadata
    }
}

fn list_objects(
    bucket: &str,
    objects: &BTreeMap<String, StoredObject>,
    query: &BTreeMap<String, String>,
    resource: &str,
) -> HttpResponse {
    let max_keys = match query.get("max-keys").map(|v| v.parse::<usize>()) {
        None => MAX_BATCH_SIZE,
        Some(Ok(n)) if n <= MAX_BATCH_SIZE => n,
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "InvalidArgument",
                "Argument max-keys must be an integer between 0 and 1000",
                resource,
            );
        }
    };
    let prefix = query.get("prefix").map(String::as_str).unwrap_or_default();
    let delimiter = query.get("delimiter").map(String::as_str).filter(|d| !d.is_empty());
    let token = query.get("continuation-token");

    let marker = match token.map(|t| decode_marker(t)) {
        None => None,
        Some(Some(marker)) => Some(marker),
        Some(None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "InvalidArgument",
                "The continuation token provided is incorrect",
                resource,
            );
        }
    };

    let mut result = ListObjectsResult::default();
    let mut prefixes = BTreeSet::new();
    let mut emitted = 0usize;
    let mut last: Option<Marker> = None;

    for (key, object) in objects.range(prefix.to_string()..) {
        if !key.starts_with(prefix) {
            break;
        }
        if marker.as_ref().is_some_and(|m| m.covers(key)) {
            continue;
        }

        let rolled_up = delimiter.and_then(|d| {
            key[prefix.len()..]
                .find(d)
                .map(|pos| key[..prefix.len() + pos + d.len()].to_string())
        });
        if rolled_up.as_ref().is_some_and(|common| prefixes.contains(common)) {
            continue;
        }

        if emitted == max_keys {
            result.is_truncated = true;
            break;
        }
        emitted += 1;

        match rolled_up {
            Some(common) => {
                prefixes.insert(common.clone());
                result.common_prefixes.push(common.clone());
                last = Some(Marker::Prefix(common));
            }
            None => {
                result.objects.push(object.metadata(key));
                last = Some(Marker::Key(key.clone()));
            }
        }
    }

    if result.is_truncated {
        result.next_continuation_token = last.map(|m| m.encode());
    }

    let echo = ListEcho {
        bucket,
        prefix: Some(prefix).filter(|p| !p.is_empty()),
        delimiter,
        max_keys,
        continuation_token: token.map(String::as_str),
    };
    HttpResponse::new(StatusCode::OK)
        .with_header("content-type", "application/xml")
        .with_body(xml::build_list_result(&echo, &result))
}

fn delete_objects(
    objects: &mut BTreeMap<String, StoredObject>,
    request: &HttpRequest,
    omitted: &HashSet<String>,
    protected: &HashSet<String>,
    resource: &str,
) -> HttpResponse {
    let expected_md5 = STANDARD.encode(Md5::digest(&request.body));
    if request.header("content-md5") != Some(expected_md5.as_str()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "BadDigest",
            "The Content-MD5 you specified did not match what we received.",
            resource,
        );
    }

    let (keys, quiet) = match xml::parse_delete_request(&request.body) {
        Ok(parsed) if parsed.0.len() <= MAX_BATCH_SIZE => parsed,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MalformedXML",
                "The XML you provided was not well-formed or did not validate against our published schema.",
                resource,
            );
        }
    };

    let mut output = DeleteObjectsOutput::default();
    for key in keys {
        if protected.contains(&key) {
            output.errors.push(DeleteObjectError {
                key,
                code: "AccessDenied".to_string(),
                message: "Access Denied".to_string(),
            });
            continue;
        }

        objects.remove(&key);
        if !quiet && !omitted.contains(&key) {
            output.deleted.push(key);
        }
    }

    HttpResponse::new(StatusCode::OK)
        .with_header("content-type", "application/xml")
        .with_body(xml::build_delete_result(&output))
}

/// Resume point encoded in the service's continuation tokens
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Key(String),
    Prefix(String),
}

impl Marker {
    fn covers(&self, key: &str) -> bool {
        match self {
            Self::Key(last) => key <= last.as_str(),
            Self::Prefix(common) => key <= common.as_str() || key.starts_with(common.as_str()),
        }
    }

    fn encode(&self) -> String {
        match self {
            Self::Key(key) => STANDARD.encode(format!("k:{key}")),
            Self::Prefix(prefix) => STANDARD.encode(format!("p:{prefix}")),
        }
    }
}

fn decode_marker(token: &str) -> Option<Marker> {
    let decoded = String::from_utf8(STANDARD.decode(token).ok()?).ok()?;
    match decoded.split_at_checked(2)? {
        ("k:", key) => Some(Marker::Key(key.to_string())),
        ("p:", prefix) => Some(Marker::Prefix(prefix.to_string())),
        _ => None,
    }
}

fn parse_amz_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|t| t.and_utc())
}

/// Recompute the `Authorization` header and compare
fn verify_signed(signer: &SigV4Signer, request: &HttpRequest, params: &SigningParams<'_>) -> bool {
    let mut unsigned = request.clone();
    for name in [
        "authorization",
        "host",
        "x-amz-date",
        "x-amz-content-sha256",
        "x-amz-security-token",
    ] {
        unsigned.headers.remove(name);
    }

    signer
        .sign(unsigned, params)
        .is_ok_and(|resigned| resigned.header("authorization") == request.header("authorization"))
}

/// Recompute the query signature of a presigned URL and compare
fn verify_presigned(
    signer: &SigV4Signer,
    request: &HttpRequest,
    params: &SigningParams<'_>,
    query: &BTreeMap<String, String>,
) -> bool {
    let Some(expires) = query.get("X-Amz-Expires").and_then(|v| v.parse::<u64>().ok()) else {
        return false;
    };

    let mut unsigned = request.clone();
    let remaining: Vec<&str> = request
        .url
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("X-Amz-"))
        .collect();
    unsigned
        .url
        .set_query((!remaining.is_empty()).then(|| remaining.join("&")).as_deref());

    signer
        .presign(&unsigned, params, Duration::from_secs(expires))
        .is_ok_and(|url| {
            url.query_pairs()
                .find(|(k, _)| k == "X-Amz-Signature")
                .map(|(_, v)| v.into_owned())
                == query.get("X-Amz-Signature").cloned()
        })
}

fn error_response(status: StatusCode, code: &str, message: &str, resource: &str) -> HttpResponse {
    HttpResponse::new(status)
        .with_header("content-type", "application/xml")
        .with_body(xml::build_error(code, message, resource))
}

fn no_such_bucket(resource: &str) -> HttpResponse {
    error_response(
        StatusCode::NOT_FOUND,
        "NoSuchBucket",
        "The specified bucket does not exist",
        resource,
    )
}

fn method_not_allowed(resource: &str) -> HttpResponse {
    error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "MethodNotAllowed",
        "The specified method is not allowed against this resource.",
        resource,
    )
}
