//! AWS Signature Version 4 signing.
//!
//! [`Signer`] is the seam the client signs through; [`SigV4Signer`] is the
//! default implementation. Header signing puts the signature in the
//! `Authorization` header, presigning puts it in the query string:
//!
//! - `X-Amz-Algorithm` - always `AWS4-HMAC-SHA256`
//! - `X-Amz-Credential` - `AKID/date/region/service/aws4_request`
//! - `X-Amz-Date` - ISO 8601 basic format timestamp (`YYYYMMDDTHHMMSSZ`)
//! - `X-Amz-Expires` - validity in seconds, exactly as requested
//! - `X-Amz-SignedHeaders` - `host`
//! - `X-Amz-Signature` - hex-encoded signature

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Url;
use sha2::{Digest, Sha256};

use super::error::{Result, StorageError};
use super::transport::HttpRequest;
use crate::config::Credentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash used by every presigned request
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// SHA-256 of an empty payload
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Longest validity SigV4 accepts for a presigned URL (7 days)
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Everything except RFC 3986 unreserved characters is encoded
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Same as [`URI_ENCODE_SET`] but keeps `/` for object key paths
const PATH_ENCODE_SET: &AsciiSet = &URI_ENCODE_SET.remove(b'/');

/// Percent-encode a query parameter name or value
pub(crate) fn encode_query(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

/// Percent-encode an object key for use as a URL path, preserving `/`
pub(crate) fn encode_path(key: &str) -> String {
    utf8_percent_encode(key, PATH_ENCODE_SET).to_string()
}

/// Per-request signing inputs
#[derive(Debug, Clone, Copy)]
pub struct SigningParams<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

/// Produces authenticated requests and presigned URLs.
///
/// The expiry passed to [`Signer::presign`] must end up unmodified in the
/// resulting URL.
pub trait Signer: Send + Sync + fmt::Debug {
    fn sign(&self, request: HttpRequest, params: &SigningParams<'_>) -> Result<HttpRequest>;

    fn presign(
        &self,
        request: &HttpRequest,
        params: &SigningParams<'_>,
        expires_in: Duration,
    ) -> Result<Url>;
}

/// AWS Signature Version 4 signer
///
/// The derived signing key only changes daily, so the last one is cached per
/// (access key, date, region, service).
#[derive(Default)]
pub struct SigV4Signer {
    cached_signing_key: Mutex<Option<(String, [u8; 32])>>,
}

impl SigV4Signer {
    pub fn new() -> Self {
        Self::default()
    }

    fn signature(&self, params: &SigningParams<'_>, date_stamp: &str, string_to_sign: &str) -> String {
        let cache_key = format!(
            "{}/{}/{}/{}",
            params.credentials.access_key(),
            date_stamp,
            params.region,
            params.service
        );

        let signing_key = {
            let mut cache = self.cached_signing_key.lock();
            match cache.as_ref() {
                Some((cached, key)) if *cached == cache_key => *key,
                _ => {
                    let key = derive_signing_key(
                        params.credentials.secret_key(),
                        date_stamp,
                        params.region,
                        params.service,
                    );
                    *cache = Some((cache_key, key));
                    key
                }
            }
        };

        hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }
}

impl Clone for SigV4Signer {
    fn clone(&self) -> Self {
        // Each clone gets its own cache (populated on first use)
        Self::default()
    }
}

impl fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4Signer").finish_non_exhaustive()
    }
}

impl Signer for SigV4Signer {
    fn sign(&self, mut request: HttpRequest, params: &SigningParams<'_>) -> Result<HttpRequest> {
        let amz_date = params.time.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = params.time.format("%Y%m%d").to_string();

        let payload_hash = if request.body.is_empty() {
            EMPTY_SHA256.to_string()
        } else {
            hex::encode(Sha256::digest(&request.body))
        };

        request.headers.remove("authorization");
        request
            .headers
            .insert("host".to_string(), host_header(&request.url)?);
        request
            .headers
            .insert("x-amz-date".to_string(), amz_date.clone());
        request
            .headers
            .insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        if let Some(token) = params.credentials.session_token() {
            request
                .headers
                .insert("x-amz-security-token".to_string(), token.to_string());
        }

        let signed_headers = request
            .headers
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = request
            .headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method.as_str(),
            request.url.path(),
            canonical_query_string(request.url.query().unwrap_or("")),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = credential_scope(&date_stamp, params);
        let string_to_sign = build_string_to_sign(&amz_date, &scope, &canonical_request);
        let signature = self.signature(params, &date_stamp, &string_to_sign);

        request.headers.insert(
            "authorization".to_string(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM,
                params.credentials.access_key(),
                scope,
                signed_headers,
                signature
            ),
        );

        Ok(request)
    }

    fn presign(
        &self,
        request: &HttpRequest,
        params: &SigningParams<'_>,
        expires_in: Duration,
    ) -> Result<Url> {
        if expires_in.as_secs() == 0 || expires_in > MAX_PRESIGN_EXPIRY {
            return Err(StorageError::invalid(format!(
                "presign expiry must be between 1 second and 7 days (got {:?})",
                expires_in
            )));
        }
        // X-Amz-Expires carries whole seconds only
        if expires_in.subsec_nanos() != 0 {
            return Err(StorageError::invalid(format!(
                "presign expiry must be a whole number of seconds (got {:?})",
                expires_in
            )));
        }

        let amz_date = params.time.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = params.time.format("%Y%m%d").to_string();
        let scope = credential_scope(&date_stamp, params);
        let host = host_header(&request.url)?;

        let mut query = request.url.query().unwrap_or_default().to_string();
        let mut push = |name: &str, value: &str| {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(name);
            query.push('=');
            query.push_str(&encode_query(value));
        };
        push("X-Amz-Algorithm", ALGORITHM);
        push(
            "X-Amz-Credential",
            &format!("{}/{}", params.credentials.access_key(), scope),
        );
        push("X-Amz-Date", &amz_date);
        push("X-Amz-Expires", &expires_in.as_secs().to_string());
        if let Some(token) = params.credentials.session_token() {
            push("X-Amz-Security-Token", token);
        }
        push("X-Amz-SignedHeaders", "host");

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            request.method.as_str(),
            request.url.path(),
            canonical_query_string(&query),
            host,
            UNSIGNED_PAYLOAD
        );
        let string_to_sign = build_string_to_sign(&amz_date, &scope, &canonical_request);
        let signature = self.signature(params, &date_stamp, &string_to_sign);

        query.push_str("&X-Amz-Signature=");
        query.push_str(&signature);

        let mut url = request.url.clone();
        url.set_query(Some(&query));
        Ok(url)
    }
}

/// `Host` header value: host plus port when it is not the scheme default
fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| StorageError::invalid(format!("url '{url}' has no host")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn credential_scope(date_stamp: &str, params: &SigningParams<'_>) -> String {
    format!(
        "{}/{}/{}/aws4_request",
        date_stamp, params.region, params.service
    )
}

/// Sort already-encoded query parameters by name, then value.
///
/// Valueless parameters (`?delete`) are normalized to `delete=`.
fn canonical_query_string(query: &str) -> String {
    let mut params: Vec<(&str, &str)> = query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|param| param.split_once('=').unwrap_or((param, "")))
        .collect();
    params.sort_unstable();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn build_string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{amz_date}\n{scope}\n{hash}")
}

/// Derive the signing key (4 chained HMAC operations)
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> [u8; 32] {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}
