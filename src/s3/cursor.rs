//! Scoped continuation tokens.
//!
//! The service's own continuation token is wrapped together with a
//! fingerprint of the listing it belongs to (bucket, prefix, delimiter), so a
//! token replayed against a different listing is rejected before it reaches
//! the service.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use super::error::{Result, StorageError};
use super::types::ListRequest;

/// Opaque cursor returned with a truncated [`Page`](super::types::Page)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Rebuild a token from the exact string previously obtained via
    /// [`ContinuationToken::as_str`]
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn issue(request: &ListRequest, service_token: &str) -> Self {
        let fingerprint = fingerprint(request);
        Self(URL_SAFE_NO_PAD.encode(format!("{fingerprint}:{service_token}")))
    }

    /// Unwrap the service token, checking it belongs to `request`'s listing
    pub(crate) fn redeem(&self, request: &ListRequest) -> Result<String> {
        let decoded = URL_SAFE_NO_PAD
            .decode(self.0.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| StorageError::InvalidContinuation("token is not one we issued".to_string()))?;

        let (scope, service_token) = decoded
            .split_once(':')
            .ok_or_else(|| StorageError::InvalidContinuation("token is not one we issued".to_string()))?;

        if scope != fingerprint(request) {
            return Err(StorageError::InvalidContinuation(format!(
                "token was issued for a different listing than bucket '{}'{}",
                request.bucket,
                request
                    .prefix
                    .as_deref()
                    .map(|p| format!(" prefix '{p}'"))
                    .unwrap_or_default()
            )));
        }

        Ok(service_token.to_string())
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn fingerprint(request: &ListRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.bucket.as_bytes());
    hasher.update([0]);
    hasher.update(request.prefix.as_deref().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(request.delimiter.as_deref().unwrap_or_default().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let request = ListRequest::new("photos").with_prefix("2024/");
        let token = ContinuationToken::issue(&request, "1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=");

        let replayed = ContinuationToken::from_string(token.as_str());
        assert_eq!(
            replayed.redeem(&request).unwrap(),
            "1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM="
        );
    }

    #[test]
    fn test_token_rejected_for_other_scope() {
        let request = ListRequest::new("photos").with_prefix("2024/");
        let token = ContinuationToken::issue(&request, "abc");

        let other_bucket = ListRequest::new("videos").with_prefix("2024/");
        let other_prefix = ListRequest::new("photos").with_prefix("2025/");
        let other_delimiter = ListRequest::new("photos").with_prefix("2024/").with_delimiter("/");

        for other in [other_bucket, other_prefix, other_delimiter] {
            assert!(matches!(
                token.redeem(&other),
                Err(StorageError::InvalidContinuation(_))
            ));
        }
    }

    #[test]
    fn test_garbage_token_rejected() {
        let request = ListRequest::new("photos");
        for raw in ["", "not base64 at all!", "bm9jb2xvbg"] {
            let token = ContinuationToken::from_string(raw);
            assert!(matches!(
                token.redeem(&request),
                Err(StorageError::InvalidContinuation(_))
            ));
        }
    }
}
