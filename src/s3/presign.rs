use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, Url};

use super::client::S3Client;
use super::error::Result;

/// Default validity of a pre-signed URL (15 minutes)
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// A pre-signed request: anyone holding `url` may perform `method` on the
/// object until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedRequest {
    pub method: Method,
    pub url: Url,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Generate a pre-signed GET URL with the default 15-minute expiration
///
/// # Arguments
///
/// * `client` - S3 client
/// * `bucket` - S3 bucket name
/// * `s3_key` - S3 object key
///
/// # Returns
///
/// Pre-signed URL as a string
pub fn generate_presigned_url(client: &S3Client, bucket: &str, s3_key: &str) -> Result<String> {
    generate_presigned_url_with_expiry(client, bucket, s3_key, DEFAULT_PRESIGN_EXPIRY)
}

/// Generate a pre-signed GET URL with custom expiration
///
/// # Notes
///
/// SigV4 limits pre-signed URLs to whole seconds up to 7 days. Anything else
/// is rejected with a validation error rather than capped or rounded.
pub fn generate_presigned_url_with_expiry(
    client: &S3Client,
    bucket: &str,
    s3_key: &str,
    expires_in: Duration,
) -> Result<String> {
    let presigned = client.presign(Method::GET, bucket, s3_key, expires_in)?;
    Ok(presigned.url.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{ClientConfig, Credentials};
    use crate::s3::memory::MemoryTransport;
    use crate::s3::signer::SigV4Signer;

    fn client() -> S3Client {
        let config = ClientConfig::new("http://localhost:9000", "us-east-1", Credentials::new("AKID", "secret"))
            .unwrap();
        S3Client::with_parts(config, Arc::new(MemoryTransport::new()), Arc::new(SigV4Signer::new()))
    }

    #[test]
    fn test_generate_presigned_url_defaults_to_fifteen_minutes() {
        let url = generate_presigned_url(&client(), "demo-bucket", "myobjpath/hello.txt").unwrap();
        assert!(url.starts_with("http://localhost:9000/demo-bucket/myobjpath/hello.txt?"));
        assert!(url.contains("X-Amz-Expires=900"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
    }

    #[test]
    fn test_expiry_is_never_clamped() {
        let client = client();
        let url = generate_presigned_url_with_expiry(&client, "demo-bucket", "k", Duration::from_secs(3600)).unwrap();
        assert!(url.contains("X-Amz-Expires=3600"));

        let err = generate_presigned_url_with_expiry(&client, "demo-bucket", "k", Duration::from_secs(8 * 24 * 3600))
            .unwrap_err();
        assert_eq!(err.kind(), crate::s3::error::ErrorKind::ValidationError);
    }
}
