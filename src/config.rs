use std::fmt;
use std::time::Duration;

use reqwest::Url;

use crate::s3::error::{Result, StorageError};
use crate::s3::signer::encode_path;
use crate::s3::types::{validate_bucket_name, validate_key};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(20);

/// Static credential pair plus an optional STS session token
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.session_token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Configuration for an [`S3Client`](crate::S3Client).
///
/// Built once by the caller and owned by the client for its lifetime. The
/// library never reads the environment; see the `s3demo` binary for an env
/// based loader.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    endpoint: Url,
    region: String,
    credentials: Credentials,
    path_style: bool,
    max_retries: u32,
    request_timeout: Duration,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl ClientConfig {
    /// Create a validated configuration with default retry and timeout settings
    ///
    /// # Errors
    ///
    /// Returns a validation error if the endpoint, region or credentials are
    /// empty or malformed
    pub fn new(endpoint: &str, region: &str, credentials: Credentials) -> Result<Self> {
        let endpoint = Self::parse_endpoint(endpoint)?;
        let config = Self {
            endpoint,
            region: region.to_string(),
            credentials,
            path_style: true,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        };
        config.validate()?;
        Ok(config)
    }

    /// Address buckets as `endpoint/bucket/key` (true) or `bucket.endpoint/key` (false)
    pub fn with_path_style(mut self, path_style: bool) -> Self {
        self.path_style = path_style;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Backoff base and upper bound used by the retry policy
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn path_style(&self) -> bool {
        self.path_style
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }

    pub fn retry_max_delay(&self) -> Duration {
        self.retry_max_delay
    }

    /// Check every invariant of the configuration
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first violated invariant
    pub fn validate(&self) -> Result<()> {
        Self::validate_region(&self.region)?;

        if self.credentials.access_key.trim().is_empty() {
            return Err(StorageError::invalid("access key cannot be empty"));
        }
        if self.credentials.secret_key.is_empty() {
            return Err(StorageError::invalid("secret key cannot be empty"));
        }
        if self.request_timeout.is_zero() {
            return Err(StorageError::invalid("request timeout must be greater than zero"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(StorageError::invalid(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry_base_delay, self.retry_max_delay
            )));
        }

        Ok(())
    }

    /// Resolve the URL addressing a bucket (trailing slash included for
    /// virtual-hosted style)
    pub fn bucket_url(&self, bucket: &str) -> Result<Url> {
        validate_bucket_name(bucket)?;
        self.resolve(bucket, "")
    }

    /// Resolve the URL addressing a single object
    pub fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        validate_bucket_name(bucket)?;
        validate_key(key)?;
        self.resolve(bucket, &encode_path(key))
    }

    fn resolve(&self, bucket: &str, encoded_key: &str) -> Result<Url> {
        let scheme = self.endpoint.scheme();
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| StorageError::invalid("endpoint has no host"))?;
        let authority = match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let raw = if self.path_style {
            if encoded_key.is_empty() {
                format!("{scheme}://{authority}/{bucket}")
            } else {
                format!("{scheme}://{authority}/{bucket}/{encoded_key}")
            }
        } else {
            format!("{scheme}://{bucket}.{authority}/{encoded_key}")
        };

        Url::parse(&raw).map_err(|e| StorageError::invalid(format!("cannot build url '{raw}': {e}")))
    }

    fn parse_endpoint(endpoint: &str) -> Result<Url> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(StorageError::invalid("endpoint cannot be empty"));
        }

        let url = Url::parse(endpoint)
            .map_err(|e| StorageError::invalid(format!("endpoint '{endpoint}' is not a valid URL: {e}")))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(StorageError::invalid(format!(
                "endpoint '{}' must use http or https",
                endpoint
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(StorageError::invalid(format!("endpoint '{}' has no host", endpoint)));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(StorageError::invalid(format!(
                "endpoint '{}' must not carry a path, query or fragment",
                endpoint
            )));
        }

        Ok(url)
    }

    /// Validate region format
    fn validate_region(region: &str) -> Result<()> {
        if region.is_empty() {
            return Err(StorageError::invalid("region cannot be empty"));
        }

        // S3-compatible services use names like "us-east-1", "auto" or "garage"
        if let Some(c) = region
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(StorageError::invalid(format!(
                "region '{}' contains invalid character '{}'",
                region, c
            )));
        }

        Ok(())
    }
}
