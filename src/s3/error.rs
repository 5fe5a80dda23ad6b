use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a [`StorageError`], independent of any provider
/// error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AuthFailure,
    Throttled,
    Transient,
    ValidationError,
    InvalidContinuation,
    TransportFailure,
    TimedOut,
    Cancelled,
}

impl ErrorKind {
    /// Whether a call failing with this kind may succeed when repeated.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Throttled | Self::Transient)
    }

    /// Whether the failure happened below the S3 semantics layer (network,
    /// overloaded service) rather than being a verdict about the request.
    pub fn is_transport_level(self) -> bool {
        matches!(
            self,
            Self::Throttled | Self::Transient | Self::TransportFailure
        )
    }

    /// Stable textual code, used in per-object batch results.
    pub fn code(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::AuthFailure => "AuthFailure",
            Self::Throttled => "Throttled",
            Self::Transient => "Transient",
            Self::ValidationError => "ValidationError",
            Self::InvalidContinuation => "InvalidContinuation",
            Self::TransportFailure => "TransportFailure",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Errors surfaced by the storage client and the helpers built on it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Object or bucket absent
    #[error("{resource} not found ({code})")]
    NotFound { resource: String, code: String },

    /// Bucket create conflict
    #[error("{resource} already exists ({code})")]
    AlreadyExists { resource: String, code: String },

    /// Bad credentials, bad signature or access denied
    #[error("authentication failed ({code}): {message}")]
    AuthFailure { code: String, message: String },

    /// The service asked us to slow down
    #[error("request throttled ({code}): {message}")]
    Throttled { code: String, message: String },

    /// 5xx, connection reset or timeout. `status` is `None` for
    /// network-level failures.
    #[error("transient failure: {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Malformed bucket, key or parameters
    #[error("invalid request ({code}): {message}")]
    Validation { code: String, message: String },

    /// Stale or foreign pagination cursor
    #[error("invalid continuation token: {0}")]
    InvalidContinuation(String),

    /// Network failure that survived every retry
    #[error("transport failure after {attempts} attempt(s): {message}")]
    TransportFailure { attempts: u32, message: String },

    /// The service answered with something we could not understand
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Client-side validation failure
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            code: "InvalidArgument".to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::AuthFailure { .. } => ErrorKind::AuthFailure,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::InvalidContinuation(_) => ErrorKind::InvalidContinuation,
            Self::TransportFailure { .. } | Self::MalformedResponse(_) => {
                ErrorKind::TransportFailure
            }
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Map an S3 error response onto the taxonomy.
    ///
    /// The provider `code` (from the XML `<Error>` body) wins over the HTTP
    /// status; HEAD responses carry no body so they fall back to the status.
    pub fn from_service(status: u16, code: Option<&str>, message: Option<&str>, resource: &str) -> Self {
        let code_str = code.unwrap_or_default().to_string();
        let message = message
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}"));

        match code.unwrap_or_default() {
            "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound" => {
                return Self::NotFound {
                    resource: resource.to_string(),
                    code: code_str,
                };
            }
            "BucketAlreadyExists" | "BucketAlreadyOwnedByYou" => {
                return Self::AlreadyExists {
                    resource: resource.to_string(),
                    code: code_str,
                };
            }
            "AccessDenied"
            | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "InvalidToken"
            | "TokenRefreshRequired"
            | "AccountProblem"
            | "AllAccessDisabled"
            | "RequestTimeTooSkewed" => {
                return Self::AuthFailure {
                    code: code_str,
                    message,
                };
            }
            "SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded"
            | "TooManyRequests" | "RequestThrottled" => {
                return Self::Throttled {
                    code: code_str,
                    message,
                };
            }
            "InternalError" | "ServiceUnavailable" | "RequestTimeout" => {
                return Self::Transient {
                    status: Some(status),
                    message: format!("{code_str}: {message}"),
                };
            }
            _ => {}
        }

        match status {
            404 => Self::NotFound {
                resource: resource.to_string(),
                code: or_default(code_str, "NotFound"),
            },
            401 | 403 => Self::AuthFailure {
                code: or_default(code_str, "AccessDenied"),
                message,
            },
            429 | 503 => Self::Throttled {
                code: or_default(code_str, "SlowDown"),
                message,
            },
            408 | 500..=599 => Self::Transient {
                status: Some(status),
                message,
            },
            _ => Self::Validation {
                code: or_default(code_str, "InvalidRequest"),
                message,
            },
        }
    }

    /// Final form of an error once the retry loop has given up.
    ///
    /// Network-level transient failures become [`StorageError::TransportFailure`];
    /// everything else is surfaced unchanged.
    pub(crate) fn into_terminal(self, attempts: u32) -> Self {
        match self {
            Self::Transient {
                status: None,
                message,
            } => Self::TransportFailure { attempts, message },
            other => other,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { resource, .. } => {
                format!(
                    "{} does not exist\n\nPossible solutions:\n  \
                     1. Check the bucket name (S3_BUCKET) and object key\n  \
                     2. List the bucket to see what is there: s3demo ls",
                    resource
                )
            }
            Self::AuthFailure { code, message } => {
                format!(
                    "Access denied ({}): {}\n\nPossible solutions:\n  \
                     1. Check AWS_ACCESS_KEY_ID and AWS_SECRET_KEY\n  \
                     2. Verify S3_REGION matches the region the endpoint expects\n  \
                     3. Make sure the local clock is in sync",
                    code, message
                )
            }
            Self::TransportFailure { attempts, message } => {
                format!(
                    "Network error after {} attempt(s): {}\n\nPossible solutions:\n  \
                     1. Check that S3_ENDPOINT is reachable\n  \
                     2. Raise S3_MAX_RETRIES for flaky links\n  \
                     3. Check if you're behind a proxy/firewall",
                    attempts, message
                )
            }
            Self::Throttled { .. } => {
                format!(
                    "{}\n\nThe service is throttling requests. Retry later or lower the request rate.",
                    self
                )
            }
            _ => self.to_string(),
        }
    }
}

fn or_default(code: String, default: &str) -> String {
    if code.is_empty() {
        default.to_string()
    } else {
        code
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
