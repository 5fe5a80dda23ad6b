use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use s3kit::{ClientConfig, Credentials};

/// Connection settings for the `s3demo` binary, loaded from the environment
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub credentials: Credentials,
    pub max_retries: u32,
    pub path_style: bool,
    pub request_timeout: Duration,
}

impl Settings {
    /// Load configuration from environment variables and .env file
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from any `name -> value` source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            var(name).with_context(|| format!("{name} not found in environment. Please set it in .env file"))
        };

        let endpoint = required("S3_ENDPOINT")?;
        let region = var("S3_REGION")
            .or_else(|| var("AWS_REGION"))
            .context("S3_REGION not found in environment. Please set it in .env file")?;
        let bucket = required("S3_BUCKET")?;

        let access_key = required("AWS_ACCESS_KEY_ID")?;
        let secret_key = var("AWS_SECRET_KEY")
            .or_else(|| var("AWS_SECRET_ACCESS_KEY"))
            .context("AWS_SECRET_KEY not found in environment. Please set it in .env file")?;
        let mut credentials = Credentials::new(access_key, secret_key);
        if let Some(token) = var("AWS_SESSION_TOKEN") {
            credentials = credentials.with_session_token(token);
        }

        let max_retries = match var("S3_MAX_RETRIES") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("S3_MAX_RETRIES '{v}' is not a non-negative integer"))?,
            None => s3kit::config::DEFAULT_MAX_RETRIES,
        };

        let path_style = match var("S3_PATH_STYLE").map(|v| v.trim().to_ascii_lowercase()) {
            None => true,
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => anyhow::bail!("S3_PATH_STYLE '{}' must be true or false", v),
        };

        let request_timeout = match var("S3_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.trim()
                    .parse()
                    .with_context(|| format!("S3_TIMEOUT_SECS '{v}' is not a number of seconds"))?,
            ),
            None => s3kit::config::DEFAULT_REQUEST_TIMEOUT,
        };

        Ok(Self {
            endpoint,
            region,
            bucket,
            credentials,
            max_retries,
            path_style,
            request_timeout,
        })
    }

    /// Validated client configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig::new(&self.endpoint, &self.region, self.credentials.clone())?
            .with_path_style(self.path_style)
            .with_max_retries(self.max_retries)
            .with_request_timeout(self.request_timeout);
        config.validate()?;
        Ok(config)
    }
}
