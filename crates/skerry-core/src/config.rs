//! Client and sandbox configuration types.

use crate::error::CoreError;
use std::collections::HashMap;
use std::time::Duration;

/// Shortest sandbox lifetime accepted by the backend, in seconds.
pub const MIN_SANDBOX_TIMEOUT_SECS: u32 = 300;

/// Longest sandbox lifetime accepted by the backend, in seconds (12 hours).
pub const MAX_SANDBOX_TIMEOUT_SECS: u32 = 43_200;

/// Template used when none is specified.
pub const DEFAULT_TEMPLATE: &str = "python-base-v1";

/// Default base URL of the sandbox API.
pub const DEFAULT_BASE_URL: &str = "https://api.skerry.dev/v1/agents";

/// Check a sandbox timeout against the accepted range.
pub fn validate_timeout_secs(secs: u32) -> Result<(), CoreError> {
    if !(MIN_SANDBOX_TIMEOUT_SECS..=MAX_SANDBOX_TIMEOUT_SECS).contains(&secs) {
        return Err(CoreError::InvalidConfiguration(format!(
            "timeout must be between {MIN_SANDBOX_TIMEOUT_SECS} and {MAX_SANDBOX_TIMEOUT_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

/// Configuration for a [`Client`](crate::Client).
///
/// Constructed explicitly and passed to the client; there is no
/// process-wide default client.
#[derive(Clone)]
pub struct ClientConfig {
    /// Bearer credential attached to every request.
    pub api_key: String,
    /// Base URL that resource paths are appended to.
    pub base_url: String,
    /// Default provider for new sandboxes.
    pub provider: Option<String>,
    /// Default region for new sandboxes.
    pub region: Option<String>,
    /// Per-request HTTP timeout (default: 60s).
    pub request_timeout: Duration,
    /// Retry budget for idempotent calls on transient failures (default: 3).
    pub max_retries: u32,
    /// First backoff delay; doubles on every attempt (default: 500ms).
    pub retry_base_delay: Duration,
    /// Extra local wait beyond a caller's execution timeout before giving
    /// up on the response (default: 2s).
    pub execution_grace: Duration,
    /// User-Agent header value.
    pub user_agent: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("provider", &self.provider)
            .field("region", &self.region)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("execution_grace", &self.execution_grace)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            provider: None,
            region: None,
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            execution_grace: Duration::from_secs(2),
            user_agent: concat!("skerry-rust/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration with the given credential and defaults.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Create a new config builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SKERRY_API_KEY` | (required) |
    /// | `SKERRY_BASE_URL` | `https://api.skerry.dev/v1/agents` |
    /// | `SKERRY_PROVIDER` | unset |
    /// | `SKERRY_REGION` | unset |
    /// | `SKERRY_TIMEOUT_SECS` | `60` |
    /// | `SKERRY_MAX_RETRIES` | `3` |
    pub fn from_env() -> Result<Self, CoreError> {
        let default = Self::default();

        let config = Self {
            api_key: std::env::var("SKERRY_API_KEY").unwrap_or_default(),
            base_url: std::env::var("SKERRY_BASE_URL").unwrap_or(default.base_url),
            provider: std::env::var("SKERRY_PROVIDER").ok().or(default.provider),
            region: std::env::var("SKERRY_REGION").ok().or(default.region),
            request_timeout: std::env::var("SKERRY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.request_timeout),
            max_retries: std::env::var("SKERRY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_retries),
            ..default
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.api_key.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "api_key is required (set SKERRY_API_KEY)".into(),
            ));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(CoreError::InvalidConfiguration(format!(
                "base_url must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "request_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for ClientConfig.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the bearer credential.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    /// Set the API base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Set the default provider.
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.config.provider = Some(provider.into());
        self
    }

    /// Set the default region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Set the per-request HTTP timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the retry budget for idempotent calls.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the first backoff delay.
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry_base_delay = delay;
        self
    }

    /// Set the local grace period added to execution timeouts.
    pub fn execution_grace(mut self, grace: Duration) -> Self {
        self.config.execution_grace = grace;
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<ClientConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parameters for creating a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Template name or ID (default: `python-base-v1`).
    pub template: String,
    /// Provider; falls back to the client's default.
    pub provider: Option<String>,
    /// Region; falls back to the client's default.
    pub region: Option<String>,
    /// Lifetime in seconds, within [300, 43200] (default: 300).
    pub timeout_secs: u32,
    /// Environment variables set inside the sandbox.
    pub env_vars: HashMap<String, String>,
    /// Key-value tags.
    pub metadata: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            provider: None,
            region: None,
            timeout_secs: MIN_SANDBOX_TIMEOUT_SECS,
            env_vars: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.template.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration("template is required".into()));
        }
        validate_timeout_secs(self.timeout_secs)
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the template.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.config.template = template.into();
        self
    }

    /// Set the provider.
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.config.provider = Some(provider.into());
        self
    }

    /// Set the region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Set the lifetime in seconds.
    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env_vars.insert(key.into(), value.into());
        self
    }

    /// Add a metadata tag.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
