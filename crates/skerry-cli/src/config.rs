//! Connection settings for the CLI.
//!
//! Every flag falls back to an environment variable, so a configured shell
//! needs no flags at all.

use clap::Args;
use skerry_core::{ClientConfig, CoreError};
use std::time::Duration;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionArgs {
    /// API key
    #[arg(long, env = "SKERRY_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// API base URL
    #[arg(long, env = "SKERRY_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Default provider for new sandboxes
    #[arg(long, env = "SKERRY_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Default region for new sandboxes
    #[arg(long, env = "SKERRY_REGION", global = true)]
    pub region: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "SKERRY_TIMEOUT_SECS", global = true)]
    pub request_timeout: Option<u64>,

    /// Retry budget for idempotent calls
    #[arg(long, env = "SKERRY_MAX_RETRIES", global = true)]
    pub max_retries: Option<u32>,
}

impl ConnectionArgs {
    /// Build a validated client configuration.
    pub fn client_config(&self) -> Result<ClientConfig, CoreError> {
        let mut builder = ClientConfig::builder().api_key(self.api_key.clone().unwrap_or_default());
        if let Some(url) = &self.base_url {
            builder = builder.base_url(url.clone());
        }
        if let Some(provider) = &self.provider {
            builder = builder.provider(provider.clone());
        }
        if let Some(region) = &self.region {
            builder = builder.region(region.clone());
        }
        if let Some(secs) = self.request_timeout {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(retries) = self.max_retries {
            builder = builder.max_retries(retries);
        }
        builder.build()
    }
}

/// Parse a `KEY=VALUE` flag.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("MODE=test").unwrap(),
            ("MODE".to_string(), "test".to_string())
        );
        assert_eq!(
            parse_key_value("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_key_value("EMPTY=").unwrap().1, "");
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_client_config_applies_overrides() {
        let args = ConnectionArgs {
            api_key: Some("k".to_string()),
            base_url: Some("http://localhost:8080/v1/agents".to_string()),
            provider: Some("azure".to_string()),
            region: Some("eastus2".to_string()),
            request_timeout: Some(5),
            max_retries: Some(0),
        };
        let config = args.client_config().unwrap();

        assert_eq!(config.base_url, "http://localhost:8080/v1/agents");
        assert_eq!(config.provider.as_deref(), Some("azure"));
        assert_eq!(config.region.as_deref(), Some("eastus2"));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn test_client_config_requires_api_key() {
        let result = ConnectionArgs::default().client_config();
        assert!(matches!(result, Err(CoreError::InvalidConfiguration(_))));
    }
}
