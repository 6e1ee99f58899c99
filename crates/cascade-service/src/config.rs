//! Service configuration: where the database lives, how to reach the
//! providers, and the secrets that authenticate their webhooks.
//!
//! Environment variables supply defaults; an optional TOML file overrides
//! them. Engine tunables live under a `[cascade]` table.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cascade::CascadeConfig;
use serde::{Deserialize, Serialize};

/// HTTP endpoint of an outbound provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub url: String,
    /// Bearer token sent with every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ProviderEndpoint {
    fn from_env(url_key: &str, token_key: &str) -> Option<Self> {
        let url = std::env::var(url_key).ok().filter(|u| !u.trim().is_empty())?;
        Some(Self {
            url: url.trim_end_matches('/').to_string(),
            token: std::env::var(token_key).ok(),
        })
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Chat provider (messages with inline buttons)
    pub chat: Option<ProviderEndpoint>,
    /// Telephony provider (outbound calls, call control)
    pub telephony: Option<ProviderEndpoint>,
    /// Secret for HMAC-signed telephony webhooks
    pub call_webhook_secret: Option<String>,
    /// Secret the chat provider echoes in `chat_secret_header`
    pub chat_webhook_secret: Option<String>,
    pub chat_secret_header: String,
    /// Per-request timeout for provider calls
    pub request_timeout_secs: u64,
    pub cascade: CascadeConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: std::env::var("CASCADE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cascade.sqlite")),
            chat: ProviderEndpoint::from_env("CASCADE_CHAT_URL", "CASCADE_CHAT_TOKEN"),
            telephony: ProviderEndpoint::from_env("CASCADE_TELEPHONY_URL", "CASCADE_TELEPHONY_TOKEN"),
            call_webhook_secret: std::env::var("CASCADE_CALL_WEBHOOK_SECRET").ok(),
            chat_webhook_secret: std::env::var("CASCADE_CHAT_WEBHOOK_SECRET").ok(),
            chat_secret_header: std::env::var("CASCADE_CHAT_SECRET_HEADER")
                .unwrap_or_else(|_| "x-chat-secret".into()),
            request_timeout_secs: std::env::var("CASCADE_PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            cascade: CascadeConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Failed to parse service config")?;
        config.cascade.validate().context("Invalid [cascade] section")?;
        Ok(config)
    }

    /// Load from an optional TOML file, falling back to the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            let config = Self::default();
            config.cascade.validate().context("Invalid cascade settings")?;
            return Ok(config);
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides_nested_cascade_settings() {
        let config = ServiceConfig::from_toml_str(
            r#"
            database_path = "/var/lib/cascade/db.sqlite"
            call_webhook_secret = "s3cret"

            [telephony]
            url = "https://voice.example.com"
            token = "tok"

            [cascade]
            max_total_ring_sec = 240
            call_webhook_url = "https://hooks.example.com/call"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/var/lib/cascade/db.sqlite"));
        assert_eq!(config.call_webhook_secret.as_deref(), Some("s3cret"));
        let telephony = config.telephony.unwrap();
        assert_eq!(telephony.url, "https://voice.example.com");
        assert_eq!(telephony.token.as_deref(), Some("tok"));
        assert_eq!(config.cascade.max_total_ring_sec, 240);
        // Untouched engine defaults survive
        assert_eq!(config.cascade.gather_timeout_sec, CascadeConfig::default().gather_timeout_sec);
    }

    #[test]
    fn test_invalid_cascade_section_is_rejected() {
        let err = ServiceConfig::from_toml_str("[cascade]\nmax_total_ring_sec = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("max_total_ring_sec"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "request_timeout_secs = 3\n").unwrap();

        let config = ServiceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.request_timeout_secs, 3);
        assert!(ServiceConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
