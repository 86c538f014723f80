//! Application configuration loaded from environment variables.

use std::time::Duration;

use secrecy::SecretString;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Shared secrets for provider webhook signatures. A provider whose
/// secret is unset has every webhook rejected.
#[derive(Debug, Clone, Default)]
pub struct WebhookSecrets {
    pub stripe: Option<SecretString>,
    pub docusign: Option<SecretString>,
    pub zoho_billing: Option<SecretString>,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL URL; unset runs on the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `PUBLIC_BASE_URL`: origin used in magic links (default: `http://localhost:3000`)
/// - `PROVIDER_TIMEOUT_MS`: bound on each provider call (default: `5000`)
/// - `PROVISIONING_LEASE_SECS`: per-session provisioning lease (default: `60`)
/// - `STRIPE_WEBHOOK_SECRET`, `DOCUSIGN_WEBHOOK_SECRET`, `ZOHO_BILLING_WEBHOOK_SECRET`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub public_base_url: String,
    pub provider_timeout: Duration,
    pub provisioning_lease: Duration,
    pub webhook_secrets: WebhookSecrets,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let parsed = |key: &str| non_empty(key).and_then(|value| value.trim().parse::<u64>().ok());

        Self {
            host: non_empty("HOST").unwrap_or(defaults.host),
            port: non_empty("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: non_empty("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match non_empty("LOG_FORMAT").as_deref() {
                Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: non_empty("DATABASE_MAX_CONNECTIONS")
                .and_then(|n| n.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            public_base_url: non_empty("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            provider_timeout: parsed("PROVIDER_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.provider_timeout),
            provisioning_lease: parsed("PROVISIONING_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.provisioning_lease),
            webhook_secrets: WebhookSecrets {
                stripe: non_empty("STRIPE_WEBHOOK_SECRET").map(SecretString::from),
                docusign: non_empty("DOCUSIGN_WEBHOOK_SECRET").map(SecretString::from),
                zoho_billing: non_empty("ZOHO_BILLING_WEBHOOK_SECRET").map(SecretString::from),
            },
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            public_base_url: "http://localhost:3000".to_string(),
            provider_timeout: Duration::from_millis(5000),
            provisioning_lease: Duration::from_secs(60),
            webhook_secrets: WebhookSecrets::default(),
        }
    }
}
