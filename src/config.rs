//! Environment-driven bootstrap configuration.
//!
//! All knobs are read once at startup from `GANGWAY_*` environment variables
//! (a `.env` file is honored via `dotenvy` in `main`). Everything that
//! changes at runtime lives in the compose manifest instead and arrives
//! through the reload path.

use std::env;
use std::path::PathBuf;

use crate::error::{ProxyError, Result};
use crate::logging::LogFormat;

/// Default HTTP listen port.
pub const DEFAULT_HTTP_PORT: u16 = 80;
/// Default HTTPS listen port.
pub const DEFAULT_HTTPS_PORT: u16 = 443;
/// Default compose manifest path.
pub const DEFAULT_MANIFEST: &str = "./compose.yaml";
/// Default certificate cache directory.
pub const DEFAULT_CERT_DIR: &str = "./certs";

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or a file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Root configuration assembled from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Path to the compose manifest routes are read from.
    pub manifest_path: PathBuf,

    /// HTTP listen port.
    pub http_port: u16,

    /// HTTPS listen port.
    pub https_port: u16,

    /// Whether the TLS-terminating listener is enabled.
    pub https_enabled: bool,

    /// ACME account email, required when HTTPS is enabled.
    pub acme_email: Option<String>,

    /// Directory the ACME collaborator drops certificates into.
    pub cert_dir: PathBuf,

    /// Whether to watch the manifest and reload on change.
    pub watch: bool,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from(DEFAULT_MANIFEST),
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            https_enabled: false,
            acme_email: None,
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            watch: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = AppConfig::default();
        let config = AppConfig {
            manifest_path: get("GANGWAY_COMPOSE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.manifest_path),
            http_port: parse_port(get("GANGWAY_HTTP_PORT"), DEFAULT_HTTP_PORT),
            https_port: parse_port(get("GANGWAY_HTTPS_PORT"), DEFAULT_HTTPS_PORT),
            https_enabled: parse_bool(get("GANGWAY_HTTPS_ENABLED"), false),
            acme_email: get("GANGWAY_ACME_EMAIL").filter(|v| !v.is_empty()),
            cert_dir: get("GANGWAY_CERT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cert_dir),
            watch: parse_bool(get("GANGWAY_WATCH"), false),
            logging: LoggingConfig {
                level: get("GANGWAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                output: get("GANGWAY_LOG_OUTPUT").unwrap_or_else(|| "stdout".to_string()),
                format: get("GANGWAY_LOG_FORMAT")
                    .as_deref()
                    .map(LogFormat::parse)
                    .unwrap_or_default(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.https_enabled && self.acme_email.is_none() {
            return Err(ProxyError::config_validation(
                "GANGWAY_ACME_EMAIL is required when HTTPS is enabled",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }
}

/// Parses a port variable, keeping the default on absent or invalid input.
fn parse_port(value: Option<String>, fallback: u16) -> u16 {
    value.and_then(|v| v.parse().ok()).unwrap_or(fallback)
}

/// Boolean environment values accept `true`, `1`, and `yes`.
fn parse_bool(value: Option<String>, fallback: bool) -> bool {
    match value {
        Some(v) => matches!(v.as_str(), "true" | "1" | "yes"),
        None => fallback,
    }
}
