//! Error types for gangway.
//!
//! This module defines all error types used throughout the application,
//! providing structured error handling with context.

use thiserror::Error;

/// Main error type for gangway.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Manifest file could not be found.
    #[error("Manifest file not found: {path}")]
    ManifestNotFound { path: String },

    /// Manifest file could not be parsed.
    #[error("Failed to parse manifest: {message}")]
    ManifestParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// A certificate could not be loaded or understood.
    #[error("Certificate error for {host}: {message}")]
    Certificate { host: String, message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new manifest parse error.
    pub fn manifest_parse(message: impl Into<String>) -> Self {
        Self::ManifestParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new certificate error.
    pub fn certificate(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Certificate {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
