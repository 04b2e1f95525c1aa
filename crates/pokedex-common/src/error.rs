//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for shared operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors raised outside a specific pipeline stage
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl EtlError {
    /// Shorthand for a rejected configuration value
    pub fn invalid_setting(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        EtlError::InvalidSetting {
            key: key.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
