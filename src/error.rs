// Error handling module
// Defines the error kinds surfaced to stream readers and the tap runner

use thiserror::Error;

/// Errors that can occur while authenticating or issuing API requests
#[derive(Error, Debug)]
pub enum TapError {
    /// Required configuration is missing or empty
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The identity provider rejected (or never answered) a token refresh
    #[error("Could not refresh credentials: {message} (status: {}, response: '{body}')", format_status(.status))]
    AuthRefreshError {
        status: Option<u16>,
        body: String,
        message: String,
    },

    /// Ordinary error response from the HubSpot API
    #[error("HubSpot API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TapError {
    /// True when no valid credential can be obtained without operator action
    pub fn is_auth_refresh(&self) -> bool {
        matches!(self, TapError::AuthRefreshError { .. })
    }
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

/// Result type alias for tap operations
pub type Result<T> = std::result::Result<T, TapError>;
