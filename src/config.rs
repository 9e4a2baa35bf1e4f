use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::auth::{OAuthSettings, DEFAULT_TOKEN_ENDPOINT};
use crate::error::TapError;

/// Default HubSpot API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.hubapi.com";

/// HubSpot tap
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to a JSON config file
    #[arg(short = 'c', long, env = "TAP_CONFIG")]
    pub config: Option<String>,

    /// OAuth client id
    #[arg(long, env = "HUBSPOT_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "HUBSPOT_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// OAuth redirect URI registered for the app
    #[arg(long, env = "HUBSPOT_REDIRECT_URI")]
    pub redirect_uri: Option<String>,

    /// OAuth refresh token
    #[arg(long, env = "HUBSPOT_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// OAuth token endpoint
    #[arg(long, env = "HUBSPOT_TOKEN_ENDPOINT")]
    pub token_endpoint: Option<String>,

    /// HubSpot API base URL
    #[arg(long, env = "HUBSPOT_API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT")]
    pub http_timeout: Option<u64>,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES")]
    pub http_retries: Option<u32>,
}

/// Singer-style JSON config file. Unknown keys (start_date, properties, ...)
/// belong to the stream layer and are ignored here.
#[derive(Deserialize, Debug, Default)]
pub struct FileConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub token_endpoint: Option<String>,
    pub api_base_url: Option<String>,
    pub log_level: Option<String>,
    pub http_request_timeout: Option<u64>,
    pub http_max_retries: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // OAuth credentials
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub refresh_token: String,
    pub token_endpoint: String,

    // API
    pub api_base_url: String,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > config file > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();

        let file = match args.config.as_deref() {
            Some(path) => read_config_file(&expand_tilde(path))?,
            None => FileConfig::default(),
        };

        let connect_timeout = std::env::var("HTTP_CONNECT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self::merge(args, file, connect_timeout))
    }

    /// Combine CLI/ENV values with the config file, filling in defaults
    pub fn merge(args: CliArgs, file: FileConfig, http_connect_timeout: u64) -> Self {
        Config {
            client_id: args.client_id.or(file.client_id).unwrap_or_default(),
            client_secret: args.client_secret.or(file.client_secret).unwrap_or_default(),
            redirect_uri: args.redirect_uri.or(file.redirect_uri).unwrap_or_default(),
            refresh_token: args.refresh_token.or(file.refresh_token).unwrap_or_default(),
            token_endpoint: args
                .token_endpoint
                .or(file.token_endpoint)
                .unwrap_or_else(|| DEFAULT_TOKEN_ENDPOINT.to_string()),
            api_base_url: args
                .api_base_url
                .or(file.api_base_url)
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            http_connect_timeout,
            http_request_timeout: args.http_timeout.or(file.http_request_timeout).unwrap_or(300),
            http_max_retries: args.http_retries.or(file.http_max_retries).unwrap_or(3),
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), TapError> {
        let required = [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", &self.redirect_uri),
            ("refresh_token", &self.refresh_token),
            ("token_endpoint", &self.token_endpoint),
            ("api_base_url", &self.api_base_url),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(TapError::ConfigError(format!(
                "missing required setting(s): {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// OAuth settings handed to the token manager
    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            refresh_token: self.refresh_token.clone(),
            token_endpoint: self.token_endpoint.clone(),
        }
    }
}

/// Read a JSON config file
fn read_config_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
