use anyhow::Result;
use std::sync::Arc;

use tap_hubspot::auth::{SystemClock, TokenManager};
use tap_hubspot::config::Config;
use tap_hubspot::error::TapError;
use tap_hubspot::http_client::{self, HubspotClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;

    tracing::info!("tap-hubspot {} starting", env!("CARGO_PKG_VERSION"));
    tracing::debug!(
        token_endpoint = %config.token_endpoint,
        api_base_url = %config.api_base_url,
        "Configuration loaded"
    );

    let client =
        http_client::build_client(config.http_connect_timeout, config.http_request_timeout)?;

    let token_manager = Arc::new(TokenManager::new(
        config.oauth_settings(),
        client.clone(),
        Arc::new(SystemClock),
    )?);

    let hubspot = HubspotClient::new(
        client,
        token_manager.clone(),
        &config.api_base_url,
        config.http_max_retries,
    );

    match hubspot.token_info().await {
        Ok(info) => {
            tracing::info!(
                hub_id = ?info.hub_id,
                hub_domain = ?info.hub_domain,
                user = ?info.user,
                scopes = info.scopes.len(),
                "Connection check passed"
            );
            Ok(())
        }
        Err(err @ TapError::AuthRefreshError { .. }) => {
            tracing::error!("{}", err);
            eprintln!(
                "Could not refresh credentials; re-authorize the app and update the refresh token."
            );
            eprintln!("{}", err);
            std::process::exit(2);
        }
        Err(err) => {
            tracing::error!("Connection check failed: {}", err);
            Err(err.into())
        }
    }
}
