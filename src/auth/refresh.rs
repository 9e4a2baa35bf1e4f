// Token refresh logic

use reqwest::Client;

use super::types::{OAuthSettings, RefreshRequest, TokenResponse};
use crate::error::TapError;

fn refresh_failure(status: Option<u16>, body: String, message: impl Into<String>) -> TapError {
    TapError::AuthRefreshError {
        status,
        body,
        message: message.into(),
    }
}

/// Exchange the configured refresh token for a new access token.
///
/// One POST, no retries. Any transport error, non-2xx status or response
/// without both `access_token` and `expires_in` is an `AuthRefreshError`.
pub async fn request_access_token(
    client: &Client,
    settings: &OAuthSettings,
) -> Result<TokenResponse, TapError> {
    let client_prefix: String = settings.client_id.chars().take(8).collect();
    tracing::debug!(
        endpoint = %settings.token_endpoint,
        client_id = %client_prefix,
        "Requesting new access token"
    );

    let form = RefreshRequest::from_settings(settings);

    let response = client
        .post(&settings.token_endpoint)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(|e| {
            let kind = if e.is_timeout() { "timed out" } else { "failed" };
            refresh_failure(None, String::new(), format!("token request {}: {}", kind, e))
        })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| {
        refresh_failure(
            Some(status.as_u16()),
            String::new(),
            format!("failed to read token response: {}", e),
        )
    })?;

    if !status.is_success() {
        tracing::error!(
            status = status.as_u16(),
            body = %body,
            "Failed OAuth login"
        );

        // Surface the provider's error code when the body carries one
        if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&body) {
            let code = error_json
                .get("status")
                .or_else(|| error_json.get("error"))
                .and_then(|v| v.as_str());
            let detail = error_json
                .get("message")
                .or_else(|| error_json.get("error_description"))
                .and_then(|v| v.as_str());
            if let (Some(code), Some(detail)) = (code, detail) {
                tracing::error!(error = code, description = detail, "OAuth error details");
            }
        }

        return Err(refresh_failure(
            Some(status.as_u16()),
            body,
            format!("token endpoint returned {}", status),
        ));
    }

    let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
        refresh_failure(
            Some(status.as_u16()),
            body.clone(),
            format!("malformed token response: {}", e),
        )
    })?;

    if token.access_token.is_empty() {
        return Err(refresh_failure(
            Some(status.as_u16()),
            body,
            "token response contains an empty access_token",
        ));
    }

    tracing::info!("OAuth authorization attempt was successful.");
    Ok(token)
}
