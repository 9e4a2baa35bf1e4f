use chrono::{TimeZone, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use super::clock::Clock;
use super::refresh;
use super::types::{Credential, CredentialState, OAuthSettings};
use crate::error::{Result, TapError};

/// OAuth2 refresh-token authenticator shared by every stream reader of a run.
///
/// Holds the only copy of the access credential. Readers call
/// [`TokenManager::get_auth_header`] right before each request; the credential
/// is refreshed lazily, at most one refresh at a time.
pub struct TokenManager {
    /// Immutable client settings
    settings: OAuthSettings,

    /// Current credential, swapped as a whole by refresh
    credential: RwLock<Credential>,

    /// Serialises refreshes
    refresh_lock: Mutex<()>,

    /// HTTP client for refresh requests
    client: Client,

    /// Time source for validity checks
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    /// Create a manager with no token; the first header request refreshes
    pub fn new(settings: OAuthSettings, client: Client, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_credential(settings, client, clock, Credential::Empty)
    }

    /// Create a manager seeded with a previously issued credential
    pub fn with_credential(
        settings: OAuthSettings,
        client: Client,
        clock: Arc<dyn Clock>,
        credential: Credential,
    ) -> Result<Self> {
        validate_settings(&settings)?;

        Ok(Self {
            settings,
            credential: RwLock::new(credential),
            refresh_lock: Mutex::new(()),
            client,
            clock,
        })
    }

    /// Token endpoint used for refreshes
    pub fn auth_endpoint(&self) -> &str {
        &self.settings.token_endpoint
    }

    /// Consistent snapshot of the current credential
    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Lifecycle state of the current credential
    pub async fn state(&self) -> CredentialState {
        let now = self.clock.now();
        self.credential.read().await.state(now)
    }

    /// Headers to attach to the next request, refreshing first if needed
    pub async fn get_auth_header(&self) -> Result<HashMap<String, String>> {
        let token = self.valid_access_token().await?;

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        Ok(headers)
    }

    /// Return a token with at least 60 seconds left, refreshing if necessary
    pub async fn valid_access_token(&self) -> Result<String> {
        if let Some(token) = self.current_if_valid().await {
            return Ok(token);
        }

        let guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(token) = self.current_if_valid().await {
            tracing::debug!("Token refreshed by a concurrent caller");
            return Ok(token);
        }

        self.refresh_locked(&guard).await?;

        let credential = self.credential.read().await;
        credential
            .access_token()
            .map(str::to_string)
            .ok_or_else(|| TapError::Internal(anyhow::anyhow!("No access token after refresh")))
    }

    /// Unconditionally exchange the refresh token for a new access token
    pub async fn refresh(&self) -> Result<()> {
        let guard = self.refresh_lock.lock().await;
        self.refresh_locked(&guard).await
    }

    async fn current_if_valid(&self) -> Option<String> {
        let now = self.clock.now();
        let credential = self.credential.read().await;
        if credential.is_valid(now) {
            credential.access_token().map(str::to_string)
        } else {
            None
        }
    }

    async fn refresh_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<()> {
        tracing::debug!("Refreshing access token...");

        // Expiry counts from when the request was sent, not when the answer arrived
        let request_time = self.clock.now();
        let token = refresh::request_access_token(&self.client, &self.settings).await?;
        let expires_in = i64::try_from(token.expires_in).unwrap_or(i64::MAX);
        let expires_at = request_time.saturating_add(expires_in);

        {
            let mut credential = self.credential.write().await;
            *credential = Credential::Issued {
                access_token: token.access_token,
                expires_at,
            };
        }

        let expires_display = Utc
            .timestamp_opt(expires_at, 0)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| expires_at.to_string());
        tracing::info!(expires_at = %expires_display, "Generated new access token");

        Ok(())
    }
}

fn validate_settings(settings: &OAuthSettings) -> Result<()> {
    if settings.token_endpoint.trim().is_empty() {
        return Err(TapError::ConfigError(
            "Authorization endpoint not set.".to_string(),
        ));
    }

    let required = [
        ("client_id", &settings.client_id),
        ("client_secret", &settings.client_secret),
        ("redirect_uri", &settings.redirect_uri),
        ("refresh_token", &settings.refresh_token),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(TapError::ConfigError(format!("{} is required", name)));
        }
    }

    Ok(())
}
