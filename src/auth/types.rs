// Authentication types

use serde::{Deserialize, Serialize};

/// Seconds before the real expiry at which a token is already treated as expired
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// HubSpot OAuth token endpoint
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://api.hubapi.com/oauth/v1/token";

/// Shared access credential.
///
/// Token and expiry are set together by a refresh, so a half-written credential
/// cannot be represented.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credential {
    /// No token obtained yet
    #[default]
    Empty,

    /// Token issued by the identity provider
    Issued {
        access_token: String,
        /// Absolute UNIX timestamp (seconds)
        expires_at: i64,
    },
}

/// Lifecycle position of a credential at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Empty,
    Valid,
    /// Within the expiry margin, or already expired
    ExpiringSoon,
}

impl Credential {
    pub fn issued(access_token: impl Into<String>, expires_at: i64) -> Self {
        Credential::Issued {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn state(&self, now: i64) -> CredentialState {
        match self {
            Credential::Empty => CredentialState::Empty,
            Credential::Issued { access_token, .. } if access_token.is_empty() => {
                CredentialState::Empty
            }
            Credential::Issued { expires_at, .. } => {
                if expires_at.saturating_sub(now) >= EXPIRY_MARGIN_SECS {
                    CredentialState::Valid
                } else {
                    CredentialState::ExpiringSoon
                }
            }
        }
    }

    /// Valid if the token will expire in 60 seconds or more
    pub fn is_valid(&self, now: i64) -> bool {
        self.state(now) == CredentialState::Valid
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            Credential::Empty => None,
            Credential::Issued { access_token, .. } => Some(access_token),
        }
    }

    pub fn expires_at(&self) -> Option<i64> {
        match self {
            Credential::Empty => None,
            Credential::Issued { expires_at, .. } => Some(*expires_at),
        }
    }
}

/// OAuth client settings, supplied once at startup
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub refresh_token: String,
    pub token_endpoint: String,
}

/// Form body for the refresh_token grant
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub redirect_uri: &'a str,
    pub refresh_token: &'a str,
    pub grant_type: &'static str,
}

impl<'a> RefreshRequest<'a> {
    pub fn from_settings(settings: &'a OAuthSettings) -> Self {
        Self {
            client_id: &settings.client_id,
            client_secret: &settings.client_secret,
            redirect_uri: &settings.redirect_uri,
            refresh_token: &settings.refresh_token,
            grant_type: "refresh_token",
        }
    }
}

/// Token endpoint response; both fields are required
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}
