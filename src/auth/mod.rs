// Authentication module
// Owns the shared OAuth2 credential and its refresh lifecycle

mod clock;
mod manager;
mod refresh;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::TokenManager;
pub use types::{
    Credential, CredentialState, OAuthSettings, DEFAULT_TOKEN_ENDPOINT, EXPIRY_MARGIN_SECS,
};
