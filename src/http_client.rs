use anyhow::Context;
use rand::Rng;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenManager;
use crate::error::{Result, TapError};

/// Build the shared reqwest client used for API calls and token refreshes
pub fn build_client(connect_timeout: u64, request_timeout: u64) -> anyhow::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .build()
        .context("Failed to create HTTP client")
}

/// Access token metadata returned by `/oauth/v1/access-tokens/{token}`
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub hub_id: Option<u64>,
    pub hub_domain: Option<String>,
    pub user: Option<String>,
    pub app_id: Option<u64>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: Option<i64>,
}

const TOKEN_INFO_PATH: &str = "/oauth/v1/access-tokens";

/// Request target relative to the base URL
enum Target<'a> {
    Path(&'a str),
    /// Metadata route; its last segment is the access token sent in the same request
    TokenInfo,
}

impl Target<'_> {
    fn path(&self, headers: &HashMap<String, String>) -> Result<String> {
        match self {
            Target::Path(path) => Ok(path.to_string()),
            Target::TokenInfo => {
                let token = headers
                    .get("Authorization")
                    .and_then(|value| value.strip_prefix("Bearer "))
                    .context("Authorization header missing from auth headers")?;
                Ok(format!("{}/{}", TOKEN_INFO_PATH, token))
            }
        }
    }

    /// Path safe to write to logs
    fn redacted(&self) -> String {
        match self {
            Target::Path(path) => path.to_string(),
            Target::TokenInfo => format!("{}/[redacted]", TOKEN_INFO_PATH),
        }
    }
}

/// Authenticated HubSpot client used by stream readers
pub struct HubspotClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Authenticator consulted before every attempt
    token_manager: Arc<TokenManager>,

    /// API base URL without trailing slash
    base_url: String,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl HubspotClient {
    pub fn new(
        client: Client,
        token_manager: Arc<TokenManager>,
        base_url: &str,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            token_manager,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        }
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// GET a JSON document relative to the base URL
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value> {
        let response = self.get_with_retry(Target::Path(path), query).await?;
        let value = response
            .json()
            .await
            .context("Failed to parse HubSpot response")?;
        Ok(value)
    }

    /// Connection check: metadata for the token currently in use
    pub async fn token_info(&self) -> Result<TokenInfo> {
        let response = self.get_with_retry(Target::TokenInfo, &[]).await?;
        let info = response
            .json()
            .await
            .context("Failed to parse access token metadata")?;
        Ok(info)
    }

    /// Execute a GET with retry logic
    /// - 429 / 5xx / network errors: exponential backoff
    /// - credential refresh failures: returned immediately
    async fn get_with_retry(
        &self,
        target: Target<'_>,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let log_path = target.redacted();
        let mut attempt = 0;

        loop {
            // Fresh headers on every attempt; the token may have expired during backoff
            let headers = self.token_manager.get_auth_header().await?;
            let url = format!("{}{}", self.base_url, target.path(&headers)?);

            let mut builder = self.client.get(&url).query(query);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            tracing::debug!(path = %log_path, attempt = attempt + 1, "Sending HTTP request");

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        path = %log_path,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(TapError::ApiError {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    // The URL may embed the access token
                    let e = e.without_url();
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else {
                        "unknown"
                    };

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            "Request failed, retrying after {}ms (attempt {}/{})",
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        path = %log_path,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(TapError::Internal(anyhow::anyhow!(
                        "HTTP request failed: {} (kind: {})",
                        e,
                        error_kind
                    )));
                }
            }
        }
    }

    /// Exponential backoff: base_delay * 2^attempt, plus up to 10% jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
        delay + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, ManualClock, OAuthSettings};
    use std::io::Write;
    use std::sync::Mutex;

    /// Collects formatted log output in memory
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }

        /// Debug-level subscriber for the current thread
        fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
            let logs = self.clone();
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .with_writer(move || logs.clone())
                .finish()
        }
    }

    fn manager(token_endpoint: &str, credential: Credential) -> Arc<TokenManager> {
        manager_with_clock(token_endpoint, credential, Arc::new(ManualClock::new(1000)))
    }

    fn manager_with_clock(
        token_endpoint: &str,
        credential: Credential,
        clock: Arc<ManualClock>,
    ) -> Arc<TokenManager> {
        let settings = OAuthSettings {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://example.com/oauth".to_string(),
            refresh_token: "rt".to_string(),
            token_endpoint: token_endpoint.to_string(),
        };
        Arc::new(
            TokenManager::with_credential(settings, Client::new(), clock, credential).unwrap(),
        )
    }

    #[test]
    fn test_backoff_calculation() {
        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::Empty),
            "https://api.hubapi.com/",
            3,
        );

        let delay0 = client.calculate_backoff_delay(0);
        let delay1 = client.calculate_backoff_delay(1);
        let delay2 = client.calculate_backoff_delay(2);

        assert!((1000..=1100).contains(&delay0));
        assert!((2000..=2200).contains(&delay1));
        assert!((4000..=4400).contains(&delay2));
        assert_eq!(client.base_url, "https://api.hubapi.com");
    }

    #[tokio::test]
    async fn test_request_carries_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/crm/v3/objects/contacts")
            .match_header("authorization", "Bearer xyz")
            .match_query(mockito::Matcher::UrlEncoded("limit".into(), "10".into()))
            .with_status(200)
            .with_body(r#"{"results":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::issued("xyz", 1000 + 3600)),
            &server.url(),
            0,
        );

        let body = client
            .get_json("/crm/v3/objects/contacts", &[("limit", "10")])
            .await
            .unwrap();
        assert!(body["results"].is_array());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/crm/v3/owners")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::issued("xyz", 1000 + 3600)),
            &server.url(),
            1,
        )
        .with_base_delay(1);

        let err = client.get_json("/crm/v3/owners", &[]).await.unwrap_err();
        match err {
            TapError::ApiError { status, .. } => assert_eq!(status, 503),
            other => panic!("expected ApiError, got {:?}", other),
        }
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/crm/v3/owners")
            .with_status(404)
            .with_body("not found")
            .expect(1)
            .create_async()
            .await;

        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::issued("xyz", 1000 + 3600)),
            &server.url(),
            3,
        )
        .with_base_delay(1);

        let err = client.get_json("/crm/v3/owners", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "HubSpot API error: 404 - not found");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_is_not_an_api_error() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/oauth/v1/token")
            .with_status(401)
            .with_body(r#"{"status":"BAD_CLIENT_ID"}"#)
            .expect(1)
            .create_async()
            .await;
        let api_mock = server
            .mock("GET", "/crm/v3/owners")
            .expect(0)
            .create_async()
            .await;

        let client = HubspotClient::new(
            Client::new(),
            manager(&format!("{}/oauth/v1/token", server.url()), Credential::Empty),
            &server.url(),
            3,
        )
        .with_base_delay(1);

        let err = client.get_json("/crm/v3/owners", &[]).await.unwrap_err();
        assert!(err.is_auth_refresh());
        assert!(err.to_string().contains("BAD_CLIENT_ID"));
        token_mock.assert_async().await;
        api_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_info() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/oauth/v1/access-tokens/xyz")
            .match_header("authorization", "Bearer xyz")
            .with_status(200)
            .with_body(
                r#"{"token":"xyz","user":"ops@example.com","hub_domain":"example.com",
                    "scopes":["crm.objects.contacts.read"],"hub_id":62515,"app_id":456,
                    "expires_in":1754,"user_id":123,"token_type":"access"}"#,
            )
            .create_async()
            .await;

        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::issued("xyz", 1000 + 3600)),
            &server.url(),
            0,
        );

        let info = client.token_info().await.unwrap();
        assert_eq!(info.hub_id, Some(62515));
        assert_eq!(info.user.as_deref(), Some("ops@example.com"));
        assert_eq!(info.scopes, vec!["crm.objects.contacts.read".to_string()]);
    }

    #[tokio::test]
    async fn test_token_info_never_logs_access_token() {
        let secret = "SECRET-ACCESS-TOKEN-123";
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", format!("/oauth/v1/access-tokens/{}", secret).as_str())
            .with_status(503)
            .with_body("temporarily unavailable")
            .expect(2)
            .create_async()
            .await;

        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::issued(secret, 10_000)),
            &server.url(),
            1,
        )
        .with_base_delay(1);

        let err = client.token_info().await.unwrap_err();
        assert!(!err.to_string().contains(secret));
        mock.assert_async().await;

        let output = logs.contents();
        assert!(output.contains("Sending HTTP request"));
        assert!(output.contains("/oauth/v1/access-tokens/[redacted]"));
        assert!(!output.contains(secret), "token leaked into logs:\n{}", output);
    }

    #[tokio::test]
    async fn test_transport_errors_do_not_log_access_token() {
        let secret = "SECRET-ACCESS-TOKEN-456";
        let logs = CapturedLogs::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());

        // Nothing listens on port 9
        let client = HubspotClient::new(
            Client::new(),
            manager("http://127.0.0.1:9/token", Credential::issued(secret, 10_000)),
            "http://127.0.0.1:9",
            1,
        )
        .with_base_delay(1);

        let err = client.token_info().await.unwrap_err();
        assert!(!err.to_string().contains(secret));

        let output = logs.contents();
        assert!(output.contains("HTTP request failed after all retries"));
        assert!(!output.contains(secret), "token leaked into logs:\n{}", output);
    }

    #[tokio::test]
    async fn test_token_info_path_follows_refreshed_token() {
        let mut server = mockito::Server::new_async().await;
        let clock = Arc::new(ManualClock::new(1000));

        // First attempt fails slowly enough for the token to enter the expiry margin
        let slow_clock = clock.clone();
        let stale = server
            .mock("GET", "/oauth/v1/access-tokens/old-token")
            .match_header("authorization", "Bearer old-token")
            .with_status(503)
            .with_body_from_request(move |_| {
                slow_clock.advance(50);
                Vec::new()
            })
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/oauth/v1/token")
            .with_status(200)
            .with_body(r#"{"access_token":"new-token","expires_in":1800}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/oauth/v1/access-tokens/new-token")
            .match_header("authorization", "Bearer new-token")
            .with_status(200)
            .with_body(r#"{"token":"new-token","hub_id":62515,"scopes":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HubspotClient::new(
            Client::new(),
            manager_with_clock(
                &format!("{}/oauth/v1/token", server.url()),
                Credential::issued("old-token", 1100),
                clock,
            ),
            &server.url(),
            1,
        )
        .with_base_delay(1);

        let info = client.token_info().await.unwrap();
        assert_eq!(info.hub_id, Some(62515));
        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
    }
}
