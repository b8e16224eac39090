//! OAuth2 authentication: Gmail hub bootstrap and a provider-neutral
//! authorization-code manager used by the Graph backend

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use yup_oauth2::ApplicationSecret;

use crate::config::{GmailConfig, OutlookConfig};
use crate::error::{CleanupError, Result};

/// Read/write access without permanent deletion
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Full mailbox access, required for `messages.delete`
pub const GMAIL_FULL_SCOPE: &str = "https://mail.google.com/";

/// Graph scopes for reading and deleting mail with a refresh token
pub const OUTLOOK_SCOPES: &[&str] = &[
    "offline_access",
    "https://graph.microsoft.com/Mail.ReadWrite",
];

/// Seconds before the real expiry at which a token counts as expired
const EXPIRY_BUFFER_SECS: i64 = 60;

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Scopes requested for the Gmail hub
pub fn gmail_scopes(config: &GmailConfig) -> Vec<&'static str> {
    let mut scopes = vec![GMAIL_MODIFY_SCOPE];
    if config.permanent_delete {
        scopes.push(GMAIL_FULL_SCOPE);
    }
    scopes
}

/// Initialize Gmail API hub with OAuth2 authentication
///
/// Credentials come from `credentials_path` when the file exists, otherwise
/// from the `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET` environment variables.
/// The installed flow opens a browser on first use and caches tokens at
/// `token_cache_path`.
pub async fn initialize_gmail_hub(config: &GmailConfig) -> Result<GmailHub> {
    let secret = if config.credentials_path.exists() {
        yup_oauth2::read_application_secret(&config.credentials_path)
            .await
            .map_err(|e| CleanupError::AuthError(format!("Failed to read credentials: {}", e)))?
    } else {
        debug!(
            path = %config.credentials_path.display(),
            "credentials file missing, falling back to environment"
        );
        load_credentials_from_env()?
    };

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(&config.token_cache_path)
    .build()
    .await
    .map_err(|e| CleanupError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Pre-authenticate so the cached token carries every scope used later
    let scopes = gmail_scopes(config);
    auth.token(&scopes[..])
        .await
        .map_err(|e| CleanupError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if config.token_cache_path.exists() {
        secure_token_file(&config.token_cache_path).await?;
    }

    // HTTP/1 works better with google-gmail1
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| {
                    CleanupError::AuthError(format!("Failed to load TLS roots: {}", e))
                })?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    info!("Gmail hub initialized");
    Ok(Gmail::new(client, auth))
}

/// Load Gmail OAuth2 credentials from environment variables
///
/// # Environment Variables
/// - `GMAIL_CLIENT_ID`: OAuth2 client ID
/// - `GMAIL_CLIENT_SECRET`: OAuth2 client secret
/// - `GMAIL_REDIRECT_URI`: Redirect URI (optional, defaults to http://localhost:8080)
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("GMAIL_CLIENT_ID")
        .map_err(|_| CleanupError::ConfigError("GMAIL_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("GMAIL_CLIENT_SECRET")
        .map_err(|_| CleanupError::ConfigError("GMAIL_CLIENT_SECRET not set".to_string()))?;
    let redirect_uri = env::var("GMAIL_REDIRECT_URI")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Restrict a token file to its owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows relies on the profile directory ACLs
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

/// Authorization and token endpoints of one OAuth2 provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthEndpoints {
    pub name: String,
    pub auth_url: String,
    pub token_url: String,
    /// Provider-specific query parameters appended to the authorization URL
    pub extra_auth_params: Vec<(String, String)>,
}

impl OAuthEndpoints {
    pub fn google() -> Self {
        Self {
            name: "google".to_string(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            extra_auth_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        }
    }

    /// `tenant` is `common`, `organizations`, `consumers` or a tenant id
    pub fn microsoft(tenant: &str) -> Self {
        Self {
            name: "microsoft".to_string(),
            auth_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/authorize",
                tenant
            ),
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant
            ),
            extra_auth_params: vec![("prompt".to_string(), "consent".to_string())],
        }
    }

    pub fn custom(
        name: impl Into<String>,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            auth_url: auth_url.into(),
            token_url: token_url.into(),
            extra_auth_params: Vec::new(),
        }
    }
}

/// Access and refresh tokens as persisted on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

impl TokenSet {
    /// Expired, or within a minute of expiring
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - ChronoDuration::seconds(EXPIRY_BUFFER_SECS) <= now,
            None => false,
        }
    }

    fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: response
                .expires_in
                .map(|secs| now + ChronoDuration::seconds(secs as i64)),
            refresh_token: response.refresh_token,
            scope: response.scope,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Read a token file written by [`save_token_file`]; `None` when absent
pub async fn load_token_file(path: &Path) -> Result<Option<TokenSet>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn save_token_file(path: &Path, tokens: &TokenSet) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let content = serde_json::to_string_pretty(tokens)?;
    tokio::fs::write(path, content).await?;
    secure_token_file(path).await
}

/// Authorization-code flow with refresh and change notifications
///
/// Every successful exchange, refresh or [`set_tokens`](Self::set_tokens)
/// call is broadcast to subscribers, so callers can persist the new tokens.
pub struct OAuthManager {
    http: reqwest::Client,
    endpoints: OAuthEndpoints,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    tokens: RwLock<Option<TokenSet>>,
    events: broadcast::Sender<TokenSet>,
}

impl OAuthManager {
    pub fn new(
        endpoints: OAuthEndpoints,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            http: reqwest::Client::new(),
            endpoints,
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: redirect_uri.into(),
            tokens: RwLock::new(None),
            events,
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Microsoft endpoints for the configured tenant; the client secret is
    /// read from `OUTLOOK_CLIENT_SECRET` when set
    pub fn for_outlook(config: &OutlookConfig) -> Self {
        let manager = Self::new(
            OAuthEndpoints::microsoft(&config.tenant),
            config.client_id.clone(),
            config.redirect_uri.clone(),
        );
        match env::var("OUTLOOK_CLIENT_SECRET") {
            Ok(secret) if !secret.is_empty() => manager.with_client_secret(secret),
            _ => manager,
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.endpoints.name
    }

    /// Receiver for "tokens updated" notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TokenSet> {
        self.events.subscribe()
    }

    pub async fn tokens(&self) -> Option<TokenSet> {
        self.tokens.read().await.clone()
    }

    /// URL the user opens to grant access
    pub fn authorization_url(&self, scopes: &[&str], state: &str) -> Result<String> {
        let mut url = url::Url::parse(&self.endpoints.auth_url).map_err(|e| {
            CleanupError::ConfigError(format!(
                "Invalid authorization URL '{}': {}",
                self.endpoints.auth_url, e
            ))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("scope", &scopes.join(" "))
                .append_pair("state", state);
            for (key, value) in &self.endpoints.extra_auth_params {
                query.append_pair(key, value);
            }
        }

        Ok(url.into())
    }

    /// Trade an authorization code for tokens
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", self.redirect_uri.as_str());

        let tokens = self.request_tokens(params).await?;
        info!(provider = %self.endpoints.name, "Authorization code exchanged");
        self.store(tokens.clone()).await;
        Ok(tokens)
    }

    /// Current tokens, refreshed first when they are about to expire
    pub async fn refresh_if_expired(&self) -> Result<TokenSet> {
        let current = self
            .tokens()
            .await
            .ok_or_else(|| CleanupError::AuthError("Not authenticated".to_string()))?;

        if !current.is_expired() {
            return Ok(current);
        }
        self.refresh().await
    }

    /// Unconditionally exchange the refresh token for a new access token
    pub async fn refresh(&self) -> Result<TokenSet> {
        let current = self.tokens().await;
        let refresh_token = current
            .as_ref()
            .and_then(|t| t.refresh_token.clone())
            .ok_or(CleanupError::MissingRefreshToken)?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token.as_str());

        let mut tokens = self.request_tokens(params).await?;
        // Providers may omit the refresh token on refresh
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.clone());
        }

        debug!(provider = %self.endpoints.name, "Access token refreshed");
        self.store(tokens.clone()).await;
        Ok(tokens)
    }

    /// Replace the stored tokens, e.g. from a token file
    pub async fn set_tokens(&self, tokens: TokenSet) {
        self.store(tokens).await;
    }

    /// Bearer token for API calls
    pub async fn access_token(&self) -> Result<String> {
        Ok(self.refresh_if_expired().await?.access_token)
    }

    async fn store(&self, tokens: TokenSet) {
        *self.tokens.write().await = Some(tokens.clone());
        // No receivers is fine
        let _ = self.events.send(tokens);
    }

    async fn request_tokens<'a>(
        &'a self,
        mut params: HashMap<&'a str, &'a str>,
    ) -> Result<TokenSet> {
        params.insert("client_id", self.client_id.as_str());
        if let Some(secret) = &self.client_secret {
            params.insert("client_secret", secret.as_str());
        }

        let response = self
            .http
            .post(&self.endpoints.token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(CleanupError::from_status(status.as_u16(), &body, None));
            }
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error,
                },
                Err(_) => format!("HTTP {}: {}", status.as_u16(), body.trim()),
            };
            warn!(provider = %self.endpoints.name, "Token request rejected: {}", message);
            return Err(CleanupError::AuthError(message));
        }

        let token_response: TokenResponse = response.json().await?;
        Ok(TokenSet::from_response(token_response, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager_for(server: &MockServer) -> OAuthManager {
        OAuthManager::new(
            OAuthEndpoints::custom(
                "test",
                format!("{}/authorize", server.uri()),
                format!("{}/token", server.uri()),
            ),
            "client-1",
            "http://localhost:8080",
        )
    }

    fn token(expires_at: Option<DateTime<Utc>>, refresh: Option<&str>) -> TokenSet {
        TokenSet {
            access_token: "old-access".to_string(),
            token_type: "Bearer".to_string(),
            expires_at,
            refresh_token: refresh.map(str::to_string),
            scope: None,
        }
    }

    #[test]
    fn test_gmail_scopes() {
        let mut config = GmailConfig::default();
        assert_eq!(gmail_scopes(&config), vec![GMAIL_MODIFY_SCOPE]);

        config.permanent_delete = true;
        assert_eq!(gmail_scopes(&config), vec![GMAIL_MODIFY_SCOPE, GMAIL_FULL_SCOPE]);
    }

    #[test]
    fn test_token_expiry_buffer() {
        let now = Utc::now();
        assert!(!token(None, None).is_expired_at(now));
        assert!(!token(Some(now + ChronoDuration::seconds(120)), None).is_expired_at(now));
        assert!(token(Some(now + ChronoDuration::seconds(30)), None).is_expired_at(now));
        assert!(token(Some(now - ChronoDuration::seconds(1)), None).is_expired_at(now));
    }

    #[test]
    fn test_authorization_url_google() {
        let manager = OAuthManager::new(OAuthEndpoints::google(), "cid", "http://localhost:8080");
        let url = manager
            .authorization_url(&["openid", "email"], "xyz")
            .unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let pairs: HashMap<_, _> = parsed.query_pairs().into_owned().collect();

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], "openid email");
        assert_eq!(pairs["state"], "xyz");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["prompt"], "consent");
    }

    #[test]
    fn test_microsoft_endpoints_use_tenant() {
        let endpoints = OAuthEndpoints::microsoft("consumers");
        assert_eq!(
            endpoints.token_url,
            "https://login.microsoftonline.com/consumers/oauth2/v2.0/token"
        );
        assert!(endpoints.auth_url.ends_with("/consumers/oauth2/v2.0/authorize"));
    }

    #[tokio::test]
    async fn test_exchange_code_stores_and_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "refresh-1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager_for(&server);
        let mut events = manager.subscribe();

        let tokens = manager.exchange_code("abc").await.unwrap();
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
        assert!(!tokens.is_expired());

        let notified = events.recv().await.unwrap();
        assert_eq!(notified, tokens);
        assert_eq!(manager.access_token().await.unwrap(), "new-access");
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=keep-me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager_for(&server);
        manager
            .set_tokens(token(Some(Utc::now() - ChronoDuration::minutes(5)), Some("keep-me")))
            .await;

        let tokens = manager.refresh_if_expired().await.unwrap();
        assert_eq!(tokens.access_token, "fresh");
        assert_eq!(tokens.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(tokens.token_type, "Bearer");
    }

    #[tokio::test]
    async fn test_refresh_skipped_while_valid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let manager = manager_for(&server);
        manager
            .set_tokens(token(Some(Utc::now() + ChronoDuration::hours(1)), Some("r")))
            .await;

        let tokens = manager.refresh_if_expired().await.unwrap();
        assert_eq!(tokens.access_token, "old-access");
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let server = MockServer::start().await;
        let manager = manager_for(&server);
        manager
            .set_tokens(token(Some(Utc::now() - ChronoDuration::minutes(5)), None))
            .await;

        let err = manager.refresh_if_expired().await.unwrap_err();
        assert!(matches!(err, CleanupError::MissingRefreshToken));
        assert_eq!(err.to_string(), "No refresh token available");
    }

    #[tokio::test]
    async fn test_unauthenticated_access_token() {
        let server = MockServer::start().await;
        let manager = manager_for(&server);
        assert!(matches!(
            manager.access_token().await,
            Err(CleanupError::AuthError(_))
        ));
    }

    #[tokio::test]
    async fn test_token_endpoint_error_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Code expired"
            })))
            .mount(&server)
            .await;

        let manager = manager_for(&server);
        let err = manager.exchange_code("stale").await.unwrap_err();
        match err {
            CleanupError::AuthError(message) => {
                assert_eq!(message, "invalid_grant: Code expired")
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(manager.tokens().await.is_none());
    }

    #[tokio::test]
    async fn test_token_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("token.json");

        assert!(load_token_file(&path).await.unwrap().is_none());

        let tokens = token(Some(Utc::now()), Some("r"));
        save_token_file(&path, &tokens).await.unwrap();
        assert_eq!(load_token_file(&path).await.unwrap(), Some(tokens));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = tokio::fs::metadata(&path).await.unwrap().permissions();
            assert_eq!(perms.mode() & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_credentials_from_env() {
        env::set_var("GMAIL_CLIENT_ID", "test-id");
        env::set_var("GMAIL_CLIENT_SECRET", "test-secret");
        env::set_var("GMAIL_REDIRECT_URI", "http://localhost:9999");

        let secret = load_credentials_from_env().unwrap();
        assert_eq!(secret.client_id, "test-id");
        assert_eq!(secret.client_secret, "test-secret");
        assert_eq!(secret.redirect_uris[0], "http://localhost:9999");

        env::remove_var("GMAIL_CLIENT_ID");
        env::remove_var("GMAIL_CLIENT_SECRET");
        env::remove_var("GMAIL_REDIRECT_URI");
    }
}
