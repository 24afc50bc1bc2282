//! Discord OAuth2 login flow.
//!
//! Handles authorization URL generation, code exchange, and the session
//! cookie that points at the stored token.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ConsoleError, Result};
use crate::session::SESSION_COOKIE;

/// Scopes requested at login.
const SCOPES: &str = "identify guilds";

/// How long a login attempt's state value stays valid.
pub const LOGIN_STATE_TTL: Duration = Duration::from_secs(600);

/// Cache key for a pending login state value.
pub fn login_state_key(state: &str) -> String {
    format!("oauth_state:{}", state)
}

/// Token stored in the cache behind a session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

/// Discord token response (internal).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Discord OAuth2 configuration and handlers.
pub struct OAuthHandler {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    api_base: String,
    http_client: Client,
}

impl OAuthHandler {
    /// Create a handler. `redirect_uri` must match the application settings.
    pub fn new(
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        api_base: &str,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            http_client: Client::builder().timeout(timeout).build()?,
        })
    }

    /// Generate authorization URL with state parameter.
    pub fn authorization_url(&self, state: &str) -> String {
        format!(
            "{}/oauth2/authorize?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.api_base,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(SCOPES),
            urlencoding::encode(state)
        )
    }

    /// Exchange authorization code for a token.
    pub async fn exchange_code(&self, code: &str) -> Result<StoredToken> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let response = self
            .http_client
            .post(format!("{}/oauth2/token", self.api_base))
            .form(&params)
            .send()
            .await
            .map_err(|e| ConsoleError::OAuth(format!("Token exchange request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body: String = response.text().await.unwrap_or_default();
            return Err(ConsoleError::OAuth(format!(
                "Token exchange failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ConsoleError::OAuth(format!("Failed to parse token response: {}", e)))?;

        Ok(StoredToken {
            access_token: token.access_token,
            token_type: token.token_type,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

/// `Set-Cookie` value establishing a session.
pub fn session_cookie(session_id: &str, secure: bool, max_age: Duration) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!(
        "{}={}; Path=/; HttpOnly{}; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        session_id,
        secure_flag,
        max_age.as_secs()
    )
}
