//! Gmail-style OAuth 2.0 authorization-code flow.
//!
//! Stateless HTTPS client used by the OAuth endpoints (authorization URL,
//! code exchange) and by the email node (access-token refresh). Token sets
//! carry an absolute expiry in epoch milliseconds, computed from the
//! provider's `expires_in` at exchange/refresh time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const PROFILE_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users/me/profile";
const GMAIL_SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

/// Default token lifetime when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),
}

/// Access/refresh token pair as stored inside a `gmail-oauth` credential blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, epoch milliseconds
    pub expires_at: i64,
}

impl TokenSet {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now().timestamp_millis()
    }
}

/// Plaintext shape of a `gmail-oauth` credential blob (pre-encryption).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailCredential {
    pub email: String,
    pub tokens: TokenSet,
    pub client_id: String,
    pub client_secret: String,
}

/// Plaintext shape of a `gmail-oauth-config` credential blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailClientConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
}

/// OAuth client for Gmail's authorization-code flow.
pub struct GmailOAuth {
    http: reqwest::Client,
}

impl Default for GmailOAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailOAuth {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Format the provider authorization URL for the consent screen.
    ///
    /// Requests offline access with a forced consent prompt so a refresh
    /// token is always returned.
    pub fn auth_url(
        &self,
        client_id: &str,
        redirect_uri: &str,
        state: &str,
    ) -> Result<String, OAuthError> {
        let url = reqwest::Url::parse_with_params(
            AUTH_ENDPOINT,
            &[
                ("client_id", client_id),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", GMAIL_SEND_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| OAuthError::Exchange(format!("invalid authorization URL: {e}")))?;
        Ok(url.to_string())
    }

    /// Exchange an authorization code for a token set.
    pub async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, OAuthError> {
        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("code", code),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;
        if !status.is_success() {
            return Err(OAuthError::Exchange(body));
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| OAuthError::Exchange(e.to_string()))?;
        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: expires_at_from(parsed.expires_in),
        })
    }

    /// Refresh an access token. The old refresh token is reused when the
    /// provider does not rotate it.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenSet, OAuthError> {
        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| OAuthError::Refresh(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Refresh(e.to_string()))?;
        if !status.is_success() {
            return Err(OAuthError::Refresh(body));
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| OAuthError::Refresh(e.to_string()))?;
        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: expires_at_from(parsed.expires_in),
        })
    }

    /// Fetch the authenticated account's address, used to label freshly
    /// connected credentials.
    pub async fn fetch_profile_email(&self, access_token: &str) -> Result<String, OAuthError> {
        let response = self
            .http
            .get(PROFILE_ENDPOINT)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;
        if !status.is_success() {
            return Err(OAuthError::Exchange(body));
        }

        let profile: Profile =
            serde_json::from_str(&body).map_err(|e| OAuthError::Exchange(e.to_string()))?;
        Ok(profile.email_address)
    }
}

fn expires_at_from(expires_in: Option<i64>) -> i64 {
    Utc::now().timestamp_millis() + expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_url_carries_required_parameters() {
        let oauth = GmailOAuth::new();
        let url = oauth
            .auth_url("client-123", "http://localhost:3200/api/oauth/gmail/callback", "st4te")
            .unwrap();

        assert!(url.starts_with(AUTH_ENDPOINT));
        assert!(url.contains("client_id=client-123"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("gmail.send"));
        // redirect_uri must be percent-encoded
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3200%2Fapi%2Foauth%2Fgmail%2Fcallback"));
    }

    #[test]
    fn token_expiry_is_computed_from_now() {
        let set = TokenSet {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: expires_at_from(Some(3600)),
        };
        assert!(!set.is_expired());

        let stale = TokenSet {
            access_token: "at".into(),
            refresh_token: None,
            expires_at: Utc::now().timestamp_millis() - 1,
        };
        assert!(stale.is_expired());
    }
}
