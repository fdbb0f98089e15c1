//! Gmail OAuth endpoints.
//!
//! `POST /api/oauth/gmail/auth-url` picks the OAuth client (a stored
//! `gmail-oauth-config` credential, or the process configuration), mints a
//! random `state` token and remembers the pending flow in memory. The
//! provider redirects back to `GET /api/oauth/gmail/callback`, which
//! exchanges the code, resolves the account address, stores an encrypted
//! `gmail-oauth` credential and bounces the browser to the UI.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Json, Redirect};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{internal, AppState};
use crate::crypto;
use crate::oauth::{GmailClientConfig, GmailCredential};

/// OAuth client parameters held between auth-url and callback.
#[derive(Debug, Clone)]
pub struct PendingOAuth {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthUrlRequest {
    /// Optional id of a `gmail-oauth-config` credential to take the client
    /// id/secret from.
    #[serde(default)]
    credential_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/oauth/gmail/auth-url", post(auth_url))
        .route("/api/oauth/gmail/callback", get(callback))
}

/// POST /api/oauth/gmail/auth-url
///
/// Body: `{"credentialId": N}`, optional; the body is parsed by hand so an
/// empty POST falls back to the process-level OAuth client.
async fn auth_url(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<Value>, StatusCode> {
    let request: AuthUrlRequest = if body.trim().is_empty() {
        AuthUrlRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };
    let pending = resolve_client(&state, request.credential_id).await?;

    let state_token = crypto::generate_token();
    let url = state
        .oauth
        .auth_url(&pending.client_id, &pending.redirect_uri, &state_token)
        .map_err(internal)?;

    state
        .oauth_states
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(state_token.clone(), pending);

    Ok(Json(json!({ "authUrl": url, "state": state_token })))
}

/// GET /api/oauth/gmail/callback?code=...&state=...
async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Redirect, StatusCode> {
    let pending = state
        .oauth_states
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(&query.state)
        .ok_or(StatusCode::BAD_REQUEST)?;

    let tokens = state
        .oauth
        .exchange_code(
            &query.code,
            &pending.client_id,
            &pending.client_secret,
            &pending.redirect_uri,
        )
        .await
        .map_err(internal)?;

    let email = match state.oauth.fetch_profile_email(&tokens.access_token).await {
        Ok(email) => email,
        Err(e) => {
            tracing::warn!("could not resolve Gmail profile address: {e}");
            "unknown".to_string()
        }
    };

    let blob = GmailCredential {
        email: email.clone(),
        tokens,
        client_id: pending.client_id,
        client_secret: pending.client_secret,
    };
    let plaintext = serde_json::to_value(&blob).map_err(internal)?;
    let ciphertext = state.cipher.encrypt(&plaintext).map_err(internal)?;

    let credential = state
        .store
        .create_credential(&format!("Gmail ({email})"), "gmail-oauth", &ciphertext)
        .await
        .map_err(internal)?;
    tracing::info!("stored gmail-oauth credential {} for {email}", credential.id);

    Ok(Redirect::to("/credentials?connected=gmail"))
}

/// Resolve the OAuth client from a stored config credential or from process
/// configuration.
async fn resolve_client(
    state: &AppState,
    credential_id: Option<i64>,
) -> Result<PendingOAuth, StatusCode> {
    let default_redirect = || {
        state.config.oauth.redirect_uri.clone().unwrap_or_else(|| {
            format!(
                "http://localhost:{}/api/oauth/gmail/callback",
                state.config.server.port
            )
        })
    };

    if let Some(id) = credential_id {
        let credential = state
            .store
            .get_credential(id)
            .await
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)?;
        if credential.kind != "gmail-oauth-config" {
            return Err(StatusCode::BAD_REQUEST);
        }

        let blob: GmailClientConfig =
            serde_json::from_value(state.cipher.decrypt(&credential.data).map_err(internal)?)
                .map_err(internal)?;
        return Ok(PendingOAuth {
            client_id: blob.client_id,
            client_secret: blob.client_secret,
            redirect_uri: blob.redirect_uri.unwrap_or_else(default_redirect),
        });
    }

    match (
        state.config.oauth.client_id.clone(),
        state.config.oauth.client_secret.clone(),
    ) {
        (Some(client_id), Some(client_secret)) => Ok(PendingOAuth {
            client_id,
            client_secret,
            redirect_uri: default_redirect(),
        }),
        _ => {
            tracing::error!("OAuth client is not configured and no config credential was given");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
