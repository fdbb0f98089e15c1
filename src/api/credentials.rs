//! Credential management endpoints.
//!
//! Creation encrypts the submitted blob before it touches the store; every
//! read path returns metadata only. There is intentionally no endpoint that
//! returns decrypted credential data.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{internal, AppState};
use crate::workflow::Credential;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCredentialRequest {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

/// What the API exposes about a credential; never the blob.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialSummary {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    created_at: DateTime<Utc>,
}

impl From<Credential> for CredentialSummary {
    fn from(credential: Credential) -> Self {
        Self {
            id: credential.id,
            name: credential.name,
            kind: credential.kind,
            created_at: credential.created_at,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/credentials", post(create_credential).get(list_credentials))
        .route("/api/credentials/{id}", get(get_credential).delete(delete_credential))
}

/// POST /api/credentials
async fn create_credential(
    State(state): State<AppState>,
    Json(request): Json<CreateCredentialRequest>,
) -> Result<Json<CredentialSummary>, StatusCode> {
    if request.name.is_empty() || request.kind.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let ciphertext = state.cipher.encrypt(&request.data).map_err(internal)?;
    let credential = state
        .store
        .create_credential(&request.name, &request.kind, &ciphertext)
        .await
        .map_err(internal)?;

    tracing::info!("stored credential {} ({})", credential.id, credential.kind);
    Ok(Json(credential.into()))
}

/// GET /api/credentials
async fn list_credentials(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let credentials: Vec<CredentialSummary> = state
        .store
        .get_credentials()
        .await
        .map_err(internal)?
        .into_iter()
        .map(CredentialSummary::from)
        .collect();
    Ok(Json(json!({ "credentials": credentials })))
}

/// GET /api/credentials/{id}
async fn get_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CredentialSummary>, StatusCode> {
    state
        .store
        .get_credential(id)
        .await
        .map_err(internal)?
        .map(|credential| Json(credential.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /api/credentials/{id}
async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.store.delete_credential(id).await.map_err(internal)? {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
