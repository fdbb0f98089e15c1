//! HTTP API layer.
//!
//! Thin CRUD surface over workflows, executions and credentials, plus the
//! endpoints that drive the engine: execute-workflow, the SSE progress
//! stream, and the Gmail OAuth flow. Handlers map errors the simple way:
//! bad input is 400, a missing row is 404, everything else is 500 with the
//! message logged.

pub mod credentials;
pub mod executions;
pub mod oauth;
pub mod workflows;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;

use crate::config::Config;
use crate::crypto::CredentialCipher;
use crate::oauth::GmailOAuth;
use crate::progress::ProgressBus;
use crate::runtime::WorkflowRunner;
use crate::store::Store;

/// Shared application state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub runner: Arc<WorkflowRunner>,
    pub bus: Arc<ProgressBus>,
    pub cipher: Arc<CredentialCipher>,
    pub oauth: Arc<GmailOAuth>,
    pub config: Arc<Config>,
    /// In-flight OAuth states awaiting their callback, keyed by state token
    pub oauth_states: Arc<Mutex<HashMap<String, oauth::PendingOAuth>>>,
}

/// Log-and-500 for errors the client can't do anything about.
pub(crate) fn internal<E: std::fmt::Display>(error: E) -> StatusCode {
    tracing::error!("request failed: {error}");
    StatusCode::INTERNAL_SERVER_ERROR
}
