//! Engine-level error types.
//!
//! Handlers return [`HandlerError`] to the scheduler, which folds any failure
//! into a single failed execution plus a skip cascade. [`ValidationError`] is
//! produced by the static checks that run before the first node executes.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::oauth::OAuthError;

/// Failure of a single node handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transport-level failure talking to an external system.
    #[error("request failed: {0}")]
    Io(String),

    /// The code sandbox exceeded its wall-clock budget (or its script can
    /// never settle).
    #[error("code execution timed out after {0}s")]
    CodeTimeout(u64),

    /// The user script threw or failed to parse.
    #[error("code execution failed: {0}")]
    CodeRuntime(String),

    /// A required process-level configuration value is absent.
    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    /// A required node data field is absent at runtime.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// An upstream service answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Credential ciphertext could not be decrypted.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// OAuth token exchange or refresh failed.
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// The database node's query or connection failed.
    #[error("database error: {0}")]
    Database(String),

    /// Mail could not be built or delivered.
    #[error("email delivery failed: {0}")]
    Email(String),

    /// A referenced credential is missing or of the wrong shape.
    #[error("credential error: {0}")]
    Credential(String),
}

/// A static check failed before execution; no handler was invoked.
#[derive(Debug, Clone, Error)]
#[error("Validation error: [{node_id}] {message}")]
pub struct ValidationError {
    pub node_id: String,
    pub message: String,
}

impl ValidationError {
    pub fn missing_field(node_id: &str, field: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            message: format!("Missing required field: {field}"),
        }
    }
}
