//! Configuration management for the flowmill engine.
//!
//! All settings come from the environment with sensible development
//! defaults, so a container deployment configures the engine entirely via
//! env vars. The one production-only rule lives in the crypto module: a
//! missing encryption key is fatal when `FLOWMILL_ENV=production`.

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub llm: LlmConfig,
    pub smtp: SmtpConfig,
    pub oauth: OAuthClientConfig,
    pub engine: EngineConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g. "0.0.0.0")
    pub host: String,
    pub port: u16,
}

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the database file; created on first start
    pub path: String,
}

/// Credential encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Raw 64-hex key or arbitrary passphrase (stretched with scrypt)
    pub encryption_key: Option<String>,
    /// True when FLOWMILL_ENV=production
    pub production: bool,
}

/// Chat-completions provider for the ai-chat node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Model used when the node doesn't pick one
    pub model: String,
}

/// SMTP defaults for the email node's fallback provider. Node data wins over
/// these where both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: Option<String>,
}

/// Process-level OAuth client, used when no `gmail-oauth-config` credential
/// is referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
}

/// Scheduler and sandbox knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reject workflows whose edges reference unknown node ids
    pub strict_graph: bool,
    /// Wall-clock budget for one code node script
    pub code_timeout_secs: u64,
    /// Env var names exposed to the sandbox as `$env`
    pub sandbox_env: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("FLOWMILL_HOST", "0.0.0.0"),
                port: env_parsed("FLOWMILL_PORT", 3200),
            },
            database: DatabaseConfig {
                path: env_or("FLOWMILL_DB", "flowmill.db"),
            },
            security: SecurityConfig {
                encryption_key: std::env::var("ENCRYPTION_KEY").ok(),
                production: std::env::var("FLOWMILL_ENV").as_deref() == Ok("production"),
            },
            llm: LlmConfig {
                api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
                base_url: env_or("LLM_BASE_URL", "https://api.anthropic.com"),
                model: env_or("LLM_MODEL", "claude-3-5-sonnet-latest"),
            },
            smtp: SmtpConfig {
                host: std::env::var("SMTP_HOST").ok(),
                port: env_parsed("SMTP_PORT", 587),
                user: std::env::var("SMTP_USER").ok(),
                pass: std::env::var("SMTP_PASS").ok(),
                from: std::env::var("SMTP_FROM").ok(),
            },
            oauth: OAuthClientConfig {
                client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
                client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
                redirect_uri: std::env::var("GOOGLE_REDIRECT_URI").ok(),
            },
            engine: EngineConfig {
                strict_graph: std::env::var("FLOWMILL_STRICT_GRAPH").as_deref() == Ok("1"),
                code_timeout_secs: env_parsed("FLOWMILL_CODE_TIMEOUT_SECS", 30),
                sandbox_env: std::env::var("FLOWMILL_SANDBOX_ENV")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
        }
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}
