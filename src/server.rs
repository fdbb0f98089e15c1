//! Server setup and initialization.
//!
//! Wires together all components: store, credential cipher, progress bus,
//! node executor, workflow runner, and the HTTP routes. Provides the main
//! application factory function for creating the Axum app.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::crypto::CredentialCipher;
use crate::oauth::GmailOAuth;
use crate::progress::ProgressBus;
use crate::runtime::{NodeExecutor, WorkflowRunner};
use crate::store::Store;

/// Create the Axum application with all routes and shared state.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("opening store at {}", config.database.path);
    let store = Store::connect(&config.database.path).await?;

    let cipher = Arc::new(CredentialCipher::from_key_material(
        config.security.encryption_key.as_deref(),
        config.security.production,
    )?);
    let oauth = Arc::new(GmailOAuth::new());
    let bus = Arc::new(ProgressBus::new());

    tracing::info!("initializing node executor and workflow runner");
    let executor = Arc::new(NodeExecutor::new(
        &config,
        store.clone(),
        Arc::clone(&cipher),
        Arc::clone(&oauth),
    ));
    let runner = Arc::new(WorkflowRunner::new(
        store.clone(),
        executor,
        Arc::clone(&bus),
        config.engine.strict_graph,
    ));

    let state = AppState {
        store,
        runner,
        bus,
        cipher,
        oauth,
        config: Arc::new(config),
        oauth_states: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(api::workflows::routes())
        .merge(api::executions::routes())
        .merge(api::credentials::routes())
        .merge(api::oauth::routes())
        .with_state(state);

    tracing::info!("application initialized");
    Ok(app)
}

/// Start the HTTP server with the given configuration.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("flowmill=info")),
        )
        .with_target(false)
        .init();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app = create_app(config).await?;

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("server listening on http://{bind_addr}");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
