//! Main entry point for the flowmill server.
//!
//! Loads configuration from the environment and starts the HTTP server:
//! - workflow management and execution at /api/workflows/*
//! - execution inspection and SSE progress at /api/executions/*
//! - credential management at /api/credentials/*
//! - Gmail OAuth flow at /api/oauth/gmail/*
//! - health check at /healthz

use flowmill::{start_server, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start_server(config).await?;
    Ok(())
}
