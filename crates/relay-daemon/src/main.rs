//! Relay Daemon
//!
//! OpenAI-compatible HTTP gateway in front of an AI coding-assistant engine.
//!
//! HTTP API:
//! - POST /v1/chat/completions - OpenAI-compatible chat endpoint (SSE or JSON)
//! - GET /health - Health check

use std::sync::Arc;

use relay_daemon::config::Config;
use relay_daemon::engine::CliEngine;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();

    info!("🚀 Relay Daemon starting...");

    // Optional env file; missing is fine.
    let _ = dotenvy::from_filename(
        dirs::home_dir()
            .unwrap_or_default()
            .join(".relay/relay.env"),
    );

    let config = Config::from_env();
    info!(
        port = config.port,
        work_dir = %config.work_dir.display(),
        engine_cmd = %config.engine_cmd,
        "configuration loaded"
    );

    let engine = Arc::new(CliEngine::new(config.engine_cmd.clone()));
    let addr = format!("127.0.0.1:{}", config.port);
    let app = relay_daemon::build_router(config, engine);

    let listener = TcpListener::bind(&addr).await?;
    info!("🔄 Listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
