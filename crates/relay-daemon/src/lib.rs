//! Relay Daemon Library
//!
//! OpenAI-compatible HTTP gateway in front of an AI coding-assistant engine:
//! - Prompt translation (role-tagged messages -> single engine prompt)
//! - Engine session runner (live forwarding + turn buffer, wall-clock bound)
//! - File discovery (tool-call parsing with directory-scan fallback)
//! - SSE / JSON response formatting with trailing discovery metadata
//! - Tool-aware performance monitoring at the transport boundary
//!
//! Each request is fully isolated: its own message buffer, its own working
//! directory resolution, no shared session state.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod handlers;
pub mod monitor;
pub mod session;
pub mod sse;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::discovery::DiscoveryEngine;
use crate::engine::Engine;
use crate::monitor::PerfMonitorLayer;
use crate::session::SessionRunner;

/// Shared per-process state; everything inside is read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub runner: Arc<SessionRunner>,
    pub discovery: Arc<DiscoveryEngine>,
}

/// Build the HTTP router around an engine implementation.
pub fn build_router(config: Config, engine: Arc<dyn Engine>) -> Router {
    let config = Arc::new(config);
    let state = AppState {
        runner: Arc::new(SessionRunner::new(engine)),
        discovery: Arc::new(DiscoveryEngine::new(config.max_inline_file_bytes)),
        config: config.clone(),
    };

    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/health", get(handlers::health))
        .layer(PerfMonitorLayer::new(config.monitor.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
