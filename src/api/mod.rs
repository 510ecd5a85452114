mod debug;
pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use std::sync::Arc;

use crate::config::Config;
use crate::debug::DebugHub;
use crate::process::ProcessLauncher;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub debug: Arc<DebugHub>,
    pub shutdown: ShutdownCoordinator,
}

impl AppState {
    pub fn new(config: Arc<Config>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let debug = Arc::new(DebugHub::new(config.debug.backlog));
        Self {
            registry: SessionRegistry::new(config, launcher),
            debug,
            shutdown: ShutdownCoordinator::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors_origins = state.registry.config().server.cors_origins.clone();

    let router = Router::new()
        .route("/health", get(health))
        .route("/sessions", get(session_list))
        .route("/sessions/{id}", axum::routing::delete(session_close))
        .route("/sessions/{id}/ws", get(session_ws))
        .route("/debug/{id}/browser", get(debug::browser_ws))
        .route("/debug/{id}/agent", get(debug::agent_ws))
        .route("/debug/{id}/events", get(debug::events))
        .route("/debug/{id}/query", post(debug::query))
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http());

    if cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
    }
}
