//! Tabsync Server - reference sync server for the tabsync engine.
//!
//! Serves collection snapshots over REST, accepts confirmed full-overwrite
//! pushes, and tells WebSocket clients to pull when documents are edited out
//! of band.

pub mod config;
mod confirm;
pub mod error;
mod handlers;
mod routes;
pub mod store;
pub mod websocket;

use crate::config::Config;
use crate::store::DocumentStore;
use crate::websocket::ConnectionManager;
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    /// Fresh state with an empty store and no connections.
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(DocumentStore::new()),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
