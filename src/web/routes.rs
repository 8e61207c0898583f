use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Natural language to SQL
            .route("/nl-query", post(handlers::api::nl_query))
            // Schema management
            .route("/databases", get(handlers::api::list_databases))
            .route("/databases/{name}/schema", get(handlers::api::get_schema))
            .route("/databases/{name}/refresh", post(handlers::api::refresh_schema))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
