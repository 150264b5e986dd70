use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json,
    Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::api::routes::{context_routes, resource_routes, session_routes, system_routes};
use crate::app_state::AppState;

/// Build the main application router
pub fn app_router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .nest("/contexts", context_routes::context_routes())
        .nest("/resources", resource_routes::resource_routes())
        .nest("/stream", resource_routes::stream_routes())
        .nest("/exec", session_routes::exec_routes())
        .nest("/portforward", session_routes::port_forward_routes())
        .nest("/sessions", session_routes::session_routes())
        .nest("/system", system_routes::system_routes());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1)
        .fallback(handler_404)
        // Attach shared application state ONCE here
        .with_state(state)
        .layer(CorsLayer::very_permissive())
}

async fn root() -> &'static str {
    "kubedeck-core is running"
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handler_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": "The requested resource was not found" })),
    )
}
