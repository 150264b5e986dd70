//! Context routes (e.g., /api/v1/contexts/*)

use axum::{routing::{get, post}, Router};
use crate::api::controller::context::ContextController;
use crate::app_state::AppState;

pub fn context_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(ContextController::list))
        .route("/switch", post(ContextController::switch))
        .route("/reload", post(ContextController::reload))
}
