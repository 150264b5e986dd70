//! Resource summary and push-stream routes

use axum::{routing::get, Router};
use crate::api::controller::resource::ResourceController;
use crate::api::controller::stream::StreamController;
use crate::app_state::AppState;

pub fn resource_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(ResourceController::kinds))
        .route("/{kind}", get(ResourceController::summary))
}

pub fn stream_routes() -> Router<AppState> {
    Router::new().route("/{kind}", get(StreamController::subscribe))
}
