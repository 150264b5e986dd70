//! Interactive session routes: exec, port-forward and the session registry

use axum::{routing::{delete, get}, Router};
use crate::api::controller::session::SessionController;
use crate::app_state::AppState;

pub fn exec_routes() -> Router<AppState> {
    Router::new().route("/{namespace}/{pod}", get(SessionController::exec))
}

pub fn port_forward_routes() -> Router<AppState> {
    Router::new().route(
        "/",
        get(SessionController::list_port_forwards)
            .post(SessionController::start_port_forward)
            .delete(SessionController::stop_port_forward),
    )
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(SessionController::list))
        .route("/{id}", delete(SessionController::stop))
}
