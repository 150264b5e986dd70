use axum::extract::State;
use axum::Json;

use crate::api::dto::context_dto::{ContextListResponse, ContextView, SwitchContextRequest};
use crate::api::dto::ApiResponse;
use crate::api::util::json::{to_json_app, validated};
use crate::app_state::AppState;
use crate::domain::cluster::service::switch_coordinator::{ReloadOutcome, SwitchOutcome};
use crate::errors::AppError;

pub struct ContextController;

impl ContextController {
    pub async fn list(
        State(state): State<AppState>,
    ) -> Result<Json<ApiResponse<ContextListResponse>>, AppError> {
        let active = state.registry.active();
        let contexts = state
            .registry
            .contexts()
            .iter()
            .map(|c| ContextView::new(c, &active))
            .collect();

        to_json_app(Ok(ContextListResponse {
            current: active.name().to_string(),
            namespace: active.namespace().to_string(),
            generation: active.generation,
            contexts,
        }))
    }

    /// Unknown contexts are a 404; an unreachable one still switches.
    pub async fn switch(
        State(state): State<AppState>,
        Json(request): Json<SwitchContextRequest>,
    ) -> Result<Json<ApiResponse<SwitchOutcome>>, AppError> {
        let request = validated(request)?;
        to_json_app(state.switcher.switch_to(request.context.trim()).await)
    }

    pub async fn reload(
        State(state): State<AppState>,
    ) -> Result<Json<ApiResponse<ReloadOutcome>>, AppError> {
        to_json_app(state.switcher.reload().await)
    }
}
