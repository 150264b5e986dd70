use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;

use crate::api::dto::stream_dto::NamespaceQuery;
use crate::api::dto::ApiResponse;
use crate::api::util::json::to_json_app;
use crate::app_state::AppState;
use crate::core::state::runtime::k8s::resource_snapshot::SummaryRecord;
use crate::errors::AppError;

pub struct ResourceController;

impl ResourceController {
    /// Canonical names of the kinds that can be summarized or streamed.
    pub async fn kinds(
        State(state): State<AppState>,
    ) -> Result<Json<ApiResponse<Vec<&'static str>>>, AppError> {
        to_json_app(Ok(state.kinds.names()))
    }

    /// One-shot summary of a kind, without opening a stream.
    pub async fn summary(
        State(state): State<AppState>,
        Path(kind): Path<String>,
        Query(query): Query<NamespaceQuery>,
    ) -> Result<Json<ApiResponse<Arc<SummaryRecord>>>, AppError> {
        to_json_app(
            state
                .resource_service
                .summary(&kind, query.namespace.as_deref())
                .await,
        )
    }
}
