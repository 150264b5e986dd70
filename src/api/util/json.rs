use anyhow::Result;
use axum::Json;
use validator::Validate;

use crate::api::dto::ApiResponse;
use crate::errors::{from_anyhow, AppError};

/// Wrap a service result in the response envelope, keeping the error's status.
pub fn to_json<T: serde::Serialize>(
    result: Result<T>
) -> Result<Json<ApiResponse<T>>, AppError> {
    match result {
        Ok(value) => Ok(Json(ApiResponse::ok(value))),
        Err(err) => Err(from_anyhow(err)),
    }
}

/// Same as [`to_json`] for core calls that already return `AppError`.
pub fn to_json_app<T: serde::Serialize>(
    result: Result<T, AppError>,
) -> Result<Json<ApiResponse<T>>, AppError> {
    result.map(|value| Json(ApiResponse::ok(value)))
}

pub fn validated<T: Validate>(payload: T) -> Result<T, AppError> {
    payload
        .validate()
        .map_err(|e| AppError::BodyParsingError(e.to_string()))?;
    Ok(payload)
}
