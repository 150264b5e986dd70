use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    InternalServerError(String),

    #[error("Body parsing error: {0}")]
    BodyParsingError(String),

    #[error("K8s API error: {0}")]
    K8sApiError(String),

    /// Cluster could not be reached, or a stream failed to establish in time.
    #[error("Connect error: {0}")]
    ConnectError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Helper for mapping any unknown error into internal error
pub fn internal_error<E: ToString>(err: E) -> AppError {
    AppError::InternalServerError(err.to_string())
}

/// Recover a typed `AppError` from an `anyhow` chain, falling back to 500.
pub fn from_anyhow(err: anyhow::Error) -> AppError {
    match err.downcast::<AppError>() {
        Ok(app) => app,
        Err(other) => internal_error(format!("{other:#}")),
    }
}

impl From<kube::Error> for AppError {
    fn from(err: kube::Error) -> Self {
        // Anything that is not an API status never reached the apiserver.
        match &err {
            kube::Error::Api(_) => AppError::K8sApiError(err.to_string()),
            _ => AppError::ConnectError(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        // Choose status codes per variant
        let status = match self {
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BodyParsingError(_) => StatusCode::BAD_REQUEST,
            AppError::K8sApiError(_) => StatusCode::BAD_GATEWAY,
            AppError::ConnectError(_) => StatusCode::BAD_GATEWAY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        let body = Json(json!({
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_anyhow_keeps_variant() {
        let err = anyhow::Error::new(AppError::Conflict("port 80 already forwarded".into()));
        assert_eq!(
            from_anyhow(err),
            AppError::Conflict("port 80 already forwarded".into())
        );
    }

    #[test]
    fn test_from_anyhow_falls_back_to_internal() {
        let err = anyhow::anyhow!("boom");
        assert!(matches!(from_anyhow(err), AppError::InternalServerError(_)));
    }

    #[test]
    fn test_status_codes() {
        let resp = AppError::NotFound("ctx".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = AppError::Conflict("dup".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = AppError::ConnectError("down".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
