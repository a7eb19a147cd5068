//! Error type shared by the prediction path and the HTTP layer.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Request payload failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Model artifact could not be fetched, parsed or validated.
    #[error("model '{model}' unavailable: {message}")]
    ModelUnavailable { model: String, message: String },

    /// Model was loaded but could not score the given features.
    #[error("inference failed for '{model}': {message}")]
    Inference { model: String, message: String },

    /// Prediction store read or write failed. Never surfaced to callers.
    #[error("prediction store error: {0}")]
    Store(String),

    /// Bulk query did not finish within the configured bound.
    #[error("query timed out after {0:?}")]
    QueryTimeout(std::time::Duration),

    /// Bulk query engine returned an error or an unreadable result.
    #[error("query failed: {0}")]
    Query(String),

    /// Batch scoring requested without a query engine.
    #[error("batch scoring is not configured")]
    BatchDisabled,
}

impl Error {
    pub fn model_unavailable(model: &str, message: impl ToString) -> Self {
        Self::ModelUnavailable {
            model: model.to_string(),
            message: message.to_string(),
        }
    }

    pub fn inference(model: &str, message: impl ToString) -> Self {
        Self::Inference {
            model: model.to_string(),
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inference { .. } | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Query(_) => StatusCode::BAD_GATEWAY,
            Self::BatchDisabled => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

// Unreadable bodies are the caller's fault, reported like any other bad input
impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn statuses_follow_failure_kind() {
        assert_eq!(
            Error::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::model_unavailable("churn", "missing").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::inference("churn", "dims").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::QueryTimeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(Error::Query("boom".into()).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn messages_name_the_model() {
        let err = Error::model_unavailable("ltv", "404 Not Found");
        assert_eq!(err.to_string(), "model 'ltv' unavailable: 404 Not Found");
    }
}
