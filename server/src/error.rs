use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tts_core::PipelineError;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    pub fn category(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::Pipeline(e) => e.category(),
            ApiError::InternalError(_) => "internal",
            ApiError::NotFound(_) => "not_found",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(e) => match e {
                PipelineError::EmptyInput => StatusCode::BAD_REQUEST,
                PipelineError::Synthesis { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                PipelineError::Encoding { .. } => StatusCode::BAD_GATEWAY,
                PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                // Nobody is left to read this one.
                PipelineError::ClientDisconnected => StatusCode::BAD_REQUEST,
            },
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    category: &'static str,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::InternalError(msg) => tracing::error!("Internal error: {}", msg),
            ApiError::Pipeline(e) if status.is_server_error() => {
                tracing::error!(category = e.category(), "Request failed: {}", e)
            }
            _ => {}
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            category: self.category(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::InvalidInput("x".into()), 400, "invalid_input"),
            (PipelineError::EmptyInput.into(), 400, "empty_input"),
            (PipelineError::synthesis(0, "x").into(), 500, "synthesis"),
            (PipelineError::encoding("x").into(), 502, "encoding"),
            (
                PipelineError::Timeout {
                    stage: "encoder",
                    after: Duration::from_secs(1),
                }
                .into(),
                504,
                "timeout",
            ),
            (ApiError::NotFound("x".into()), 404, "not_found"),
        ];
        for (err, code, category) in cases {
            assert_eq!(err.status().as_u16(), code, "{err}");
            assert_eq!(err.category(), category);
        }
    }

    #[test]
    fn test_pipeline_message_passes_through() {
        let err = ApiError::from(PipelineError::Encoding {
            message: "ffmpeg exited with exit status: 1".into(),
            stderr: "Invalid bitrate".into(),
        });
        assert_eq!(
            err.to_string(),
            "encoder failed: ffmpeg exited with exit status: 1 (stderr: Invalid bitrate)"
        );
    }
}
