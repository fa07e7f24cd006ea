use crate::engine::EngineError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facegate_core::{PipelineError, ReferenceError};
use serde_json::json;
use thiserror::Error;

/// Errors returned to HTTP clients.
///
/// Every biometric rejection maps to [`ApiError::InvalidCredentials`] so a
/// caller cannot tell which check failed.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Failed to find a face")]
    NoFace,
    #[error("User account doesn't exist")]
    UnknownAccount,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Email already exists")]
    EmailExists,
    #[error("Too many failed attempts, try again in {0}s")]
    RateLimited(u64),
    #[error("Could not retrieve reference image")]
    ReferenceUnavailable(String),
    #[error("Server busy, try again")]
    Busy,
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoFace => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UnknownAccount | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::EmailExists => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::ReferenceUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(detail) => tracing::error!(error = %detail, "request failed"),
            Self::ReferenceUnavailable(detail) => {
                tracing::error!(error = %detail, "reference fetch failed")
            }
            _ => {}
        }
        let body = json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EmailExists => Self::EmailExists,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ReferenceError> for ApiError {
    fn from(err: ReferenceError) -> Self {
        match err {
            ReferenceError::Fetch(detail) => Self::ReferenceUnavailable(detail),
            ReferenceError::NoFace => {
                Self::ReferenceUnavailable("no face found in reference image".into())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoFaceDetected => Self::NoFace,
            EngineError::TimedOut => Self::Busy,
            EngineError::Pipeline(PipelineError::BurstSize(_)) => {
                Self::BadRequest("Request fields invalid".into())
            }
            EngineError::Pipeline(PipelineError::Reference(reference))
            | EngineError::Reference(reference) => reference.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_share_one_body() {
        assert_eq!(ApiError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InvalidCredentials.to_string(), "Invalid credentials");
    }

    #[test]
    fn test_engine_error_mapping() {
        let status = |err: EngineError| ApiError::from(err).status();
        let reference = |err: ReferenceError| EngineError::Pipeline(PipelineError::Reference(err));

        let fetch = reference(ReferenceError::Fetch("refused".into()));
        assert_eq!(status(fetch), StatusCode::BAD_GATEWAY);
        assert_eq!(status(EngineError::NoFaceDetected), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(EngineError::TimedOut), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(EngineError::ChannelClosed), StatusCode::INTERNAL_SERVER_ERROR);

        let mismatch = reference(ReferenceError::DimensionMismatch {
            reference: 128,
            live: 512,
        });
        assert_eq!(status(mismatch), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_duplicate_email_maps_to_conflict() {
        assert_eq!(ApiError::from(StoreError::EmailExists).status(), StatusCode::CONFLICT);
    }
}
