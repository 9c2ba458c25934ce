// ABOUTME: API error type mapping pool failures to HTTP status codes
// ABOUTME: Renders a structured error body with a machine-readable code and request id

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sandpool_sandbox::PoolError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Seconds a rejected caller should wait before retrying a saturated pool
pub const RETRY_AFTER_SECS: u64 = 5;

/// Error type returned by every handler
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Structured error response format for API consistency
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

/// Error detail structure with machine-readable codes
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Convert AppError to its HTTP status code and error code
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Pool(pool_error) => match pool_error {
                PoolError::PoolExhausted => (StatusCode::SERVICE_UNAVAILABLE, "POOL_EXHAUSTED"),
                PoolError::ResourceExhausted(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RESOURCE_EXHAUSTED")
                }
                PoolError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
                PoolError::ProvisionTimeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "PROVISION_TIMEOUT")
                }
                PoolError::LeaseMismatch(_) => (StatusCode::CONFLICT, "LEASE_MISMATCH"),
                PoolError::NotFound(_) => (StatusCode::NOT_FOUND, "SLOT_NOT_FOUND"),
                PoolError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
                PoolError::InvalidScale { .. } => (StatusCode::BAD_REQUEST, "INVALID_SCALE"),
                PoolError::Settings(_) => (StatusCode::BAD_REQUEST, "INVALID_SETTINGS"),
                PoolError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BACKEND_ERROR"),
                PoolError::RegistryPoisoned => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }

    /// User-facing message. Backend details stay in the logs.
    fn to_user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("Validation failed: {}", msg),
            AppError::Pool(PoolError::Backend(_)) => {
                "The sandbox backend reported an error".to_string()
            }
            AppError::Pool(PoolError::RegistryPoisoned) => {
                "An internal server error occurred".to_string()
            }
            AppError::Pool(other) => other.to_string(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::Pool(PoolError::PoolExhausted | PoolError::ResourceExhausted(_)) => {
                Some(RETRY_AFTER_SECS)
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.to_status_and_code();

        match &self {
            AppError::Pool(err @ (PoolError::Backend(_) | PoolError::RegistryPoisoned)) => {
                error!(
                    request_id = %request_id,
                    error = %err,
                    "Internal server error occurred"
                );
            }
            AppError::Pool(err @ (PoolError::PoolExhausted | PoolError::ResourceExhausted(_))) => {
                warn!(
                    request_id = %request_id,
                    error = %err,
                    "Pool saturated"
                );
            }
            _ => {
                // Expected protocol errors
                info!(
                    request_id = %request_id,
                    error_code = %error_code,
                    error = %self,
                    "API error response"
                );
            }
        }

        let retry_after = self.retry_after();
        let error_response = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code.to_string(),
                message: self.to_user_message(),
                retry_after,
            },
            request_id,
        };

        let mut response = Json(error_response).into_response();
        *response.status_mut() = status_code;
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }

        response
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;
