//! Centralized error handling for the escrow engine
//!
//! Every engine operation returns [`ApiResult`]. Hosts map an [`ApiError`] to
//! a transport response through [`ApiError::status_code`] and
//! [`ApiError::to_response`].

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::payment::GatewayError;
use crate::wallet::WalletError;

/// API error type with HTTP status code mapping
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Error details in the response
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
            ApiError::DatabaseError(_) => "DATABASE_ERROR",
            ApiError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            ApiError::ValidationError(_) => "VALIDATION_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the caller may retry the whole operation unchanged.
    ///
    /// Business-rule and access errors are final; infrastructure failures and
    /// lost optimistic-concurrency races are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::InternalError(_)
                | ApiError::DatabaseError(_)
                | ApiError::ExternalServiceError(_)
                | ApiError::Conflict(_)
        )
    }

    /// Build the JSON body a host returns for this error
    pub fn to_response(&self) -> ErrorResponse {
        let message = self.to_string();

        match self {
            ApiError::InternalError(_)
            | ApiError::DatabaseError(_)
            | ApiError::ExternalServiceError(_) => {
                tracing::error!(error = %message, code = %self.error_code(), "Server error occurred");
            }
            _ => {
                tracing::debug!(error = %message, code = %self.error_code(), "Client error occurred");
            }
        }

        ErrorResponse {
            error: ErrorDetails {
                code: self.error_code().to_string(),
                message,
                details: None,
            },
        }
    }
}

// Convenience conversions from common error types

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            _ => ApiError::DatabaseError(err.to_string()),
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => ApiError::NotFound(what),
            RepositoryError::Conflict(what) => ApiError::Conflict(what),
            RepositoryError::Database(msg) => ApiError::DatabaseError(msg),
        }
    }
}

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientBalance { .. } => {
                ApiError::BadRequest("Insufficient wallet balance".to_string())
            }
            WalletError::InvalidAmount(amount) => {
                ApiError::BadRequest(format!("Invalid wallet amount: {}", amount))
            }
            WalletError::Unavailable(msg) => ApiError::ExternalServiceError(msg),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::ExternalServiceError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(err.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::ExternalServiceError(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("Invalid JSON: {}", err))
    }
}

/// Result type alias using ApiError
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            ApiError::BadRequest("test".to_string()).error_code(),
            "BAD_REQUEST"
        );
        assert_eq!(
            ApiError::Conflict("test".to_string()).error_code(),
            "CONFLICT"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Forbidden("test".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::ExternalServiceError("test".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::DatabaseError("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!ApiError::BadRequest("sold out".to_string()).is_retryable());
        assert!(!ApiError::Forbidden("not yours".to_string()).is_retryable());
        assert!(!ApiError::NotFound("missing".to_string()).is_retryable());
        assert!(ApiError::Conflict("stale".to_string()).is_retryable());
        assert!(ApiError::ExternalServiceError("gateway".to_string()).is_retryable());
    }

    #[test]
    fn test_repository_error_conversion() {
        let err: ApiError = RepositoryError::NotFound("Transaction x not found".to_string()).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = RepositoryError::Conflict("version".to_string()).into();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn test_insufficient_balance_is_bad_request() {
        let err: ApiError = WalletError::InsufficientBalance {
            required: 100,
            available: 10,
        }
        .into();
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }

    #[test]
    fn test_response_body() {
        let body = ApiError::NotFound("Transaction not found".to_string()).to_response();
        assert_eq!(body.error.code, "NOT_FOUND");
        assert!(body.error.message.contains("Transaction not found"));
    }
}
