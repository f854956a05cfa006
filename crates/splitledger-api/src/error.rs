//! API error handling
//!
//! Every error maps to an HTTP status and a `{ code, msg }` body. Internal
//! failures are logged in full and answered with a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use splitledger_allocation::AllocationError;
use splitledger_crypto::SignatureError;
use splitledger_db::DbError;
use splitledger_ledger::LedgerError;
use splitledger_types::SplitLedgerError;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    // =========================================================================
    // Webhook authentication
    // =========================================================================
    /// Misconfiguration: no signing secret, so nothing can be verified
    #[error("Webhook signing secret is not configured")]
    WebhookSecretMissing,

    #[error("Missing webhook signature")]
    MissingSignature,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    // =========================================================================
    // Request errors
    // =========================================================================
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Server errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn error_code(&self) -> i32 {
        match self {
            Self::WebhookSecretMissing => -1001,
            Self::MissingSignature => -1021,
            Self::InvalidSignature => -1022,
            Self::InvalidPayload(_) => -1100,
            Self::InvalidParameter(_) => -1102,
            Self::NotFound(_) => -4000,
            Self::Internal(_) => -5000,
            Self::ServiceUnavailable(_) => -5001,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature => StatusCode::FORBIDDEN,
            Self::InvalidPayload(_) | Self::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::WebhookSecretMissing | Self::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Message safe to send to the caller
    fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub msg: String,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        Self {
            code: err.error_code(),
            msg: err.public_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!(error = %detail, "Request failed with internal error");
        }
        (self.status_code(), Json(ErrorResponse::from(&self))).into_response()
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::MissingSecret => Self::WebhookSecretMissing,
            SignatureError::MissingSignature => Self::MissingSignature,
            SignatureError::InvalidSignature => Self::InvalidSignature,
        }
    }
}

impl From<SplitLedgerError> for ApiError {
    fn from(err: SplitLedgerError) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}
