use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::providers::ProviderKind;

/// The main error type for pressbill services.
///
/// Every variant maps to a stable machine-readable code plus an HTTP status.
/// Server-side failures collapse to a generic message in responses so
/// internal details never leak to clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("User already has an active subscription")]
    AlreadySubscribed,

    #[error("Click already converted")]
    AlreadyConverted,

    #[error("Subscription is not active")]
    NotActive,

    #[error("Payment method is required for this provider")]
    MissingPaymentMethod,

    #[error("Invalid subscription plan: {0}")]
    InvalidPlan(String),

    /// An external payment-provider call failed. Carries the provider-native
    /// error code when the provider returned one.
    #[error("Payment provider error ({provider}): {message}")]
    Provider {
        provider: ProviderKind,
        code: Option<String>,
        message: String,
    },

    /// Optimistic-locking conflict; safe for the caller to retry (for
    /// webhooks: the delivery mechanism redelivers).
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for pressbill services.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Wire format for API error responses.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadySubscribed => "ALREADY_SUBSCRIBED",
            Self::AlreadyConverted => "ALREADY_CONVERTED",
            Self::NotActive => "NOT_ACTIVE",
            Self::MissingPaymentMethod => "MISSING_PAYMENT_METHOD",
            Self::InvalidPlan(_) => "INVALID_PLAN",
            Self::Provider { .. } => "PAYMENT_FAILED",
            Self::Conflict(_) => "CONFLICT",
            Self::Timeout => "TIMEOUT",
            Self::Internal(_) | Self::Anyhow(_) => "SERVER_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::AlreadySubscribed
            | Self::AlreadyConverted
            | Self::NotActive
            | Self::MissingPaymentMethod
            | Self::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message suitable for client responses.
    ///
    /// Client errors (4xx) expose their message; server errors collapse to a
    /// generic one while the full error is logged server-side (CWE-209).
    fn safe_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Anyhow(_) => "An unexpected error occurred".to_string(),
            Self::Provider { provider, code, .. } => match code {
                Some(code) => format!("Payment provider error ({provider}): {code}"),
                None => format!("Payment provider error ({provider})"),
            },
            other => other.to_string(),
        }
    }

    /// Whether a webhook delivery mechanism should retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Timeout | Self::Internal(_) | Self::Anyhow(_)
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Full error details go to server logs, never to the client.
        if status.is_server_error() {
            tracing::error!(target: "pressbill", status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::warn!(target: "pressbill", status = status.as_u16(), code = self.code(), error = %self, "request rejected");
        }

        let body = Json(ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code(),
                message: self.safe_message(),
            },
        });

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            ApiError::Validation(format!("JSON error: {err}"))
        } else {
            ApiError::Internal(format!("JSON serialization error: {err}"))
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Internal(format!("HTTP transport error: {err}"))
        }
    }
}
