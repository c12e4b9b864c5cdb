use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crate::approval::ApprovalError;
use crate::auth::AuthError;
use crate::vault::VaultError;

/// Error surfaced to an agent or operator, owning the status-code mapping.
///
/// Internal detail never rides in `message`; constructors that wrap internal
/// failures log the cause and emit a generic body.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
    retry_after: Option<u64>,
}

impl HttpError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication required")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: format!("rate limited, retry after {retry_after_secs}s"),
            retry_after: Some(retry_after_secs),
        }
    }

    /// Internal failure: the cause is logged, the agent sees a generic body.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        error!(%cause, "internal gateway error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AuthError> for HttpError {
    fn from(_: AuthError) -> Self {
        HttpError::unauthorized()
    }
}

impl From<VaultError> for HttpError {
    fn from(err: VaultError) -> Self {
        // The agent must not learn whether a credential exists.
        HttpError::internal(err)
    }
}

impl From<ApprovalError> for HttpError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(id) => {
                HttpError::not_found(format!("approval request not found: {id}"))
            }
            ApprovalError::AlreadyResolved(id) => {
                HttpError::conflict(format!("approval request already resolved: {id}"))
            }
            ApprovalError::Cancelled => HttpError::bad_request("request cancelled"),
        }
    }
}
