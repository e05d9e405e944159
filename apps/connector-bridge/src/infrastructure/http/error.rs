//! REST error responses.

use std::time::Duration;

use axum::Json;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::application::ports::{AuthError, StoreError};
use crate::application::services::SubmitError;
use crate::error::{BridgeError, ErrorCode};

/// API error response wrapper.
#[derive(Debug)]
pub struct ApiError {
    error: BridgeError,
    status: Option<StatusCode>,
}

impl ApiError {
    /// Create from a bridge error.
    #[must_use]
    pub const fn from_error(error: BridgeError) -> Self {
        Self {
            error,
            status: None,
        }
    }

    /// Create a bad request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::from_error(BridgeError::invalid_request(message))
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::from_error(BridgeError::internal(message))
    }

    /// Authenticated, but not allowed to touch the resource.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            error: BridgeError::unauthorized(message),
            status: Some(StatusCode::FORBIDDEN),
        }
    }

    /// Resource does not exist.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            error: BridgeError::invalid_request(message),
            status: Some(StatusCode::NOT_FOUND),
        }
    }

    /// Caller exhausted its window.
    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::from_error(
            BridgeError::new(
                ErrorCode::RateLimited,
                format!("rate limited, retry after {}ms", retry_after.as_millis()),
            )
            .with_retry_after(retry_after),
        )
    }

    /// HTTP status of the response.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.error.code().http_status())
    }

    /// Wrapped error.
    #[must_use]
    pub const fn error(&self) -> &BridgeError {
        &self.error
    }
}

impl From<BridgeError> for ApiError {
    fn from(error: BridgeError) -> Self {
        Self::from_error(error)
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        Self::from_error(error.into())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::internal(error.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        Self::from_error(BridgeError::unauthorized(error.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self.error.to_body())).into_response();

        if let Some(wait) = self.error.retry_after() {
            // Whole seconds, rounded up so a client never retries early.
            let secs = wait.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = ApiError::rate_limited(Duration::from_millis(1_200)).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn submit_errors_keep_their_status() {
        let offline: ApiError = SubmitError::ConnectorOffline("no connector".into()).into();
        assert_eq!(offline.status(), StatusCode::SERVICE_UNAVAILABLE);

        let timeout: ApiError = SubmitError::Timeout(Duration::from_secs(15)).into();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.error().code(), ErrorCode::ExecutionTimeout);
    }

    #[test]
    fn overrides_win_over_code_mapping() {
        assert_eq!(ApiError::forbidden("nope").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("gone").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(AuthError::Invalid).status(), StatusCode::UNAUTHORIZED);
    }
}
