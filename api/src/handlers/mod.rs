pub mod evaluation;
pub mod health;
pub mod metrics;
pub mod scan;

// Common response types
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::errors::{ApiError, DatabaseError, PoolError, ValidationError};
use serde::Serialize;

/// Standard API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub trace_id: String,
    #[serde(skip)]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Map a database failure, logging ordering bugs loudly.
    ///
    /// Connectivity problems become `503` with `Retry-After`; an
    /// uninitialized or closed pool is a server bug and becomes `500`.
    pub fn from_database_error(err: DatabaseError, retry_after_seconds: u64) -> Self {
        match &err {
            _ if err.is_unavailable() => {
                tracing::warn!(error = %err, "Database unavailable");
            }
            DatabaseError::Pool(PoolError::NotInitialized | PoolError::Closed) => {
                tracing::error!(error = %err, "Connection pool used outside its lifecycle");
            }
            _ => tracing::error!(error = %err, "Database operation failed"),
        }

        let response = Self::from(ApiError::from(err));
        if response.error == "service_unavailable" {
            response.with_retry_after(retry_after_seconds)
        } else {
            response
        }
    }

    fn status(&self) -> StatusCode {
        match self.error.as_str() {
            "validation_error" => StatusCode::BAD_REQUEST,
            "service_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ApiError> for ErrorResponse {
    fn from(err: ApiError) -> Self {
        let error = match err.code.as_str() {
            "SERVICE_UNAVAILABLE" => "service_unavailable",
            "VALIDATION_ERROR" => "validation_error",
            _ => "internal_error",
        };
        ErrorResponse::new(error, err.message)
    }
}

impl From<ValidationError> for ErrorResponse {
    fn from(err: ValidationError) -> Self {
        ApiError::from(err).into()
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after;
        let mut response = (status, Json(self)).into_response();

        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

/// Standard API success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for SuccessResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_is_service_unavailable_with_retry_after() {
        let err = DatabaseError::Pool(PoolError::Connect("refused".to_string()));
        let response = ErrorResponse::from_database_error(err, 7).into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn test_uninitialized_pool_is_internal_error() {
        let err = DatabaseError::Pool(PoolError::NotInitialized);
        let response = ErrorResponse::from_database_error(err, 7).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_missing_row_is_internal_error() {
        let err = DatabaseError::NotFound("Record not found".to_string());
        let response = ErrorResponse::from_database_error(err, 7);

        assert_eq!(response.error, "internal_error");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_validation_error_is_bad_request() {
        let err = ValidationError::MissingField("url".to_string());
        let response = ErrorResponse::from(err);

        assert_eq!(response.error, "validation_error");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
