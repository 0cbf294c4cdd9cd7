//! # Error Handling
//!
//! Domain errors implement [`ServiceError`], which carries the HTTP status,
//! a namespaced error name and the message shown to clients. [`ApiError`] is
//! the wire representation rendered by the HTTP surface.

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Serialize, Serializer};
use utoipa::ToSchema;

/// Prefix of error names produced by the ingestion endpoint.
pub const STREAM_IN_PREFIX: &str = "stream.in.";

/// Prefix of error names produced by the definition API.
pub const STREAM_API_PREFIX: &str = "stream.api.";

/// Errors that know how they are presented to a client.
pub trait ServiceError: std::error::Error {
    /// HTTP status code of the error.
    fn status_code(&self) -> StatusCode;

    /// Fully qualified error name, e.g. `stream.in.noSourceFound`.
    fn error_name(&self) -> String;

    /// Message safe to show to the client.
    fn public_message(&self) -> String {
        as_sentence(&self.to_string())
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(serialize_with = "serialize_status")]
    #[schema(value_type = u16, example = 404)]
    pub status_code: StatusCode,
    /// Error name for programmatic handling
    #[schema(value_type = String, example = "stream.in.noSourceFound")]
    pub error: Box<str>,
    /// Human-readable error message
    #[schema(value_type = String)]
    pub message: Box<str>,
    /// Suggested retry delay in seconds, sent as the `Retry-After` header
    #[serde(skip)]
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// Create a new API error with the given status code, name and message
    pub fn new(status_code: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error: error.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            retry_after: None,
        }
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Converts any [`ServiceError`], hiding the message of server-side failures.
    pub fn from_service_error<E: ServiceError + ?Sized>(err: &E) -> Self {
        let status = err.status_code();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %err, "internal error");
            return Self::new(status, err.error_name(), "Internal server error.");
        }
        Self::new(status, err.error_name(), err.public_message())
    }

    /// Renders the error as an indented JSON document.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| {
            format!(
                "{{\"statusCode\":{},\"error\":\"{}\"}}",
                self.status_code.as_u16(),
                self.error
            )
        })
    }
}

fn serialize_status<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status_code, headers, self.to_json()).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{STREAM_API_PREFIX}internalError"),
            "Internal server error.",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err.body_text()),
            JsonRejection::JsonSyntaxError(err) => {
                format!("JSON syntax error: {}", err.body_text())
            }
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        bad_request(STREAM_API_PREFIX, &message)
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        bad_request(STREAM_API_PREFIX, &rejection.body_text())
    }
}

/// Create a bad request error (400) under the given name prefix
pub fn bad_request(prefix: &str, message: &str) -> ApiError {
    ApiError::new(
        StatusCode::BAD_REQUEST,
        format!("{prefix}badRequest"),
        as_sentence(message),
    )
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(
        StatusCode::UNAUTHORIZED,
        format!("{STREAM_API_PREFIX}unauthorized"),
        as_sentence(msg),
    )
}

/// Formats an error message as a sentence: first letter upper-cased, trailing period.
pub fn as_sentence(message: &str) -> String {
    let message = message.trim();
    let mut chars = message.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };

    let mut out: String = first.to_uppercase().chain(chars).collect();
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}
