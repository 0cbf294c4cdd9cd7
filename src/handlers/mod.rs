//! # API Handlers
//!
//! HTTP endpoint handlers: the ingestion endpoint, health probes and the
//! definition management API.

pub mod branches;
pub mod sinks;
pub mod sources;
pub mod stream;
pub mod types;

use axum::{http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, STREAM_IN_PREFIX};

/// Basic service information returned by the root endpoint
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "stream-ingest".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health-check",
    responses(
        (status = 200, description = "Service is alive", body = String, content_type = "text/plain")
    ),
    tag = "root"
)]
pub async fn health_check() -> &'static str {
    "OK\n"
}

/// Fallback for unknown routes
pub async fn route_not_found() -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        format!("{STREAM_IN_PREFIX}routeNotFound"),
        "Not found, please send data using POST /stream/<projectID>/<sourceID>/<secret>",
    )
}
