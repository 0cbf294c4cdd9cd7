//! # Ingestion Endpoint
//!
//! `POST /stream/{projectId}/{sourceId}/{secret}` receives one record and
//! writes it to every enabled sink of the matching sources.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Query, State, rejection::BytesRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{ALLOW, CONTENT_TYPE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;
use utoipa::IntoParams;

use crate::definition::{ProjectId, SourceId};
use crate::error::{ApiError, STREAM_IN_PREFIX, bad_request};
use crate::server::AppState;
use crate::sink::{Record, SourcesResult};
use crate::source::DispatchError;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Path)]
#[serde(rename_all = "camelCase")]
pub struct StreamPath {
    pub project_id: String,
    pub source_id: String,
    pub secret: String,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct StreamQuery {
    /// Return the full result tree even when all writes succeeded
    pub verbose: Option<String>,
}

impl StreamQuery {
    fn is_verbose(&self) -> bool {
        self.verbose.as_deref() == Some("true")
    }
}

/// Address of the client, preferring proxy headers over the peer address.
pub struct ClientIp(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse().ok());
        let real_ip = || {
            parts
                .headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse().ok())
        };
        let peer = || {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        };
        Ok(Self(forwarded.or_else(real_ip).or_else(peer)))
    }
}

/// Answers preflight-like probes of the ingestion URL
#[utoipa::path(
    options,
    path = "/stream/{projectId}/{sourceId}/{secret}",
    params(StreamPath),
    responses((status = 200, description = "Allowed methods in the Allow header")),
    tag = "stream"
)]
pub async fn stream_options() -> impl IntoResponse {
    (StatusCode::OK, [(ALLOW, HeaderValue::from_static("OPTIONS, POST"))])
}

/// Ingests one record
///
/// Without `verbose=true`, a fully successful write answers `OK` as plain
/// text; otherwise the response is the result tree of all sources and sinks.
#[utoipa::path(
    post,
    path = "/stream/{projectId}/{sourceId}/{secret}",
    params(StreamPath, StreamQuery),
    request_body(content = String, description = "Record body of any content type"),
    responses(
        (status = 200, description = "Written to all sinks", body = SourcesResult),
        (status = 202, description = "Accepted by all sinks", body = SourcesResult),
        (status = 400, description = "Invalid project ID", body = ApiError),
        (status = 404, description = "No matching or enabled source", body = ApiError),
        (status = 413, description = "Body too large", body = ApiError),
        (status = 500, description = "Some sinks failed", body = SourcesResult),
        (status = 503, description = "Shutting down", body = ApiError)
    ),
    tag = "stream"
)]
pub async fn stream_post(
    State(state): State<AppState>,
    Path(path): Path<StreamPath>,
    Query(query): Query<StreamQuery>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let project_id: ProjectId = path
        .project_id
        .parse()
        .map_err(|err: crate::definition::KeyError| bad_request(STREAM_IN_PREFIX, &err.to_string()))?;
    // An invalid slug cannot belong to any source.
    let source_id = SourceId::new(path.source_id).map_err(|_| DispatchError::NoSourceFound)?;

    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("{STREAM_IN_PREFIX}bodyTooLarge"),
                format!("Request body size is over the maximum \"{}B\".", state.config.max_body_size),
            )
        } else {
            bad_request(STREAM_IN_PREFIX, &rejection.body_text())
        }
    })?;

    let record = Record {
        received_at: state.clock.now(),
        client_ip,
        headers,
        body,
    };
    let result = state
        .dispatcher
        .dispatch(project_id, &source_id, &path.secret, record)
        .await?;

    if !query.is_verbose() && result.failed_sinks == 0 {
        return Ok((result.status_code, [(CONTENT_TYPE, "text/plain")], "OK").into_response());
    }

    let body = serde_json::to_string_pretty(&result).map_err(anyhow::Error::from)?;
    Ok((result.status_code, [(CONTENT_TYPE, "application/json")], body).into_response())
}
