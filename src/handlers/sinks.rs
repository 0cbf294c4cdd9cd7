//! # Sink API Handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};

use super::types::{
    ApiJson, ApiPath, CreateSinkRequest, DEFAULT_DISABLE_REASON, DisableRequest, ListQuery, ListResponse, SinkPath,
    SourcePath, UpdateSinkRequest, VersionPath, validate_name,
};
use crate::auth::OperatorAuth;
use crate::definition::Sink;
use crate::error::ApiError;
use crate::repositories::DefinitionError;
use crate::server::AppState;

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks",
    security(("bearer_auth" = [])),
    params(SourcePath, ListQuery),
    responses(
        (status = 200, description = "Sinks ordered by id", body = ListResponse<Sink>)
    ),
    tag = "sinks"
)]
pub async fn list_sinks(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Sink>>, ApiError> {
    let sinks = &state.repository.sinks;
    let source = path.key();
    let data = if query.deleted {
        sinks.list_deleted(&source).await?
    } else {
        sinks.list(&source).await?
    };
    Ok(Json(ListResponse::new(data)))
}

/// Creates a sink of a supported type
#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks",
    security(("bearer_auth" = [])),
    params(SourcePath),
    request_body = CreateSinkRequest,
    responses(
        (status = 201, description = "Sink created", body = Sink),
        (status = 400, description = "Unsupported sink type", body = ApiError),
        (status = 404, description = "Source not found", body = ApiError),
        (status = 409, description = "Sink exists or the source is full", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn create_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
    ApiJson(request): ApiJson<CreateSinkRequest>,
) -> Result<(StatusCode, Json<Sink>), ApiError> {
    validate_name(&request.name)?;
    if !state.pipelines.supports(&request.sink_type) {
        return Err(DefinitionError::Invalid(format!(
            "sink type \"{}\" is not supported, supported types: {}",
            request.sink_type,
            state.pipelines.sink_types().join(", ")
        ))
        .into());
    }

    let mut sink = Sink::new(path.key().sink(request.sink_id), request.sink_type, request.name);
    sink.description = request.description;
    sink.config = request.config;

    let created = state
        .repository
        .sinks
        .create(state.clock.now(), "Sink created.", &sink)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}",
    security(("bearer_auth" = [])),
    params(SinkPath),
    responses(
        (status = 200, description = "Active sink", body = Sink),
        (status = 404, description = "Sink not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn get_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
) -> Result<Json<Sink>, ApiError> {
    Ok(Json(state.repository.sinks.get(&path.key()).await?))
}

/// Updates the sink, saving a new version; open pipelines follow the change
#[utoipa::path(
    patch,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}",
    security(("bearer_auth" = [])),
    params(SinkPath),
    request_body = UpdateSinkRequest,
    responses(
        (status = 200, description = "Updated sink", body = Sink),
        (status = 404, description = "Sink not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn update_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
    ApiJson(request): ApiJson<UpdateSinkRequest>,
) -> Result<Json<Sink>, ApiError> {
    if let Some(name) = &request.name {
        validate_name(name)?;
    }
    let description = request.change_description.as_deref().unwrap_or("Sink updated.");

    let updated = state
        .repository
        .sinks
        .update(state.clock.now(), &path.key(), description, |mut sink| {
            if let Some(name) = &request.name {
                sink.name = name.clone();
            }
            if let Some(description) = &request.description {
                sink.description = description.clone();
            }
            if let Some(config) = &request.config {
                sink.config = config.clone();
            }
            Ok(sink)
        })
        .await?;
    Ok(Json(updated))
}

#[utoipa::path(
    delete,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}",
    security(("bearer_auth" = [])),
    params(SinkPath),
    responses(
        (status = 200, description = "Deleted sink", body = Sink),
        (status = 404, description = "Sink not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn delete_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
) -> Result<Json<Sink>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.sinks.soft_delete(now, &path.key()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}/undelete",
    security(("bearer_auth" = [])),
    params(SinkPath),
    responses(
        (status = 200, description = "Restored sink", body = Sink),
        (status = 404, description = "Deleted sink or its source not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn undelete_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
) -> Result<Json<Sink>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.sinks.undelete(now, &path.key()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}/enable",
    security(("bearer_auth" = [])),
    params(SinkPath),
    responses(
        (status = 200, description = "Enabled sink", body = Sink),
        (status = 404, description = "Sink not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn enable_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
) -> Result<Json<Sink>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.sinks.enable(now, &path.key()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}/disable",
    security(("bearer_auth" = [])),
    params(SinkPath),
    request_body(content = DisableRequest, description = "Optional disable reason"),
    responses(
        (status = 200, description = "Disabled sink", body = Sink),
        (status = 404, description = "Sink not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn disable_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
    request: Option<ApiJson<DisableRequest>>,
) -> Result<Json<Sink>, ApiError> {
    let reason = request
        .and_then(|ApiJson(request)| request.reason)
        .unwrap_or_else(|| DEFAULT_DISABLE_REASON.to_string());
    let now = state.clock.now();
    Ok(Json(state.repository.sinks.disable(now, &path.key(), &reason).await?))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}/versions",
    security(("bearer_auth" = [])),
    params(SinkPath),
    responses(
        (status = 200, description = "Version history, oldest first", body = ListResponse<Sink>)
    ),
    tag = "sinks"
)]
pub async fn list_sink_versions(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
) -> Result<Json<ListResponse<Sink>>, ApiError> {
    Ok(Json(ListResponse::new(state.repository.sinks.versions(&path.key()).await?)))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}/versions/{number}",
    security(("bearer_auth" = [])),
    params(SinkPath, VersionPath),
    responses(
        (status = 200, description = "Stored version", body = Sink),
        (status = 404, description = "Version not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn get_sink_version(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
    ApiPath(version): ApiPath<VersionPath>,
) -> Result<Json<Sink>, ApiError> {
    Ok(Json(state.repository.sinks.version(&path.key(), version.number).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/sinks/{sinkId}/versions/{number}/rollback",
    security(("bearer_auth" = [])),
    params(SinkPath, VersionPath),
    responses(
        (status = 200, description = "Sink at the new version", body = Sink),
        (status = 404, description = "Sink or version not found", body = ApiError)
    ),
    tag = "sinks"
)]
pub async fn rollback_sink(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SinkPath>,
    ApiPath(version): ApiPath<VersionPath>,
) -> Result<Json<Sink>, ApiError> {
    let now = state.clock.now();
    Ok(Json(
        state.repository.sinks.rollback(now, &path.key(), version.number).await?,
    ))
}
