//! # Source API Handlers
//!
//! HTTP sources of a branch. The generated secret is part of the ingestion
//! URL `POST /stream/{projectId}/{sourceId}/{secret}`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};

use super::types::{
    ApiJson, ApiPath, BranchPath, CreateSourceRequest, DEFAULT_DISABLE_REASON, DisableRequest, ListQuery,
    ListResponse, SourcePath, UpdateSourceRequest, VersionPath, validate_name,
};
use crate::auth::OperatorAuth;
use crate::definition::Source;
use crate::error::ApiError;
use crate::server::AppState;

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources",
    security(("bearer_auth" = [])),
    params(BranchPath, ListQuery),
    responses(
        (status = 200, description = "Sources ordered by id", body = ListResponse<Source>)
    ),
    tag = "sources"
)]
pub async fn list_sources(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Source>>, ApiError> {
    let sources = &state.repository.sources;
    let branch = path.key();
    let data = if query.deleted {
        sources.list_deleted(&branch).await?
    } else {
        sources.list(&branch).await?
    };
    Ok(Json(ListResponse::new(data)))
}

/// Creates an HTTP source with a generated secret
#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources",
    security(("bearer_auth" = [])),
    params(BranchPath),
    request_body = CreateSourceRequest,
    responses(
        (status = 201, description = "Source created", body = Source),
        (status = 404, description = "Branch not found", body = ApiError),
        (status = 409, description = "Source exists or the branch is full", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn create_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
    ApiJson(request): ApiJson<CreateSourceRequest>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    validate_name(&request.name)?;
    let mut source = Source::new_http(path.key().source(request.source_id), request.name);
    source.description = request.description;

    let created = state
        .repository
        .sources
        .create(state.clock.now(), "Source created.", &source)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}",
    security(("bearer_auth" = [])),
    params(SourcePath),
    responses(
        (status = 200, description = "Active source", body = Source),
        (status = 404, description = "Source not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn get_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.repository.sources.get(&path.key()).await?))
}

/// Updates the name or description, saving a new version
#[utoipa::path(
    patch,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}",
    security(("bearer_auth" = [])),
    params(SourcePath),
    request_body = UpdateSourceRequest,
    responses(
        (status = 200, description = "Updated source", body = Source),
        (status = 404, description = "Source not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn update_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
    ApiJson(request): ApiJson<UpdateSourceRequest>,
) -> Result<Json<Source>, ApiError> {
    if let Some(name) = &request.name {
        validate_name(name)?;
    }
    let description = request.change_description.as_deref().unwrap_or("Source updated.");

    let updated = state
        .repository
        .sources
        .update(state.clock.now(), &path.key(), description, |mut source| {
            if let Some(name) = &request.name {
                source.name = name.clone();
            }
            if let Some(description) = &request.description {
                source.description = description.clone();
            }
            Ok(source)
        })
        .await?;
    Ok(Json(updated))
}

/// Soft-deletes a source with its sinks
#[utoipa::path(
    delete,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}",
    security(("bearer_auth" = [])),
    params(SourcePath),
    responses(
        (status = 200, description = "Deleted source", body = Source),
        (status = 404, description = "Source not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn delete_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
) -> Result<Json<Source>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.sources.soft_delete(now, &path.key()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/undelete",
    security(("bearer_auth" = [])),
    params(SourcePath),
    responses(
        (status = 200, description = "Restored source", body = Source),
        (status = 404, description = "Deleted source or its branch not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn undelete_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
) -> Result<Json<Source>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.sources.undelete(now, &path.key()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/enable",
    security(("bearer_auth" = [])),
    params(SourcePath),
    responses(
        (status = 200, description = "Enabled source", body = Source),
        (status = 404, description = "Source not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn enable_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
) -> Result<Json<Source>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.sources.enable(now, &path.key()).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/disable",
    security(("bearer_auth" = [])),
    params(SourcePath),
    request_body(content = DisableRequest, description = "Optional disable reason"),
    responses(
        (status = 200, description = "Disabled source", body = Source),
        (status = 404, description = "Source not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn disable_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
    request: Option<ApiJson<DisableRequest>>,
) -> Result<Json<Source>, ApiError> {
    let reason = request
        .and_then(|ApiJson(request)| request.reason)
        .unwrap_or_else(|| DEFAULT_DISABLE_REASON.to_string());
    let now = state.clock.now();
    Ok(Json(state.repository.sources.disable(now, &path.key(), &reason).await?))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/versions",
    security(("bearer_auth" = [])),
    params(SourcePath),
    responses(
        (status = 200, description = "Version history, oldest first", body = ListResponse<Source>)
    ),
    tag = "sources"
)]
pub async fn list_source_versions(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
) -> Result<Json<ListResponse<Source>>, ApiError> {
    Ok(Json(ListResponse::new(state.repository.sources.versions(&path.key()).await?)))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/versions/{number}",
    security(("bearer_auth" = [])),
    params(SourcePath, VersionPath),
    responses(
        (status = 200, description = "Stored version", body = Source),
        (status = 404, description = "Version not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn get_source_version(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
    ApiPath(version): ApiPath<VersionPath>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.repository.sources.version(&path.key(), version.number).await?))
}

#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/sources/{sourceId}/versions/{number}/rollback",
    security(("bearer_auth" = [])),
    params(SourcePath, VersionPath),
    responses(
        (status = 200, description = "Source at the new version", body = Source),
        (status = 404, description = "Source or version not found", body = ApiError)
    ),
    tag = "sources"
)]
pub async fn rollback_source(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<SourcePath>,
    ApiPath(version): ApiPath<VersionPath>,
) -> Result<Json<Source>, ApiError> {
    let now = state.clock.now();
    Ok(Json(
        state.repository.sources.rollback(now, &path.key(), version.number).await?,
    ))
}
