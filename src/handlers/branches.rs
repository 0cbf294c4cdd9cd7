//! # Branch API Handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};

use super::types::{ApiJson, ApiPath, BranchPath, CreateBranchRequest, ListQuery, ListResponse, ProjectPath, VersionPath};
use crate::auth::OperatorAuth;
use crate::definition::{Branch, BranchKey};
use crate::error::ApiError;
use crate::server::AppState;

/// Lists active or deleted branches of a project
#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches",
    security(("bearer_auth" = [])),
    params(ProjectPath, ListQuery),
    responses(
        (status = 200, description = "Branches ordered by id", body = ListResponse<Branch>),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn list_branches(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<ProjectPath>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Branch>>, ApiError> {
    let branches = &state.repository.branches;
    let data = if query.deleted {
        branches.list_deleted(path.project_id).await?
    } else {
        branches.list(path.project_id).await?
    };
    Ok(Json(ListResponse::new(data)))
}

/// Creates a branch, or recreates a deleted one
#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches",
    security(("bearer_auth" = [])),
    params(ProjectPath),
    request_body = CreateBranchRequest,
    responses(
        (status = 201, description = "Branch created", body = Branch),
        (status = 409, description = "Branch exists or the project is full", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn create_branch(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<ProjectPath>,
    ApiJson(request): ApiJson<CreateBranchRequest>,
) -> Result<(StatusCode, Json<Branch>), ApiError> {
    let branch = Branch::new(BranchKey::new(path.project_id, request.branch_id), request.is_default);
    let created = state
        .repository
        .branches
        .create(state.clock.now(), "Branch created.", &branch)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Returns the default branch of a project
#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/default",
    security(("bearer_auth" = [])),
    params(ProjectPath),
    responses(
        (status = 200, description = "Default branch", body = Branch),
        (status = 404, description = "No default branch", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn get_default_branch(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<ProjectPath>,
) -> Result<Json<Branch>, ApiError> {
    Ok(Json(state.repository.branches.get_default(path.project_id).await?))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}",
    security(("bearer_auth" = [])),
    params(BranchPath),
    responses(
        (status = 200, description = "Active branch", body = Branch),
        (status = 404, description = "Branch not found", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn get_branch(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
) -> Result<Json<Branch>, ApiError> {
    Ok(Json(state.repository.branches.get(&path.key()).await?))
}

/// Soft-deletes a branch with its sources and sinks
#[utoipa::path(
    delete,
    path = "/v1/projects/{projectId}/branches/{branchId}",
    security(("bearer_auth" = [])),
    params(BranchPath),
    responses(
        (status = 200, description = "Deleted branch", body = Branch),
        (status = 404, description = "Branch not found", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn delete_branch(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
) -> Result<Json<Branch>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.branches.soft_delete(now, &path.key()).await?))
}

/// Restores a deleted branch and everything deleted with it
#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/undelete",
    security(("bearer_auth" = [])),
    params(BranchPath),
    responses(
        (status = 200, description = "Restored branch", body = Branch),
        (status = 404, description = "Deleted branch not found", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn undelete_branch(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
) -> Result<Json<Branch>, ApiError> {
    let now = state.clock.now();
    Ok(Json(state.repository.branches.undelete(now, &path.key()).await?))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/versions",
    security(("bearer_auth" = [])),
    params(BranchPath),
    responses(
        (status = 200, description = "Version history, oldest first", body = ListResponse<Branch>)
    ),
    tag = "branches"
)]
pub async fn list_branch_versions(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
) -> Result<Json<ListResponse<Branch>>, ApiError> {
    Ok(Json(ListResponse::new(state.repository.branches.versions(&path.key()).await?)))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{projectId}/branches/{branchId}/versions/{number}",
    security(("bearer_auth" = [])),
    params(BranchPath, VersionPath),
    responses(
        (status = 200, description = "Stored version", body = Branch),
        (status = 404, description = "Version not found", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn get_branch_version(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
    ApiPath(version): ApiPath<VersionPath>,
) -> Result<Json<Branch>, ApiError> {
    Ok(Json(state.repository.branches.version(&path.key(), version.number).await?))
}

/// Saves the payload of an older version as a new version
#[utoipa::path(
    post,
    path = "/v1/projects/{projectId}/branches/{branchId}/versions/{number}/rollback",
    security(("bearer_auth" = [])),
    params(BranchPath, VersionPath),
    responses(
        (status = 200, description = "Branch at the new version", body = Branch),
        (status = 404, description = "Branch or version not found", body = ApiError)
    ),
    tag = "branches"
)]
pub async fn rollback_branch(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    ApiPath(path): ApiPath<BranchPath>,
    ApiPath(version): ApiPath<VersionPath>,
) -> Result<Json<Branch>, ApiError> {
    let now = state.clock.now();
    Ok(Json(
        state.repository.branches.rollback(now, &path.key(), version.number).await?,
    ))
}
